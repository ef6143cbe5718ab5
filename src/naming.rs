// ========================================================================================
//
//                           THE NAMING CONVENTION MODULE
//
// ========================================================================================
//
// Every stage of the pipeline communicates with the next one exclusively through
// files whose names are derived from a small set of parameters: the dataset tag,
// the clump condition, and the chromosome number. This module is the single source
// of truth for those derivations. No other module may concatenate path tokens.
//
// One path-builder function exists per artifact kind, so a format change in one
// place propagates to every producer and consumer of that artifact at once.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::WorkspaceLayout;

/// One clump+threshold parameter combination, formatted as the `{kb}_{p1}_{r2}`
/// tag that names every artifact derived under it.
///
/// A single condition is chosen per run and must be used for every path in that
/// run; mixing tags silently orphans downstream artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClumpCondition {
    /// Clump window size in kilobases.
    pub kb: u32,
    /// Index-variant p-value threshold.
    pub p1: f64,
    /// LD r-squared threshold.
    pub r2: f64,
}

impl fmt::Display for ClumpCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.kb, self.p1, self.r2)
    }
}

/// An autosomal chromosome in the closed range 1..=22.
///
/// Sex chromosomes and mitochondrial pseudo-chromosomes are excluded from the
/// pipeline entirely: every per-chromosome loop iterates exactly this range, no
/// matter which files happen to exist on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chromosome(u8);

impl Chromosome {
    pub const COUNT: usize = 22;

    /// All autosomes, in order.
    pub fn all() -> impl Iterator<Item = Chromosome> {
        (1..=22).map(Chromosome)
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Chromosome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chr{}", self.0)
    }
}

/// How files for a dataset are named within a directory: one file per chromosome
/// (`chr{N}_` prefix) or one pooled file with no chromosome information.
///
/// The mode is decided by [`probe_naming`] once per stage call and then governs
/// naming for all 22 chromosomes uniformly. It is deliberately a value passed
/// down to the stage functions rather than a hidden directory scan, so a
/// directory holding mixed conventions is inspectable at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetNaming {
    PerChromosome,
    Pooled,
}

/// Probes a directory for the naming convention used by `tag`'s files.
///
/// The rule is all-or-nothing: if *any* entry whose name contains `tag` also
/// contains the substring `chr`, the whole dataset is treated as per-chromosome.
pub fn probe_naming(dir: &Path, tag: &str) -> io::Result<DatasetNaming> {
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.contains(tag) && name.contains("chr") {
            return Ok(DatasetNaming::PerChromosome);
        }
    }
    Ok(DatasetNaming::Pooled)
}

fn dataset_file(dir: &Path, naming: DatasetNaming, chrom: Chromosome, tag: &str, ext: &str) -> PathBuf {
    match naming {
        DatasetNaming::PerChromosome => dir.join(format!("{chrom}_{tag}{ext}")),
        DatasetNaming::Pooled => dir.join(format!("{tag}{ext}")),
    }
}

/// The quality-controlled summary-statistics table for `tag`.
pub fn qc_table(layout: &WorkspaceLayout, naming: DatasetNaming, chrom: Chromosome, tag: &str) -> PathBuf {
    dataset_file(layout.qc_dir(), naming, chrom, tag, ".QC.csv")
}

/// The raw SNP list consumed by bfile generation.
pub fn snp_list(layout: &WorkspaceLayout, naming: DatasetNaming, chrom: Chromosome, tag: &str) -> PathBuf {
    dataset_file(layout.snplists_dir(), naming, chrom, tag, ".csv")
}

/// The per-chromosome bfile prefix; the engine appends `.bed`/`.bim`/`.fam`.
pub fn bfile_prefix(layout: &WorkspaceLayout, chrom: Chromosome, name: &str) -> PathBuf {
    layout.bfiles_dir().join(format!("{chrom}_{name}"))
}

/// The `.bim` member of a bfile set, used as the existence probe for the whole set.
pub fn bfile_bim(layout: &WorkspaceLayout, chrom: Chromosome, name: &str) -> PathBuf {
    layout.bfiles_dir().join(format!("{chrom}_{name}.bim"))
}

/// The condition-tagged folder collecting one clump run's outputs.
pub fn clump_run_dir(layout: &WorkspaceLayout, tag: &str, cond: ClumpCondition) -> PathBuf {
    layout.clump_dir().join(format!("{tag}_{cond}"))
}

/// The per-chromosome clump output prefix; the engine appends `.clumped`.
///
/// `folder_tag` names the run folder and `file_tag` names the files inside it;
/// the clump stage uses one tag for both, the SNP-selection stage may differ.
pub fn clump_output_prefix(
    layout: &WorkspaceLayout,
    chrom: Chromosome,
    folder_tag: &str,
    file_tag: &str,
    cond: ClumpCondition,
) -> PathBuf {
    clump_run_dir(layout, folder_tag, cond).join(format!("{chrom}_{file_tag}_{cond}"))
}

/// The clumped-SNP table emitted by the engine.
pub fn clumped_table(
    layout: &WorkspaceLayout,
    chrom: Chromosome,
    folder_tag: &str,
    file_tag: &str,
    cond: ClumpCondition,
) -> PathBuf {
    let mut path = clump_output_prefix(layout, chrom, folder_tag, file_tag, cond).into_os_string();
    path.push(".clumped");
    PathBuf::from(path)
}

/// The `CHR SNP` list extracted from a clumped table.
pub fn clumped_snp_list(
    layout: &WorkspaceLayout,
    chrom: Chromosome,
    folder_tag: &str,
    file_tag: &str,
    cond: ClumpCondition,
) -> PathBuf {
    clump_run_dir(layout, folder_tag, cond)
        .join(format!("{chrom}_{file_tag}_{cond}_clumped_snplist.csv"))
}

/// The condition-tagged folder for QC-and-clump intersected SNP lists.
pub fn filtered_snp_dir(layout: &WorkspaceLayout, tag: &str, cond: ClumpCondition) -> PathBuf {
    layout.qc_clump_snplists_dir().join(format!("{tag}_{cond}"))
}

/// The filtered per-chromosome SNP list consumed by scoring.
pub fn filtered_snp_list(
    layout: &WorkspaceLayout,
    chrom: Chromosome,
    tag: &str,
    cond: ClumpCondition,
) -> PathBuf {
    filtered_snp_dir(layout, tag, cond).join(format!("{chrom}_{tag}_{cond}.qc_clump_snpslist.csv"))
}

/// The folder collecting one scoring run's per-chromosome partial files.
pub fn score_run_dir(layout: &WorkspaceLayout, tag: &str, cond: ClumpCondition) -> PathBuf {
    layout.prs_dir().join(format!("{tag}_{cond}"))
}

/// The per-chromosome score output prefix; the engine appends `.sscore`.
pub fn score_output_prefix(
    layout: &WorkspaceLayout,
    chrom: Chromosome,
    tag: &str,
    cond: ClumpCondition,
) -> PathBuf {
    score_run_dir(layout, tag, cond).join(format!("{chrom}_{tag}_{cond}"))
}

/// The combined score table aggregated across chromosomes.
pub fn combined_score_file(layout: &WorkspaceLayout, tag: &str, cond: ClumpCondition) -> PathBuf {
    layout.prs_dir().join(format!("{tag}_{cond}_combined.sscore"))
}

/// The wall-clock timing table written alongside a scoring run.
pub fn timing_table(layout: &WorkspaceLayout, tag: &str, cond: ClumpCondition) -> PathBuf {
    layout.prs_dir().join(format!("{tag}_{cond}_time_table.txt"))
}

/// The statistics report for one condition.
pub fn stat_report(layout: &WorkspaceLayout, name: &str, cond: ClumpCondition) -> PathBuf {
    layout.stat_dir().join(format!("{name}_{cond}_stat.txt"))
}

/// The concatenation of every statistics report for a dataset.
pub fn combined_stat_report(layout: &WorkspaceLayout, tag: &str) -> PathBuf {
    layout.stat_dir().join(format!("combined_{tag}.txt"))
}

/// A population keep-list.
pub fn pop_file(layout: &WorkspaceLayout, name: &str) -> PathBuf {
    layout.pop_dir().join(format!("{name}.txt"))
}
