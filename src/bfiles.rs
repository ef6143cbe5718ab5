//! Binary-fileset generation: from reference VCFs, and from existing bfiles
//! restricted to a population keep-list.

use itertools::Itertools;
use log::debug;
use natord::compare;
use std::fs;
use std::path::{Path, PathBuf};

use crate::naming::{self, Chromosome, DatasetNaming};
use crate::stage::{PipelineError, StageContext, StageSummary, VisitedSet};

/// Finds the reference VCF for a chromosome: the first `*.vcf.gz` entry, in
/// natural name order, whose name contains `chr{N}` followed by `symbol`.
///
/// The symbol separates the chromosome token from the rest of the name, so
/// `chr2.` cannot match a `chr22` shard. Extra matches beyond the first are
/// reported at debug level and ignored.
pub fn find_reference_vcf(
    dir: &Path,
    chrom: Chromosome,
    symbol: &str,
) -> Result<Option<PathBuf>, PipelineError> {
    let needle = format!("{chrom}{symbol}");
    let matches: Vec<String> = fs::read_dir(dir)
        .map_err(|e| PipelineError::io(dir, e))?
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".vcf.gz") && name.contains(&needle))
        .sorted_by(|a, b| compare(a, b))
        .collect();

    match matches.split_first() {
        None => Ok(None),
        Some((first, rest)) => {
            for extra in rest {
                debug!("{chrom}: ignoring additional reference match {extra}");
            }
            Ok(Some(dir.join(first)))
        }
    }
}

/// Builds one bfile set per chromosome from the reference VCFs, extracting the
/// SNPs listed for the dataset. Skips any chromosome whose SNP list or
/// reference VCF is absent.
pub fn generate_bfiles(
    ctx: &StageContext<'_>,
    list_naming: DatasetNaming,
    ref_dir: &Path,
    snplist_tag: &str,
    output_name: &str,
    symbol: &str,
    extra: &[String],
) -> Result<StageSummary, PipelineError> {
    let mut summary = StageSummary::new("generate-bfiles");
    let mut visited = VisitedSet::new();

    for chrom in Chromosome::all() {
        let snp_list = naming::snp_list(ctx.layout, list_naming, chrom, snplist_tag);
        if !summary.require(chrom, &snp_list) {
            continue;
        }
        let Some(vcf) = find_reference_vcf(ref_dir, chrom, symbol)? else {
            summary.record_skip(Some(chrom), &ref_dir.join(format!("{chrom}{symbol}*.vcf.gz")));
            continue;
        };

        let out_prefix = naming::bfile_prefix(ctx.layout, chrom, output_name);
        if !visited.insert(out_prefix.to_string_lossy().into_owned()) {
            continue;
        }

        let command = ctx.engine.make_bed(
            vcf.as_os_str(),
            snp_list.as_os_str(),
            extra,
            out_prefix.as_os_str(),
            format!("make-bed {chrom}_{output_name}"),
        );
        ctx.dispatch(&command)?;
        summary.record_completed();
    }

    Ok(summary.finish())
}

/// Re-generates each chromosome's bfile set keeping only the individuals in
/// the named population file. A missing population file skips the whole stage;
/// a missing bfile set skips that chromosome.
pub fn keep_individuals(
    ctx: &StageContext<'_>,
    pop_name: &str,
    bfile_name: &str,
    output_name: &str,
) -> Result<StageSummary, PipelineError> {
    let mut summary = StageSummary::new("keep-individuals");

    let pop = naming::pop_file(ctx.layout, pop_name);
    if !pop.exists() {
        summary.record_skip(None, &pop);
        return Ok(summary.finish());
    }

    let mut visited = VisitedSet::new();
    for chrom in Chromosome::all() {
        let bim = naming::bfile_bim(ctx.layout, chrom, bfile_name);
        if !summary.require(chrom, &bim) {
            continue;
        }

        let out_prefix = naming::bfile_prefix(ctx.layout, chrom, output_name);
        if !visited.insert(out_prefix.to_string_lossy().into_owned()) {
            continue;
        }

        let command = ctx.engine.keep_individuals(
            naming::bfile_prefix(ctx.layout, chrom, bfile_name).as_os_str(),
            pop.as_os_str(),
            out_prefix.as_os_str(),
            format!("keep {chrom}_{output_name}"),
        );
        ctx.dispatch(&command)?;
        summary.record_completed();
    }

    Ok(summary.finish())
}
