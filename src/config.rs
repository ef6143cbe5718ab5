//! The result-directory layout and the optional run manifest.
//!
//! The layout is computed once from the result root and passed by reference to
//! every stage function. There is no process-wide directory state: a stage can
//! only reach the paths its `WorkspaceLayout` argument gives it.

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::naming::ClumpCondition;
use crate::stage::PipelineError;

/// The fixed tree of result subdirectories shared by every stage.
///
/// This tree is the integration contract between stages; a stage implemented in
/// another language interoperates by reproducing exactly these paths.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    result_dir: PathBuf,
    plink_dir: PathBuf,
    bfiles_dir: PathBuf,
    clump_dir: PathBuf,
    prs_dir: PathBuf,
    qc_clump_snplists_dir: PathBuf,
    qc_dir: PathBuf,
    snplists_dir: PathBuf,
    pop_dir: PathBuf,
    stat_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(result_dir: impl Into<PathBuf>) -> Self {
        let result_dir = result_dir.into();
        let plink_dir = result_dir.join("plink");
        Self {
            bfiles_dir: plink_dir.join("bfiles"),
            clump_dir: plink_dir.join("clump"),
            prs_dir: plink_dir.join("prs"),
            qc_clump_snplists_dir: plink_dir.join("qc_and_clump_snpslist"),
            qc_dir: result_dir.join("qc"),
            snplists_dir: result_dir.join("snplists"),
            pop_dir: result_dir.join("pop"),
            stat_dir: result_dir.join("stat"),
            plink_dir,
            result_dir,
        }
    }

    /// Creates every subdirectory of the tree. Idempotent; runs before each stage.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            &self.result_dir,
            &self.plink_dir,
            &self.bfiles_dir,
            &self.clump_dir,
            &self.prs_dir,
            &self.qc_clump_snplists_dir,
            &self.qc_dir,
            &self.snplists_dir,
            &self.pop_dir,
            &self.stat_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn bfiles_dir(&self) -> &Path {
        &self.bfiles_dir
    }

    pub fn clump_dir(&self) -> &Path {
        &self.clump_dir
    }

    pub fn prs_dir(&self) -> &Path {
        &self.prs_dir
    }

    pub fn qc_clump_snplists_dir(&self) -> &Path {
        &self.qc_clump_snplists_dir
    }

    pub fn qc_dir(&self) -> &Path {
        &self.qc_dir
    }

    pub fn snplists_dir(&self) -> &Path {
        &self.snplists_dir
    }

    pub fn pop_dir(&self) -> &Path {
        &self.pop_dir
    }

    pub fn stat_dir(&self) -> &Path {
        &self.stat_dir
    }
}

/// Parameters for a full scoring pass, loaded from a TOML manifest by the `run`
/// subcommand. Everything not listed here (QC tables, SNP lists, bfiles) must
/// already exist in the workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineManifest {
    /// Dataset tag naming every artifact of this run.
    pub dataset: String,
    /// Directory of per-chromosome `.vcf.gz` genotype files used for scoring.
    pub vcf_dir: PathBuf,
    /// Clump condition shared by every stage of the run.
    pub condition: ClumpCondition,
    /// Separator between the chromosome token and the rest of a VCF file name.
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Memory cap in megabytes handed to the scoring engine.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub clump: ManifestClump,
    pub statistics: Option<ManifestStatistics>,
}

/// Clump-stage knobs that are not part of the condition tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestClump {
    /// Secondary p-value threshold; `None` reuses `condition.p1`.
    pub p2: Option<f64>,
    pub field: String,
    pub snp_field: String,
    /// Bfile name; `None` reuses the dataset tag.
    pub bfile_name: Option<String>,
}

impl Default for ManifestClump {
    fn default() -> Self {
        Self {
            p2: None,
            field: "Pvalue".to_string(),
            snp_field: "SNPID".to_string(),
            bfile_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestStatistics {
    pub pheno_file: PathBuf,
    pub script: PathBuf,
    #[serde(default = "default_r_command")]
    pub r_command: String,
}

fn default_symbol() -> String {
    ".".to_string()
}

fn default_memory_mb() -> u32 {
    8000
}

fn default_r_command() -> String {
    "Rscript".to_string()
}

impl PipelineManifest {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| PipelineError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }
}
