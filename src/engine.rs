// ========================================================================================
//
//                        THE EXTERNAL GENOTYPE-ENGINE LAYER
//
// ========================================================================================
//
// The pipeline never computes genotypes itself; it drives an external engine
// through four subcommands (make-bed, keep, clump, score) plus the statistics
// script. This module owns that boundary.
//
// Commands are explicit argument vectors, never shell strings, so file names
// containing spaces or metacharacters cannot change the command's meaning.
// Invocation goes through the `EngineInvoker` trait; production code uses the
// blocking `SystemInvoker`, tests substitute a recording stub.

use log::debug;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::stage::PipelineError;

/// One fully-assembled external command: the program, its argument vector, and
/// a short human-readable label used in diagnostics.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<OsString>,
    pub label: String,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>, label: String) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            label,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    /// A loggable rendition of the full command line.
    pub fn rendered(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// The observed exit of an external process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "status {code}"),
            None => write!(f, "a signal"),
        }
    }
}

/// The seam between stage logic and the operating system.
pub trait EngineInvoker {
    fn invoke(&self, command: &EngineCommand) -> Result<ExitOutcome, PipelineError>;
}

/// Blocking invoker. Waits for the child without inspecting its output
/// streams; the engine writes its own logs next to its outputs.
///
/// With no timeout configured (the default) the wait is unbounded. A timeout
/// arms a watchdog that kills the child on expiry.
pub struct SystemInvoker {
    timeout: Option<Duration>,
}

const WATCHDOG_POLL: Duration = Duration::from_millis(100);

impl SystemInvoker {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl EngineInvoker for SystemInvoker {
    fn invoke(&self, command: &EngineCommand) -> Result<ExitOutcome, PipelineError> {
        debug!("spawning: {}", command.rendered());

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| PipelineError::Launch {
                program: command.program.clone(),
                source,
            })?;

        let status = match self.timeout {
            None => child.wait().map_err(|source| PipelineError::Launch {
                program: command.program.clone(),
                source,
            })?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match child.try_wait().map_err(|source| PipelineError::Launch {
                        program: command.program.clone(),
                        source,
                    })? {
                        Some(status) => break status,
                        None if Instant::now() >= deadline => {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(PipelineError::EngineTimeout {
                                label: command.label.clone(),
                                seconds: timeout.as_secs(),
                            });
                        }
                        None => thread::sleep(WATCHDOG_POLL),
                    }
                }
            }
        };

        Ok(ExitOutcome {
            code: status.code(),
        })
    }
}

/// Program names for the two engine generations plus the command builders for
/// their subcommands. The bfile-manipulating subcommands run on the classic
/// engine; dosage scoring runs on the second-generation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub plink: String,
    pub plink2: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            plink: "plink".to_string(),
            plink2: "plink2".to_string(),
        }
    }
}

impl EngineConfig {
    /// `--vcf V --extract S [extra...] --make-bed --out O`
    pub fn make_bed(
        &self,
        vcf: &OsStr,
        extract: &OsStr,
        extra: &[String],
        out_prefix: &OsStr,
        label: String,
    ) -> EngineCommand {
        EngineCommand::new(&self.plink, label)
            .arg("--vcf")
            .arg(vcf)
            .arg("--extract")
            .arg(extract)
            .args(extra)
            .arg("--make-bed")
            .arg("--out")
            .arg(out_prefix)
    }

    /// `--bfile B --keep P --make-bed --out O`
    pub fn keep_individuals(
        &self,
        bfile_prefix: &OsStr,
        keep_file: &OsStr,
        out_prefix: &OsStr,
        label: String,
    ) -> EngineCommand {
        EngineCommand::new(&self.plink, label)
            .arg("--bfile")
            .arg(bfile_prefix)
            .arg("--keep")
            .arg(keep_file)
            .arg("--make-bed")
            .arg("--out")
            .arg(out_prefix)
    }

    /// `--bfile B --clump Q --clump-p1 .. --clump-p2 .. --clump-r2 ..
    ///  --clump-kb .. --clump-field F --clump-snp-field SF --out O`
    #[allow(clippy::too_many_arguments)]
    pub fn clump(
        &self,
        bfile_prefix: &OsStr,
        assoc_file: &OsStr,
        kb: u32,
        p1: f64,
        p2: f64,
        r2: f64,
        field: &str,
        snp_field: &str,
        out_prefix: &OsStr,
        label: String,
    ) -> EngineCommand {
        EngineCommand::new(&self.plink, label)
            .arg("--bfile")
            .arg(bfile_prefix)
            .arg("--clump")
            .arg(assoc_file)
            .arg("--clump-p1")
            .arg(p1.to_string())
            .arg("--clump-p2")
            .arg(p2.to_string())
            .arg("--clump-r2")
            .arg(r2.to_string())
            .arg("--clump-kb")
            .arg(kb.to_string())
            .arg("--clump-field")
            .arg(field)
            .arg("--clump-snp-field")
            .arg(snp_field)
            .arg("--out")
            .arg(out_prefix)
    }

    /// `--vcf V dosage=DS --score W c1 c2 c3 modifier --memory M --out O`
    pub fn score(
        &self,
        vcf: &OsStr,
        weights: &OsStr,
        score_columns: &str,
        modifier: &str,
        memory_mb: u32,
        out_prefix: &OsStr,
        label: String,
    ) -> EngineCommand {
        EngineCommand::new(&self.plink2, label)
            .arg("--vcf")
            .arg(vcf)
            .arg("dosage=DS")
            .arg("--score")
            .arg(weights)
            .args(score_columns.split_whitespace())
            .arg(modifier)
            .arg("--memory")
            .arg(memory_mb.to_string())
            .arg("--out")
            .arg(out_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clump_command_preserves_flag_semantics() {
        let engine = EngineConfig::default();
        let command = engine.clump(
            OsStr::new("bfiles/chr1_T"),
            OsStr::new("qc/chr1_T.QC.csv"),
            250,
            0.02,
            0.02,
            0.1,
            "Pvalue",
            "SNPID",
            OsStr::new("clump/T_250_0.02_0.1/chr1_T_250_0.02_0.1"),
            "clump chr1".to_string(),
        );
        assert_eq!(command.program, "plink");
        assert_eq!(
            command.rendered(),
            "plink --bfile bfiles/chr1_T --clump qc/chr1_T.QC.csv \
             --clump-p1 0.02 --clump-p2 0.02 --clump-r2 0.1 --clump-kb 250 \
             --clump-field Pvalue --clump-snp-field SNPID \
             --out clump/T_250_0.02_0.1/chr1_T_250_0.02_0.1"
        );
    }

    #[test]
    fn score_command_splits_column_selection_into_separate_args() {
        let engine = EngineConfig::default();
        let command = engine.score(
            OsStr::new("vcf/chr2.vcf.gz"),
            OsStr::new("list.csv"),
            "1 2 3",
            "no-mean-imputation",
            8000,
            OsStr::new("prs/chr2_T"),
            "score chr2".to_string(),
        );
        assert_eq!(command.program, "plink2");
        let args: Vec<String> = command
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "--vcf",
                "vcf/chr2.vcf.gz",
                "dosage=DS",
                "--score",
                "list.csv",
                "1",
                "2",
                "3",
                "no-mean-imputation",
                "--memory",
                "8000",
                "--out",
                "prs/chr2_T",
            ]
        );
    }

    #[test]
    fn nonzero_and_signal_exits_are_not_success() {
        assert!(ExitOutcome { code: Some(0) }.success());
        assert!(!ExitOutcome { code: Some(2) }.success());
        assert!(!ExitOutcome { code: None }.success());
    }
}
