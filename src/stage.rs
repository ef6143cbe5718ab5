// ========================================================================================
//
//                              THE STAGE EXECUTOR
//
// ========================================================================================
//
// Shared machinery for every pipeline stage: the error taxonomy, the
// lenient/strict execution mode, the structured completed/skipped accounting,
// and the invocation-scoped visited set.
//
// The cardinal rule is that a missing upstream artifact never aborts a
// chromosome loop. Each absence is recorded as a skip diagnostic and the loop
// moves on; only malformed data and (in strict mode) engine failures surface
// as errors.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use std::collections::HashSet;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::WorkspaceLayout;
use crate::engine::{EngineCommand, EngineConfig, EngineInvoker};
use crate::naming::Chromosome;

/// The error taxonomy of the pipeline.
///
/// Missing inputs are deliberately absent here: they are diagnostics carried by
/// [`StageSummary`], not errors. Empty intersections and aggregations are not
/// errors either; they produce header-only outputs.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{label} exited with {status}")]
    Engine { label: String, status: String },

    #[error("{label} exceeded the {seconds}s timeout and was killed")]
    EngineTimeout { label: String, seconds: u64 },

    #[error("malformed table {path} (line {line}): {reason}")]
    MalformedTable {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("could not parse manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl PipelineError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        PipelineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// How a stage reacts to a non-zero engine exit.
///
/// The lenient default matches the historical behavior: log and continue.
/// Strict mode promotes the exit status to [`PipelineError::Engine`] without
/// changing any stage logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Lenient,
    Strict,
}

/// Artifact keys already processed within one stage invocation.
///
/// Scoped strictly to a single call; never persisted across runs or shared
/// between stages.
pub type VisitedSet = HashSet<String>;

/// One skipped unit of work and the input whose absence caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDiagnostic {
    /// `None` for stage-level inputs that are not chromosome-scoped.
    pub chromosome: Option<Chromosome>,
    pub missing: PathBuf,
}

/// Structured per-stage accounting of completed versus skipped work.
#[derive(Debug)]
pub struct StageSummary {
    stage: &'static str,
    pub completed: usize,
    pub skipped: Vec<SkipDiagnostic>,
}

impl StageSummary {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            completed: 0,
            skipped: Vec::new(),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn record_completed(&mut self) {
        self.completed += 1;
    }

    pub fn record_skip(&mut self, chromosome: Option<Chromosome>, missing: &Path) {
        warn!("{}: {} not found, skipped", self.stage, missing.display());
        self.skipped.push(SkipDiagnostic {
            chromosome,
            missing: missing.to_path_buf(),
        });
    }

    /// Existence gate for a required input. Records a skip and returns `false`
    /// when the path is absent.
    pub fn require(&mut self, chromosome: Chromosome, path: &Path) -> bool {
        if path.exists() {
            true
        } else {
            self.record_skip(Some(chromosome), path);
            false
        }
    }

    /// Logs the closing one-line account of the stage and hands the summary back.
    pub fn finish(self) -> Self {
        info!(
            "{}: {} completed, {} skipped",
            self.stage,
            self.completed,
            self.skipped.len()
        );
        self
    }
}

/// Everything a stage function needs to act on the world: the directory
/// layout, the engine configuration, the process invoker, and the run mode.
/// Immutable and passed by reference; stages hold no other ambient state.
pub struct StageContext<'a> {
    pub layout: &'a WorkspaceLayout,
    pub engine: &'a EngineConfig,
    pub invoker: &'a dyn EngineInvoker,
    pub mode: RunMode,
}

impl StageContext<'_> {
    /// Runs one external command under the stage's run mode.
    ///
    /// Launch failures are always errors. A non-zero exit is a warning in
    /// lenient mode and a [`PipelineError::Engine`] in strict mode.
    pub fn dispatch(&self, command: &EngineCommand) -> Result<(), PipelineError> {
        let outcome = self.invoker.invoke(command)?;
        if !outcome.success() {
            match self.mode {
                RunMode::Strict => {
                    return Err(PipelineError::Engine {
                        label: command.label.clone(),
                        status: outcome.to_string(),
                    });
                }
                RunMode::Lenient => {
                    warn!("{} exited with {}; continuing", command.label, outcome);
                }
            }
        }
        Ok(())
    }
}

/// A progress bar over the chromosome loop, hidden when stderr is not a
/// terminal so batch logs stay clean.
pub fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());

    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExitOutcome;
    use std::sync::Mutex;

    struct FixedStatusInvoker {
        code: Option<i32>,
        labels: Mutex<Vec<String>>,
    }

    impl EngineInvoker for FixedStatusInvoker {
        fn invoke(&self, command: &EngineCommand) -> Result<ExitOutcome, PipelineError> {
            self.labels.lock().unwrap().push(command.label.clone());
            Ok(ExitOutcome { code: self.code })
        }
    }

    fn context_with<'a>(
        layout: &'a WorkspaceLayout,
        engine: &'a EngineConfig,
        invoker: &'a FixedStatusInvoker,
        mode: RunMode,
    ) -> StageContext<'a> {
        StageContext {
            layout,
            engine,
            invoker,
            mode,
        }
    }

    #[test]
    fn lenient_mode_swallows_nonzero_exits() -> Result<(), PipelineError> {
        let layout = WorkspaceLayout::new("result");
        let engine = EngineConfig::default();
        let invoker = FixedStatusInvoker {
            code: Some(3),
            labels: Mutex::new(Vec::new()),
        };
        let ctx = context_with(&layout, &engine, &invoker, RunMode::Lenient);

        let command = EngineCommand::new("true", "noop".to_string());
        ctx.dispatch(&command)?;
        assert_eq!(invoker.labels.lock().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn strict_mode_promotes_nonzero_exits_to_errors() {
        let layout = WorkspaceLayout::new("result");
        let engine = EngineConfig::default();
        let invoker = FixedStatusInvoker {
            code: Some(3),
            labels: Mutex::new(Vec::new()),
        };
        let ctx = context_with(&layout, &engine, &invoker, RunMode::Strict);

        let command = EngineCommand::new("true", "noop".to_string());
        let err = ctx.dispatch(&command).unwrap_err();
        assert!(matches!(err, PipelineError::Engine { .. }));
    }

    #[test]
    fn require_records_exactly_the_missing_inputs() {
        let mut summary = StageSummary::new("probe");
        let chrom = Chromosome::all().next().unwrap();
        assert!(!summary.require(chrom, Path::new("/definitely/not/here.bim")));
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].chromosome, Some(chrom));
    }
}
