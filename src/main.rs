// ========================================================================================
//
//                        THE PIPELINE ORCHESTRATOR: PRSPIPE
//
// ========================================================================================
//
// The binary exposes one subcommand per pipeline stage plus a manifest-driven
// `run` that chains the scoring pass end to end. `main` owns the immutable
// run-wide state (directory layout, engine configuration, invoker, run mode)
// and hands it to the stage functions; the stages own nothing ambient.

#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use prspipe::bfiles;
use prspipe::clump::{self, ClumpParams};
use prspipe::config::{PipelineManifest, WorkspaceLayout};
use prspipe::engine::{EngineConfig, SystemInvoker};
use prspipe::naming::{self, ClumpCondition, DatasetNaming};
use prspipe::prs::{self, ScoreParams};
use prspipe::qc;
use prspipe::stage::{PipelineError, RunMode, StageContext};
use prspipe::stats::{self, StatisticsJob};

// ========================================================================================
//                          Command-line interface definition
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "prspipe",
    version,
    about = "A pipeline orchestrator for polygenic risk score calculation."
)]
struct Cli {
    /// Result directory holding the fixed artifact tree.
    #[arg(long, default_value = "result", global = true)]
    result_dir: PathBuf,

    /// Treat a non-zero engine exit as an error instead of logging it.
    #[arg(long, global = true)]
    strict: bool,

    /// Kill an engine invocation after this many seconds.
    #[arg(long, value_name = "SECONDS", global = true)]
    timeout_secs: Option<u64>,

    /// Program name of the bfile/clump engine.
    #[arg(long, default_value = "plink", global = true)]
    plink: String,

    /// Program name of the dosage-scoring engine.
    #[arg(long, default_value = "plink2", global = true)]
    plink2: String,

    #[command(subcommand)]
    command: Commands,
}

/// The `{kb}_{p1}_{r2}` clump condition shared by every artifact of a run.
#[derive(Args)]
struct ConditionArgs {
    /// Clump window size in kilobases.
    #[arg(long)]
    kb: u32,

    /// Index-variant p-value threshold.
    #[arg(long)]
    p1: f64,

    /// LD r-squared threshold.
    #[arg(long, default_value_t = 0.1)]
    r2: f64,
}

impl ConditionArgs {
    fn condition(&self) -> ClumpCondition {
        ClumpCondition {
            kb: self.kb,
            p1: self.p1,
            r2: self.r2,
        }
    }
}

#[derive(Args)]
struct GenerateBfilesArgs {
    /// Directory of per-chromosome reference `.vcf.gz` files.
    #[arg(long)]
    ref_dir: PathBuf,

    /// Tag of the SNP lists under `snplists/`.
    #[arg(long)]
    snplist_name: String,

    /// Tag naming the generated bfile sets.
    #[arg(long)]
    output_name: String,

    /// Separator between the chromosome token and the rest of a VCF name.
    #[arg(long, default_value = ".")]
    symbol: String,

    /// Extra flags appended verbatim to the engine invocation.
    #[arg(long)]
    extra: Vec<String>,
}

#[derive(Args)]
struct ClumpArgs {
    /// Tag of the QC tables under `qc/`.
    #[arg(long)]
    qc_name: String,

    /// Tag of the bfile sets under `plink/bfiles/`.
    #[arg(long)]
    bfile_name: String,

    /// Tag naming the clump outputs.
    #[arg(long)]
    output_name: String,

    #[command(flatten)]
    condition: ConditionArgs,

    /// Secondary p-value threshold; defaults to `--p1`.
    #[arg(long)]
    p2: Option<f64>,

    /// Summary-statistics column holding the p-value.
    #[arg(long, default_value = "Pvalue")]
    field: String,

    /// Summary-statistics column holding the SNP identifier.
    #[arg(long, default_value = "SNPID")]
    snp_field: String,
}

#[derive(Args)]
struct SelectClumpSnpsArgs {
    /// Tag of the QC tables under `qc/`.
    #[arg(long)]
    qc_name: String,

    /// Tag of the `.clumped` files inside the run folder.
    #[arg(long)]
    clump_name: String,

    /// Tag of the clump run folder.
    #[arg(long)]
    clump_folder: String,

    /// Tag naming the filtered SNP lists.
    #[arg(long)]
    output_name: String,

    #[command(flatten)]
    condition: ConditionArgs,
}

#[derive(Args)]
struct BuildPrsArgs {
    /// Directory of per-chromosome genotype `.vcf.gz` files.
    #[arg(long)]
    vcf_dir: PathBuf,

    /// Tag of the filtered SNP lists; defaults to `--output-name`.
    #[arg(long)]
    snplist_name: Option<String>,

    /// Tag naming the score outputs.
    #[arg(long)]
    output_name: String,

    #[command(flatten)]
    condition: ConditionArgs,

    /// Separator between the chromosome token and the rest of a VCF name.
    #[arg(long, default_value = ".")]
    symbol: String,

    /// Memory cap in megabytes handed to the scoring engine.
    #[arg(long, default_value_t = 8000)]
    memory: u32,

    /// Score-file column selection handed to the engine.
    #[arg(long, default_value = "1 2 3")]
    columns: String,

    /// Scoring modifier handed to the engine.
    #[arg(long, default_value = "no-mean-imputation")]
    modifier: String,
}

#[derive(Args)]
struct StatisticsArgs {
    /// Combined score table; the stage skips when it is absent.
    #[arg(long)]
    score_file: PathBuf,

    /// Phenotype table handed to the statistics script.
    #[arg(long)]
    pheno_file: PathBuf,

    /// Dataset tag naming the filtered SNP lists to count.
    #[arg(long)]
    dataset: String,

    /// Base name of the emitted report.
    #[arg(long)]
    output_name: String,

    /// Path of the statistics script.
    #[arg(long)]
    script: PathBuf,

    /// Interpreter running the statistics script.
    #[arg(long, default_value = "Rscript")]
    r_command: String,

    #[command(flatten)]
    condition: ConditionArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Uppercase the allele column of every per-chromosome QC table
    NormalizeAlleles {
        /// Tag of the QC tables under `qc/`.
        #[arg(long)]
        name: String,
    },

    /// Build per-chromosome bfile sets from reference VCFs and SNP lists
    GenerateBfiles(GenerateBfilesArgs),

    /// Subset a sample table by column value into a population keep-list
    SubsetPop {
        /// Whitespace-delimited sample table.
        #[arg(long)]
        input: PathBuf,

        /// Column to filter on.
        #[arg(long)]
        column: String,

        /// Value the column must equal.
        #[arg(long)]
        value: String,

        /// Name of the keep-list written under `pop/`.
        #[arg(long)]
        output_name: String,
    },

    /// Re-generate bfile sets keeping only the individuals in a keep-list
    KeepIndividuals {
        /// Name of the keep-list under `pop/`.
        #[arg(long)]
        pop_name: String,

        /// Tag of the input bfile sets.
        #[arg(long)]
        bfile_name: String,

        /// Tag naming the re-generated bfile sets.
        #[arg(long)]
        output_name: String,
    },

    /// Clump the QC tables against the bfile sets per chromosome
    Clump(ClumpArgs),

    /// Reduce `.clumped` tables and intersect them with the QC tables
    SelectClumpSnps(SelectClumpSnpsArgs),

    /// Score every chromosome's genotypes against its filtered SNP list
    BuildPrs(BuildPrsArgs),

    /// Fold the per-chromosome score tables into one combined table
    CombinePrs {
        /// Tag of the scoring run.
        #[arg(long)]
        name: String,

        #[command(flatten)]
        condition: ConditionArgs,
    },

    /// Run the external statistics script and normalize its report
    Statistics(StatisticsArgs),

    /// Concatenate every statistics report of a dataset
    CombineStats {
        /// Dataset tag the reports share.
        #[arg(long)]
        dataset: String,
    },

    /// Execute the scoring pass end to end from a TOML manifest
    Run {
        /// Path of the manifest.
        #[arg(long)]
        config: PathBuf,
    },
}

// ========================================================================================
//                                  Orchestration
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let layout = WorkspaceLayout::new(&cli.result_dir);
    if let Err(e) = layout.ensure_dirs() {
        eprintln!(
            "Error creating result tree under '{}': {}",
            cli.result_dir.display(),
            e
        );
        process::exit(1);
    }

    let engine = EngineConfig {
        plink: cli.plink.clone(),
        plink2: cli.plink2.clone(),
    };
    let invoker = SystemInvoker::new(cli.timeout_secs.map(Duration::from_secs));
    let ctx = StageContext {
        layout: &layout,
        engine: &engine,
        invoker: &invoker,
        mode: if cli.strict {
            RunMode::Strict
        } else {
            RunMode::Lenient
        },
    };

    if let Err(e) = dispatch(cli.command, &ctx) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn dispatch(command: Commands, ctx: &StageContext<'_>) -> Result<(), PipelineError> {
    match command {
        Commands::NormalizeAlleles { name } => {
            qc::normalize_alleles(ctx.layout, &name)?;
        }
        Commands::GenerateBfiles(args) => {
            let mode = probe(ctx.layout.snplists_dir(), &args.snplist_name)?;
            bfiles::generate_bfiles(
                ctx,
                mode,
                &args.ref_dir,
                &args.snplist_name,
                &args.output_name,
                &args.symbol,
                &args.extra,
            )?;
        }
        Commands::SubsetPop {
            input,
            column,
            value,
            output_name,
        } => {
            let kept = qc::subset_population(ctx.layout, &input, &column, &value, &output_name)?;
            info!("subset-pop: kept {kept} individuals");
        }
        Commands::KeepIndividuals {
            pop_name,
            bfile_name,
            output_name,
        } => {
            bfiles::keep_individuals(ctx, &pop_name, &bfile_name, &output_name)?;
        }
        Commands::Clump(args) => {
            let mode = probe(ctx.layout.qc_dir(), &args.qc_name)?;
            let params = ClumpParams {
                condition: args.condition.condition(),
                p2: args.p2.unwrap_or(args.condition.p1),
                field: args.field,
                snp_field: args.snp_field,
            };
            clump::run_clump(
                ctx,
                mode,
                &args.qc_name,
                &args.bfile_name,
                &args.output_name,
                &params,
            )?;
        }
        Commands::SelectClumpSnps(args) => {
            let cond = args.condition.condition();
            clump::extract_clumped_snp_lists(ctx.layout, &args.clump_folder, &args.clump_name, cond)?;
            let mode = probe(ctx.layout.qc_dir(), &args.qc_name)?;
            clump::intersect_qc_and_clump(
                ctx.layout,
                mode,
                &args.qc_name,
                &args.clump_folder,
                &args.clump_name,
                &args.output_name,
                cond,
            )?;
        }
        Commands::BuildPrs(args) => {
            let snplist_tag = args.snplist_name.as_deref().unwrap_or(&args.output_name);
            let params = ScoreParams {
                columns: args.columns.clone(),
                modifier: args.modifier.clone(),
                memory_mb: args.memory,
            };
            prs::build_prs(
                ctx,
                &args.vcf_dir,
                snplist_tag,
                &args.output_name,
                args.condition.condition(),
                &args.symbol,
                &params,
            )?;
        }
        Commands::CombinePrs { name, condition } => {
            prs::combine_scores(ctx.layout, &name, condition.condition())?;
        }
        Commands::Statistics(args) => {
            let job = StatisticsJob {
                score_file: &args.score_file,
                pheno_file: &args.pheno_file,
                dataset_tag: &args.dataset,
                output_name: &args.output_name,
                script: &args.script,
                r_command: &args.r_command,
                condition: args.condition.condition(),
            };
            stats::run_statistics(ctx, &job)?;
        }
        Commands::CombineStats { dataset } => {
            let combined = stats::combine_stat_reports(ctx.layout, &dataset)?;
            info!("combine-stats: concatenated {combined} reports");
        }
        Commands::Run { config } => {
            run_manifest(ctx, &config)?;
        }
    }
    Ok(())
}

/// The manifest-driven scoring pass: clump, select, score, combine, and
/// (when configured) statistics, all under one dataset tag and condition.
fn run_manifest(ctx: &StageContext<'_>, config: &Path) -> Result<(), PipelineError> {
    let manifest = PipelineManifest::load(config)?;
    let dataset = manifest.dataset.as_str();
    let cond = manifest.condition;
    let bfile_name = manifest.clump.bfile_name.as_deref().unwrap_or(dataset);

    let mode = probe(ctx.layout.qc_dir(), dataset)?;
    let params = ClumpParams {
        condition: cond,
        p2: manifest.clump.p2.unwrap_or(cond.p1),
        field: manifest.clump.field.clone(),
        snp_field: manifest.clump.snp_field.clone(),
    };
    clump::run_clump(ctx, mode, dataset, bfile_name, dataset, &params)?;
    clump::extract_clumped_snp_lists(ctx.layout, dataset, dataset, cond)?;
    clump::intersect_qc_and_clump(ctx.layout, mode, dataset, dataset, dataset, dataset, cond)?;

    let score_params = ScoreParams {
        memory_mb: manifest.memory_mb,
        ..ScoreParams::default()
    };
    prs::build_prs(
        ctx,
        &manifest.vcf_dir,
        dataset,
        dataset,
        cond,
        &manifest.symbol,
        &score_params,
    )?;
    prs::combine_scores(ctx.layout, dataset, cond)?;

    if let Some(statistics) = &manifest.statistics {
        let score_file = naming::combined_score_file(ctx.layout, dataset, cond);
        let job = StatisticsJob {
            score_file: &score_file,
            pheno_file: &statistics.pheno_file,
            dataset_tag: dataset,
            output_name: dataset,
            script: &statistics.script,
            r_command: &statistics.r_command,
            condition: cond,
        };
        stats::run_statistics(ctx, &job)?;
    }

    info!("run: scoring pass for {dataset}_{cond} finished");
    Ok(())
}

fn probe(dir: &Path, tag: &str) -> Result<DatasetNaming, PipelineError> {
    naming::probe_naming(dir, tag).map_err(|e| PipelineError::io(dir, e))
}
