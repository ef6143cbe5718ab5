// ========================================================================================
//
//                           THE STATISTICS DRIVER
//
// ========================================================================================
//
// The statistical model itself lives in an external script; this module only
// assembles its inputs (combined score table, phenotype file, the total SNP
// count across the 22 filtered lists), invokes it, and normalizes the report
// it emits into a tab-delimited table with scientific-notation numerics.

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use itertools::Itertools;
use log::{debug, warn};
use natord::compare;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::WorkspaceLayout;
use crate::engine::EngineCommand;
use crate::naming::{self, Chromosome, ClumpCondition};
use crate::stage::{PipelineError, StageContext, StageSummary};

/// Inputs of one statistics invocation.
#[derive(Debug, Clone)]
pub struct StatisticsJob<'a> {
    pub score_file: &'a Path,
    pub pheno_file: &'a Path,
    /// Dataset tag naming the filtered SNP lists whose rows are summed.
    pub dataset_tag: &'a str,
    /// Base name of the emitted report.
    pub output_name: &'a str,
    pub script: &'a Path,
    pub r_command: &'a str,
    pub condition: ClumpCondition,
}

/// Sums the data rows of every per-chromosome filtered SNP list; a missing
/// list contributes zero.
pub fn total_snp_count(
    layout: &WorkspaceLayout,
    dataset_tag: &str,
    cond: ClumpCondition,
) -> Result<usize, PipelineError> {
    let mut total = 0usize;
    for chrom in Chromosome::all() {
        let path = naming::filtered_snp_list(layout, chrom, dataset_tag, cond);
        if !path.exists() {
            debug!("snp count: {} not found, counts zero", path.display());
            continue;
        }
        let text = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
        total += text.lines().filter(|line| !line.trim().is_empty()).count().saturating_sub(1);
    }
    Ok(total)
}

/// Runs the external statistics script and reformats its report.
///
/// When the score file is absent nothing is spawned and no report appears; the
/// absence is a skip diagnostic, not an error. Likewise when the script
/// finishes without emitting its report.
pub fn run_statistics(
    ctx: &StageContext<'_>,
    job: &StatisticsJob<'_>,
) -> Result<StageSummary, PipelineError> {
    let mut summary = StageSummary::new("statistics");

    let total = total_snp_count(ctx.layout, job.dataset_tag, job.condition)?;
    debug!("statistics: {total} SNPs across filtered lists");

    if !job.score_file.exists() {
        summary.record_skip(None, job.score_file);
        return Ok(summary.finish());
    }

    let command = EngineCommand::new(job.r_command, format!("statistics {}", job.output_name))
        .arg("--vanilla")
        .arg(job.script)
        .arg(job.score_file)
        .arg(job.pheno_file)
        .arg(job.dataset_tag)
        .arg(job.condition.to_string())
        .arg(total.to_string())
        .arg(ctx.layout.stat_dir().join(job.output_name));
    ctx.dispatch(&command)?;

    let report = naming::stat_report(ctx.layout, job.output_name, job.condition);
    if !report.exists() {
        summary.record_skip(None, &report);
        return Ok(summary.finish());
    }

    reformat_report(&report)?;
    summary.record_completed();
    Ok(summary.finish())
}

/// Rewrites a comma-separated report in place as tab-delimited, with
/// fractional numerics in two-digit scientific notation.
pub fn reformat_report(report: &Path) -> Result<(), PipelineError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(report)?;

    let tmp = report.with_extension("txt.tmp");
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(&tmp)?;
    for record in reader.records() {
        let record = record?;
        let rewritten: StringRecord = record.iter().map(reformat_field).collect();
        writer.write_record(&rewritten)?;
    }
    writer.flush().map_err(|e| PipelineError::io(&tmp, e))?;
    drop(writer);

    fs::rename(&tmp, report).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PipelineError::io(report, e)
    })
}

fn reformat_field(field: &str) -> String {
    // Integers and non-numeric fields pass through untouched; only fractional
    // numbers are rewritten in scientific notation.
    if field.parse::<i64>().is_ok() {
        return field.to_string();
    }
    match field.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => scientific(value),
        _ => field.to_string(),
    }
}

/// `%.2E`-style rendering: two mantissa decimals, sign and two digits in the
/// exponent (`3.12E+02`).
fn scientific(value: f64) -> String {
    let formatted = format!("{value:.2e}");
    let (mantissa, exponent) = formatted
        .split_once('e')
        .expect("float formatting always yields an exponent");
    let exponent: i32 = exponent.parse().expect("exponent is an integer");
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}E{sign}{:02}", exponent.abs())
}

/// Concatenates every `{tag}*_stat.txt` report into one space-delimited
/// table, keeping the first report's header. Returns the number of reports
/// combined; with none present, nothing is written.
pub fn combine_stat_reports(
    layout: &WorkspaceLayout,
    dataset_tag: &str,
) -> Result<usize, PipelineError> {
    let stat_dir = layout.stat_dir();
    let reports: Vec<PathBuf> = fs::read_dir(stat_dir)
        .map_err(|e| PipelineError::io(stat_dir, e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy())
                .is_some_and(|name| name.starts_with(dataset_tag) && name.ends_with("_stat.txt"))
        })
        .sorted_by(|a, b| compare(&a.to_string_lossy(), &b.to_string_lossy()))
        .collect();

    if reports.is_empty() {
        warn!("combine-stats: no {dataset_tag}*_stat.txt reports to combine");
        return Ok(0);
    }

    let out = naming::combined_stat_report(layout, dataset_tag);
    let mut writer = WriterBuilder::new().delimiter(b' ').from_path(&out)?;

    for (file_nb, report) in reports.iter().enumerate() {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(report)?;
        for (record_nb, record) in reader.records().enumerate() {
            // Every report repeats the header; keep the first file's only.
            if file_nb > 0 && record_nb == 0 {
                continue;
            }
            writer.write_record(&record?)?;
        }
    }
    writer.flush().map_err(|e| PipelineError::io(&out, e))?;

    Ok(reports.len())
}
