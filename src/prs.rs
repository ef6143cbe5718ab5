// ========================================================================================
//
//                    DOSAGE SCORING AND SCORE AGGREGATION
//
// ========================================================================================
//
// `build_prs` drives the engine's dosage-scoring subcommand once per
// chromosome, producing partial `.sscore` tables in the condition-tagged run
// folder. `combine_scores` then folds those partials into one combined table
// keyed by sample identifier.
//
// Aggregation rules, fixed by the `.sscore` contract: column 0 is the sample
// id, column 1 the allele count, column 3 the dosage score. Each row
// contributes `(allele_count, score * allele_count)`; per-sample totals are
// the independent sums of both components. Chromosomes contribute
// independently, so summation order is immaterial up to float rounding.

use itertools::Itertools;
use log::{info, warn};
use natord::compare;
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::bfiles::find_reference_vcf;
use crate::config::WorkspaceLayout;
use crate::naming::{self, Chromosome, ClumpCondition};
use crate::stage::{self, PipelineError, StageContext, StageSummary, VisitedSet};

/// Engine-facing scoring knobs that are not part of any artifact name.
#[derive(Debug, Clone)]
pub struct ScoreParams {
    /// Column selection handed to the engine, e.g. `"1 2 3"`.
    pub columns: String,
    /// Scoring modifier, e.g. `"no-mean-imputation"`.
    pub modifier: String,
    /// Memory cap in megabytes.
    pub memory_mb: u32,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            columns: "1 2 3".to_string(),
            modifier: "no-mean-imputation".to_string(),
            memory_mb: 8000,
        }
    }
}

/// Scores every chromosome whose reference VCF and filtered SNP list are
/// present, writing partial `.sscore` tables plus a wall-clock timing table
/// for the whole run.
pub fn build_prs(
    ctx: &StageContext<'_>,
    vcf_dir: &Path,
    snplist_tag: &str,
    output_name: &str,
    cond: ClumpCondition,
    symbol: &str,
    params: &ScoreParams,
) -> Result<StageSummary, PipelineError> {
    let mut summary = StageSummary::new("build-prs");

    let run_dir = naming::score_run_dir(ctx.layout, output_name, cond);
    fs::create_dir_all(&run_dir).map_err(|e| PipelineError::io(&run_dir, e))?;

    let timing_path = naming::timing_table(ctx.layout, output_name, cond);
    let timing_file = fs::File::create(&timing_path).map_err(|e| PipelineError::io(&timing_path, e))?;
    let mut timing = BufWriter::new(timing_file);

    let pb = stage::create_progress_bar(Chromosome::COUNT as u64, "scoring chromosomes");
    let total_start = Instant::now();
    let mut visited = VisitedSet::new();

    for chrom in Chromosome::all() {
        let chrom_start = Instant::now();

        let weights = naming::filtered_snp_list(ctx.layout, chrom, snplist_tag, cond);
        if summary.require(chrom, &weights) {
            match find_reference_vcf(vcf_dir, chrom, symbol)? {
                None => {
                    summary.record_skip(Some(chrom), &vcf_dir.join(format!("{chrom}{symbol}*.vcf.gz")));
                }
                Some(vcf) => {
                    if visited.insert(weights.to_string_lossy().into_owned()) {
                        let out_prefix =
                            naming::score_output_prefix(ctx.layout, chrom, output_name, cond);
                        let score_start = Instant::now();
                        let command = ctx.engine.score(
                            vcf.as_os_str(),
                            weights.as_os_str(),
                            &params.columns,
                            &params.modifier,
                            params.memory_mb,
                            out_prefix.as_os_str(),
                            format!("score {chrom}_{output_name}"),
                        );
                        ctx.dispatch(&command)?;
                        writeln!(
                            timing,
                            "[score] {}: {:.3}",
                            weights.display(),
                            score_start.elapsed().as_secs_f64()
                        )
                        .map_err(|e| PipelineError::io(&timing_path, e))?;
                        summary.record_completed();
                    }
                }
            }
        }

        writeln!(
            timing,
            "[chromosome] {chrom}: {:.3}",
            chrom_start.elapsed().as_secs_f64()
        )
        .map_err(|e| PipelineError::io(&timing_path, e))?;
        pb.inc(1);
    }

    writeln!(timing, "[total]: {:.3}", total_start.elapsed().as_secs_f64())
        .map_err(|e| PipelineError::io(&timing_path, e))?;
    timing.flush().map_err(|e| PipelineError::io(&timing_path, e))?;
    pb.finish_and_clear();

    Ok(summary.finish())
}

/// What `combine_scores` did: how many partial files were folded, how many
/// samples the combined table holds, and where it was written (`None` when
/// the run folder was absent and nothing happened).
#[derive(Debug)]
pub struct CombineOutcome {
    pub files: usize,
    pub samples: usize,
    pub output: Option<PathBuf>,
}

/// Folds every partial `.sscore` table in the run folder into one combined
/// score table, then deletes the folder of partials.
///
/// Partials are read in natural name order; samples appear in the combined
/// output in order of first appearance across that sequence. The combined
/// table is written to a temporary sibling and atomically renamed into place
/// before any partial is deleted, so a failed write leaves every partial
/// intact.
pub fn combine_scores(
    layout: &WorkspaceLayout,
    output_name: &str,
    cond: ClumpCondition,
) -> Result<CombineOutcome, PipelineError> {
    let run_dir = naming::score_run_dir(layout, output_name, cond);
    if !run_dir.is_dir() {
        warn!("combine-scores: {} not found, skipped", run_dir.display());
        return Ok(CombineOutcome {
            files: 0,
            samples: 0,
            output: None,
        });
    }

    let partials: Vec<PathBuf> = fs::read_dir(&run_dir)
        .map_err(|e| PipelineError::io(&run_dir, e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "sscore"))
        .sorted_by(|a, b| compare(&a.to_string_lossy(), &b.to_string_lossy()))
        .collect();
    if partials.is_empty() {
        warn!("combine-scores: no partial score files under {}", run_dir.display());
    }

    let mut order: Vec<String> = Vec::new();
    let mut table: HashMap<String, Vec<(f64, f64)>> = HashMap::new();

    for path in &partials {
        accumulate_partial(path, &mut order, &mut table)?;
    }

    let combined = naming::combined_score_file(layout, output_name, cond);
    let tmp = combined.with_extension("sscore.tmp");
    write_combined(&tmp, &order, &table)?;
    fs::rename(&tmp, &combined).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PipelineError::io(&combined, e)
    })?;

    // Only now that the combined table is durable do the partials go away.
    fs::remove_dir_all(&run_dir).map_err(|e| PipelineError::io(&run_dir, e))?;
    info!(
        "combine-scores: folded {} files into {} ({} samples); partials deleted",
        partials.len(),
        combined.display(),
        order.len()
    );

    Ok(CombineOutcome {
        files: partials.len(),
        samples: order.len(),
        output: Some(combined),
    })
}

fn accumulate_partial(
    path: &Path,
    order: &mut Vec<String>,
    table: &mut HashMap<String, Vec<(f64, f64)>>,
) -> Result<(), PipelineError> {
    let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    // First line is the engine's header; every later non-empty line is a sample.
    for (line_nb, line) in text.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (id, allele_ct, score) = parse_score_row(&fields, path, line_nb + 1)?;

        let weighted = score * allele_ct;
        if !table.contains_key(id) {
            order.push(id.to_string());
        }
        table
            .entry(id.to_string())
            .or_default()
            .push((allele_ct, weighted));
    }
    Ok(())
}

fn parse_score_row<'a>(
    fields: &[&'a str],
    path: &Path,
    line: usize,
) -> Result<(&'a str, f64, f64), PipelineError> {
    let malformed = |reason: String| PipelineError::MalformedTable {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let id = fields
        .first()
        .copied()
        .ok_or_else(|| malformed("empty row".to_string()))?;
    let allele_ct = fields
        .get(1)
        .ok_or_else(|| malformed("no allele count column".to_string()))?
        .parse::<f64>()
        .map_err(|e| malformed(format!("allele count: {e}")))?;
    let score = fields
        .get(3)
        .ok_or_else(|| malformed("no score column".to_string()))?
        .parse::<f64>()
        .map_err(|e| malformed(format!("score: {e}")))?;
    Ok((id, allele_ct, score))
}

fn write_combined(
    path: &Path,
    order: &[String],
    table: &HashMap<String, Vec<(f64, f64)>>,
) -> Result<(), PipelineError> {
    let file = fs::File::create(path).map_err(|e| PipelineError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "id\tALLELE_CT\tSCORE_SUM").map_err(|e| PipelineError::io(path, e))?;

    for id in order {
        let contributions = &table[id];
        let allele_ct: f64 = contributions.iter().map(|(ct, _)| ct).sum();
        let score_sum: f64 = contributions.iter().map(|(_, weighted)| weighted).sum();
        writeln!(writer, "{id}\t{allele_ct}\t{score_sum}").map_err(|e| PipelineError::io(path, e))?;
    }
    writer.flush().map_err(|e| PipelineError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    const COND: ClumpCondition = ClumpCondition {
        kb: 250,
        p1: 0.02,
        r2: 0.1,
    };

    fn scratch_layout() -> (tempfile::TempDir, WorkspaceLayout) {
        let root = tempdir().expect("tempdir");
        let layout = WorkspaceLayout::new(root.path().join("result"));
        layout.ensure_dirs().expect("ensure dirs");
        (root, layout)
    }

    fn write_partial(layout: &WorkspaceLayout, chrom_nb: u8, rows: &str) {
        let dir = naming::score_run_dir(layout, "HDL", COND);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(format!("chr{chrom_nb}_HDL_250_0.02_0.1.sscore")),
            format!("#IID\tALLELE_CT\tNAMED_ALLELE_DOSAGE_SUM\tSCORE1_AVG\n{rows}"),
        )
        .unwrap();
    }

    fn combined_rows(layout: &WorkspaceLayout) -> Vec<(String, f64, f64)> {
        let text = fs::read_to_string(naming::combined_score_file(layout, "HDL", COND)).unwrap();
        text.lines()
            .skip(1)
            .map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                (
                    fields[0].to_string(),
                    fields[1].parse().unwrap(),
                    fields[2].parse().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn weighted_sums_accumulate_across_chromosomes() -> Result<(), PipelineError> {
        let (_root, layout) = scratch_layout();
        write_partial(&layout, 1, "S1\t2\t0\t0.5\n");
        write_partial(&layout, 2, "S1\t3\t0\t0.7\n");

        let outcome = combine_scores(&layout, "HDL", COND)?;
        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.samples, 1);

        let rows = combined_rows(&layout);
        assert_eq!(rows[0].0, "S1");
        assert_relative_eq!(rows[0].1, 5.0, epsilon = 1e-9);
        assert_relative_eq!(rows[0].2, 2.0 * 0.5 + 3.0 * 0.7, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn samples_appear_in_first_appearance_order() -> Result<(), PipelineError> {
        let (_root, layout) = scratch_layout();
        // Natural order reads chr2 before chr10.
        write_partial(&layout, 2, "S9\t1\t0\t0.1\nS1\t1\t0\t0.1\n");
        write_partial(&layout, 10, "S5\t1\t0\t0.1\nS1\t1\t0\t0.1\n");

        combine_scores(&layout, "HDL", COND)?;
        let ids: Vec<String> = combined_rows(&layout).into_iter().map(|r| r.0).collect();
        assert_eq!(ids, ["S9", "S1", "S5"]);
        Ok(())
    }

    #[test]
    fn partials_are_deleted_only_after_the_combined_table_lands() -> Result<(), PipelineError> {
        let (_root, layout) = scratch_layout();
        write_partial(&layout, 1, "S1\t2\t0\t0.5\n");

        // Occupy the combined path with a directory so the rename must fail.
        let combined = naming::combined_score_file(&layout, "HDL", COND);
        fs::create_dir_all(&combined).unwrap();

        let err = combine_scores(&layout, "HDL", COND);
        assert!(err.is_err());
        assert!(
            naming::score_run_dir(&layout, "HDL", COND).is_dir(),
            "partials must survive a failed combined write"
        );

        fs::remove_dir_all(&combined).unwrap();
        let outcome = combine_scores(&layout, "HDL", COND)?;
        assert_eq!(outcome.samples, 1);
        assert!(!naming::score_run_dir(&layout, "HDL", COND).exists());
        Ok(())
    }

    #[test]
    fn missing_run_folder_is_a_skip_not_an_error() -> Result<(), PipelineError> {
        let (_root, layout) = scratch_layout();
        let outcome = combine_scores(&layout, "HDL", COND)?;
        assert_eq!(outcome.files, 0);
        assert!(outcome.output.is_none());
        Ok(())
    }

    #[test]
    fn empty_run_folder_yields_a_header_only_table() -> Result<(), PipelineError> {
        let (_root, layout) = scratch_layout();
        fs::create_dir_all(naming::score_run_dir(&layout, "HDL", COND)).unwrap();

        let outcome = combine_scores(&layout, "HDL", COND)?;
        assert_eq!(outcome.files, 0);
        let text = fs::read_to_string(outcome.output.unwrap()).unwrap();
        assert_eq!(text, "id\tALLELE_CT\tSCORE_SUM\n");
        Ok(())
    }
}
