//! Summary-statistics normalization and population subsetting.

use csv::WriterBuilder;
use log::debug;
use std::fs;
use std::path::Path;

use crate::config::WorkspaceLayout;
use crate::naming::{self, Chromosome, DatasetNaming};
use crate::stage::{PipelineError, StageSummary};

/// Uppercases the allele column of every per-chromosome QC table, in place.
///
/// This is the one artifact mutation in the pipeline: the QC tables are
/// rewritten where they stand so every downstream consumer sees canonical
/// allele letters. Missing tables are skipped, like everywhere else.
pub fn normalize_alleles(
    layout: &WorkspaceLayout,
    qc_tag: &str,
) -> Result<StageSummary, PipelineError> {
    let mut summary = StageSummary::new("normalize-alleles");

    for chrom in Chromosome::all() {
        let path = naming::qc_table(layout, DatasetNaming::PerChromosome, chrom, qc_tag);
        if !summary.require(chrom, &path) {
            continue;
        }
        rewrite_allele_column(&path)?;
        debug!("normalized alleles in {}", path.display());
        summary.record_completed();
    }

    Ok(summary.finish())
}

fn rewrite_allele_column(path: &Path) -> Result<(), PipelineError> {
    let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let mut lines = text.lines();

    let header = lines.next().ok_or_else(|| PipelineError::MalformedTable {
        path: path.to_path_buf(),
        line: 1,
        reason: "empty file".to_string(),
    })?;
    let allele_idx = header
        .split_whitespace()
        .position(|col| col == "Allele")
        .ok_or_else(|| PipelineError::MalformedTable {
            path: path.to_path_buf(),
            line: 1,
            reason: "no Allele column".to_string(),
        })?;

    let mut out = String::with_capacity(text.len());
    out.push_str(&header.split_whitespace().collect::<Vec<_>>().join(" "));
    out.push('\n');

    for (line_nb, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let allele = fields
            .get_mut(allele_idx)
            .ok_or_else(|| PipelineError::MalformedTable {
                path: path.to_path_buf(),
                line: line_nb + 2,
                reason: format!("row has no column {allele_idx}"),
            })?;
        *allele = allele.to_ascii_uppercase();
        out.push_str(&fields.join(" "));
        out.push('\n');
    }

    fs::write(path, out).map_err(|e| PipelineError::io(path, e))
}

/// Filters a whitespace-delimited sample table down to the rows whose `column`
/// equals `value`, writing the subset as a tab-separated keep-list into the
/// pop directory. Returns the number of rows kept.
pub fn subset_population(
    layout: &WorkspaceLayout,
    input: &Path,
    column: &str,
    value: &str,
    output_name: &str,
) -> Result<usize, PipelineError> {
    let text = fs::read_to_string(input).map_err(|e| PipelineError::io(input, e))?;
    let mut lines = text.lines();

    let header = lines.next().ok_or_else(|| PipelineError::MalformedTable {
        path: input.to_path_buf(),
        line: 1,
        reason: "empty file".to_string(),
    })?;
    let header_fields: Vec<&str> = header.split_whitespace().collect();
    let column_idx = header_fields
        .iter()
        .position(|col| *col == column)
        .ok_or_else(|| PipelineError::MalformedTable {
            path: input.to_path_buf(),
            line: 1,
            reason: format!("no {column} column"),
        })?;

    let out_path = naming::pop_file(layout, output_name);
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&out_path)
        .map_err(PipelineError::Csv)?;
    writer.write_record(&header_fields)?;

    let mut kept = 0usize;
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.get(column_idx).copied() == Some(value) {
            writer.write_record(&fields)?;
            kept += 1;
        }
    }
    writer.flush().map_err(|e| PipelineError::io(&out_path, e))?;

    debug!("kept {kept} individuals in {}", out_path.display());
    Ok(kept)
}
