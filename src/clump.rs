// ========================================================================================
//
//                     LD CLUMPING AND THE SNP LIST FILTER
//
// ========================================================================================
//
// Three operations share the clump naming contract:
//
//   1. `run_clump` drives the engine's clump subcommand per chromosome,
//      writing `.clumped` tables into the condition-tagged run folder.
//   2. `extract_clumped_snp_lists` reduces each `.clumped` table to a
//      two-column `CHR SNP` list.
//   3. `intersect_qc_and_clump` inner-joins the QC table against that list on
//      the SNP identifier, producing the filtered per-chromosome SNP list the
//      scoring stage consumes.

use log::{debug, info};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::WorkspaceLayout;
use crate::naming::{self, Chromosome, ClumpCondition, DatasetNaming};
use crate::stage::{PipelineError, StageContext, StageSummary, VisitedSet};

/// Engine-facing clump parameters. The condition names the artifact set; the
/// remaining fields tune the engine without appearing in any path.
#[derive(Debug, Clone)]
pub struct ClumpParams {
    pub condition: ClumpCondition,
    /// Secondary p-value threshold for clumped (non-index) variants.
    pub p2: f64,
    /// Summary-statistics column holding the p-value.
    pub field: String,
    /// Summary-statistics column holding the SNP identifier.
    pub snp_field: String,
}

/// Runs the engine's clump subcommand for every chromosome whose QC table and
/// bfile set are present.
///
/// The QC naming mode is decided once by the caller and applies to all 22
/// chromosomes; it is logged here so a mixed-convention QC directory can be
/// diagnosed from the run log.
pub fn run_clump(
    ctx: &StageContext<'_>,
    qc_naming: DatasetNaming,
    qc_tag: &str,
    bfile_name: &str,
    output_name: &str,
    params: &ClumpParams,
) -> Result<StageSummary, PipelineError> {
    let mut summary = StageSummary::new("clump");
    info!("clump: QC naming mode {qc_naming:?}");

    let run_dir = naming::clump_run_dir(ctx.layout, output_name, params.condition);
    fs::create_dir_all(&run_dir).map_err(|e| PipelineError::io(&run_dir, e))?;

    let mut visited = VisitedSet::new();
    for chrom in Chromosome::all() {
        let qc = naming::qc_table(ctx.layout, qc_naming, chrom, qc_tag);
        if !summary.require(chrom, &qc) {
            continue;
        }
        let bim = naming::bfile_bim(ctx.layout, chrom, bfile_name);
        if !summary.require(chrom, &bim) {
            continue;
        }

        let out_prefix =
            naming::clump_output_prefix(ctx.layout, chrom, output_name, output_name, params.condition);
        if !visited.insert(out_prefix.to_string_lossy().into_owned()) {
            continue;
        }

        let command = ctx.engine.clump(
            naming::bfile_prefix(ctx.layout, chrom, bfile_name).as_os_str(),
            qc.as_os_str(),
            params.condition.kb,
            params.condition.p1,
            params.p2,
            params.condition.r2,
            &params.field,
            &params.snp_field,
            out_prefix.as_os_str(),
            format!("clump {chrom}_{output_name}"),
        );
        ctx.dispatch(&command)?;
        summary.record_completed();
    }

    Ok(summary.finish())
}

/// Reduces each chromosome's `.clumped` table to a `CHR SNP` list, keeping
/// only the rows of that chromosome.
pub fn extract_clumped_snp_lists(
    layout: &WorkspaceLayout,
    folder_tag: &str,
    clump_name: &str,
    cond: ClumpCondition,
) -> Result<StageSummary, PipelineError> {
    let mut summary = StageSummary::new("clumped-snp-lists");

    let run_dir = naming::clump_run_dir(layout, folder_tag, cond);
    fs::create_dir_all(&run_dir).map_err(|e| PipelineError::io(&run_dir, e))?;

    let mut visited = VisitedSet::new();
    for chrom in Chromosome::all() {
        let table = naming::clumped_table(layout, chrom, folder_tag, clump_name, cond);
        if !summary.require(chrom, &table) {
            continue;
        }

        let out = naming::clumped_snp_list(layout, chrom, folder_tag, clump_name, cond);
        if !visited.insert(out.to_string_lossy().into_owned()) {
            continue;
        }

        let kept = write_chromosome_snp_list(&table, chrom, &out)?;
        debug!("{}: kept {kept} index SNPs", out.display());
        summary.record_completed();
    }

    Ok(summary.finish())
}

fn write_chromosome_snp_list(
    table: &Path,
    chrom: Chromosome,
    out: &Path,
) -> Result<usize, PipelineError> {
    let text = fs::read_to_string(table).map_err(|e| PipelineError::io(table, e))?;
    let mut lines = text.lines();

    let header = lines.next().ok_or_else(|| PipelineError::MalformedTable {
        path: table.to_path_buf(),
        line: 1,
        reason: "empty file".to_string(),
    })?;
    let header_fields: Vec<&str> = header.split_whitespace().collect();
    let chr_idx = column_index(&header_fields, "CHR", table)?;
    let snp_idx = column_index(&header_fields, "SNP", table)?;

    let wanted = chrom.number().to_string();
    let file = fs::File::create(out).map_err(|e| PipelineError::io(out, e))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "CHR SNP").map_err(|e| PipelineError::io(out, e))?;

    let mut kept = 0usize;
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Engine clump tables end with ragged footer lines; rows shorter than
        // the header are not data.
        let (Some(chr), Some(snp)) = (fields.get(chr_idx), fields.get(snp_idx)) else {
            continue;
        };
        if *chr == wanted {
            writeln!(writer, "{chr} {snp}").map_err(|e| PipelineError::io(out, e))?;
            kept += 1;
        }
    }
    writer.flush().map_err(|e| PipelineError::io(out, e))?;
    Ok(kept)
}

/// Inner-joins each chromosome's QC table against its clumped SNP list,
/// producing the filtered SNP list consumed by scoring.
#[allow(clippy::too_many_arguments)]
pub fn intersect_qc_and_clump(
    layout: &WorkspaceLayout,
    qc_naming: DatasetNaming,
    qc_tag: &str,
    folder_tag: &str,
    clump_name: &str,
    output_name: &str,
    cond: ClumpCondition,
) -> Result<StageSummary, PipelineError> {
    let mut summary = StageSummary::new("qc-clump-intersection");
    info!("qc-clump-intersection: QC naming mode {qc_naming:?}");

    let out_dir = naming::filtered_snp_dir(layout, output_name, cond);
    fs::create_dir_all(&out_dir).map_err(|e| PipelineError::io(&out_dir, e))?;

    let mut visited = VisitedSet::new();
    for chrom in Chromosome::all() {
        let clump_list = naming::clumped_snp_list(layout, chrom, folder_tag, clump_name, cond);
        if !summary.require(chrom, &clump_list) {
            continue;
        }
        let qc = naming::qc_table(layout, qc_naming, chrom, qc_tag);
        if !summary.require(chrom, &qc) {
            continue;
        }
        if !visited.insert(clump_list.to_string_lossy().into_owned()) {
            continue;
        }

        let out = naming::filtered_snp_list(layout, chrom, output_name, cond);
        let kept = filter_snps(&qc, &clump_list, &out)?;
        debug!("{}: {kept} SNPs survive the intersection", out.display());
        summary.record_completed();
    }

    Ok(summary.finish())
}

/// The SNP List Filter: keeps exactly the QC rows whose identifier appears in
/// the clumped SNP list, in QC row order, and writes them space-delimited
/// under the QC header. An empty intersection writes the header alone.
///
/// The clump list's identifier column may be named `SNP` (as the engine emits
/// it) or `SNPID` (as the QC table names it); both are accepted.
pub fn filter_snps(
    qc_path: &Path,
    clump_list_path: &Path,
    out: &Path,
) -> Result<usize, PipelineError> {
    let clump_text =
        fs::read_to_string(clump_list_path).map_err(|e| PipelineError::io(clump_list_path, e))?;
    let mut clump_lines = clump_text.lines();
    let clump_header = clump_lines
        .next()
        .ok_or_else(|| PipelineError::MalformedTable {
            path: clump_list_path.to_path_buf(),
            line: 1,
            reason: "empty file".to_string(),
        })?;
    let clump_fields: Vec<&str> = clump_header.split_whitespace().collect();
    let id_idx = clump_fields
        .iter()
        .position(|col| *col == "SNP" || *col == "SNPID")
        .ok_or_else(|| PipelineError::MalformedTable {
            path: clump_list_path.to_path_buf(),
            line: 1,
            reason: "no SNP column".to_string(),
        })?;

    let keep: HashSet<&str> = clump_lines
        .filter_map(|line| line.split_whitespace().nth(id_idx))
        .collect();

    let qc_text = fs::read_to_string(qc_path).map_err(|e| PipelineError::io(qc_path, e))?;
    let mut qc_lines = qc_text.lines();
    let qc_header = qc_lines.next().ok_or_else(|| PipelineError::MalformedTable {
        path: qc_path.to_path_buf(),
        line: 1,
        reason: "empty file".to_string(),
    })?;
    let qc_fields: Vec<&str> = qc_header.split_whitespace().collect();
    let qc_id_idx = column_index(&qc_fields, "SNPID", qc_path)?;

    let file = fs::File::create(out).map_err(|e| PipelineError::io(out, e))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", qc_fields.join(" ")).map_err(|e| PipelineError::io(out, e))?;

    let mut kept = 0usize;
    for line in qc_lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(id) = fields.get(qc_id_idx) else {
            continue;
        };
        if keep.contains(id) {
            writeln!(writer, "{}", fields.join(" ")).map_err(|e| PipelineError::io(out, e))?;
            kept += 1;
        }
    }
    writer.flush().map_err(|e| PipelineError::io(out, e))?;
    Ok(kept)
}

fn column_index(
    header: &[&str],
    name: &str,
    path: &Path,
) -> Result<usize, PipelineError> {
    header
        .iter()
        .position(|col| *col == name)
        .ok_or_else(|| PipelineError::MalformedTable {
            path: path.to_path_buf(),
            line: 1,
            reason: format!("no {name} column"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn clumped_table_reduces_to_chr_and_snp_columns() -> Result<(), PipelineError> {
        let (_root, layout) = scratch_layout();
        let chr3 = Chromosome::all().nth(2).unwrap();
        fs::create_dir_all(naming::clump_run_dir(&layout, "HDL", COND)).unwrap();
        let table = naming::clumped_table(&layout, chr3, "HDL", "HDL", COND);
        fs::write(
            &table,
            " CHR    F             SNP         BP        P    TOTAL\n\
             \x20  3    1     rs1001   742429   1.95e-08      22\n\
             \x20  4    1     rs2002   767376   3.12e-05      11\n\
             \x20  3    1     rs3003   772044   1.11e-04       6\n\n",
        )
        .unwrap();

        let summary = extract_clumped_snp_lists(&layout, "HDL", "HDL", COND)?;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.skipped.len(), Chromosome::COUNT - 1);

        let list = fs::read_to_string(naming::clumped_snp_list(&layout, chr3, "HDL", "HDL", COND))
            .unwrap();
        assert_eq!(list, "CHR SNP\n3 rs1001\n3 rs3003\n");
        Ok(())
    }

    #[test]
    fn filter_keeps_qc_rows_in_qc_order() -> Result<(), PipelineError> {
        let root = tempdir().expect("tempdir");
        let qc = root.path().join("qc.csv");
        let clump = root.path().join("clump.csv");
        let out = root.path().join("out.csv");
        fs::write(
            &qc,
            "SNPID Allele Beta SE Pvalue\n\
             rs3 A 0.3 0.03 0.003\n\
             rs1 T 0.1 0.01 0.001\n\
             rs2 C 0.2 0.02 0.002\n",
        )
        .unwrap();
        fs::write(&clump, "CHR SNP\n1 rs2\n1 rs3\n1 rs9\n").unwrap();

        let kept = filter_snps(&qc, &clump, &out)?;
        assert_eq!(kept, 2);
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            "SNPID Allele Beta SE Pvalue\nrs3 A 0.3 0.03 0.003\nrs2 C 0.2 0.02 0.002\n"
        );
        Ok(())
    }

    #[test]
    fn filter_is_idempotent_against_its_own_output() -> Result<(), PipelineError> {
        let root = tempdir().expect("tempdir");
        let qc = root.path().join("qc.csv");
        let clump = root.path().join("clump.csv");
        fs::write(&qc, "SNPID Allele\nrs1 A\nrs2 T\nrs3 G\n").unwrap();
        fs::write(&clump, "SNP\nrs1\nrs3\n").unwrap();

        let once = root.path().join("once.csv");
        filter_snps(&qc, &clump, &once)?;
        // Filtering the filtered list against itself must change nothing.
        let twice = root.path().join("twice.csv");
        filter_snps(&once, &once, &twice)?;
        assert_eq!(
            fs::read_to_string(&once).unwrap(),
            fs::read_to_string(&twice).unwrap()
        );
        Ok(())
    }

    #[test]
    fn empty_intersection_writes_a_header_only_file() -> Result<(), PipelineError> {
        let root = tempdir().expect("tempdir");
        let qc = root.path().join("qc.csv");
        let clump = root.path().join("clump.csv");
        let out = root.path().join("out.csv");
        fs::write(&qc, "SNPID Allele\nrs1 A\n").unwrap();
        fs::write(&clump, "CHR SNP\n1 rs77\n").unwrap();

        let kept = filter_snps(&qc, &clump, &out)?;
        assert_eq!(kept, 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "SNPID Allele\n");
        Ok(())
    }
}
