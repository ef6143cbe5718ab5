//! Cross-stage flow over the file-backed stages.
//!
//! The naming contract is what ties the stages together: these tests seed a
//! scratch workspace, run clump extraction, QC intersection, score
//! aggregation, and the SNP count against each other, and check that each
//! stage finds exactly what the previous one wrote.

use approx::assert_relative_eq;
use prspipe::clump::{self, ClumpParams};
use prspipe::config::WorkspaceLayout;
use prspipe::engine::{EngineCommand, EngineConfig, EngineInvoker, ExitOutcome};
use prspipe::naming::{self, Chromosome, ClumpCondition, DatasetNaming};
use prspipe::prs;
use prspipe::stage::{PipelineError, RunMode, StageContext};
use prspipe::stats;
use std::fs;
use std::sync::Mutex;
use tempfile::tempdir;

const COND: ClumpCondition = ClumpCondition {
    kb: 250,
    p1: 0.05,
    r2: 0.1,
};

fn chrom(nb: u8) -> Chromosome {
    Chromosome::all()
        .find(|c| c.number() == nb)
        .expect("autosome in 1..=22")
}

fn scratch_layout() -> (tempfile::TempDir, WorkspaceLayout) {
    let root = tempdir().expect("tempdir");
    let layout = WorkspaceLayout::new(root.path().join("result"));
    layout.ensure_dirs().expect("ensure dirs");
    (root, layout)
}

#[derive(Default)]
struct RecordingInvoker {
    commands: Mutex<Vec<String>>,
}

impl EngineInvoker for RecordingInvoker {
    fn invoke(&self, command: &EngineCommand) -> Result<ExitOutcome, PipelineError> {
        self.commands.lock().unwrap().push(command.rendered());
        Ok(ExitOutcome { code: Some(0) })
    }
}

#[test]
fn extraction_output_is_exactly_what_intersection_reads() -> Result<(), PipelineError> {
    let (_root, layout) = scratch_layout();

    // QC tables for chr1 and chr2; a clumped table for chr1 only.
    fs::write(
        naming::qc_table(&layout, DatasetNaming::PerChromosome, chrom(1), "HDL"),
        "SNPID Allele Beta SE Pvalue\nrs11 A 0.10 0.01 1e-8\nrs12 T 0.20 0.02 1e-6\nrs13 G 0.30 0.03 1e-4\n",
    )
    .unwrap();
    fs::write(
        naming::qc_table(&layout, DatasetNaming::PerChromosome, chrom(2), "HDL"),
        "SNPID Allele Beta SE Pvalue\nrs21 C 0.40 0.04 1e-5\n",
    )
    .unwrap();
    fs::create_dir_all(naming::clump_run_dir(&layout, "HDL", COND)).unwrap();
    fs::write(
        naming::clumped_table(&layout, chrom(1), "HDL", "HDL", COND),
        " CHR   F    SNP        BP          P   TOTAL\n\
         \x20  1   1   rs11    742429    1.9e-08      22\n\
         \x20  1   1   rs13    772044    1.1e-04       6\n",
    )
    .unwrap();

    let extracted = clump::extract_clumped_snp_lists(&layout, "HDL", "HDL", COND)?;
    assert_eq!(extracted.completed, 1);
    assert_eq!(extracted.skipped.len(), Chromosome::COUNT - 1);

    let intersected = clump::intersect_qc_and_clump(
        &layout,
        DatasetNaming::PerChromosome,
        "HDL",
        "HDL",
        "HDL",
        "HDL",
        COND,
    )?;
    assert_eq!(intersected.completed, 1);
    // chr2 has a QC table but no clumped list; it is one of the 21 skips.
    assert!(intersected
        .skipped
        .iter()
        .any(|skip| skip.chromosome == Some(chrom(2))));

    let filtered =
        fs::read_to_string(naming::filtered_snp_list(&layout, chrom(1), "HDL", COND)).unwrap();
    assert_eq!(
        filtered,
        "SNPID Allele Beta SE Pvalue\nrs11 A 0.10 0.01 1e-8\nrs13 G 0.30 0.03 1e-4\n"
    );

    // The SNP count downstream sees exactly the intersected rows.
    assert_eq!(stats::total_snp_count(&layout, "HDL", COND)?, 2);
    Ok(())
}

#[test]
fn clump_stage_skip_count_equals_missing_input_count() -> Result<(), PipelineError> {
    let (_root, layout) = scratch_layout();

    // QC tables for chr1..=4, bfile sets for chr1 and chr3 only.
    for nb in 1..=4 {
        fs::write(
            naming::qc_table(&layout, DatasetNaming::PerChromosome, chrom(nb), "HDL"),
            "SNPID Allele Beta SE Pvalue\n",
        )
        .unwrap();
    }
    for nb in [1, 3] {
        fs::write(naming::bfile_bim(&layout, chrom(nb), "HDL"), "").unwrap();
    }

    let engine = EngineConfig::default();
    let invoker = RecordingInvoker::default();
    let ctx = StageContext {
        layout: &layout,
        engine: &engine,
        invoker: &invoker,
        mode: RunMode::Lenient,
    };
    let params = ClumpParams {
        condition: COND,
        p2: COND.p1,
        field: "Pvalue".to_string(),
        snp_field: "SNPID".to_string(),
    };

    let summary = clump::run_clump(&ctx, DatasetNaming::PerChromosome, "HDL", "HDL", "HDL", &params)?;
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.skipped.len(), Chromosome::COUNT - 2);
    assert_eq!(invoker.commands.lock().unwrap().len(), 2);

    // The engine was pointed at the condition-tagged output prefix.
    let expected_out = naming::clump_output_prefix(&layout, chrom(1), "HDL", "HDL", COND);
    assert!(invoker.commands.lock().unwrap()[0].contains(&expected_out.to_string_lossy().into_owned()));
    Ok(())
}

#[test]
fn aggregation_matches_hand_computed_totals_across_partials() -> Result<(), PipelineError> {
    let (_root, layout) = scratch_layout();

    let run_dir = naming::score_run_dir(&layout, "HDL", COND);
    fs::create_dir_all(&run_dir).unwrap();
    let header = "#IID\tALLELE_CT\tNAMED_ALLELE_DOSAGE_SUM\tSCORE1_AVG\n";
    fs::write(
        run_dir.join("chr1_HDL_250_0.05_0.1.sscore"),
        format!("{header}S1 2 0 0.5\nS2 4 0 0.25\n"),
    )
    .unwrap();
    fs::write(
        run_dir.join("chr2_HDL_250_0.05_0.1.sscore"),
        format!("{header}S1 3 0 0.7\n"),
    )
    .unwrap();

    let outcome = prs::combine_scores(&layout, "HDL", COND)?;
    assert_eq!(outcome.files, 2);
    assert_eq!(outcome.samples, 2);
    assert!(!run_dir.exists(), "partials are deleted after the combine");

    let text = fs::read_to_string(outcome.output.expect("combined table written")).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("id\tALLELE_CT\tSCORE_SUM"));

    let s1: Vec<&str> = lines.next().unwrap().split('\t').collect();
    assert_eq!(s1[0], "S1");
    assert_relative_eq!(s1[1].parse::<f64>().unwrap(), 5.0, epsilon = 1e-9);
    assert_relative_eq!(
        s1[2].parse::<f64>().unwrap(),
        2.0 * 0.5 + 3.0 * 0.7,
        epsilon = 1e-9
    );

    let s2: Vec<&str> = lines.next().unwrap().split('\t').collect();
    assert_eq!(s2[0], "S2");
    assert_relative_eq!(s2[1].parse::<f64>().unwrap(), 4.0, epsilon = 1e-9);
    assert_relative_eq!(s2[2].parse::<f64>().unwrap(), 1.0, epsilon = 1e-9);
    Ok(())
}
