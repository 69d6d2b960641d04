use approx::assert_abs_diff_eq;
use methylprep::annotation::AnnotationResolver;
use methylprep::assemble::{assemble_cohort, AssemblyOptions};
use methylprep::config::{PipelineConfig, ThresholdComparison};
use methylprep::output::read_matrix_tsv;
use methylprep::raw::read_sample_sheet;
use methylprep::run_pipeline;
use methylprep::types::{Partition, SkipKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const MANIFEST: &str = "\
probe_id,gene_symbol,chr,is_snp,is_cross_reactive
P1,G1,chr1,false,false
P2,G1;G1-AS1,chr1,false,false
P3,G3,chr2,false,false
P4,G2,chr3,false,false
P5,G5,chr4,false,false
P6,G6,chrX,false,false
";

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    config_path: PathBuf,
    sheet_path: PathBuf,
}

fn write(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
}

/// Two 450K arrays in one project. P3 is cross-reactive, P5 overlaps a SNP, P6 sits on
/// chrX; P1 and P2 map to G1 and P4 to G2. The second sample has no value for P4.
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    write(&root.join("manifest_450k.csv"), MANIFEST);
    write(&root.join("cross_reactive.txt"), "P3\n");
    write(&root.join("snps.txt"), "# common SNPs\nP5\n");

    fs::create_dir(root.join("raw")).unwrap();
    write(
        &root.join("raw/s1.level3betas.txt"),
        "probe\tbeta\nP1\t0.2\nP2\t0.4\nP3\t0.9\nP4\t0.7\nP5\t0.1\nP6\t0.5\n",
    );
    write(
        &root.join("raw/s2.level3betas.txt"),
        "probe\tbeta\nP1\t0.6\nP2\t0.8\nP3\t0.1\nP4\tNA\nP5\t0.3\nP6\t0.5\n",
    );

    let sheet_path = root.join("samples.csv");
    write(
        &sheet_path,
        "file_name,project_id,platform,submitter_id,primary_diagnosis\n\
         raw/s1.level3betas.txt,TCGA-TEST,Illumina Human Methylation 450,TCGA-AA-0001-01A-11D-A123-05,tumor\n\
         raw/s2.level3betas.txt,TCGA-TEST,Illumina Human Methylation 450,TCGA-AA-0002-01A-11D-A123-05,tumor\n\
         raw/s3.level3betas.txt,TCGA-TEST,Illumina Human Methylation EPIC,TCGA-AA-0003-01A-11D-A123-05,tumor\n",
    );

    let config_path = root.join("pipeline.toml");
    let config = format!(
        "seed = 7\n\
         threads = 2\n\
         label_column = \"primary_diagnosis\"\n\
         \n\
         [annotation]\n\
         manifest_450k = '{manifest}'\n\
         cross_reactive_list = '{cross}'\n\
         snp_list = '{snp}'\n\
         \n\
         [qc]\n\
         max_missing_probe = 0.5\n\
         max_missing_sample = 0.4\n",
        manifest = root.join("manifest_450k.csv").display(),
        cross = root.join("cross_reactive.txt").display(),
        snp = root.join("snps.txt").display(),
    );
    write(&config_path, &config);

    Fixture {
        _dir: dir,
        root,
        config_path,
        sheet_path,
    }
}

#[test]
fn excluded_probes_never_reach_the_gene_matrix() {
    let fx = fixture();
    let config = PipelineConfig::from_toml_path(&fx.config_path).unwrap();
    let resolver = AnnotationResolver::from_config(&config.annotation).unwrap();
    let (records, sheet_failures) =
        read_sample_sheet(&fx.sheet_path, config.label_column.as_deref()).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(sheet_failures.count(SkipKind::Parse), 1);

    let assembly = assemble_cohort(
        "TCGA-TEST",
        &records,
        &resolver,
        &AssemblyOptions::from_config(&config),
    )
    .unwrap();
    let m = &assembly.matrix;
    assert_eq!(m.genes, vec!["G1", "G2"]);
    assert_eq!(m.sample_ids(), vec!["TCGA-AA-0001-01", "TCGA-AA-0002-01"]);
    assert_abs_diff_eq!(m.values[[0, 0]], 0.3, epsilon = 1e-12);
    assert_abs_diff_eq!(m.values[[1, 0]], 0.7, epsilon = 1e-12);
    assert_abs_diff_eq!(m.values[[0, 1]], 0.7, epsilon = 1e-12);
    assert!(m.values[[1, 1]].is_nan());
}

#[test]
fn worked_example_keeps_gene_at_threshold_and_drops_sparse_sample() {
    let fx = fixture();
    let config = PipelineConfig::from_toml_path(&fx.config_path).unwrap();
    let resolver = AnnotationResolver::from_config(&config.annotation).unwrap();
    let (records, sheet_failures) =
        read_sample_sheet(&fx.sheet_path, config.label_column.as_deref()).unwrap();

    let run = run_pipeline(
        records,
        sheet_failures,
        &resolver,
        &config,
        &AssemblyOptions::from_config(&config),
    )
    .unwrap();

    // Variance filtering is left at its default. G2 is 1/2 missing: kept at a 50%
    // threshold. Sample 2 is then 1/2 missing over {G1, G2}, above the 40% sample
    // threshold.
    assert!(config.qc.drop_zero_variance);
    assert_eq!(run.matrix.genes, vec!["G1", "G2"]);
    assert_eq!(run.matrix.sample_ids(), vec!["TCGA-AA-0001-01"]);
    assert_abs_diff_eq!(run.matrix.values[[0, 0]], 0.3, epsilon = 1e-12);
    assert_abs_diff_eq!(run.matrix.values[[0, 1]], 0.7, epsilon = 1e-12);
    assert_eq!(run.matrix.samples[0].label.as_deref(), Some("tumor"));

    let summary = &run.report.projects[0];
    assert!(summary.dropped_genes.is_empty());
    assert_eq!(summary.dropped_samples, vec!["TCGA-AA-0002-01"]);
    assert_eq!(run.report.sample_failures.len(), 1);
    assert_eq!(run.splits.get("TCGA-AA-0001-01"), Some(Partition::Train));
}

#[test]
fn strict_comparison_drops_the_gene_at_threshold() {
    let fx = fixture();
    let mut config = PipelineConfig::from_toml_path(&fx.config_path).unwrap();
    config.qc.comparison = ThresholdComparison::Strict;
    let resolver = AnnotationResolver::from_config(&config.annotation).unwrap();
    let (records, sheet_failures) =
        read_sample_sheet(&fx.sheet_path, config.label_column.as_deref()).unwrap();

    let run = run_pipeline(
        records,
        sheet_failures,
        &resolver,
        &config,
        &AssemblyOptions::from_config(&config),
    )
    .unwrap();
    assert_eq!(run.matrix.genes, vec!["G1"]);
    assert_eq!(run.matrix.n_samples(), 2);
}

#[test]
fn command_line_run_writes_reloadable_outputs() {
    let fx = fixture();
    let prefix = fx.root.join("out").join("cohort");
    let status = Command::new(env!("CARGO_BIN_EXE_methylprep"))
        .arg("--config")
        .arg(&fx.config_path)
        .arg("--sample-sheet")
        .arg(&fx.sheet_path)
        .arg("--out")
        .arg(&prefix)
        .arg("--log-level")
        .arg("warn")
        .status()
        .unwrap();
    assert!(status.success());

    let with_suffix = |suffix: &str| PathBuf::from(format!("{}.{}", prefix.display(), suffix));
    let matrix = read_matrix_tsv(&with_suffix("matrix.tsv")).unwrap();
    assert_eq!(matrix.genes, vec!["G1", "G2"]);
    assert_eq!(matrix.sample_ids, vec!["TCGA-AA-0001-01"]);

    let train = read_matrix_tsv(&with_suffix("train.tsv")).unwrap();
    assert_eq!(train.sample_ids, matrix.sample_ids);
    let test = read_matrix_tsv(&with_suffix("test.tsv")).unwrap();
    assert!(test.sample_ids.is_empty());

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(with_suffix("report.json")).unwrap()).unwrap();
    assert_eq!(report["seed"], 7);
    assert_eq!(report["sample_failures"]["samples"][0]["kind"], "parse");
    assert!(with_suffix("splits.tsv").exists());

    // Raw files stay unless deletion is requested.
    assert!(fx.root.join("raw/s2.level3betas.txt").exists());
}

#[test]
fn missing_manifest_aborts_the_run() {
    let fx = fixture();
    fs::remove_file(fx.root.join("manifest_450k.csv")).unwrap();
    let config = PipelineConfig::from_toml_path(&fx.config_path).unwrap();
    assert!(AnnotationResolver::from_config(&config.annotation).is_err());
}

#[test]
fn command_line_overrides_apply_before_validation() {
    let fx = fixture();
    let text = fs::read_to_string(&fx.config_path).unwrap();
    write(&fx.config_path, &text.replace("threads = 2", "threads = 0"));
    assert!(PipelineConfig::from_toml_path(&fx.config_path).is_err());

    let prefix = fx.root.join("override");
    let run = |extra: &[&str]| {
        Command::new(env!("CARGO_BIN_EXE_methylprep"))
            .arg("--config")
            .arg(&fx.config_path)
            .arg("--sample-sheet")
            .arg(&fx.sheet_path)
            .arg("--out")
            .arg(&prefix)
            .arg("--log-level")
            .arg("error")
            .args(extra)
            .status()
            .unwrap()
    };
    assert!(!run(&[]).success());
    assert!(run(&["--threads", "2"]).success());
    assert!(PathBuf::from(format!("{}.matrix.tsv", prefix.display())).exists());
}
