//! Cohort assembly: parallel parse + gene aggregation over every array of one project,
//! then barcode harmonization and matrix construction.
//!
//! Per-sample work fans out over a bounded rayon pool and every task settles to a
//! `Result`. A failing file never aborts the batch; it lands in the failure report.
//! Harmonization runs afterwards on the controller thread, in sample-sheet order.

use crate::annotation::AnnotationResolver;
use crate::config::{BarcodeLevel, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::processor::{process_sample, GeneProfile};
use crate::raw::{SampleRecord, SampleSource};
use crate::types::{ArrayType, CohortMatrix, FailureReport, SampleFailure, SampleMetadata, SkipKind};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    pub threads: usize,
    pub preferred_array_type: ArrayType,
    pub barcode_level: BarcodeLevel,
    /// Remove raw files whose data made it into the matrix. Off unless the caller asks.
    pub delete_raw: bool,
    pub show_progress: bool,
}

impl AssemblyOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            threads: config.worker_threads(),
            preferred_array_type: config.preferred_array_type,
            barcode_level: config.barcode_level,
            delete_raw: config.delete_raw_after_assembly,
            show_progress: false,
        }
    }
}

#[derive(Debug)]
pub struct Assembly {
    pub matrix: CohortMatrix,
    pub failures: FailureReport,
}

/// Truncates a vendor barcode (`TCGA-AB-1234-01A-11D-A123-05`) to its patient or sample prefix.
pub fn harmonize_barcode(barcode: &str, level: BarcodeLevel) -> String {
    let fields: Vec<&str> = barcode.trim().split('-').collect();
    if fields.len() < 3 {
        return barcode.trim().to_string();
    }
    let patient = fields[..3].join("-");
    match level {
        BarcodeLevel::Patient => patient,
        BarcodeLevel::Sample => match fields.get(3) {
            Some(sample_field) if !sample_field.is_empty() => {
                let sample_type: String = sample_field.chars().take(2).collect();
                format!("{}-{}", patient, sample_type)
            }
            _ => patient,
        },
    }
}

struct Kept<'a> {
    record: &'a SampleRecord,
    profile: GeneProfile,
}

pub fn assemble_cohort(
    project: &str,
    records: &[SampleRecord],
    resolver: &AnnotationResolver,
    options: &AssemblyOptions,
) -> Result<Assembly> {
    let start = Instant::now();
    if let Some(stray) = records.iter().find(|r| r.project != project) {
        return Err(PipelineError::configuration(format!(
            "sample {} belongs to project {}, not {}",
            stray.barcode, stray.project, project
        )));
    }
    info!(
        "Assembling project {} from {} arrays using {} worker threads...",
        project,
        records.len(),
        options.threads
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads.max(1))
        .thread_name(|i| format!("methylprep-worker-{}", i))
        .build()
        .map_err(|e| PipelineError::configuration(format!("Failed to build worker pool: {}", e)))?;

    let pb = if options.show_progress {
        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} arrays ({percent}%) ETA: {eta}",
            )
            .map_err(|e| PipelineError::configuration(format!("Failed to create progress bar style: {}", e)))?
            .progress_chars("=> ");
        ProgressBar::new(records.len() as u64).with_style(style)
    } else {
        ProgressBar::hidden()
    };

    // Barrier: every task has settled once `collect` returns.
    let settled: Vec<Result<GeneProfile>> = pool.install(|| {
        records
            .par_iter()
            .map(|record| {
                let annotations = resolver.table_for(record.array_type);
                let result = record
                    .load()
                    .and_then(|table| process_sample(&table, &annotations));
                pb.inc(1);
                result
            })
            .collect()
    });
    pb.finish_with_message(format!("{} arrays processed.", project));

    let mut failures = FailureReport::default();
    let mut kept: Vec<Kept> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    for (record, outcome) in records.iter().zip(settled) {
        let profile = match outcome {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Skipping array {} in {}: {}", record.barcode, project, e);
                failures.push(SampleFailure {
                    project: project.to_string(),
                    barcode: record.barcode.clone(),
                    source: record.source.describe(),
                    kind: SkipKind::Parse,
                    message: e.to_string(),
                });
                continue;
            }
        };
        let sample_id = harmonize_barcode(&record.barcode, options.barcode_level);

        let Some(&slot) = index_by_id.get(&sample_id) else {
            index_by_id.insert(sample_id, kept.len());
            kept.push(Kept { record, profile });
            continue;
        };

        let incumbent = &kept[slot];
        let challenger_preferred = record.array_type == options.preferred_array_type
            && incumbent.record.array_type != options.preferred_array_type;
        let (winner, loser) = if challenger_preferred {
            (record, incumbent.record)
        } else {
            (incumbent.record, record)
        };
        if record.array_type == incumbent.record.array_type {
            warn!(
                "Barcode collision in {}: {} and {} both harmonize to {} ({}); keeping the first.",
                project, incumbent.record.barcode, record.barcode, sample_id, record.array_type
            );
        } else {
            info!(
                "Barcode collision in {}: {} ({}) and {} ({}) harmonize to {}; keeping the {} array.",
                project,
                incumbent.record.barcode,
                incumbent.record.array_type,
                record.barcode,
                record.array_type,
                sample_id,
                winner.array_type
            );
        }
        failures.push(SampleFailure {
            project: project.to_string(),
            barcode: loser.barcode.clone(),
            source: loser.source.describe(),
            kind: SkipKind::Collision,
            message: format!(
                "harmonized id {} already taken by {} ({})",
                sample_id, winner.barcode, winner.array_type
            ),
        });
        if challenger_preferred {
            kept[slot] = Kept { record, profile };
        }
    }

    build_matrix(project, kept, options, failures, start)
}

fn build_matrix(
    project: &str,
    kept: Vec<Kept>,
    options: &AssemblyOptions,
    failures: FailureReport,
    start: Instant,
) -> Result<Assembly> {
    if kept.is_empty() {
        return Err(PipelineError::InsufficientData {
            project: project.to_string(),
            stage: "cohort assembly",
            detail: format!("none of the arrays could be assembled ({} skipped)", failures.len()),
        });
    }

    let mut rows: Vec<(String, Kept)> = kept
        .into_iter()
        .map(|k| (harmonize_barcode(&k.record.barcode, options.barcode_level), k))
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    let genes: Vec<String> = rows
        .iter()
        .flat_map(|(_, k)| k.profile.genes.keys().cloned())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();
    let gene_index: HashMap<&str, usize> = genes
        .iter()
        .enumerate()
        .map(|(idx, g)| (g.as_str(), idx))
        .collect();

    let mut values = Array2::<f64>::from_elem((rows.len(), genes.len()), f64::NAN);
    let mut samples = Vec::with_capacity(rows.len());
    for (row_idx, (sample_id, k)) in rows.iter().enumerate() {
        for (gene, &beta) in &k.profile.genes {
            values[[row_idx, gene_index[gene.as_str()]]] = beta;
        }
        samples.push(SampleMetadata {
            sample_id: sample_id.clone(),
            project: project.to_string(),
            array_type: k.record.array_type,
            barcode: k.record.barcode.clone(),
            label: k.record.label.clone(),
        });
    }

    if options.delete_raw {
        for (_, k) in &rows {
            if let SampleSource::File(path) = &k.record.source {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("Removed raw file {}", path.display()),
                    Err(e) => warn!("Could not remove raw file {}: {}", path.display(), e),
                }
            }
        }
    }

    let matrix = CohortMatrix {
        project: project.to_string(),
        samples,
        genes,
        values,
    };
    info!(
        "Project {}: assembled {} samples x {} genes ({:?}), {} arrays skipped, {} missing cells, in {:.2?}.",
        project,
        matrix.n_samples(),
        matrix.n_genes(),
        matrix.array_composition(),
        failures.len(),
        matrix.missing_count(),
        start.elapsed()
    );
    Ok(Assembly { matrix, failures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProbeAnnotation, SampleProbeTable};
    use std::collections::{BTreeMap, HashSet};
    use std::io::Write;

    fn annotation(probe: &str, gene: &str) -> ProbeAnnotation {
        ProbeAnnotation {
            probe_id: probe.into(),
            gene_symbol: Some(gene.into()),
            chromosome: "1".into(),
            is_snp: false,
            is_cross_reactive: false,
            source: ArrayType::Hm450,
            from_fallback: false,
        }
    }

    fn resolver() -> AnnotationResolver {
        let mut manifests = BTreeMap::new();
        manifests.insert(
            ArrayType::Hm450,
            vec![annotation("P1", "G1"), annotation("P2", "G2"), annotation("P3", "G3")],
        );
        manifests.insert(ArrayType::Hm27, vec![annotation("P1", "G1"), annotation("P2", "G2")]);
        AnnotationResolver::from_manifests(manifests, &HashSet::new(), &HashSet::new()).unwrap()
    }

    fn parsed(barcode: &str, array_type: ArrayType, values: &[(&str, Option<f64>)]) -> SampleRecord {
        let betas = values.iter().map(|(p, v)| (p.to_string(), *v)).collect();
        SampleRecord {
            project: "TCGA-TEST".into(),
            barcode: barcode.into(),
            array_type,
            label: Some("tumor".into()),
            source: SampleSource::Parsed(SampleProbeTable::new(barcode, array_type, betas)),
        }
    }

    fn options() -> AssemblyOptions {
        AssemblyOptions {
            threads: 2,
            preferred_array_type: ArrayType::Hm450,
            barcode_level: BarcodeLevel::Sample,
            delete_raw: false,
            show_progress: false,
        }
    }

    #[test]
    fn barcodes_truncate_to_patient_or_sample() {
        let barcode = "TCGA-AB-1234-01A-11D-A123-05";
        assert_eq!(harmonize_barcode(barcode, BarcodeLevel::Patient), "TCGA-AB-1234");
        assert_eq!(harmonize_barcode(barcode, BarcodeLevel::Sample), "TCGA-AB-1234-01");
        assert_eq!(harmonize_barcode("SAMPLE1", BarcodeLevel::Sample), "SAMPLE1");
    }

    #[test]
    fn matrix_rows_and_columns_are_sorted_and_missing_is_nan() {
        let records = vec![
            parsed("TCGA-ZZ-0002-01A", ArrayType::Hm450, &[("P1", Some(0.1)), ("P3", Some(0.3))]),
            parsed("TCGA-AA-0001-01A", ArrayType::Hm27, &[("P1", Some(0.5)), ("P2", Some(0.6))]),
        ];
        let assembly = assemble_cohort("TCGA-TEST", &records, &resolver(), &options()).unwrap();
        let m = &assembly.matrix;
        assert_eq!(m.sample_ids(), vec!["TCGA-AA-0001-01", "TCGA-ZZ-0002-01"]);
        assert_eq!(m.genes, vec!["G1", "G2", "G3"]);
        assert!(m.values[[0, 2]].is_nan());
        assert!(m.values[[1, 1]].is_nan());
        assert_eq!(m.values[[1, 2]], 0.3);
        assert_eq!(m.samples[0].label.as_deref(), Some("tumor"));
        assert_eq!(m.array_composition()[&ArrayType::Hm27], 1);
        assert!(assembly.failures.is_empty());
    }

    #[test]
    fn preferred_generation_wins_collision_regardless_of_order() {
        let records = vec![
            parsed("TCGA-AA-0001-01A-11D", ArrayType::Hm27, &[("P1", Some(0.9))]),
            parsed("TCGA-AA-0001-01B-21D", ArrayType::Hm450, &[("P1", Some(0.1))]),
        ];
        let assembly = assemble_cohort("TCGA-TEST", &records, &resolver(), &options()).unwrap();
        assert_eq!(assembly.matrix.n_samples(), 1);
        assert_eq!(assembly.matrix.samples[0].array_type, ArrayType::Hm450);
        assert_eq!(assembly.matrix.values[[0, 0]], 0.1);
        assert_eq!(assembly.failures.count(SkipKind::Collision), 1);
        assert_eq!(assembly.failures.samples[0].barcode, "TCGA-AA-0001-01A-11D");
    }

    #[test]
    fn same_generation_collision_keeps_first_encountered() {
        let records = vec![
            parsed("TCGA-AA-0001-01A-11D", ArrayType::Hm450, &[("P1", Some(0.2))]),
            parsed("TCGA-AA-0001-01A-99D", ArrayType::Hm450, &[("P1", Some(0.8))]),
        ];
        let assembly = assemble_cohort("TCGA-TEST", &records, &resolver(), &options()).unwrap();
        assert_eq!(assembly.matrix.samples[0].barcode, "TCGA-AA-0001-01A-11D");
        assert_eq!(assembly.matrix.values[[0, 0]], 0.2);
        assert_eq!(assembly.failures.samples[0].barcode, "TCGA-AA-0001-01A-99D");
    }

    #[test]
    fn unreadable_file_is_recorded_and_batch_continues() {
        let dir = tempfile::tempdir().unwrap();
        let good_path = dir.path().join("good.txt");
        let mut good = std::fs::File::create(&good_path).unwrap();
        writeln!(good, "P1\t0.4\nP2\t0.5").unwrap();
        let bad_path = dir.path().join("bad.txt");
        std::fs::write(&bad_path, "P1\t0.4\nP2\tnot-a-number\n").unwrap();

        let records = vec![
            SampleRecord {
                project: "TCGA-TEST".into(),
                barcode: "TCGA-AA-0001-01A".into(),
                array_type: ArrayType::Hm450,
                label: None,
                source: SampleSource::File(bad_path.clone()),
            },
            SampleRecord {
                project: "TCGA-TEST".into(),
                barcode: "TCGA-AA-0002-01A".into(),
                array_type: ArrayType::Hm450,
                label: None,
                source: SampleSource::File(good_path.clone()),
            },
        ];
        let mut opts = options();
        opts.delete_raw = true;
        let assembly = assemble_cohort("TCGA-TEST", &records, &resolver(), &opts).unwrap();
        assert_eq!(assembly.matrix.sample_ids(), vec!["TCGA-AA-0002-01"]);
        assert_eq!(assembly.failures.count(SkipKind::Parse), 1);
        assert_eq!(assembly.failures.samples[0].barcode, "TCGA-AA-0001-01A");
        assert!(!good_path.exists());
        assert!(bad_path.exists());
    }

    #[test]
    fn project_with_no_usable_arrays_is_insufficient_data() {
        let records = vec![SampleRecord {
            project: "TCGA-TEST".into(),
            barcode: "TCGA-AA-0001-01A".into(),
            array_type: ArrayType::Hm450,
            label: None,
            source: SampleSource::File("/nonexistent/file.txt".into()),
        }];
        assert!(matches!(
            assemble_cohort("TCGA-TEST", &records, &resolver(), &options()),
            Err(PipelineError::InsufficientData { .. })
        ));
    }
}
