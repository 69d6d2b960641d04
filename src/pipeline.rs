//! End-to-end driver: per-project assembly -> QC -> imputation, then reconciliation and
//! the train/validation/test split.
//!
//! An `InsufficientData` failure only removes its own project from the run. Every other
//! error aborts.

use crate::annotation::AnnotationResolver;
use crate::assemble::{assemble_cohort, AssemblyOptions};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::impute::{impute_matrix, strategy_for};
use crate::qc::run_quality_control;
use crate::raw::SampleRecord;
use crate::reconcile::reconcile_cohorts;
use crate::split::{stratification_entries, stratified_split, SplitProportions};
use crate::types::{CohortMatrix, FailureReport, Partition, ReconciledMatrix, SplitAssignment};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// A project removed from the run and the stage that removed it.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectFailure {
    pub project: String,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub project: String,
    pub assembled_samples: usize,
    pub assembled_genes: usize,
    pub dropped_genes: Vec<String>,
    pub dropped_samples: Vec<String>,
    pub imputed_cells: usize,
    pub final_samples: usize,
    pub final_genes: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub projects: Vec<ProjectSummary>,
    pub project_failures: Vec<ProjectFailure>,
    pub sample_failures: FailureReport,
    pub reconciled_samples: usize,
    pub reconciled_genes: usize,
    pub partition_sizes: BTreeMap<String, usize>,
}

#[derive(Debug)]
pub struct ProjectOutcome {
    pub matrix: CohortMatrix,
    pub summary: ProjectSummary,
}

#[derive(Debug)]
pub struct PipelineRun {
    pub matrix: ReconciledMatrix,
    pub splits: SplitAssignment,
    pub report: RunReport,
}

/// Assembles, filters and imputes one project. Skipped arrays are appended to `failures`
/// even when the project itself fails later.
pub fn process_project(
    project: &str,
    records: &[SampleRecord],
    resolver: &AnnotationResolver,
    config: &PipelineConfig,
    options: &AssemblyOptions,
    failures: &mut FailureReport,
) -> Result<ProjectOutcome> {
    let assembly = assemble_cohort(project, records, resolver, options)?;
    failures.extend(assembly.failures);
    let assembled = assembly.matrix;

    let qc = run_quality_control(&assembled, &config.qc)?;
    let missing = qc.matrix.missing_count();

    let matrix = if config.imputation.enabled {
        let strategy = strategy_for(config.imputation.strategy);
        impute_matrix(&qc.matrix, strategy.as_ref(), config.seed)?
    } else {
        if missing > 0 {
            warn!(
                "Imputation disabled; project {} keeps {} missing cells.",
                project, missing
            );
        }
        qc.matrix
    };

    let summary = ProjectSummary {
        project: project.to_string(),
        assembled_samples: assembled.n_samples(),
        assembled_genes: assembled.n_genes(),
        dropped_genes: qc.dropped_genes,
        dropped_samples: qc.dropped_samples,
        imputed_cells: if config.imputation.enabled { missing } else { 0 },
        final_samples: matrix.n_samples(),
        final_genes: matrix.n_genes(),
    };
    Ok(ProjectOutcome { matrix, summary })
}

fn group_by_project(records: Vec<SampleRecord>) -> BTreeMap<String, Vec<SampleRecord>> {
    let mut groups: BTreeMap<String, Vec<SampleRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.project.clone()).or_default().push(record);
    }
    groups
}

/// Runs every project, reconciles the survivors and assigns splits.
///
/// `sheet_failures` are the rows the sample sheet reader already rejected; they are
/// carried into the report ahead of assembly failures.
pub fn run_pipeline(
    records: Vec<SampleRecord>,
    sheet_failures: FailureReport,
    resolver: &AnnotationResolver,
    config: &PipelineConfig,
    options: &AssemblyOptions,
) -> Result<PipelineRun> {
    let start = Instant::now();
    let mut report = RunReport {
        seed: config.seed,
        sample_failures: sheet_failures,
        ..RunReport::default()
    };

    let groups = group_by_project(records);
    info!("Running {} project(s).", groups.len());

    let mut cohorts = Vec::with_capacity(groups.len());
    for (project, members) in &groups {
        match process_project(project, members, resolver, config, options, &mut report.sample_failures) {
            Ok(outcome) => {
                report.projects.push(outcome.summary);
                cohorts.push(outcome.matrix);
            }
            Err(PipelineError::InsufficientData {
                project,
                stage,
                detail,
            }) => {
                error!("Dropping project {} after {}: {}", project, stage, detail);
                report.project_failures.push(ProjectFailure {
                    project,
                    stage: stage.to_string(),
                    message: detail,
                });
            }
            Err(e) => return Err(e),
        }
    }

    if cohorts.is_empty() {
        return Err(PipelineError::reconciliation(format!(
            "no project survived assembly and QC ({} failed)",
            report.project_failures.len()
        )));
    }

    let matrix = reconcile_cohorts(&cohorts)?;
    let entries = stratification_entries(&matrix, config.split.stratify_by)?;
    let splits = stratified_split(
        &entries,
        &SplitProportions::from_config(&config.split),
        config.seed,
    )?;

    report.reconciled_samples = matrix.n_samples();
    report.reconciled_genes = matrix.n_genes();
    report.partition_sizes = Partition::ALL
        .iter()
        .map(|&p| (p.as_str().to_string(), splits.samples_in(p).len()))
        .collect();

    info!(
        "Pipeline produced {} samples x {} genes from {} project(s); {} project(s) and {} array(s) skipped, in {:.2?}.",
        matrix.n_samples(),
        matrix.n_genes(),
        cohorts.len(),
        report.project_failures.len(),
        report.sample_failures.len(),
        start.elapsed()
    );
    Ok(PipelineRun {
        matrix,
        splits,
        report,
    })
}
