//! Two-stage quality control on one cohort matrix.
//!
//! Probe (gene column) QC always runs before sample QC so that per-sample missingness is
//! measured only over columns that survive. The reverse order is available through
//! [`QcOrder::SampleFirst`] for comparison; it is a different pipeline, not an equivalent one.

use crate::config::QcConfig;
use crate::error::{PipelineError, Result};
use crate::types::CohortMatrix;
use log::{debug, info};
use ndarray::Axis;
use statrs::statistics::Statistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcOrder {
    ProbeFirst,
    SampleFirst,
}

/// Retained indices into the input matrix after QC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcMask {
    pub samples: Vec<usize>,
    pub genes: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct QcOutcome {
    pub matrix: CohortMatrix,
    pub mask: QcMask,
    pub dropped_genes: Vec<String>,
    pub dropped_samples: Vec<String>,
}

/// Columns that pass the missingness and (optional) variance filters, measured over `rows`.
pub fn probe_qc_mask(matrix: &CohortMatrix, rows: &[usize], config: &QcConfig) -> Vec<usize> {
    if !config.probe_filtering {
        return (0..matrix.n_genes()).collect();
    }
    let n_rows = rows.len();
    let mut dropped_missing = 0usize;
    let mut dropped_variance = 0usize;

    let kept: Vec<usize> = matrix
        .values
        .axis_iter(Axis(1))
        .enumerate()
        .filter_map(|(col_idx, column)| {
            let observed: Vec<f64> = rows
                .iter()
                .map(|&r| column[r])
                .filter(|v| !v.is_nan())
                .collect();
            let missing_fraction = if n_rows == 0 {
                1.0
            } else {
                (n_rows - observed.len()) as f64 / n_rows as f64
            };
            if !config.comparison.keeps(missing_fraction, config.max_missing_probe) {
                dropped_missing += 1;
                return None;
            }
            // Fewer than two observations have no variance to test.
            if config.drop_zero_variance && observed.len() >= 2 {
                let variance = observed.iter().population_variance();
                if !(variance > config.min_variance) {
                    dropped_variance += 1;
                    return None;
                }
            }
            Some(col_idx)
        })
        .collect();

    debug!(
        "Probe QC on {}: {} genes kept, {} dropped for missingness, {} for low variance",
        matrix.project,
        kept.len(),
        dropped_missing,
        dropped_variance
    );
    kept
}

/// Rows whose missingness over `cols` passes the sample threshold.
pub fn sample_qc_mask(matrix: &CohortMatrix, cols: &[usize], config: &QcConfig) -> Vec<usize> {
    if !config.sample_filtering {
        return (0..matrix.n_samples()).collect();
    }
    let n_cols = cols.len();
    matrix
        .values
        .axis_iter(Axis(0))
        .enumerate()
        .filter_map(|(row_idx, row)| {
            let missing = cols.iter().filter(|&&c| row[c].is_nan()).count();
            let missing_fraction = if n_cols == 0 {
                1.0
            } else {
                missing as f64 / n_cols as f64
            };
            if config.comparison.keeps(missing_fraction, config.max_missing_sample) {
                Some(row_idx)
            } else {
                debug!(
                    "Sample {} dropped: {:.4} of {} genes missing",
                    matrix.samples[row_idx].sample_id, missing_fraction, n_cols
                );
                None
            }
        })
        .collect()
}

fn insufficient(
    matrix: &CohortMatrix,
    stage: &'static str,
    axis: &str,
    threshold: f64,
    config: &QcConfig,
) -> PipelineError {
    PipelineError::InsufficientData {
        project: matrix.project.clone(),
        stage,
        detail: format!(
            "threshold {} ({:?} comparison) removed all {} {}",
            threshold,
            config.comparison,
            if axis == "genes" { matrix.n_genes() } else { matrix.n_samples() },
            axis
        ),
    }
}

/// Probe QC, then sample QC.
pub fn run_quality_control(matrix: &CohortMatrix, config: &QcConfig) -> Result<QcOutcome> {
    run_quality_control_in_order(matrix, config, QcOrder::ProbeFirst)
}

pub fn run_quality_control_in_order(
    matrix: &CohortMatrix,
    config: &QcConfig,
    order: QcOrder,
) -> Result<QcOutcome> {
    let all_rows: Vec<usize> = (0..matrix.n_samples()).collect();
    let all_cols: Vec<usize> = (0..matrix.n_genes()).collect();

    let (samples, genes) = match order {
        QcOrder::ProbeFirst => {
            let genes = probe_qc_mask(matrix, &all_rows, config);
            if genes.is_empty() {
                return Err(insufficient(matrix, "probe QC", "genes", config.max_missing_probe, config));
            }
            let samples = sample_qc_mask(matrix, &genes, config);
            if samples.is_empty() {
                return Err(insufficient(matrix, "sample QC", "samples", config.max_missing_sample, config));
            }
            (samples, genes)
        }
        QcOrder::SampleFirst => {
            let samples = sample_qc_mask(matrix, &all_cols, config);
            if samples.is_empty() {
                return Err(insufficient(matrix, "sample QC", "samples", config.max_missing_sample, config));
            }
            let genes = probe_qc_mask(matrix, &samples, config);
            if genes.is_empty() {
                return Err(insufficient(matrix, "probe QC", "genes", config.max_missing_probe, config));
            }
            (samples, genes)
        }
    };

    let dropped_genes = complement(&all_cols, &genes)
        .map(|c| matrix.genes[c].clone())
        .collect::<Vec<_>>();
    let dropped_samples = complement(&all_rows, &samples)
        .map(|r| matrix.samples[r].sample_id.clone())
        .collect::<Vec<_>>();

    let filtered = matrix.select(&samples, &genes);
    info!(
        "QC for {} ({:?}): {} -> {} genes, {} -> {} samples, {} missing cells remain.",
        matrix.project,
        order,
        matrix.n_genes(),
        filtered.n_genes(),
        matrix.n_samples(),
        filtered.n_samples(),
        filtered.missing_count()
    );

    Ok(QcOutcome {
        matrix: filtered,
        mask: QcMask { samples, genes },
        dropped_genes,
        dropped_samples,
    })
}

fn complement<'a>(all: &'a [usize], kept: &'a [usize]) -> impl Iterator<Item = usize> + 'a {
    // `kept` is ascending, so a binary search suffices.
    all.iter().copied().filter(move |i| kept.binary_search(i).is_err())
}
