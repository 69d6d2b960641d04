//! Missing-value imputation.
//!
//! [`impute_matrix`] owns the contract (no empty columns going in, no missing cells coming
//! out, bit-identical output for the same matrix and seed); the statistic itself is a
//! swappable [`ImputationStrategy`].

use crate::config::ImputationMethod;
use crate::error::{PipelineError, Result};
use crate::types::CohortMatrix;
use log::{debug, info};
use ndarray::{Array2, ArrayView1, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::statistics::Statistics;

pub trait ImputationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns a copy of `values` with every `NaN` replaced. Only observed cells of the
    /// input may inform the fill.
    fn fill(&self, values: &Array2<f64>, seed: u64) -> Array2<f64>;
}

pub fn strategy_for(method: ImputationMethod) -> Box<dyn ImputationStrategy> {
    match method {
        ImputationMethod::Mean => Box::new(ColumnMean),
        ImputationMethod::Knn { neighbours } => Box::new(KNearestNeighbours { neighbours }),
    }
}

fn observed_mean(column: ArrayView1<f64>) -> f64 {
    column.iter().filter(|v| !v.is_nan()).mean()
}

/// Per-gene mean of the observed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnMean;

impl ImputationStrategy for ColumnMean {
    fn name(&self) -> &'static str {
        "column mean"
    }

    fn fill(&self, values: &Array2<f64>, _seed: u64) -> Array2<f64> {
        let mut filled = values.clone();
        for (col_idx, column) in values.axis_iter(Axis(1)).enumerate() {
            if !column.iter().any(|v| v.is_nan()) {
                continue;
            }
            let mean = observed_mean(column);
            filled
                .column_mut(col_idx)
                .mapv_inplace(|v| if v.is_nan() { mean } else { v });
        }
        filled
    }
}

/// Average of the `neighbours` closest samples that observe the gene.
///
/// Distance is the NaN-aware Euclidean distance over genes both samples observe, scaled
/// up by the fraction of genes compared. Equal distances are ordered by a seed-derived
/// permutation of the rows. A sample with no usable donor for a gene gets the column mean.
#[derive(Debug, Clone, Copy)]
pub struct KNearestNeighbours {
    pub neighbours: usize,
}

fn nan_euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Option<f64> {
    let (sum_sq, present) = a
        .iter()
        .zip(b.iter())
        .filter(|(x, y)| !x.is_nan() && !y.is_nan())
        .fold((0.0_f64, 0_usize), |(s, n), (x, y)| (s + (x - y).powi(2), n + 1));
    if present == 0 {
        return None;
    }
    let weight = a.len() as f64 / present as f64;
    Some((weight * sum_sq).sqrt())
}

impl ImputationStrategy for KNearestNeighbours {
    fn name(&self) -> &'static str {
        "k-nearest neighbours"
    }

    fn fill(&self, values: &Array2<f64>, seed: u64) -> Array2<f64> {
        let n_rows = values.nrows();
        let mut order: Vec<usize> = (0..n_rows).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        let mut tie_rank = vec![0usize; n_rows];
        for (rank, &row) in order.iter().enumerate() {
            tie_rank[row] = rank;
        }

        let column_means: Vec<f64> = values.axis_iter(Axis(1)).map(observed_mean).collect();
        let mut filled = values.clone();

        for i in 0..n_rows {
            let row = values.row(i);
            if !row.iter().any(|v| v.is_nan()) {
                continue;
            }
            let distances: Vec<Option<f64>> = (0..n_rows)
                .map(|j| if j == i { None } else { nan_euclidean(row, values.row(j)) })
                .collect();

            for (c, value) in row.iter().enumerate() {
                if !value.is_nan() {
                    continue;
                }
                let mut donors: Vec<(f64, usize, usize)> = (0..n_rows)
                    .filter_map(|j| {
                        let d = distances[j]?;
                        if values[[j, c]].is_nan() {
                            None
                        } else {
                            Some((d, tie_rank[j], j))
                        }
                    })
                    .collect();
                donors.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                donors.truncate(self.neighbours);

                filled[[i, c]] = if donors.is_empty() {
                    column_means[c]
                } else {
                    donors.iter().map(|&(_, _, j)| values[[j, c]]).sum::<f64>() / donors.len() as f64
                };
            }
        }
        filled
    }
}

/// Fills every missing cell of a QC-filtered matrix.
pub fn impute_matrix(
    matrix: &CohortMatrix,
    strategy: &dyn ImputationStrategy,
    seed: u64,
) -> Result<CohortMatrix> {
    for (col_idx, column) in matrix.values.axis_iter(Axis(1)).enumerate() {
        if column.iter().all(|v| v.is_nan()) {
            return Err(PipelineError::Imputation {
                project: matrix.project.clone(),
                gene: matrix.genes[col_idx].clone(),
            });
        }
    }

    let missing = matrix.missing_count();
    if missing == 0 {
        debug!("Project {} is already dense; nothing to impute.", matrix.project);
        return Ok(matrix.clone());
    }

    let values = strategy.fill(&matrix.values, seed);
    if let Some(((r, c), _)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(PipelineError::Imputation {
            project: matrix.project.clone(),
            gene: format!("{} (sample {} left unfilled)", matrix.genes[c], matrix.samples[r].sample_id),
        });
    }
    info!(
        "Imputed {} missing cells in {} using {} (seed {}).",
        missing,
        matrix.project,
        strategy.name(),
        seed
    );
    Ok(CohortMatrix {
        project: matrix.project.clone(),
        samples: matrix.samples.clone(),
        genes: matrix.genes.clone(),
        values,
    })
}
