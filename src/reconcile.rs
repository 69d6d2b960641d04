//! Cross-cohort reconciliation: restrict every dense project matrix to the shared gene set
//! and stack the rows.
//!
//! The intersection (not the union) is used so every sample has the same feature space.
//! Projects are stacked in project-code order and genes are lexicographic, so the result
//! does not depend on the order projects were processed in.

use crate::error::{PipelineError, Result};
use crate::types::{CohortMatrix, ReconciledMatrix};
use log::info;
use ndarray::{concatenate, Array2, Axis};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Genes present in every cohort, sorted.
pub fn intersect_gene_sets(cohorts: &[CohortMatrix]) -> BTreeSet<String> {
    let mut iter = cohorts.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    let mut shared: BTreeSet<String> = first.genes.iter().cloned().collect();
    for cohort in iter {
        let genes: HashSet<&str> = cohort.genes.iter().map(String::as_str).collect();
        shared.retain(|g| genes.contains(g.as_str()));
    }
    shared
}

pub fn reconcile_cohorts(cohorts: &[CohortMatrix]) -> Result<ReconciledMatrix> {
    if cohorts.is_empty() {
        return Err(PipelineError::reconciliation("no cohorts to reconcile"));
    }
    if let Some(sparse) = cohorts.iter().find(|c| !c.is_dense()) {
        return Err(PipelineError::reconciliation(format!(
            "project {} still has {} missing cells; impute before reconciling",
            sparse.project,
            sparse.missing_count()
        )));
    }

    let shared = intersect_gene_sets(cohorts);
    if shared.is_empty() {
        return Err(PipelineError::reconciliation(format!(
            "gene sets of {} projects have an empty intersection",
            cohorts.len()
        )));
    }
    let genes: Vec<String> = shared.into_iter().collect();

    let mut order: Vec<&CohortMatrix> = cohorts.iter().collect();
    order.sort_by(|a, b| a.project.cmp(&b.project));

    let mut seen_samples: HashSet<&str> = HashSet::new();
    let mut blocks: Vec<Array2<f64>> = Vec::with_capacity(order.len());
    let mut samples = Vec::new();
    for cohort in &order {
        let index: HashMap<&str, usize> = cohort
            .genes
            .iter()
            .enumerate()
            .map(|(idx, g)| (g.as_str(), idx))
            .collect();
        let cols: Vec<usize> = genes.iter().map(|g| index[g.as_str()]).collect();
        for meta in &cohort.samples {
            if !seen_samples.insert(meta.sample_id.as_str()) {
                return Err(PipelineError::reconciliation(format!(
                    "sample {} appears in more than one project (latest: {})",
                    meta.sample_id, cohort.project
                )));
            }
        }
        info!(
            "Project {}: keeping {} of {} genes, {} samples.",
            cohort.project,
            cols.len(),
            cohort.n_genes(),
            cohort.n_samples()
        );
        blocks.push(cohort.values.select(Axis(1), &cols));
        samples.extend(cohort.samples.iter().cloned());
    }

    let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
    let values = concatenate(Axis(0), &views)
        .map_err(|e| PipelineError::reconciliation(format!("failed to stack cohorts: {}", e)))?;

    info!(
        "Reconciled {} projects into {} samples x {} genes.",
        order.len(),
        values.nrows(),
        values.ncols()
    );
    Ok(ReconciledMatrix {
        samples,
        genes,
        values,
    })
}
