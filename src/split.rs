//! Reproducible stratified train / validation / test assignment.
//!
//! Samples are sorted by id before anything random happens, so the assignment is a pure
//! function of (sample set, labels, proportions, seed) and ignores input row order.
//! Within a stratum, validation and test sizes are floored and the remainder goes to train.

use crate::config::{SplitConfig, StratifyBy};
use crate::error::{PipelineError, Result};
use crate::types::{Partition, ReconciledMatrix, SplitAssignment};
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitProportions {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
}

impl SplitProportions {
    pub fn from_config(config: &SplitConfig) -> Self {
        Self {
            train: config.train,
            validation: config.validation,
            test: config.test,
        }
    }

    fn validate(&self) -> Result<()> {
        let parts = [self.train, self.validation, self.test];
        if parts.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(PipelineError::configuration(format!(
                "split proportions must be non-negative, got {:?}",
                self
            )));
        }
        if (parts.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(PipelineError::configuration(format!(
                "split proportions must sum to 1, got {:?}",
                self
            )));
        }
        Ok(())
    }
}

#[inline]
fn floor_count(n: usize, proportion: f64) -> usize {
    // Guard against products such as 0.29 * 100 = 28.999999999999996.
    (n as f64 * proportion + 1e-9).floor() as usize
}

/// `entries` are `(sample_id, stratum_label)` pairs.
pub fn stratified_split(
    entries: &[(String, String)],
    proportions: &SplitProportions,
    seed: u64,
) -> Result<SplitAssignment> {
    proportions.validate()?;

    let mut sorted: Vec<&(String, String)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut seen = HashSet::with_capacity(sorted.len());
    let mut strata: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (sample_id, label) in sorted {
        if !seen.insert(sample_id.as_str()) {
            return Err(PipelineError::configuration(format!(
                "sample {} listed more than once for splitting",
                sample_id
            )));
        }
        strata.entry(label.as_str()).or_default().push(sample_id.as_str());
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut assignment = SplitAssignment::default();
    for (label, mut members) in strata {
        members.shuffle(&mut rng);
        let n = members.len();
        let n_validation = floor_count(n, proportions.validation);
        let n_test = floor_count(n, proportions.test);
        let n_train = n - n_validation - n_test;
        debug!(
            "Stratum '{}': {} samples -> train {}, validation {}, test {}",
            label, n, n_train, n_validation, n_test
        );
        for (position, sample_id) in members.into_iter().enumerate() {
            let partition = if position < n_validation {
                Partition::Validation
            } else if position < n_validation + n_test {
                Partition::Test
            } else {
                Partition::Train
            };
            assignment.assignments.insert(sample_id.to_string(), partition);
        }
    }

    info!(
        "Split {} samples: train {}, validation {}, test {} (seed {}).",
        assignment.len(),
        assignment.samples_in(Partition::Train).len(),
        assignment.samples_in(Partition::Validation).len(),
        assignment.samples_in(Partition::Test).len(),
        seed
    );
    Ok(assignment)
}

/// `(sample_id, stratum)` pairs for a reconciled matrix.
pub fn stratification_entries(
    matrix: &ReconciledMatrix,
    stratify_by: StratifyBy,
) -> Result<Vec<(String, String)>> {
    matrix
        .samples
        .iter()
        .map(|meta| {
            let stratum = match stratify_by {
                StratifyBy::Project => meta.project.clone(),
                StratifyBy::Label => meta.label.clone().ok_or_else(|| {
                    PipelineError::configuration(format!(
                        "sample {} has no label to stratify by",
                        meta.sample_id
                    ))
                })?,
            };
            Ok((meta.sample_id.clone(), stratum))
        })
        .collect()
}

/// Row subsets of `matrix` per partition, in the matrix's own row order.
pub fn partition_matrix(
    matrix: &ReconciledMatrix,
    assignment: &SplitAssignment,
) -> BTreeMap<Partition, ReconciledMatrix> {
    Partition::ALL
        .iter()
        .map(|&partition| {
            let subset = matrix.subset_rows(|meta| assignment.get(&meta.sample_id) == Some(partition));
            (partition, subset)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sixty_twenty_twenty() -> SplitProportions {
        SplitProportions::from_config(&SplitConfig::default())
    }

    fn entries(strata: &[(&str, usize)]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (label, count) in strata {
            for i in 0..*count {
                out.push((format!("{}-{:03}", label, i), label.to_string()));
            }
        }
        out
    }

    #[test]
    fn every_sample_is_assigned_exactly_once() {
        let input = entries(&[("BRCA", 23), ("LUAD", 11), ("KIRC", 5)]);
        let assignment = stratified_split(&input, &sixty_twenty_twenty(), 42).unwrap();
        assert_eq!(assignment.len(), input.len());
        let total: usize = Partition::ALL
            .iter()
            .map(|&p| assignment.samples_in(p).len())
            .sum();
        assert_eq!(total, input.len());
    }

    #[test]
    fn per_stratum_counts_floor_and_remainder_goes_to_train() {
        let input = entries(&[("BRCA", 23), ("KIRC", 5)]);
        let assignment = stratified_split(&input, &sixty_twenty_twenty(), 3).unwrap();
        let count = |label: &str, partition: Partition| {
            assignment
                .assignments
                .iter()
                .filter(|(id, p)| id.starts_with(label) && **p == partition)
                .count()
        };
        // 23 * 0.2 = 4.6 -> 4 each for validation and test, 15 train.
        assert_eq!(count("BRCA", Partition::Validation), 4);
        assert_eq!(count("BRCA", Partition::Test), 4);
        assert_eq!(count("BRCA", Partition::Train), 15);
        assert_eq!(count("KIRC", Partition::Validation), 1);
        assert_eq!(count("KIRC", Partition::Test), 1);
        assert_eq!(count("KIRC", Partition::Train), 3);
    }

    #[test]
    fn assignment_ignores_input_order_and_repeats_for_same_seed() {
        let input = entries(&[("BRCA", 17), ("LUAD", 9)]);
        let mut reversed = input.clone();
        reversed.reverse();
        let a = stratified_split(&input, &sixty_twenty_twenty(), 99).unwrap();
        let b = stratified_split(&reversed, &sixty_twenty_twenty(), 99).unwrap();
        let c = stratified_split(&input, &sixty_twenty_twenty(), 99).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn different_seeds_shuffle_differently() {
        let input = entries(&[("BRCA", 50)]);
        let a = stratified_split(&input, &sixty_twenty_twenty(), 1).unwrap();
        let b = stratified_split(&input, &sixty_twenty_twenty(), 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_proportions_and_duplicates_are_rejected() {
        let input = entries(&[("BRCA", 4)]);
        let bad = SplitProportions {
            train: 0.7,
            validation: 0.2,
            test: 0.2,
        };
        assert!(stratified_split(&input, &bad, 0).is_err());

        let mut dup = input.clone();
        dup.push(input[0].clone());
        assert!(stratified_split(&dup, &sixty_twenty_twenty(), 0).is_err());
    }
}
