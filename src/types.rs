// ========================================================================================
//                             Shared Data Contracts
// ========================================================================================
//
// Only types that cross module boundaries live here. Missing beta values are `None` at
// the probe level and `NaN` once a value has been placed inside an `Array2<f64>`.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// The two instrument generations this pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArrayType {
    #[serde(rename = "450K")]
    Hm450,
    #[serde(rename = "27K")]
    Hm27,
}

impl ArrayType {
    pub const ALL: [ArrayType; 2] = [ArrayType::Hm450, ArrayType::Hm27];

    /// The other generation, used as the annotation fallback.
    pub fn counterpart(self) -> ArrayType {
        match self {
            ArrayType::Hm450 => ArrayType::Hm27,
            ArrayType::Hm27 => ArrayType::Hm450,
        }
    }
}

impl fmt::Display for ArrayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayType::Hm450 => write!(f, "450K"),
            ArrayType::Hm27 => write!(f, "27K"),
        }
    }
}

impl FromStr for ArrayType {
    type Err = String;

    /// Accepts the archive platform names as well as the short forms.
    fn from_str(platform: &str) -> Result<Self, Self::Err> {
        let normalized = platform.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "illumina human methylation 450" | "450k" | "450" | "hm450" => Ok(ArrayType::Hm450),
            "illumina human methylation 27" | "27k" | "27" | "hm27" => Ok(ArrayType::Hm27),
            _ => Err(format!(
                "Unsupported methylation platform '{}'. Expected a 450K or 27K array.",
                platform.trim()
            )),
        }
    }
}

/// One probe's annotation as seen by a particular array type.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeAnnotation {
    pub probe_id: String,
    pub gene_symbol: Option<String>,
    pub chromosome: String,
    pub is_snp: bool,
    pub is_cross_reactive: bool,
    /// Manifest the row was taken from.
    pub source: ArrayType,
    /// True when the row came from the counterpart manifest.
    pub from_fallback: bool,
}

impl ProbeAnnotation {
    pub fn is_sex_chromosome(&self) -> bool {
        let chrom = self.chromosome.trim();
        let chrom = match chrom.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("chr") => &chrom[3..],
            _ => chrom,
        };
        chrom.eq_ignore_ascii_case("X") || chrom.eq_ignore_ascii_case("Y")
    }
}

/// Canonical probe -> beta table for one raw file. Immutable once built.
#[derive(Debug, Clone)]
pub struct SampleProbeTable {
    sample_id: String,
    array_type: ArrayType,
    betas: HashMap<String, Option<f64>>,
}

impl SampleProbeTable {
    pub fn new(
        sample_id: impl Into<String>,
        array_type: ArrayType,
        betas: HashMap<String, Option<f64>>,
    ) -> Self {
        Self {
            sample_id: sample_id.into(),
            array_type,
            betas,
        }
    }

    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }

    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    pub fn get(&self, probe_id: &str) -> Option<Option<f64>> {
        self.betas.get(probe_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.betas.iter().map(|(probe, beta)| (probe.as_str(), *beta))
    }
}

/// Per-sample metadata carried beside the matrix rows, never inside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleMetadata {
    pub sample_id: String,
    pub project: String,
    pub array_type: ArrayType,
    pub barcode: String,
    pub label: Option<String>,
}

/// Samples x genes for one project. Rows and columns are unique and sorted.
#[derive(Debug, Clone)]
pub struct CohortMatrix {
    pub project: String,
    pub samples: Vec<SampleMetadata>,
    pub genes: Vec<String>,
    /// `NaN` marks a missing cell.
    pub values: Array2<f64>,
}

impl CohortMatrix {
    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.values.ncols()
    }

    pub fn sample_ids(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.sample_id.as_str()).collect()
    }

    pub fn array_composition(&self) -> BTreeMap<ArrayType, usize> {
        let mut composition = BTreeMap::new();
        for sample in &self.samples {
            *composition.entry(sample.array_type).or_insert(0) += 1;
        }
        composition
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }

    pub fn is_dense(&self) -> bool {
        self.missing_count() == 0
    }

    /// Copy out the given rows and columns, preserving their order.
    pub fn select(&self, rows: &[usize], cols: &[usize]) -> CohortMatrix {
        let values = self.values.select(Axis(0), rows).select(Axis(1), cols);
        CohortMatrix {
            project: self.project.clone(),
            samples: rows.iter().map(|&r| self.samples[r].clone()).collect(),
            genes: cols.iter().map(|&c| self.genes[c].clone()).collect(),
            values,
        }
    }
}

/// The multi-cohort matrix handed to model training.
#[derive(Debug, Clone)]
pub struct ReconciledMatrix {
    pub samples: Vec<SampleMetadata>,
    pub genes: Vec<String>,
    pub values: Array2<f64>,
}

impl ReconciledMatrix {
    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.values.ncols()
    }

    pub fn sample_ids(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.sample_id.as_str()).collect()
    }

    /// Rows whose sample id is in `keep`, in the matrix's own row order.
    pub fn subset_rows<F>(&self, mut keep: F) -> ReconciledMatrix
    where
        F: FnMut(&SampleMetadata) -> bool,
    {
        let rows: Vec<usize> = self
            .samples
            .iter()
            .enumerate()
            .filter_map(|(idx, meta)| if keep(meta) { Some(idx) } else { None })
            .collect();
        ReconciledMatrix {
            samples: rows.iter().map(|&r| self.samples[r].clone()).collect(),
            genes: self.genes.clone(),
            values: self.values.select(Axis(0), &rows),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Train,
    Validation,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Validation, Partition::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Validation => "validation",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// sample id -> partition. Ordered by sample id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitAssignment {
    pub assignments: BTreeMap<String, Partition>,
}

impl SplitAssignment {
    pub fn get(&self, sample_id: &str) -> Option<Partition> {
        self.assignments.get(sample_id).copied()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn samples_in(&self, partition: Partition) -> Vec<&str> {
        self.assignments
            .iter()
            .filter(|(_, p)| **p == partition)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    /// The sheet row or raw file could not be read.
    Parse,
    /// Lost a harmonized-id collision to another array.
    Collision,
}

/// One skipped sample and why.
#[derive(Debug, Clone, Serialize)]
pub struct SampleFailure {
    pub project: String,
    pub barcode: String,
    pub source: String,
    pub kind: SkipKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureReport {
    pub samples: Vec<SampleFailure>,
}

impl FailureReport {
    pub fn push(&mut self, failure: SampleFailure) {
        self.samples.push(failure);
    }

    pub fn extend(&mut self, other: FailureReport) {
        self.samples.extend(other.samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn count(&self, kind: SkipKind) -> usize {
        self.samples.iter().filter(|f| f.kind == kind).count()
    }
}
