//! Run configuration.
//!
//! A single immutable [`PipelineConfig`] is loaded once (TOML) and borrowed by every
//! stage. Command-line flags may override a handful of fields before validation.

use crate::error::{PipelineError, Result};
use crate::types::ArrayType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub seed: u64,
    /// Worker threads for the per-sample fan-out. `None` uses every core.
    pub threads: Option<usize>,
    /// Generation kept when two arrays harmonize to the same sample id.
    pub preferred_array_type: ArrayType,
    pub barcode_level: BarcodeLevel,
    /// Sample-sheet column copied into `SampleMetadata::label`.
    pub label_column: Option<String>,
    pub delete_raw_after_assembly: bool,
    pub annotation: AnnotationConfig,
    pub qc: QcConfig,
    pub imputation: ImputationConfig,
    pub split: SplitConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            threads: None,
            preferred_array_type: ArrayType::Hm450,
            barcode_level: BarcodeLevel::Sample,
            label_column: None,
            delete_raw_after_assembly: false,
            annotation: AnnotationConfig::default(),
            qc: QcConfig::default(),
            imputation: ImputationConfig::default(),
            split: SplitConfig::default(),
        }
    }
}

/// How much of a vendor barcode identifies a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarcodeLevel {
    /// `TCGA-AB-1234`
    Patient,
    /// `TCGA-AB-1234-01`
    Sample,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnotationConfig {
    pub manifest_450k: Option<PathBuf>,
    pub manifest_27k: Option<PathBuf>,
    pub cross_reactive_list: Option<PathBuf>,
    pub snp_list: Option<PathBuf>,
}

impl AnnotationConfig {
    pub fn manifest_for(&self, array_type: ArrayType) -> Option<&Path> {
        match array_type {
            ArrayType::Hm450 => self.manifest_450k.as_deref(),
            ArrayType::Hm27 => self.manifest_27k.as_deref(),
        }
    }
}

/// Whether a missingness fraction equal to the threshold is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdComparison {
    /// keep when `fraction <= threshold`
    Inclusive,
    /// keep when `fraction < threshold`
    Strict,
}

impl ThresholdComparison {
    pub fn keeps(self, fraction: f64, threshold: f64) -> bool {
        match self {
            ThresholdComparison::Inclusive => fraction <= threshold,
            ThresholdComparison::Strict => fraction < threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QcConfig {
    pub probe_filtering: bool,
    pub sample_filtering: bool,
    pub max_missing_probe: f64,
    pub max_missing_sample: f64,
    pub comparison: ThresholdComparison,
    pub drop_zero_variance: bool,
    /// Columns whose population variance is at or below this are dropped.
    pub min_variance: f64,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            probe_filtering: true,
            sample_filtering: true,
            max_missing_probe: 0.05,
            max_missing_sample: 0.05,
            comparison: ThresholdComparison::Inclusive,
            drop_zero_variance: true,
            min_variance: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ImputationMethod {
    Mean,
    Knn { neighbours: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImputationConfig {
    pub enabled: bool,
    pub strategy: ImputationMethod,
}

impl Default for ImputationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ImputationMethod::Mean,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StratifyBy {
    Project,
    Label,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitConfig {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
    pub stratify_by: StratifyBy,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train: 0.6,
            validation: 0.2,
            test: 0.2,
            stratify_by: StratifyBy::Project,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let config = Self::load_toml_path(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config = Self::parse_toml_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file without validating it, so callers can apply overrides first.
    pub fn load_toml_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse_toml_str(&text)
    }

    pub fn parse_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |name: &str, value: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::configuration(format!(
                    "{} must lie in [0, 1], got {}",
                    name, value
                )));
            }
            Ok(())
        };
        in_unit("qc.max_missing_probe", self.qc.max_missing_probe)?;
        in_unit("qc.max_missing_sample", self.qc.max_missing_sample)?;
        if !self.qc.min_variance.is_finite() || self.qc.min_variance < 0.0 {
            return Err(PipelineError::configuration(format!(
                "qc.min_variance must be a non-negative number, got {}",
                self.qc.min_variance
            )));
        }
        if let ImputationMethod::Knn { neighbours: 0 } = self.imputation.strategy {
            return Err(PipelineError::configuration(
                "imputation.neighbours must be at least 1 for kNN imputation",
            ));
        }
        if self.threads == Some(0) {
            return Err(PipelineError::configuration("threads must be at least 1"));
        }
        in_unit("split.train", self.split.train)?;
        in_unit("split.validation", self.split.validation)?;
        in_unit("split.test", self.split.test)?;
        let total = self.split.train + self.split.validation + self.split.test;
        if (total - 1.0).abs() > 1e-6 {
            return Err(PipelineError::configuration(format!(
                "split proportions must sum to 1, got {:.6}",
                total
            )));
        }
        if self.annotation.manifest_450k.is_none() && self.annotation.manifest_27k.is_none() {
            return Err(PipelineError::configuration(
                "at least one annotation manifest (annotation.manifest_450k or annotation.manifest_27k) is required",
            ));
        }
        Ok(())
    }
}
