//! Preprocessing for DNA-methylation array cohorts: per-sample probe filtering and gene
//! aggregation, per-project quality control and imputation, cross-project reconciliation
//! and a reproducible train/validation/test split.

pub mod annotation;
pub mod assemble;
pub mod config;
pub mod error;
pub mod impute;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod qc;
pub mod raw;
pub mod reconcile;
pub mod split;
pub mod types;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{run_pipeline, PipelineRun, RunReport};
