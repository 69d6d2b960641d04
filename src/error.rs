//! Error taxonomy shared by every pipeline stage.
//!
//! Severity is encoded by where an error is allowed to surface:
//! `Parse` only ever travels inside a [`crate::types::SampleFailure`], `InsufficientData`
//! is caught per project by the driver, and the remaining variants abort the run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or unparseable manifest, exclusion list, config file or sample sheet.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// One raw beta file is malformed.
    #[error("Parse error in {} at line {line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// A stage left nothing behind for a project.
    #[error("Insufficient data in project {project} after {stage}: {detail}")]
    InsufficientData {
        project: String,
        stage: &'static str,
        detail: String,
    },

    /// A column reached imputation without a single observed value.
    #[error("Imputation error in project {project}: gene {gene} has no observed values")]
    Imputation { project: String, gene: String },

    #[error("Reconciliation error: {message}")]
    Reconciliation { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub fn reconciliation(message: impl Into<String>) -> Self {
        Self::Reconciliation {
            message: message.into(),
        }
    }
}
