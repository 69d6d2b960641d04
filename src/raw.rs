//! Raw input readers: per-sample beta files and the sample sheet that enumerates them.

use crate::error::{PipelineError, Result};
use crate::types::{ArrayType, FailureReport, SampleFailure, SampleProbeTable, SkipKind};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where a sample's probe table comes from.
#[derive(Debug, Clone)]
pub enum SampleSource {
    File(PathBuf),
    Parsed(SampleProbeTable),
}

impl SampleSource {
    pub fn describe(&self) -> String {
        match self {
            SampleSource::File(path) => path.display().to_string(),
            SampleSource::Parsed(table) => format!("<parsed:{}>", table.sample_id()),
        }
    }
}

/// One row of the sample sheet: a raw array tagged with project and generation.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub project: String,
    pub barcode: String,
    pub array_type: ArrayType,
    pub label: Option<String>,
    pub source: SampleSource,
}

impl SampleRecord {
    /// Parse the backing file, or hand back the table already in memory.
    pub fn load(&self) -> Result<SampleProbeTable> {
        match &self.source {
            SampleSource::File(path) => parse_beta_file(path, &self.barcode, self.array_type),
            SampleSource::Parsed(table) => Ok(table.clone()),
        }
    }
}

#[inline]
fn is_missing_token(token: &str) -> bool {
    matches!(
        token,
        "" | "NA" | "na" | "NaN" | "nan" | "null" | "NULL" | "."
    )
}

const PROBE_HEADERS: [&str; 5] = ["composite element ref", "probe", "probe_id", "probeid", "id_ref"];
const BETA_HEADERS: [&str; 3] = ["beta_value", "beta", "beta value"];

/// A first line is a header only when it names its columns the way vendor exports do.
fn is_header_line(probe_field: &str, value_field: &str) -> bool {
    PROBE_HEADERS.iter().any(|h| probe_field.eq_ignore_ascii_case(h))
        || BETA_HEADERS.iter().any(|h| value_field.eq_ignore_ascii_case(h))
}

fn record_line(position: Option<&csv::Position>) -> usize {
    position.map_or(0, |p| p.line() as usize)
}

/// Reads one vendor beta file (`probe_id<TAB>beta`, optional header) into a probe table.
pub fn parse_beta_file(
    path: &Path,
    sample_id: &str,
    array_type: ArrayType,
) -> Result<SampleProbeTable> {
    debug!("Parsing beta file {} for sample {}", path.display(), sample_id);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_path(path)
        .map_err(|e| PipelineError::parse(path, 0, format!("cannot open file: {}", e)))?;
    let mut betas: HashMap<String, Option<f64>> = HashMap::new();

    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| {
            PipelineError::parse(path, record_line(e.position()), format!("read failed: {}", e))
        })?;
        let line_no = record_line(record.position());
        if record.len() != 2 {
            return Err(PipelineError::parse(
                path,
                line_no,
                format!("expected 2 tab-separated columns, found {}", record.len()),
            ));
        }
        let probe_id = record[0].trim();
        let raw_value = record[1].trim();
        if idx == 0 && is_header_line(probe_id, raw_value) {
            debug!("Treating first line of {} as a header", path.display());
            continue;
        }
        if probe_id.is_empty() {
            return Err(PipelineError::parse(path, line_no, "empty probe identifier"));
        }

        let beta = if is_missing_token(raw_value) {
            None
        } else {
            match raw_value.parse::<f64>() {
                Ok(v) if v.is_finite() && (0.0..=1.0).contains(&v) => Some(v),
                Ok(v) => {
                    return Err(PipelineError::parse(
                        path,
                        line_no,
                        format!("beta value {} for probe {} is outside [0, 1]", v, probe_id),
                    ));
                }
                Err(_) => {
                    return Err(PipelineError::parse(
                        path,
                        line_no,
                        format!("unparsable beta value '{}' for probe {}", raw_value, probe_id),
                    ));
                }
            }
        };

        if betas.insert(probe_id.to_string(), beta).is_some() {
            return Err(PipelineError::parse(
                path,
                line_no,
                format!("duplicate probe identifier {}", probe_id),
            ));
        }
    }

    if betas.is_empty() {
        return Err(PipelineError::parse(path, 0, "file contains no probe measurements"));
    }
    Ok(SampleProbeTable::new(sample_id, array_type, betas))
}

const SHEET_FILE: &str = "file_name";
const SHEET_PROJECT: &str = "project_id";
const SHEET_PLATFORM: &str = "platform";
const SHEET_BARCODE: &str = "submitter_id";

/// Reads the sample sheet (CSV with a header row).
///
/// Rows with an unsupported platform are returned in the failure report rather than
/// aborting; a missing required column is a configuration error.
pub fn read_sample_sheet(
    path: &Path,
    label_column: Option<&str>,
) -> Result<(Vec<SampleRecord>, FailureReport)> {
    info!("Reading sample sheet {}", path.display());
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| {
            PipelineError::configuration(format!(
                "Failed to open sample sheet {}: {}",
                path.display(),
                e
            ))
        })?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| -> Result<usize> {
        headers.iter().position(|h| h == name).ok_or_else(|| {
            PipelineError::configuration(format!(
                "Sample sheet {} has no '{}' column",
                path.display(),
                name
            ))
        })
    };
    let file_idx = column(SHEET_FILE)?;
    let project_idx = column(SHEET_PROJECT)?;
    let platform_idx = column(SHEET_PLATFORM)?;
    let barcode_idx = column(SHEET_BARCODE)?;
    let label_idx = label_column.map(|name| column(name)).transpose()?;

    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut records = Vec::new();
    let mut failures = FailureReport::default();

    for (row_idx, row) in reader.records().enumerate() {
        let row = row?;
        let field = |idx: usize| row.get(idx).unwrap_or("").to_string();
        let file_name = field(file_idx);
        let project = field(project_idx);
        let barcode = field(barcode_idx);
        let file_path = {
            let candidate = PathBuf::from(&file_name);
            if candidate.is_absolute() {
                candidate
            } else {
                base_dir.join(candidate)
            }
        };

        if file_name.is_empty() || project.is_empty() || barcode.is_empty() {
            warn!(
                "Sample sheet row {} is missing file name, project or barcode; skipping.",
                row_idx + 2
            );
            failures.push(SampleFailure {
                project,
                barcode,
                source: file_path.display().to_string(),
                kind: SkipKind::Parse,
                message: format!("sample sheet row {} is incomplete", row_idx + 2),
            });
            continue;
        }

        let array_type = match field(platform_idx).parse::<ArrayType>() {
            Ok(t) => t,
            Err(message) => {
                warn!("Skipping {} ({}): {}", barcode, project, message);
                failures.push(SampleFailure {
                    project,
                    barcode,
                    source: file_path.display().to_string(),
                    kind: SkipKind::Parse,
                    message,
                });
                continue;
            }
        };

        let label = label_idx
            .map(field)
            .filter(|value| !value.is_empty() && !is_missing_token(value));

        records.push(SampleRecord {
            project,
            barcode,
            array_type,
            label,
            source: SampleSource::File(file_path),
        });
    }

    info!(
        "Sample sheet lists {} usable arrays ({} rows skipped).",
        records.len(),
        failures.len()
    );
    Ok((records, failures))
}
