//! On-disk artifacts for a finished run, all sharing one output prefix.
//!
//! Floats are written with Rust's shortest round-trip formatting so that identical inputs
//! produce identical bytes and re-reading recovers the exact values.

use crate::error::{PipelineError, Result};
use crate::pipeline::{PipelineRun, RunReport};
use crate::split::partition_matrix;
use crate::types::{ReconciledMatrix, SampleMetadata, SplitAssignment};
use log::info;
use ndarray::Array2;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

fn output_path(prefix: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", prefix, suffix))
}

fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
    let path = output_path(prefix, suffix);
    File::create(&path).map(BufWriter::new).map_err(|e| {
        PipelineError::configuration(format!(
            "Failed to create output file {}: {}",
            path.display(),
            e
        ))
    })
}

fn tsv_writer(prefix: &str, suffix: &str) -> Result<csv::Writer<BufWriter<File>>> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(create_output_file(prefix, suffix)?))
}

/// Creates the parent directory of `prefix` if it is missing.
pub fn prepare_output_prefix(prefix: &str) -> Result<()> {
    let prefix_path = PathBuf::from(prefix);
    if let Some(parent) = prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            info!("Created output directory: {}", parent.display());
        }
    }
    Ok(())
}

fn write_value<W: Write>(writer: &mut W, value: f64) -> std::io::Result<()> {
    if value.is_nan() {
        write!(writer, "\tNA")
    } else {
        write!(writer, "\t{}", value)
    }
}

pub fn write_matrix(prefix: &str, suffix: &str, matrix: &ReconciledMatrix) -> Result<()> {
    let mut writer = create_output_file(prefix, suffix)?;
    info!(
        "Writing {} x {} matrix to {}.{}",
        matrix.n_samples(),
        matrix.n_genes(),
        prefix,
        suffix
    );

    write!(writer, "sample_id")?;
    for gene in &matrix.genes {
        write!(writer, "\t{}", gene)?;
    }
    writeln!(writer)?;

    for (meta, row) in matrix.samples.iter().zip(matrix.values.rows()) {
        write!(writer, "{}", meta.sample_id)?;
        for &value in row {
            write_value(&mut writer, value)?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_samples(prefix: &str, samples: &[SampleMetadata]) -> Result<()> {
    let mut writer = tsv_writer(prefix, "samples.tsv")?;
    info!("Writing sample metadata to {}.samples.tsv", prefix);
    for sample in samples {
        writer.serialize(sample)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_features(prefix: &str, genes: &[String]) -> Result<()> {
    let mut writer = create_output_file(prefix, "features.tsv")?;
    info!("Writing {} features to {}.features.tsv", genes.len(), prefix);
    writeln!(writer, "index\tgene")?;
    for (idx, gene) in genes.iter().enumerate() {
        writeln!(writer, "{}\t{}", idx, gene)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct SplitRow<'a> {
    sample_id: &'a str,
    partition: &'a str,
}

pub fn write_splits(prefix: &str, splits: &SplitAssignment) -> Result<()> {
    let mut writer = tsv_writer(prefix, "splits.tsv")?;
    info!("Writing split assignment to {}.splits.tsv", prefix);
    for (sample_id, partition) in &splits.assignments {
        writer.serialize(SplitRow {
            sample_id,
            partition: partition.as_str(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_report(prefix: &str, report: &RunReport) -> Result<()> {
    let mut writer = create_output_file(prefix, "report.json")?;
    info!("Writing run report to {}.report.json", prefix);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// Writes every artifact of a run.
pub fn write_run(prefix: &str, run: &PipelineRun) -> Result<()> {
    prepare_output_prefix(prefix)?;
    write_matrix(prefix, "matrix.tsv", &run.matrix)?;
    write_samples(prefix, &run.matrix.samples)?;
    write_features(prefix, &run.matrix.genes)?;
    write_splits(prefix, &run.splits)?;
    for (partition, subset) in partition_matrix(&run.matrix, &run.splits) {
        write_matrix(prefix, &format!("{}.tsv", partition.as_str()), &subset)?;
    }
    write_report(prefix, &run.report)?;
    Ok(())
}

/// A matrix as read back from disk: row ids, gene header and values.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedMatrix {
    pub sample_ids: Vec<String>,
    pub genes: Vec<String>,
    pub values: Array2<f64>,
}

/// Reads a file produced by [`write_matrix`].
pub fn read_matrix_tsv(path: &Path) -> Result<LoadedMatrix> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_path(path)?;
    let mut records = reader.records();
    let line_of = |position: Option<&csv::Position>| position.map_or(0, |p| p.line() as usize);

    let header = match records.next() {
        Some(record) => record?,
        None => return Err(PipelineError::parse(path, 1, "empty matrix file")),
    };
    if header.get(0) != Some("sample_id") {
        return Err(PipelineError::parse(path, 1, "header must start with 'sample_id'"));
    }
    let genes: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

    let mut sample_ids = Vec::new();
    let mut flat = Vec::new();
    for result in records {
        let record = result.map_err(|e| {
            PipelineError::parse(path, line_of(e.position()), format!("read failed: {}", e))
        })?;
        let line_no = line_of(record.position());
        if record.len() != genes.len() + 1 {
            return Err(PipelineError::parse(
                path,
                line_no,
                format!("expected {} values, found {}", genes.len(), record.len().saturating_sub(1)),
            ));
        }
        for token in record.iter().skip(1) {
            let value = if token == "NA" {
                f64::NAN
            } else {
                token.parse::<f64>().map_err(|_| {
                    PipelineError::parse(path, line_no, format!("invalid value '{}'", token))
                })?
            };
            flat.push(value);
        }
        sample_ids.push(record[0].to_string());
    }

    let values = Array2::from_shape_vec((sample_ids.len(), genes.len()), flat)
        .map_err(|e| PipelineError::parse(path, 0, format!("matrix shape mismatch: {}", e)))?;
    Ok(LoadedMatrix {
        sample_ids,
        genes,
        values,
    })
}
