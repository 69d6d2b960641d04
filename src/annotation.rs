//! Probe annotation manifests and their per-array-type resolution.
//!
//! Each array type gets its own read-only [`AnnotationTable`]: rows from its own manifest
//! win, and probes only present in the counterpart manifest are filled in from there with
//! `from_fallback` set. Tables are wrapped in `Arc` and shared across assembly workers.

use crate::config::AnnotationConfig;
use crate::error::{PipelineError, Result};
use crate::types::{ArrayType, ProbeAnnotation};
use log::{debug, info};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct ManifestRow {
    probe_id: String,
    #[serde(default)]
    gene_symbol: Option<String>,
    #[serde(default, alias = "chromosome")]
    chr: Option<String>,
    #[serde(default)]
    is_snp: Option<String>,
    #[serde(default)]
    is_cross_reactive: Option<String>,
}

fn parse_flag(raw: Option<&str>) -> std::result::Result<bool, String> {
    match raw.map(str::trim).unwrap_or("") {
        "" => Ok(false),
        v if v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes") => Ok(true),
        v if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("no") => Ok(false),
        other => Err(format!("invalid boolean '{}'", other)),
    }
}

/// First non-empty symbol of a possibly `;`-separated gene list.
fn first_gene_symbol(raw: Option<&str>) -> Option<String> {
    raw?.split(';')
        .map(str::trim)
        .find(|s| !s.is_empty() && *s != "NA")
        .map(str::to_string)
}

/// Loads one manifest. Any failure is fatal: nothing downstream can run without it.
pub fn load_manifest(path: &Path, array_type: ArrayType) -> Result<Vec<ProbeAnnotation>> {
    let config_err = |message: String| {
        PipelineError::configuration(format!(
            "{} manifest {}: {}",
            array_type,
            path.display(),
            message
        ))
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| config_err(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (idx, result) in reader.deserialize::<ManifestRow>().enumerate() {
        let row = result.map_err(|e| config_err(format!("row {}: {}", idx + 2, e)))?;
        if row.probe_id.is_empty() {
            return Err(config_err(format!("row {}: empty probe_id", idx + 2)));
        }
        if !seen.insert(row.probe_id.clone()) {
            return Err(config_err(format!(
                "row {}: duplicate probe_id {}",
                idx + 2,
                row.probe_id
            )));
        }
        let is_snp = parse_flag(row.is_snp.as_deref())
            .map_err(|e| config_err(format!("row {} is_snp: {}", idx + 2, e)))?;
        let is_cross_reactive = parse_flag(row.is_cross_reactive.as_deref())
            .map_err(|e| config_err(format!("row {} is_cross_reactive: {}", idx + 2, e)))?;
        rows.push(ProbeAnnotation {
            gene_symbol: first_gene_symbol(row.gene_symbol.as_deref()),
            chromosome: row.chr.unwrap_or_default(),
            probe_id: row.probe_id,
            is_snp,
            is_cross_reactive,
            source: array_type,
            from_fallback: false,
        });
    }
    if rows.is_empty() {
        return Err(config_err("manifest contains no probes".to_string()));
    }
    info!("Loaded {} probes from {} manifest {}", rows.len(), array_type, path.display());
    Ok(rows)
}

/// One probe id per line; blank lines and `#` comments are ignored.
pub fn load_exclusion_list(path: &Path) -> Result<HashSet<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::configuration(format!(
            "Failed to read exclusion list {}: {}",
            path.display(),
            e
        ))
    })?;
    let probes: HashSet<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.split(|c: char| c == '\t' || c == ',').next().unwrap_or(l).trim().to_string())
        .collect();
    debug!("Exclusion list {} holds {} probes", path.display(), probes.len());
    Ok(probes)
}

/// Probe annotations as seen by one array type.
#[derive(Debug, Clone)]
pub struct AnnotationTable {
    array_type: ArrayType,
    probes: HashMap<String, ProbeAnnotation>,
}

impl AnnotationTable {
    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    pub fn get(&self, probe_id: &str) -> Option<&ProbeAnnotation> {
        self.probes.get(probe_id)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn fallback_count(&self) -> usize {
        self.probes.values().filter(|a| a.from_fallback).count()
    }
}

#[derive(Debug, Clone)]
pub struct AnnotationResolver {
    tables: BTreeMap<ArrayType, Arc<AnnotationTable>>,
}

impl AnnotationResolver {
    /// Loads every configured manifest and exclusion list.
    pub fn from_config(config: &AnnotationConfig) -> Result<Self> {
        let mut manifests = BTreeMap::new();
        for array_type in ArrayType::ALL {
            if let Some(path) = config.manifest_for(array_type) {
                manifests.insert(array_type, load_manifest(path, array_type)?);
            }
        }
        let cross_reactive = match &config.cross_reactive_list {
            Some(path) => load_exclusion_list(path)?,
            None => HashSet::new(),
        };
        let snp = match &config.snp_list {
            Some(path) => load_exclusion_list(path)?,
            None => HashSet::new(),
        };
        Self::from_manifests(manifests, &cross_reactive, &snp)
    }

    pub fn from_manifests(
        manifests: BTreeMap<ArrayType, Vec<ProbeAnnotation>>,
        cross_reactive: &HashSet<String>,
        snp: &HashSet<String>,
    ) -> Result<Self> {
        if manifests.is_empty() {
            return Err(PipelineError::configuration(
                "no annotation manifest was provided",
            ));
        }

        let flagged: BTreeMap<ArrayType, Vec<ProbeAnnotation>> = manifests
            .into_iter()
            .map(|(array_type, rows)| {
                let rows = rows
                    .into_iter()
                    .map(|mut a| {
                        a.source = array_type;
                        a.from_fallback = false;
                        a.is_cross_reactive |= cross_reactive.contains(&a.probe_id);
                        a.is_snp |= snp.contains(&a.probe_id);
                        a
                    })
                    .collect();
                (array_type, rows)
            })
            .collect();

        let mut tables = BTreeMap::new();
        for array_type in ArrayType::ALL {
            let mut probes: HashMap<String, ProbeAnnotation> = HashMap::new();
            if let Some(primary) = flagged.get(&array_type) {
                for annotation in primary {
                    probes.insert(annotation.probe_id.clone(), annotation.clone());
                }
            }
            if let Some(secondary) = flagged.get(&array_type.counterpart()) {
                for annotation in secondary {
                    probes.entry(annotation.probe_id.clone()).or_insert_with(|| {
                        let mut filled = annotation.clone();
                        filled.from_fallback = true;
                        filled
                    });
                }
            }
            let table = AnnotationTable { array_type, probes };
            info!(
                "Resolved {} annotation: {} probes ({} filled from the {} manifest).",
                array_type,
                table.len(),
                table.fallback_count(),
                array_type.counterpart()
            );
            tables.insert(array_type, Arc::new(table));
        }
        Ok(Self { tables })
    }

    pub fn table_for(&self, array_type: ArrayType) -> Arc<AnnotationTable> {
        // Both entries are always populated by `from_manifests`.
        Arc::clone(&self.tables[&array_type])
    }
}
