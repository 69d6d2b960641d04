//! Array-type processing: probe filtering and gene-level aggregation for one sample.
//!
//! Probes are collapsed to genes by the mean of their observed beta values, which loses
//! probe-level detail for good.

use crate::annotation::AnnotationTable;
use crate::error::{PipelineError, Result};
use crate::types::{ArrayType, SampleProbeTable};
use log::debug;
use std::collections::BTreeMap;

/// Why probes left the table, for logging and the run report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeFilterCounts {
    pub input: usize,
    pub cross_reactive: usize,
    pub snp: usize,
    pub sex_chromosome: usize,
    pub no_gene: usize,
    pub retained: usize,
}

/// One sample reduced to gene level. Genes with no observed probe are absent.
#[derive(Debug, Clone)]
pub struct GeneProfile {
    pub sample_id: String,
    pub array_type: ArrayType,
    pub genes: BTreeMap<String, f64>,
    pub counts: ProbeFilterCounts,
}

pub fn process_sample(
    table: &SampleProbeTable,
    annotations: &AnnotationTable,
) -> Result<GeneProfile> {
    if table.array_type() != annotations.array_type() {
        return Err(PipelineError::configuration(format!(
            "sample {} is a {} array but was given the {} annotation table",
            table.sample_id(),
            table.array_type(),
            annotations.array_type()
        )));
    }

    let mut counts = ProbeFilterCounts {
        input: table.len(),
        ..Default::default()
    };
    // gene -> (probe, observed beta); probes are sorted before summing so the
    // mean does not depend on hash iteration order.
    let mut by_gene: BTreeMap<&str, Vec<(&str, Option<f64>)>> = BTreeMap::new();

    for (probe_id, beta) in table.iter() {
        let Some(annotation) = annotations.get(probe_id) else {
            counts.no_gene += 1;
            continue;
        };
        if annotation.is_cross_reactive {
            counts.cross_reactive += 1;
            continue;
        }
        if annotation.is_snp {
            counts.snp += 1;
            continue;
        }
        if annotation.is_sex_chromosome() {
            counts.sex_chromosome += 1;
            continue;
        }
        let Some(gene) = annotation.gene_symbol.as_deref() else {
            counts.no_gene += 1;
            continue;
        };
        counts.retained += 1;
        by_gene.entry(gene).or_default().push((probe_id, beta));
    }

    let mut genes = BTreeMap::new();
    for (gene, mut probes) in by_gene {
        probes.sort_unstable_by(|a, b| a.0.cmp(b.0));
        let (sum, n) = probes
            .iter()
            .filter_map(|(_, beta)| *beta)
            .fold((0.0_f64, 0_usize), |(s, n), v| (s + v, n + 1));
        if n > 0 {
            genes.insert(gene.to_string(), sum / n as f64);
        }
    }

    debug!(
        "Sample {} ({}): {} probes -> {} retained -> {} genes (cross-reactive {}, SNP {}, sex chromosome {}, no gene {})",
        table.sample_id(),
        table.array_type(),
        counts.input,
        counts.retained,
        genes.len(),
        counts.cross_reactive,
        counts.snp,
        counts.sex_chromosome,
        counts.no_gene
    );

    Ok(GeneProfile {
        sample_id: table.sample_id().to_string(),
        array_type: table.array_type(),
        genes,
        counts,
    })
}
