// src/typing/similarity.rs

use crate::kreport::ClassificationReport;
use crate::types::ClassificationAssignment;

use super::centroids::{CentroidTable, ReferenceCentroid};

/// Reads per reference taxon and the matching read fractions.
#[derive(Debug, Clone, PartialEq)]
pub struct AbundanceVector {
    pub reads: Vec<u64>,
    pub total_reads: u64,
    pub fractions: Vec<f64>,
}

impl AbundanceVector {
    pub fn from_report(report: &ClassificationReport, taxa: &[String]) -> Self {
        let reads: Vec<u64> = taxa.iter().map(|t| report.reads_for(t)).collect();
        Self::from_counts(reads, report.total_reads())
    }

    pub fn from_counts(reads: Vec<u64>, total_reads: u64) -> Self {
        let fractions = reads
            .iter()
            .map(|&r| {
                if total_reads == 0 {
                    0.0
                } else {
                    r as f64 / total_reads as f64
                }
            })
            .collect();
        Self {
            reads,
            total_reads,
            fractions,
        }
    }
}

/// `Σ(c·x) / (Σ(c·x) + Σ(c−x)²)`, or 0 when the denominator is 0.
/// Non-negative inputs keep the result in [0, 1].
pub fn similarity(x: &[f64], c: &[f64]) -> f64 {
    let (num, dist) = x
        .iter()
        .zip(c)
        .fold((0.0f64, 0.0f64), |(num, dist), (&xi, &ci)| {
            let d = ci - xi;
            (num + ci * xi, dist + d * d)
        });
    let den = num + dist;
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Index and score of the closest centroid. Ties go to the earlier row.
pub fn closest(x: &[f64], centroids: &[ReferenceCentroid]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, c) in centroids.iter().enumerate() {
        let s = similarity(x, &c.abundances);
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best
}

/// Coarse group for a profile label. Unlisted labels are their own group.
pub fn group_of(label: &str) -> &str {
    match label {
        "I-A" | "I-B" => "I",
        "III-A" | "III-B" => "III",
        "IV-C0" | "IV-C1" | "IV-C2" | "IV-C3" | "IV-C4" => "IV-C",
        other => other,
    }
}

/// Score one unit's report against every centroid.
pub fn assign(
    unit_id: &str,
    report: &ClassificationReport,
    table: &CentroidTable,
) -> Option<ClassificationAssignment> {
    let vector = AbundanceVector::from_report(report, table.taxa());
    let scores: Vec<(String, f64)> = table
        .centroids()
        .iter()
        .map(|c| (c.label.clone(), similarity(&vector.fractions, &c.abundances)))
        .collect();
    let (idx, score) = closest(&vector.fractions, table.centroids())?;
    let profile = table.centroids()[idx].label.clone();

    Some(ClassificationAssignment {
        unit_id: unit_id.to_string(),
        taxon_reads: vector.reads,
        total_reads: vector.total_reads,
        scores,
        group: group_of(&profile).to_string(),
        profile,
        score,
    })
}
