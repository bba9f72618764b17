//src/types.rs

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read files for one sample, single-end or paired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum ReadSet {
    Single { reads: PathBuf },
    Paired { r1: PathBuf, r2: PathBuf },
}

impl ReadSet {
    pub fn is_paired(&self) -> bool {
        matches!(self, ReadSet::Paired { .. })
    }

    pub fn files(&self) -> Vec<&Path> {
        match self {
            ReadSet::Single { reads } => vec![reads.as_path()],
            ReadSet::Paired { r1, r2 } => vec![r1.as_path(), r2.as_path()],
        }
    }

    pub fn is_gzipped(&self) -> bool {
        self.files()
            .iter()
            .all(|p| p.extension().map(|e| e == "gz").unwrap_or(false))
    }
}

/// One independent read set flowing through the per-unit stages.
/// Built once by fan-out and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleUnit {
    pub id: String,
    pub reads: ReadSet,
    /// Display name from the sample sheet, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Normalised specimen type (e.g. `vaginal`).
    pub specimen: String,
}

impl SampleUnit {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One ledger entry. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub status: StepStatus,
    pub message: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// A structured representation of one row in a classifier report.
///  %  clade_reads  direct_reads  rank  taxid  name
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub pct: f64,
    pub clade_reads: u64,
    pub direct_reads: u64,
    /// Normalised single-letter rank code, sub-ranks keep their digit (`S1`).
    pub rank: String,
    pub tax_id: u64,
    pub name: String,
    /// Indentation depth of the name column
    pub depth: usize,
}

/// Typing result for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationAssignment {
    pub unit_id: String,
    /// Reads per reference taxon, same order as the reference taxon list.
    pub taxon_reads: Vec<u64>,
    pub total_reads: u64,
    /// `(profile label, similarity)` in reference table order.
    pub scores: Vec<(String, f64)>,
    pub profile: String,
    pub group: String,
    pub score: f64,
}
