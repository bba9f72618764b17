// src/ledger.rs

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{IoContext, Result};
use crate::types::{StepRecord, StepStatus};

/// Tool name recorded for steps the engine performs itself.
pub const INTERNAL_TOOL: &str = "stabiom";

/// Append-only audit trail of every stage attempt in a run.
///
/// Records live in memory and the whole array is written to `steps.json`
/// after every append (temp file + rename), so an interrupted run never
/// leaves a half-written ledger behind.
pub struct StepLedger {
    path: PathBuf,
    records: Mutex<Vec<StepRecord>>,
}

impl StepLedger {
    /// Open the ledger at `path`, keeping any records already on disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.is_file() {
            let bytes = fs::read(&path).at(&path)?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                Vec::new()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// The only mutation: add one record and checkpoint to disk.
    ///
    /// The record is kept in memory even if the checkpoint fails.
    pub fn append(&self, record: StepRecord) -> Result<()> {
        log::debug!(
            "ledger: {}{} -> {}",
            record.step,
            record
                .unit
                .as_deref()
                .map(|u| format!("[{u}]"))
                .unwrap_or_default(),
            record.status
        );
        let mut records = self.records.lock();
        records.push(record);
        write_atomic(&self.path, &records)
    }

    /// Write the current state again, e.g. at run end.
    pub fn flush(&self) -> Result<()> {
        let records = self.records.lock();
        write_atomic(&self.path, &records)
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomic(path: &Path, records: &[StepRecord]) -> Result<()> {
    let body = serde_json::to_vec_pretty(records)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    Ok(())
}

impl StepRecord {
    /// Record for a step performed in-process (no external command).
    pub fn internal(
        step: &str,
        unit: Option<&str>,
        status: StepStatus,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        StepRecord {
            step: step.to_string(),
            unit: unit.map(str::to_string),
            status,
            message: message.into(),
            tool: INTERNAL_TOOL.to_string(),
            command: String::new(),
            exit_code: None,
            started_at,
            ended_at: Utc::now(),
        }
    }
}
