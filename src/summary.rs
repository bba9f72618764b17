// src/summary.rs

//! Run-level taxa tables built from every unit's classifier report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};
use crate::kreport::ClassificationReport;
use crate::types::SampleUnit;

pub const SUMMARY_STEP: &str = "summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Species,
    Genus,
}

impl Level {
    pub fn rank(self) -> &'static str {
        match self {
            Level::Species => "S",
            Level::Genus => "G",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Level::Species => "species",
            Level::Genus => "genus",
        }
    }
}

/// One taxon of one unit at one rank.
#[derive(Debug, Clone, PartialEq)]
pub struct TidyRow {
    pub sample_id: String,
    pub sample_name: String,
    pub specimen: String,
    pub tax_id: u64,
    pub taxon: String,
    /// Clade reads over the clade reads of all taxa at this rank.
    pub fraction: f64,
}

pub fn tidy_rows(unit: &SampleUnit, report: &ClassificationReport, level: Level) -> Vec<TidyRow> {
    let total: u64 = report.at_rank(level.rank()).map(|e| e.clade_reads).sum();
    let denom = total.max(1) as f64;
    report
        .at_rank(level.rank())
        .map(|e| TidyRow {
            sample_id: unit.id.clone(),
            sample_name: unit.display_name().to_string(),
            specimen: unit.specimen.clone(),
            tax_id: e.tax_id,
            taxon: e.name.clone(),
            fraction: e.clade_reads as f64 / denom,
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct SummaryOutput {
    pub files: Vec<PathBuf>,
    pub units: usize,
    /// Units whose report could not be read.
    pub skipped: Vec<String>,
}

/// Write the tidy, wide and plot-input tables for species and genus.
pub fn write_tables(
    run_id: &str,
    reports: &[(SampleUnit, PathBuf)],
    out_dir: &Path,
) -> Result<SummaryOutput> {
    let mut out = SummaryOutput::default();
    let mut species = Vec::new();
    let mut genus = Vec::new();
    let mut plot_ids = Vec::new();

    for (unit, path) in reports {
        match ClassificationReport::from_path(path) {
            Ok(report) => {
                species.extend(tidy_rows(unit, &report, Level::Species));
                genus.extend(tidy_rows(unit, &report, Level::Genus));
                plot_ids.push(unit.id.clone());
                out.units += 1;
            }
            Err(e) => {
                log::warn!("summary: leaving out {}: {e}", unit.id);
                out.skipped.push(unit.id.clone());
            }
        }
    }

    if out_dir.exists() {
        fs::remove_dir_all(out_dir).at(out_dir)?;
    }
    fs::create_dir_all(out_dir).at(out_dir)?;

    for (level, rows) in [(Level::Species, &species), (Level::Genus, &genus)] {
        if rows.is_empty() {
            log::info!("summary: no {} entries in any report", level.key());
            continue;
        }
        let tidy = out_dir.join(format!("kraken_{}_tidy.csv", level.key()));
        write_tidy(&tidy, rows, level)?;

        let mut ids: Vec<String> = rows.iter().map(|r| r.sample_id.clone()).collect();
        ids.sort();
        ids.dedup();
        let wide = out_dir.join(format!("kraken_{}_wide.csv", level.key()));
        write_wide(&wide, rows, &ids)?;

        let plot = out_dir.join(format!("{run_id}_{}_result_table.csv", level.key()));
        write_wide(&plot, rows, &plot_ids)?;

        out.files.extend([tidy, wide, plot]);
    }
    Ok(out)
}

fn write_tidy(path: &Path, rows: &[TidyRow], level: Level) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(["sample_id", "sample_name", "specimen", "taxid", level.key(), "fraction"])?;
    for r in rows {
        w.write_record([
            r.sample_id.as_str(),
            r.sample_name.as_str(),
            r.specimen.as_str(),
            r.tax_id.to_string().as_str(),
            r.taxon.as_str(),
            r.fraction.to_string().as_str(),
        ])?;
    }
    w.flush().at(path)?;
    Ok(())
}

/// `taxon, <sample>...` with taxa in first-seen order and 0 for absent cells.
fn write_wide(path: &Path, rows: &[TidyRow], sample_ids: &[String]) -> Result<()> {
    let mut taxa: Vec<&str> = Vec::new();
    let mut cells: BTreeMap<(&str, &str), f64> = BTreeMap::new();
    for r in rows {
        if !taxa.contains(&r.taxon.as_str()) {
            taxa.push(&r.taxon);
        }
        *cells.entry((r.taxon.as_str(), r.sample_id.as_str())).or_default() += r.fraction;
    }

    let mut w = csv::Writer::from_path(path)?;
    let mut header = vec!["taxon".to_string()];
    header.extend(sample_ids.iter().cloned());
    w.write_record(&header)?;
    for taxon in taxa {
        let mut row = vec![taxon.to_string()];
        row.extend(sample_ids.iter().map(|sid| {
            cells
                .get(&(taxon, sid.as_str()))
                .copied()
                .unwrap_or(0.0)
                .to_string()
        }));
        w.write_record(&row)?;
    }
    w.flush().at(path)?;
    Ok(())
}
