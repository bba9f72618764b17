// src/typing/mod.rs

//! Compositional typing: assigns each applicable unit to its closest
//! reference profile and writes the per-unit and per-profile tables.

pub mod centroids;
pub mod similarity;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::{keys, TypingConfig};
use crate::error::{IoContext, Result};
use crate::kreport::ClassificationReport;
use crate::ledger::StepLedger;
use crate::types::{ClassificationAssignment, SampleUnit, StepRecord, StepStatus};

pub use centroids::{CentroidTable, ReferenceCentroid};
pub use similarity::{assign, closest, group_of, similarity, AbundanceVector};

pub const TYPING_STEP: &str = "typing";
pub const ASSIGNMENTS_FILE: &str = "assignments.tsv";
pub const COUNTS_FILE: &str = "typing_counts.tsv";

/// What typing produced for the run.
#[derive(Debug, Default)]
pub struct TypingOutput {
    pub assignments: Vec<ClassificationAssignment>,
    pub assignments_path: Option<PathBuf>,
    pub counts_path: Option<PathBuf>,
}

/// Type every unit whose specimen is applicable. `reports` pairs each unit
/// with its classifier report.
///
/// A unit whose report cannot be read gets a `failed` record and is left out;
/// the others still get typed.
pub fn run_typing(
    config: &TypingConfig,
    table: Option<&CentroidTable>,
    reports: &[(SampleUnit, PathBuf)],
    out_dir: &Path,
    ledger: &StepLedger,
) -> Result<TypingOutput> {
    let started = Utc::now();
    let applicable = reports
        .iter()
        .filter(|(u, _)| config.applies_to(&u.specimen))
        .count();

    if applicable == 0 {
        log::info!("typing: no unit has an applicable specimen type");
        ledger.append(StepRecord::internal(
            TYPING_STEP,
            None,
            StepStatus::Skipped,
            format!(
                "no unit has an applicable specimen type ({}) or typing is disabled",
                config.specimen_types.join(", ")
            ),
            started,
        ))?;
        return Ok(TypingOutput::default());
    }

    let Some(table) = table else {
        log::warn!("typing: {applicable} applicable unit(s) but no reference centroid table");
        ledger.append(StepRecord::internal(
            TYPING_STEP,
            None,
            StepStatus::Skipped,
            format!(
                "no reference centroid table configured; set {}",
                keys::CENTROIDS[0]
            ),
            started,
        ))?;
        return Ok(TypingOutput::default());
    };

    if out_dir.exists() {
        fs::remove_dir_all(out_dir).at(out_dir)?;
    }
    fs::create_dir_all(out_dir).at(out_dir)?;

    let mut typed: Vec<(&SampleUnit, ClassificationAssignment)> = Vec::new();
    for (unit, kreport) in reports {
        let started = Utc::now();
        if !config.applies_to(&unit.specimen) {
            ledger.append(StepRecord::internal(
                TYPING_STEP,
                Some(&unit.id),
                StepStatus::Skipped,
                format!("specimen `{}` is not typed", unit.specimen),
                started,
            ))?;
            continue;
        }

        let outcome = ClassificationReport::from_path(kreport)
            .map(|report| assign(&unit.id, &report, table));
        match outcome {
            Ok(Some(a)) => {
                log::info!(
                    "typing[{}]: {} ({}), score {:.4}",
                    unit.id,
                    a.profile,
                    a.group,
                    a.score
                );
                ledger.append(StepRecord::internal(
                    TYPING_STEP,
                    Some(&unit.id),
                    StepStatus::Succeeded,
                    format!("profile {} (group {}), score {:.4}", a.profile, a.group, a.score),
                    started,
                ))?;
                typed.push((unit, a));
            }
            Ok(None) => {
                ledger.append(StepRecord::internal(
                    TYPING_STEP,
                    Some(&unit.id),
                    StepStatus::Failed,
                    "reference table has no profiles",
                    started,
                ))?;
            }
            Err(e) => {
                log::warn!("typing[{}]: {e}", unit.id);
                ledger.append(StepRecord::internal(
                    TYPING_STEP,
                    Some(&unit.id),
                    StepStatus::Failed,
                    e.to_string(),
                    started,
                ))?;
            }
        }
    }

    let assignments_path = out_dir.join(ASSIGNMENTS_FILE);
    write_assignments(&assignments_path, table, &typed)?;
    let counts_path = out_dir.join(COUNTS_FILE);
    let assignments: Vec<ClassificationAssignment> = typed.into_iter().map(|(_, a)| a).collect();
    write_counts(&counts_path, &assignments)?;

    Ok(TypingOutput {
        assignments,
        assignments_path: Some(assignments_path),
        counts_path: Some(counts_path),
    })
}

fn write_assignments(
    path: &Path,
    table: &CentroidTable,
    typed: &[(&SampleUnit, ClassificationAssignment)],
) -> Result<()> {
    let mut w = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;

    let mut header = vec![
        "unit_id".to_string(),
        "name".to_string(),
        "specimen".to_string(),
        "total_reads".to_string(),
    ];
    header.extend(table.taxa().iter().cloned());
    header.extend(table.centroids().iter().map(|c| format!("sim_{}", c.label)));
    header.extend(["profile", "group", "score"].map(String::from));
    w.write_record(&header)?;

    for (unit, a) in typed {
        let mut row = vec![
            a.unit_id.clone(),
            unit.display_name().to_string(),
            unit.specimen.clone(),
            a.total_reads.to_string(),
        ];
        row.extend(a.taxon_reads.iter().map(u64::to_string));
        row.extend(a.scores.iter().map(|(_, s)| format!("{s:.6}")));
        row.push(a.profile.clone());
        row.push(a.group.clone());
        row.push(format!("{:.6}", a.score));
        w.write_record(&row)?;
    }
    w.flush().at(path)?;
    Ok(())
}

/// Units per profile and per group, most frequent first.
fn write_counts(path: &Path, assignments: &[ClassificationAssignment]) -> Result<()> {
    let mut w = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    w.write_record(["level", "label", "count", "proportion"])?;

    let total = assignments.len();
    let levels = [
        ("profile", tally(assignments.iter().map(|a| a.profile.as_str()))),
        ("group", tally(assignments.iter().map(|a| a.group.as_str()))),
    ];
    for (level, counts) in levels {
        for (label, count) in counts {
            let proportion = if total == 0 { 0.0 } else { count as f64 / total as f64 };
            let count = count.to_string();
            let proportion = format!("{proportion:.4}");
            w.write_record([level, label, count.as_str(), proportion.as_str()])?;
        }
    }
    w.flush().at(path)?;
    Ok(())
}

fn tally<'a>(labels: impl Iterator<Item = &'a str>) -> Vec<(&'a str, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for l in labels {
        *counts.entry(l).or_default() += 1;
    }
    let mut out: Vec<(&str, usize)> = counts.into_iter().collect();
    // BTreeMap order breaks ties by label; the sort is stable
    out.sort_by(|a, b| b.1.cmp(&a.1));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypingMode;
    use crate::types::ReadSet;

    const TABLE: &str = "sub_CST,Lactobacillus_crispatus,Gardnerella_vaginalis\n\
                         I-A,0.9,0.1\n\
                         IV-B,0.1,0.9\n";

    fn typing_config(mode: TypingMode) -> TypingConfig {
        TypingConfig {
            mode,
            centroids: None,
            centroid_count: 2,
            label_column: "sub_CST".into(),
            specimen_types: vec!["vaginal".into()],
        }
    }

    fn unit(id: &str, specimen: &str) -> SampleUnit {
        SampleUnit {
            id: id.into(),
            reads: ReadSet::Single { reads: format!("{id}.fq").into() },
            name: None,
            specimen: specimen.into(),
        }
    }

    fn kreport(dir: &Path, id: &str, crispatus: u64, gardnerella: u64) -> PathBuf {
        let p = dir.join(format!("{id}.kreport"));
        let total = crispatus + gardnerella;
        fs::write(
            &p,
            format!(
                "100\t{total}\t0\tR\t1\troot\n\
                 50\t{crispatus}\t{crispatus}\tS\t47770\t  Lactobacillus crispatus\n\
                 50\t{gardnerella}\t{gardnerella}\tS\t2702\t  Gardnerella vaginalis\n"
            ),
        )
        .unwrap();
        p
    }

    fn table() -> CentroidTable {
        CentroidTable::from_reader(std::io::Cursor::new(TABLE), Path::new("t.csv"), 2, "sub_CST")
            .unwrap()
    }

    #[test]
    fn types_applicable_units_and_skips_others() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = StepLedger::open(dir.path().join("steps.json")).unwrap();
        let reports = vec![
            (unit("a", "vaginal"), kreport(dir.path(), "a", 90, 10)),
            (unit("b", "oral"), kreport(dir.path(), "b", 90, 10)),
            (unit("c", "vaginal"), kreport(dir.path(), "c", 5, 95)),
            (unit("d", "vaginal"), dir.path().join("missing.kreport")),
        ];
        let out = run_typing(
            &typing_config(TypingMode::Auto),
            Some(&table()),
            &reports,
            &dir.path().join("typing"),
            &ledger,
        )
        .unwrap();

        let profiles: Vec<&str> = out.assignments.iter().map(|a| a.profile.as_str()).collect();
        assert_eq!(profiles, ["I-A", "IV-B"]);
        assert_eq!(out.assignments[0].group, "I");

        let statuses: Vec<(Option<String>, StepStatus)> =
            ledger.records().into_iter().map(|r| (r.unit, r.status)).collect();
        assert_eq!(
            statuses,
            [
                (Some("a".to_string()), StepStatus::Succeeded),
                (Some("b".to_string()), StepStatus::Skipped),
                (Some("c".to_string()), StepStatus::Succeeded),
                (Some("d".to_string()), StepStatus::Failed),
            ]
        );

        let tsv = fs::read_to_string(out.assignments_path.unwrap()).unwrap();
        let mut lines = tsv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "unit_id\tname\tspecimen\ttotal_reads\tLactobacillus_crispatus\tGardnerella_vaginalis\tsim_I-A\tsim_IV-B\tprofile\tgroup\tscore"
        );
        assert!(lines.next().unwrap().starts_with("a\ta\tvaginal\t100\t90\t10\t"));

        let counts = fs::read_to_string(out.counts_path.unwrap()).unwrap();
        assert!(counts.contains("profile\tI-A\t1\t0.5000"));
        assert!(counts.contains("group\tIV-B\t1\t0.5000"));
    }

    #[test]
    fn no_applicable_unit_is_one_skip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = StepLedger::open(dir.path().join("steps.json")).unwrap();
        let reports = vec![(unit("a", "vaginal"), kreport(dir.path(), "a", 1, 1))];
        let out = run_typing(
            &typing_config(TypingMode::Disabled),
            Some(&table()),
            &reports,
            &dir.path().join("typing"),
            &ledger,
        )
        .unwrap();
        assert!(out.assignments.is_empty());
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.records()[0].status, StepStatus::Skipped);
        assert!(!dir.path().join("typing").exists());
    }

    #[test]
    fn explicit_enable_types_non_vaginal_units() {
        let dir = tempfile::tempdir().unwrap();
        let reports = vec![(unit("o", "oral"), kreport(dir.path(), "o", 90, 10))];

        let ledger = StepLedger::open(dir.path().join("on.json")).unwrap();
        let out = run_typing(
            &typing_config(TypingMode::Enabled),
            Some(&table()),
            &reports,
            &dir.path().join("typing_on"),
            &ledger,
        )
        .unwrap();
        assert_eq!(out.assignments.len(), 1);
        assert_eq!(out.assignments[0].profile, "I-A");
        assert_eq!(ledger.records()[0].status, StepStatus::Succeeded);

        let ledger = StepLedger::open(dir.path().join("auto.json")).unwrap();
        let out = run_typing(
            &typing_config(TypingMode::Auto),
            Some(&table()),
            &reports,
            &dir.path().join("typing_auto"),
            &ledger,
        )
        .unwrap();
        assert!(out.assignments.is_empty());
        assert_eq!(ledger.records()[0].status, StepStatus::Skipped);
        assert_eq!(ledger.records()[0].unit, None);
    }

    #[test]
    fn missing_table_is_skipped_with_remediation() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = StepLedger::open(dir.path().join("steps.json")).unwrap();
        let reports = vec![(unit("a", "vaginal"), kreport(dir.path(), "a", 1, 1))];
        run_typing(
            &typing_config(TypingMode::Enabled),
            None,
            &reports,
            &dir.path().join("typing"),
            &ledger,
        )
        .unwrap();
        let rec = &ledger.records()[0];
        assert_eq!(rec.status, StepStatus::Skipped);
        assert!(rec.message.contains("valencia.centroids_csv"));
    }

    #[test]
    fn tally_orders_by_count_then_label() {
        let t = tally(["V", "I", "III", "I", "V"].into_iter());
        assert_eq!(t, [("I", 2), ("V", 2), ("III", 1)]);
    }
}
