// src/fanout.rs

//! Splits the submitted reads into independent sample units.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{keys, normalize_specimen, sanitize_id, RunConfig};
use crate::error::{EngineError, IoContext, Result};
use crate::fastq::has_records;
use crate::ledger::INTERNAL_TOOL;
use crate::stage::{StageCommand, StageRunner, StageSpec};
use crate::tools::Tool;
use crate::types::{ReadSet, SampleUnit};

pub const DEMUX_STEP: &str = "demultiplex";

/// Unit name cutadapt gives reads that matched no barcode.
pub const UNTRIMMED_UNIT: &str = "unclassified";

const ID_COLUMNS: &[&str] = &["barcode", "sample_id", "id"];
const NAME_COLUMNS: &[&str] = &["sample_name", "name", "sample"];
const SPECIMEN_COLUMNS: &[&str] = &["specimen", "site", "sample_type", "specimen_type"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub name: Option<String>,
    pub specimen: Option<String>,
}

/// Optional per-unit metadata keyed by barcode or sample id.
#[derive(Debug, Clone, Default)]
pub struct SampleSheet {
    entries: BTreeMap<String, SheetEntry>,
    /// First specimen listed; applies to units the sheet does not mention.
    default_specimen: Option<String>,
}

impl SampleSheet {
    /// Tab-separated, header row required. Unknown columns are ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('#').to_ascii_lowercase())
            .collect();
        let column = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| headers.iter().position(|h| h == n))
        };
        let id_col = column(ID_COLUMNS).ok_or_else(|| {
            EngineError::config(
                keys::SAMPLE_SHEET[0],
                format!(
                    "{}: no id column (expected one of {})",
                    path.display(),
                    ID_COLUMNS.join(", ")
                ),
            )
        })?;
        let name_col = column(NAME_COLUMNS);
        let specimen_col = column(SPECIMEN_COLUMNS);

        let mut sheet = SampleSheet::default();
        for row in reader.records() {
            let row = row?;
            let id = match row.get(id_col) {
                Some(id) if !id.is_empty() => sheet_key(id),
                _ => continue,
            };
            let field = |col: Option<usize>| {
                col.and_then(|c| row.get(c))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };
            let specimen = field(specimen_col).map(|s| normalize_specimen(&s));
            if sheet.default_specimen.is_none() {
                sheet.default_specimen = specimen.clone();
            }
            sheet.entries.insert(
                id,
                SheetEntry {
                    name: field(name_col),
                    specimen,
                },
            );
        }
        log::info!("sample sheet {}: {} entries", path.display(), sheet.entries.len());
        Ok(sheet)
    }

    pub fn get(&self, unit_id: &str) -> Option<&SheetEntry> {
        self.entries.get(&sheet_key(unit_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `Barcode01`, `barcode1` and `01` all name the same unit.
fn sheet_key(id: &str) -> String {
    let lower = id.trim().to_ascii_lowercase();
    let rest = lower.strip_prefix("barcode").unwrap_or(&lower);
    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
        let trimmed = rest.trim_start_matches('0');
        format!("barcode{}", if trimmed.is_empty() { "0" } else { trimmed })
    } else {
        lower
    }
}

pub struct UnitFanout<'a> {
    config: &'a RunConfig,
    sheet: Option<SampleSheet>,
}

impl<'a> UnitFanout<'a> {
    pub fn new(config: &'a RunConfig) -> Result<Self> {
        let sheet = config
            .sample_sheet
            .as_deref()
            .map(SampleSheet::load)
            .transpose()?;
        Ok(Self { config, sheet })
    }

    /// Ordered, non-empty list of units. Demultiplexes first when enabled.
    pub fn units(&self, runner: &StageRunner<'_>, demux_dir: &Path) -> Result<Vec<SampleUnit>> {
        if !self.config.demux.enabled {
            runner.skip(DEMUX_STEP, None, INTERNAL_TOOL, "demultiplexing disabled; one unit")?;
            return Ok(vec![self.unit(&self.config.sample_id, self.config.input.clone())]);
        }

        let barcodes = self.config.demux.barcodes.as_deref().ok_or_else(|| {
            EngineError::config(keys::BARCODES.join(" | "), "no barcode set configured")
        })?;
        let command = demux_command(self.config, barcodes, demux_dir);
        runner.run(StageSpec::new(DEMUX_STEP, None, vec![command]).output_dir(demux_dir))?;

        let units = self.collect(demux_dir)?;
        if units.is_empty() {
            return Err(EngineError::config(
                keys::BARCODES[0],
                format!(
                    "demultiplexing produced no non-empty read sets in {}",
                    demux_dir.display()
                ),
            ));
        }
        log::info!(
            "fan-out: {} unit(s): {}",
            units.len(),
            units.iter().map(|u| u.id.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(units)
    }

    fn unit(&self, id: &str, reads: ReadSet) -> SampleUnit {
        let entry = self.sheet.as_ref().and_then(|s| s.get(id));
        let specimen = entry
            .and_then(|e| e.specimen.clone())
            .or_else(|| self.sheet.as_ref().and_then(|s| s.default_specimen.clone()))
            .unwrap_or_else(|| self.config.specimen.clone());
        SampleUnit {
            id: id.to_string(),
            reads,
            name: entry.and_then(|e| e.name.clone()),
            specimen,
        }
    }

    /// One unit per non-empty `<name>.fastq.gz` (plus `<name>_R2.fastq.gz`
    /// when paired), sorted by name.
    fn collect(&self, demux_dir: &Path) -> Result<Vec<SampleUnit>> {
        let paired = self.config.input.is_paired();
        let mut found: BTreeMap<String, ReadSet> = BTreeMap::new();

        for entry in fs::read_dir(demux_dir).at(demux_dir)? {
            let path = entry.at(demux_dir)?.path();
            let Some(file) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = file.strip_suffix(".fastq.gz") else {
                continue;
            };
            if name.ends_with("_R2") {
                continue;
            }
            if name == UNTRIMMED_UNIT && self.config.demux.discard_untrimmed {
                continue;
            }
            if !has_records(&path).at(&path)? {
                log::debug!("demux: dropping empty read set {}", path.display());
                continue;
            }

            let reads = if paired {
                let r2 = demux_dir.join(format!("{name}_R2.fastq.gz"));
                if !r2.is_file() {
                    log::warn!("demux: {} has no mate file, skipping", path.display());
                    continue;
                }
                ReadSet::Paired { r1: path.clone(), r2 }
            } else {
                ReadSet::Single { reads: path.clone() }
            };
            found.insert(sanitize_id(name), reads);
        }

        Ok(found
            .into_iter()
            .map(|(id, reads)| self.unit(&id, reads))
            .collect())
    }
}

fn demux_command(config: &RunConfig, barcodes: &Path, demux_dir: &Path) -> StageCommand {
    let out = |file: &str| -> PathBuf { demux_dir.join(file) };
    let mut cmd = StageCommand::new(Tool::Cutadapt)
        .arg("-g")
        .arg(format!("^file:{}", barcodes.display()))
        .arg("-j")
        .arg(config.threads.to_string())
        .arg("-o")
        .arg(out("{name}.fastq.gz"));
    if config.input.is_paired() {
        cmd = cmd.arg("-p").arg(out("{name}_R2.fastq.gz"));
    }
    if config.demux.discard_untrimmed {
        cmd = cmd.arg("--discard-untrimmed");
    } else {
        cmd = cmd
            .arg("--untrimmed-output")
            .arg(out(&format!("{UNTRIMMED_UNIT}.fastq.gz")));
        if config.input.is_paired() {
            cmd = cmd
                .arg("--untrimmed-paired-output")
                .arg(out(&format!("{UNTRIMMED_UNIT}_R2.fastq.gz")));
        }
    }
    cmd.args(config.input.files())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StepLedger;
    use crate::tools::{ToolEnv, ToolLocations};
    use crate::types::StepStatus;
    use serde_json::json;

    fn config(dir: &Path, extra: serde_json::Value) -> RunConfig {
        let reads = dir.join("reads.fastq.gz");
        let mut doc = json!({
            "run_dir": dir.join("run"),
            "input": { "fastq": reads, "sample_id": "S 1", "sample_type": "Vaginal" }
        });
        if let (Some(d), Some(e)) = (doc.as_object_mut(), extra.as_object()) {
            for (k, v) in e {
                d.insert(k.clone(), v.clone());
            }
        }
        RunConfig::from_document(&doc, dir).unwrap()
    }

    #[test]
    fn sheet_keys_fold_barcode_spellings() {
        assert_eq!(sheet_key("Barcode01"), "barcode1");
        assert_eq!(sheet_key("01"), "barcode1");
        assert_eq!(sheet_key("barcode10"), "barcode10");
        assert_eq!(sheet_key("S_7"), "s_7");
    }

    #[test]
    fn sheet_loads_aliases_and_default_specimen() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sheet.tsv");
        fs::write(
            &p,
            "barcode\tsample_name\tsite\textra\n\
             barcode01\tPatient A\tVagina\tx\n\
             barcode02\t\toral\ty\n",
        )
        .unwrap();
        let sheet = SampleSheet::load(&p).unwrap();
        assert_eq!(sheet.len(), 2);
        let a = sheet.get("barcode1").unwrap();
        assert_eq!(a.name.as_deref(), Some("Patient A"));
        assert_eq!(a.specimen.as_deref(), Some("vaginal"));
        assert_eq!(sheet.get("02").unwrap().name, None);
        assert_eq!(sheet.default_specimen.as_deref(), Some("vaginal"));
    }

    #[test]
    fn sheet_without_id_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sheet.tsv");
        fs::write(&p, "foo\tbar\n1\t2\n").unwrap();
        assert!(SampleSheet::load(&p).unwrap_err().is_configuration());
    }

    #[test]
    fn demux_disabled_yields_the_input_as_one_unit() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), json!({}));
        let ledger = StepLedger::open(dir.path().join("steps.json")).unwrap();
        let tools = ToolLocations::resolve(&BTreeMap::new(), &ToolEnv::default());
        let runner = StageRunner::new(&tools, &ledger, dir.path().join("logs"));

        let units = UnitFanout::new(&cfg)
            .unwrap()
            .units(&runner, &dir.path().join("demux"))
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "S_1");
        assert_eq!(units[0].reads, cfg.input);
        assert_eq!(units[0].specimen, "vaginal");

        let steps = ledger.records();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step, DEMUX_STEP);
        assert_eq!(steps[0].status, StepStatus::Skipped);
    }

    #[test]
    fn demux_command_for_paired_input_keeps_untrimmed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            json!({
                "input": { "fastq_r1": "a_R1.fastq.gz", "fastq_r2": "a_R2.fastq.gz" },
                "demux": { "enabled": true, "barcodes_fasta": "bc.fa", "discard_untrimmed": false }
            }),
        );
        let cmd = demux_command(&cfg, Path::new("/ref/bc.fa"), Path::new("/run/results/demux"));
        let args: Vec<String> = cmd.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[0..2], ["-g", "^file:/ref/bc.fa"]);
        assert!(args.contains(&"/run/results/demux/{name}_R2.fastq.gz".to_string()));
        assert!(args.contains(&"--untrimmed-paired-output".to_string()));
        assert!(!args.contains(&"--discard-untrimmed".to_string()));
        assert!(args.last().unwrap().ends_with("a_R2.fastq.gz"));
    }

    #[cfg(unix)]
    #[test]
    fn demux_outputs_become_sorted_units() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        fs::create_dir_all(&template).unwrap();
        let gz = |name: &str, body: &str| {
            let mut enc =
                GzEncoder::new(fs::File::create(template.join(name)).unwrap(), Compression::fast());
            enc.write_all(body.as_bytes()).unwrap();
            enc.finish().unwrap();
        };
        gz("barcode02.fastq.gz", "@r\nACGT\n+\nIIII\n");
        gz("barcode01.fastq.gz", "@r\nACGT\n+\nIIII\n");
        gz("barcode03.fastq.gz", "");
        gz("unclassified.fastq.gz", "@r\nACGT\n+\nIIII\n");

        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let cutadapt = bin.join("cutadapt");
        fs::write(
            &cutadapt,
            format!(
                "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n  shift\ndone\ncp {}/* \"$(dirname \"$out\")\"/\n",
                template.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&cutadapt, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.path().join("bc.fa"), ">barcode01\nACGT\n").unwrap();

        let sheet = dir.path().join("sheet.tsv");
        fs::write(&sheet, "barcode\tname\tspecimen\n02\tSecond\toral\n").unwrap();
        let cfg = config(
            dir.path(),
            json!({
                "demux": { "enabled": "yes", "barcodes_fasta": "bc.fa" },
                "run": { "sample_sheet": "sheet.tsv" }
            }),
        );

        let ledger = StepLedger::open(dir.path().join("steps.json")).unwrap();
        let env = ToolEnv::new(BTreeMap::new(), Some(bin.into_os_string()));
        let tools = ToolLocations::resolve(&BTreeMap::new(), &env);
        let runner = StageRunner::new(&tools, &ledger, dir.path().join("logs"));

        let units = UnitFanout::new(&cfg)
            .unwrap()
            .units(&runner, &dir.path().join("results/demux"))
            .unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, ["barcode01", "barcode02"]);
        assert_eq!(units[1].display_name(), "Second");
        assert_eq!(units[1].specimen, "oral");
        // barcode01 is not in the sheet: first listed specimen applies
        assert_eq!(units[0].specimen, "oral");
        assert_eq!(ledger.records()[0].status, StepStatus::Succeeded);
    }
}
