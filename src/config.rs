//! Run configuration: defaults, alias tables and the eager typed parse.
//!
//! Every field of the submitted document is read exactly once, here, through
//! [`ConfigResolver`]. Stages never look at the raw document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::resolver::{truthy, ConfigResolver};
use crate::tools::Tool;
use crate::types::ReadSet;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_PIPELINE: &str = "sr_meta";

pub const DEFAULT_SAMPLE_ID: &str = "sample";

pub const DEFAULT_SPECIMEN: &str = "other";

pub const DEFAULT_THREADS: usize = 4;

/// Units processed concurrently. One keeps a run strictly sequential.
pub const DEFAULT_WORKERS: usize = 1;

pub const DEFAULT_MIN_QSCORE: i64 = 10;

pub const DEFAULT_MIN_LENGTH: i64 = 50;

/// minimap2 preset for host alignment (`sr` short reads, `map-ont` nanopore).
pub const DEFAULT_ALIGNER_PRESET: &str = "sr";

/// Number of trailing rows of the reference table used as centroids.
/// Rows above them are descriptive and ignored.
pub const DEFAULT_CENTROID_COUNT: usize = 13;

pub const DEFAULT_LABEL_COLUMN: &str = "sub_CST";

pub const DEFAULT_TYPING_SPECIMENS: &[&str] = &["vaginal", "vaginal_swab", "vagina"];

/// Environment variable prefix for tool overrides (`STABIOM_KRAKEN2`).
pub const TOOL_ENV_PREFIX: &str = "STABIOM_";

// ============================================================================
// Alias tables (first match wins)
// ============================================================================

pub mod keys {
    pub const PIPELINE_ID: &[&str] = &["pipeline_id", "module_name", "pipeline"];
    pub const RUN_ID: &[&str] = &["run.run_id", "run_id"];
    pub const RUN_DIR: &[&str] = &["run.run_dir", "run_dir", "output.run_dir"];
    pub const WORK_DIR: &[&str] = &["run.work_dir", "work_dir"];
    pub const OVERWRITE: &[&str] = &["run.force_overwrite", "force_overwrite", "overwrite"];
    pub const INPUT_STYLE: &[&str] = &["input.style", "input_style"];
    pub const READ1: &[&str] = &["input.fastq_r1", "input.r1", "input.fastq", "input.files[0]"];
    pub const READ2: &[&str] = &["input.fastq_r2", "input.r2", "input.files[1]"];
    pub const SAMPLE_ID: &[&str] = &["input.sample_id", "sample_id"];
    pub const SPECIMEN: &[&str] = &["input.sample_type", "sample_type", "input.specimen", "specimen"];
    pub const SAMPLE_SHEET: &[&str] = &[
        "input.sample_sheet",
        "input.barcode_sites_tsv",
        "run.sample_sheet",
        "paths.sample_sheet",
    ];
    pub const THREADS: &[&str] = &["resources.threads", "threads"];
    pub const WORKERS: &[&str] = &["resources.workers", "resources.max_parallel_units", "workers"];
    pub const QFILTER_ENABLED: &[&str] = &["qfilter.enabled", "params.common.qfilter"];
    pub const MIN_QSCORE: &[&str] = &["qfilter.min_q", "params.common.min_qscore", "min_qscore"];
    pub const MIN_LENGTH: &[&str] = &["qfilter.min_length", "params.common.min_length"];
    pub const REMOVE_HOST: &[&str] = &[
        "params.common.remove_host",
        "host_depletion.enabled",
        "remove_host",
    ];
    pub const HOST_INDEX: &[&str] = &["tools.minimap2.human_mmi", "host_depletion.index", "human_index"];
    pub const ALIGNER_PRESET: &[&str] = &["tools.minimap2.preset", "params.seq_type"];
    pub const CLASSIFIER_DB: &[&str] = &["tools.kraken2.db", "kraken2_db", "databases.kraken2"];
    pub const DEMUX_ENABLED: &[&str] = &["demux.enabled", "params.demux"];
    pub const BARCODES: &[&str] = &[
        "demux.barcodes_fasta",
        "tools.cutadapt.barcodes",
        "input.barcodes_fasta",
    ];
    pub const DISCARD_UNTRIMMED: &[&str] = &["demux.discard_untrimmed", "params.discard_untrimmed"];
    pub const TYPING_MODE: &[&str] = &["valencia.enabled", "typing.enabled", "postprocess.steps.valencia"];
    pub const CENTROIDS: &[&str] = &["valencia.centroids_csv", "typing.centroids", "valencia_centroids"];
    pub const CENTROID_COUNT: &[&str] = &["valencia.centroid_count", "typing.centroid_count"];
    pub const LABEL_COLUMN: &[&str] = &["valencia.label_column", "typing.label_column"];
    pub const TYPING_SPECIMENS: &[&str] = &["valencia.specimen_types", "typing.specimen_types"];
    pub const POSTPROCESS_ENABLED: &[&str] = &["postprocess.enabled"];
    pub const PLOT_SCRIPT: &[&str] = &["postprocess.plot_script", "tools.rplot_script"];
}

// ============================================================================
// Typed configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputStyle {
    FastqSingle,
    FastqPaired,
}

/// Tri-state switch for compositional typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingMode {
    Enabled,
    Disabled,
    /// Enabled when the unit's specimen type is in the applicability set.
    Auto,
}

impl TypingMode {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            None => TypingMode::Auto,
            Some(Value::String(s)) if s.trim().eq_ignore_ascii_case("auto") => TypingMode::Auto,
            Some(v) if truthy(v) => TypingMode::Enabled,
            Some(_) => TypingMode::Disabled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityFilter {
    pub enabled: bool,
    pub min_qscore: u32,
    pub min_length: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostDepletion {
    pub enabled: bool,
    pub index: Option<PathBuf>,
    pub preset: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemuxConfig {
    pub enabled: bool,
    pub barcodes: Option<PathBuf>,
    pub discard_untrimmed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypingConfig {
    pub mode: TypingMode,
    pub centroids: Option<PathBuf>,
    pub centroid_count: usize,
    pub label_column: String,
    /// Normalised specimen types the classifier applies to.
    pub specimen_types: Vec<String>,
}

impl TypingConfig {
    /// Gate for one unit. An explicit enable types every unit; `auto` only
    /// those whose specimen is applicable.
    pub fn applies_to(&self, specimen: &str) -> bool {
        match self.mode {
            TypingMode::Enabled => true,
            TypingMode::Disabled => false,
            TypingMode::Auto => {
                let specimen = normalize_specimen(specimen);
                self.specimen_types.iter().any(|s| *s == specimen)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PostprocessConfig {
    pub enabled: bool,
    pub plot_script: Option<PathBuf>,
}

/// Resolved, normalised view of the submitted document.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub pipeline_id: String,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub overwrite: bool,
    pub input_style: InputStyle,
    pub input: ReadSet,
    pub sample_id: String,
    pub specimen: String,
    pub sample_sheet: Option<PathBuf>,
    pub threads: usize,
    pub workers: usize,
    pub qfilter: QualityFilter,
    pub host: HostDepletion,
    pub classifier_db: Option<PathBuf>,
    pub demux: DemuxConfig,
    pub typing: TypingConfig,
    pub postprocess: PostprocessConfig,
    /// Explicit binary paths keyed by tool name.
    pub tool_overrides: BTreeMap<String, PathBuf>,
}

impl RunConfig {
    /// Parse the raw document. Relative paths are resolved against `base_dir`
    /// (normally the directory holding the config file).
    pub fn from_document(doc: &Value, base_dir: &Path) -> Result<Self> {
        let r = ConfigResolver::new(doc);
        let path_of = |paths: &[&str]| -> Option<PathBuf> {
            r.string(paths)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .map(|s| resolve_path(&s, base_dir))
        };

        let run_dir = match path_of(keys::RUN_DIR) {
            Some(dir) => dir,
            None => {
                let work_dir = path_of(keys::WORK_DIR);
                let run_id = r.string(keys::RUN_ID).filter(|s| !s.trim().is_empty());
                match (work_dir, run_id) {
                    (Some(work), Some(id)) => work.join(id.trim()),
                    _ => {
                        let mut paths: Vec<String> =
                            keys::RUN_DIR.iter().map(|s| s.to_string()).collect();
                        paths.push(format!("{} + {}", keys::WORK_DIR[0], keys::RUN_ID[0]));
                        return Err(EngineError::MissingRequiredField { paths });
                    }
                }
            }
        };
        let run_id = r
            .string(keys::RUN_ID)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| run_dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "run".to_string());

        let read1 = path_of(keys::READ1).ok_or_else(|| EngineError::MissingRequiredField {
            paths: keys::READ1.iter().map(|s| s.to_string()).collect(),
        })?;
        let read2 = path_of(keys::READ2);
        let (input_style, input) = resolve_input(&r, read1, read2)?;

        let threads = positive(&r, keys::THREADS, DEFAULT_THREADS as i64)?;
        let workers = positive(&r, keys::WORKERS, DEFAULT_WORKERS as i64)?;

        let qfilter = QualityFilter {
            enabled: r.bool_or(keys::QFILTER_ENABLED, true),
            min_qscore: non_negative(&r, keys::MIN_QSCORE, DEFAULT_MIN_QSCORE)?,
            min_length: non_negative(&r, keys::MIN_LENGTH, DEFAULT_MIN_LENGTH)?,
        };

        let host = HostDepletion {
            enabled: r.bool_or(keys::REMOVE_HOST, false),
            index: path_of(keys::HOST_INDEX),
            preset: r
                .string(keys::ALIGNER_PRESET)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ALIGNER_PRESET.to_string()),
        };

        let demux = DemuxConfig {
            enabled: r.bool_or(keys::DEMUX_ENABLED, false),
            barcodes: path_of(keys::BARCODES),
            discard_untrimmed: r.bool_or(keys::DISCARD_UNTRIMMED, true),
        };

        let specimen_types = r
            .string_list(keys::TYPING_SPECIMENS)
            .unwrap_or_else(|| DEFAULT_TYPING_SPECIMENS.iter().map(|s| s.to_string()).collect())
            .iter()
            .map(|s| normalize_specimen(s))
            .collect();
        let typing = TypingConfig {
            mode: TypingMode::from_value(r.value(keys::TYPING_MODE)),
            centroids: path_of(keys::CENTROIDS),
            centroid_count: positive(&r, keys::CENTROID_COUNT, DEFAULT_CENTROID_COUNT as i64)?,
            label_column: r.string_or(keys::LABEL_COLUMN, DEFAULT_LABEL_COLUMN),
            specimen_types,
        };

        let postprocess = PostprocessConfig {
            enabled: r.bool_or(keys::POSTPROCESS_ENABLED, true),
            plot_script: path_of(keys::PLOT_SCRIPT),
        };

        let mut tool_overrides = BTreeMap::new();
        for tool in Tool::ALL {
            let name = tool.binary();
            let aliases = [
                format!("tools.{name}.bin"),
                format!("tools.{name}.path"),
                format!("{name}_bin"),
            ];
            let aliases: Vec<&str> = aliases.iter().map(String::as_str).collect();
            if let Some(p) = path_of(&aliases) {
                tool_overrides.insert(name.to_string(), p);
            }
        }

        Ok(RunConfig {
            pipeline_id: r.string_or(keys::PIPELINE_ID, DEFAULT_PIPELINE),
            run_id,
            run_dir,
            overwrite: r.bool_or(keys::OVERWRITE, false),
            input_style,
            input,
            sample_id: r
                .string(keys::SAMPLE_ID)
                .map(|s| sanitize_id(&s))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SAMPLE_ID.to_string()),
            specimen: normalize_specimen(&r.string_or(keys::SPECIMEN, DEFAULT_SPECIMEN)),
            sample_sheet: path_of(keys::SAMPLE_SHEET),
            threads,
            workers,
            qfilter,
            host,
            classifier_db: path_of(keys::CLASSIFIER_DB),
            demux,
            typing,
            postprocess,
            tool_overrides,
        })
    }

    /// Filesystem checks that must pass before the run directory is touched.
    pub fn validate(&self) -> Result<()> {
        for (file, key) in self.input.files().into_iter().zip([keys::READ1[0], keys::READ2[0]]) {
            if !file.is_file() {
                return Err(EngineError::config(
                    key,
                    format!("input reads not found: {}", file.display()),
                ));
            }
        }

        match &self.classifier_db {
            None => {
                return Err(EngineError::config(
                    keys::CLASSIFIER_DB.join(" | "),
                    "classifier database path is required",
                ))
            }
            Some(db) if !db.exists() => {
                return Err(EngineError::config(
                    keys::CLASSIFIER_DB[0],
                    format!("classifier database not found: {}", db.display()),
                ))
            }
            _ => {}
        }

        if self.demux.enabled {
            match &self.demux.barcodes {
                None => {
                    return Err(EngineError::config(
                        keys::BARCODES.join(" | "),
                        "demultiplexing is enabled but no barcode set is configured",
                    ))
                }
                Some(b) if !b.is_file() => {
                    return Err(EngineError::config(
                        keys::BARCODES[0],
                        format!("barcode set not found: {}", b.display()),
                    ))
                }
                _ => {}
            }
        }

        if self.host.enabled {
            match &self.host.index {
                None => {
                    return Err(EngineError::config(
                        keys::HOST_INDEX.join(" | "),
                        "host depletion is enabled but no host reference index is configured",
                    ))
                }
                Some(i) if !i.exists() => {
                    return Err(EngineError::config(
                        keys::HOST_INDEX[0],
                        format!("host reference index not found: {}", i.display()),
                    ))
                }
                _ => {}
            }
        }

        if let Some(c) = &self.typing.centroids {
            if !c.is_file() {
                return Err(EngineError::config(
                    keys::CENTROIDS[0],
                    format!("reference centroid table not found: {}", c.display()),
                ));
            }
        }

        if let Some(sheet) = &self.sample_sheet {
            if !sheet.is_file() {
                return Err(EngineError::config(
                    keys::SAMPLE_SHEET[0],
                    format!("sample sheet not found: {}", sheet.display()),
                ));
            }
        }

        Ok(())
    }
}

fn resolve_input(
    r: &ConfigResolver<'_>,
    read1: PathBuf,
    read2: Option<PathBuf>,
) -> Result<(InputStyle, ReadSet)> {
    let explicit = match r.lookup(keys::INPUT_STYLE) {
        None => None,
        Some((path, value)) => {
            let style = value.as_str().unwrap_or_default().trim().to_ascii_uppercase();
            match style.as_str() {
                "" | "AUTO" => None,
                "FASTQ_SINGLE" | "SINGLE" => Some(InputStyle::FastqSingle),
                "FASTQ_PAIRED" | "PAIRED" => Some(InputStyle::FastqPaired),
                other => {
                    return Err(EngineError::config(
                        path,
                        format!("unsupported input style `{other}` (expected FASTQ_SINGLE or FASTQ_PAIRED)"),
                    ))
                }
            }
        }
    };

    match (explicit, read2) {
        (Some(InputStyle::FastqPaired), None) => Err(EngineError::config(
            keys::READ2[0],
            "input style is FASTQ_PAIRED but no second read file is configured",
        )),
        (Some(InputStyle::FastqSingle), Some(r2)) => {
            log::warn!(
                "input style FASTQ_SINGLE: ignoring second read file {}",
                r2.display()
            );
            Ok((InputStyle::FastqSingle, ReadSet::Single { reads: read1 }))
        }
        (_, Some(r2)) => {
            let (r1, r2) = order_mates(read1, r2);
            Ok((InputStyle::FastqPaired, ReadSet::Paired { r1, r2 }))
        }
        (_, None) => Ok((InputStyle::FastqSingle, ReadSet::Single { reads: read1 })),
    }
}

const R1_MARKERS: &[&str] = &["_R1", "_1.fastq", "_1.fq", ".R1."];
const R2_MARKERS: &[&str] = &["_R2", "_2.fastq", "_2.fq", ".R2."];

fn mate_of(path: &Path, markers: &[&str]) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    markers.iter().any(|m| name.contains(m))
}

/// Put mates in R1/R2 order when file names say they were swapped.
pub fn order_mates(a: PathBuf, b: PathBuf) -> (PathBuf, PathBuf) {
    if mate_of(&a, R2_MARKERS) && mate_of(&b, R1_MARKERS) {
        (b, a)
    } else {
        (a, b)
    }
}

fn positive(r: &ConfigResolver<'_>, paths: &[&str], default: i64) -> Result<usize> {
    let v = r.int_or(paths, default)?;
    if v < 1 {
        let key = r.lookup(paths).map(|(p, _)| p).unwrap_or(paths[0]);
        return Err(EngineError::config(key, format!("must be at least 1, got {v}")));
    }
    Ok(v as usize)
}

fn non_negative(r: &ConfigResolver<'_>, paths: &[&str], default: i64) -> Result<u32> {
    let v = r.int_or(paths, default)?;
    u32::try_from(v).map_err(|_| {
        let key = r.lookup(paths).map(|(p, _)| p).unwrap_or(paths[0]);
        EngineError::config(key, format!("must be a non-negative integer, got {v}"))
    })
}

/// `~` and relative paths are anchored at `base_dir`.
pub fn resolve_path(raw: &str, base_dir: &Path) -> PathBuf {
    let expanded = match raw.strip_prefix("~/") {
        Some(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => PathBuf::from(raw),
        },
        None => PathBuf::from(raw),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// Lowercase, drop separators, fold common synonyms.
pub fn normalize_specimen(s: &str) -> String {
    let folded: String = s
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect();
    match folded.as_str() {
        "vaginal" | "vagina" => "vaginal".to_string(),
        "oral" | "mouth" => "oral".to_string(),
        _ => folded,
    }
}

/// Unit ids end up in file names; keep them to `[A-Za-z0-9._-]`.
pub fn sanitize_id(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn base() -> PathBuf {
        PathBuf::from("/cfg")
    }

    #[test]
    fn legacy_and_current_keys_resolve_the_same() {
        let legacy = json!({
            "run_dir": "/out/r1",
            "input": { "fastq": "reads.fq.gz" },
            "kraken2_db": "/db/k2",
            "sample_type": "Vagina",
            "remove_host": "yes",
            "human_index": "/ref/h.mmi"
        });
        let current = json!({
            "run": { "run_dir": "/out/r1" },
            "input": { "fastq_r1": "reads.fq.gz", "sample_type": "vaginal" },
            "tools": { "kraken2": { "db": "/db/k2" }, "minimap2": { "human_mmi": "/ref/h.mmi" } },
            "params": { "common": { "remove_host": 1 } }
        });
        let a = RunConfig::from_document(&legacy, &base()).unwrap();
        let b = RunConfig::from_document(&current, &base()).unwrap();
        for cfg in [&a, &b] {
            assert_eq!(cfg.run_dir, PathBuf::from("/out/r1"));
            assert_eq!(cfg.run_id, "r1");
            assert_eq!(cfg.input, ReadSet::Single { reads: "/cfg/reads.fq.gz".into() });
            assert_eq!(cfg.classifier_db.as_deref(), Some(Path::new("/db/k2")));
            assert_eq!(cfg.specimen, "vaginal");
            assert!(cfg.host.enabled);
            assert_eq!(cfg.host.index.as_deref(), Some(Path::new("/ref/h.mmi")));
        }
    }

    #[test]
    fn defaults_for_absent_optional_fields() {
        let doc = json!({ "run_dir": "/o/x", "input": { "fastq": "/r.fq" } });
        let cfg = RunConfig::from_document(&doc, &base()).unwrap();
        assert_eq!(cfg.pipeline_id, DEFAULT_PIPELINE);
        assert_eq!(cfg.sample_id, DEFAULT_SAMPLE_ID);
        assert_eq!(cfg.specimen, DEFAULT_SPECIMEN);
        assert_eq!(cfg.threads, DEFAULT_THREADS);
        assert_eq!(cfg.workers, DEFAULT_WORKERS);
        assert!(cfg.qfilter.enabled);
        assert_eq!(cfg.qfilter.min_qscore, 10);
        assert!(!cfg.host.enabled);
        assert!(!cfg.demux.enabled);
        assert!(cfg.demux.discard_untrimmed);
        assert!(!cfg.overwrite);
        assert_eq!(cfg.typing.mode, TypingMode::Auto);
        assert_eq!(cfg.typing.centroid_count, DEFAULT_CENTROID_COUNT);
        assert_eq!(cfg.typing.label_column, DEFAULT_LABEL_COLUMN);
        assert!(cfg.tool_overrides.is_empty());
    }

    #[test]
    fn run_dir_falls_back_to_work_dir_and_run_id() {
        let doc = json!({
            "run": { "work_dir": "/work", "run_id": "sr_meta_1" },
            "input": { "fastq": "/r.fq" }
        });
        let cfg = RunConfig::from_document(&doc, &base()).unwrap();
        assert_eq!(cfg.run_dir, PathBuf::from("/work/sr_meta_1"));
        assert_eq!(cfg.run_id, "sr_meta_1");
    }

    #[test]
    fn missing_run_dir_lists_all_aliases() {
        let doc = json!({ "input": { "fastq": "/r.fq" } });
        match RunConfig::from_document(&doc, &base()) {
            Err(EngineError::MissingRequiredField { paths }) => {
                assert!(paths.iter().any(|p| p == "run.run_dir"));
                assert!(paths.iter().any(|p| p == "output.run_dir"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn paired_input_from_file_list_is_ordered() {
        let doc = json!({
            "run_dir": "/o/x",
            "input": { "files": ["/d/s_R2.fastq.gz", "/d/s_R1.fastq.gz"] }
        });
        let cfg = RunConfig::from_document(&doc, &base()).unwrap();
        assert_eq!(cfg.input_style, InputStyle::FastqPaired);
        assert_eq!(
            cfg.input,
            ReadSet::Paired {
                r1: "/d/s_R1.fastq.gz".into(),
                r2: "/d/s_R2.fastq.gz".into()
            }
        );
    }

    #[test]
    fn explicit_paired_without_mate_is_rejected() {
        let doc = json!({
            "run_dir": "/o/x",
            "input": { "fastq_r1": "/r.fq", "style": "FASTQ_PAIRED" }
        });
        let err = RunConfig::from_document(&doc, &base()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("input.fastq_r2"));
    }

    #[test]
    fn typing_mode_and_gate() {
        let doc = json!({
            "run_dir": "/o/x",
            "input": { "fastq": "/r.fq" },
            "valencia": { "enabled": "auto" }
        });
        let cfg = RunConfig::from_document(&doc, &base()).unwrap();
        assert_eq!(cfg.typing.mode, TypingMode::Auto);
        assert!(cfg.typing.applies_to("Vaginal_Swab"));
        assert!(cfg.typing.applies_to("vagina"));
        assert!(!cfg.typing.applies_to("oral"));

        let off = json!({
            "run_dir": "/o/x",
            "input": { "fastq": "/r.fq" },
            "typing": { "enabled": 0 }
        });
        let cfg = RunConfig::from_document(&off, &base()).unwrap();
        assert_eq!(cfg.typing.mode, TypingMode::Disabled);
        assert!(!cfg.typing.applies_to("vaginal"));
    }

    #[test]
    fn explicit_enable_types_any_specimen() {
        let on = json!({
            "run_dir": "/o/x",
            "input": { "fastq": "/r.fq" },
            "valencia": { "enabled": 1 }
        });
        let cfg = RunConfig::from_document(&on, &base()).unwrap();
        assert_eq!(cfg.typing.mode, TypingMode::Enabled);
        assert!(cfg.typing.applies_to("oral"));
        assert!(cfg.typing.applies_to("vaginal"));

        let auto = json!({
            "run_dir": "/o/x",
            "input": { "fastq": "/r.fq" },
            "valencia": { "enabled": "auto" }
        });
        let cfg = RunConfig::from_document(&auto, &base()).unwrap();
        assert!(!cfg.typing.applies_to("oral"));
    }

    #[test]
    fn tool_overrides_are_collected() {
        let doc = json!({
            "run_dir": "/o/x",
            "input": { "fastq": "/r.fq" },
            "tools": { "fastp": { "bin": "/opt/fastp" } },
            "kraken2_bin": "bin/kraken2"
        });
        let cfg = RunConfig::from_document(&doc, &base()).unwrap();
        assert_eq!(cfg.tool_overrides["fastp"], PathBuf::from("/opt/fastp"));
        assert_eq!(cfg.tool_overrides["kraken2"], PathBuf::from("/cfg/bin/kraken2"));
    }

    #[test]
    fn zero_workers_is_a_configuration_error() {
        let doc = json!({
            "run_dir": "/o/x",
            "input": { "fastq": "/r.fq" },
            "resources": { "workers": 0 }
        });
        let err = RunConfig::from_document(&doc, &base()).unwrap_err();
        assert!(err.to_string().contains("resources.workers"));
    }

    #[test]
    fn validate_requires_classifier_database() {
        let dir = tempfile::tempdir().unwrap();
        let reads = dir.path().join("r.fastq");
        fs::write(&reads, "@r\nACGT\n+\nIIII\n").unwrap();
        let doc = json!({ "run_dir": dir.path().join("run"), "input": { "fastq": reads } });
        let cfg = RunConfig::from_document(&doc, dir.path()).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("tools.kraken2.db"));
    }

    #[test]
    fn specimen_normalisation() {
        assert_eq!(normalize_specimen(" Vaginal "), "vaginal");
        assert_eq!(normalize_specimen("mouth"), "oral");
        assert_eq!(normalize_specimen("vaginal_swab"), "vaginalswab");
        assert_eq!(sanitize_id("barcode 01/x"), "barcode_01_x");
    }
}
