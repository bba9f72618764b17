// src/manifest.rs

//! The two run indexes: `results/manifest.json` (artifacts by category,
//! deterministic) and `outputs.json` (where each unit's deliverables live).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::DEFAULT_PIPELINE;
use crate::error::{IoContext, Result};
use crate::types::ReadSet;

pub const RESULTS_DIR: &str = "results";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const OUTPUTS_FILE: &str = "outputs.json";
pub const STEPS_FILE: &str = "steps.json";
pub const EFFECTIVE_CONFIG_FILE: &str = "effective_config.json";
pub const LOGS_DIR: &str = "logs";

/// Categories listed in the manifest, each a sub-directory of `results/`.
pub const CATEGORIES: &[&str] = &["classification", "typing", "tables", "plots"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub pipeline_id: String,
    /// Paths relative to the run directory, sorted.
    pub artifacts: BTreeMap<String, Vec<String>>,
    pub flags: BTreeMap<String, bool>,
    pub counts: BTreeMap<String, usize>,
}

pub struct ManifestWriter {
    run_dir: PathBuf,
}

impl ManifestWriter {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.run_dir.join(RESULTS_DIR).join(MANIFEST_FILE)
    }

    /// Walk the output tree. Missing categories are empty lists.
    pub fn build(&self, run_id: &str, pipeline_id: &str) -> Result<Manifest> {
        let results = self.run_dir.join(RESULTS_DIR);
        let mut artifacts = BTreeMap::new();
        for category in CATEGORIES {
            let dir = results.join(category);
            let mut files = Vec::new();
            if dir.is_dir() {
                for entry in WalkDir::new(&dir).sort_by_file_name() {
                    let entry = entry.map_err(|e| {
                        let path = e.path().unwrap_or(&dir).to_path_buf();
                        crate::error::EngineError::io(path, e.into())
                    })?;
                    if entry.file_type().is_file() {
                        files.push(self.relative(entry.path()));
                    }
                }
            }
            artifacts.insert(category.to_string(), files);
        }

        let count = |c: &str| artifacts.get(c).map(Vec::len).unwrap_or(0);
        let mut flags = BTreeMap::new();
        let mut counts = BTreeMap::new();
        for category in CATEGORIES {
            flags.insert(format!("{category}_present"), count(category) > 0);
            counts.insert(format!("{category}_count"), count(category));
        }

        Ok(Manifest {
            run_id: run_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            artifacts,
            flags,
            counts,
        })
    }

    /// Build and write. Rerunning over an unchanged tree writes the same bytes.
    pub fn write(&self, run_id: &str, pipeline_id: &str) -> Result<Manifest> {
        let manifest = self.build(run_id, pipeline_id)?;
        write_json(&self.path(), &manifest)?;
        log::info!(
            "manifest: {} ({} artifacts)",
            self.path().display(),
            manifest.artifacts.values().map(Vec::len).sum::<usize>()
        );
        Ok(manifest)
    }

    /// Rewrite the manifest of a finished run, taking ids from its
    /// `effective_config.json` when present.
    pub fn rebuild(&self) -> Result<Manifest> {
        let cfg_path = self.run_dir.join(EFFECTIVE_CONFIG_FILE);
        let (run_id, pipeline_id) = if cfg_path.is_file() {
            let doc: serde_json::Value = serde_json::from_slice(&fs::read(&cfg_path).at(&cfg_path)?)?;
            (
                doc.get("run_id").and_then(|v| v.as_str()).map(str::to_string),
                doc.get("pipeline_id").and_then(|v| v.as_str()).map(str::to_string),
            )
        } else {
            (None, None)
        };
        let run_id = run_id.unwrap_or_else(|| {
            self.run_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "run".to_string())
        });
        let pipeline_id = pipeline_id.unwrap_or_else(|| DEFAULT_PIPELINE.to_string());
        self.write(&run_id, &pipeline_id)
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.run_dir).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Per-unit deliverables, as handed to downstream report consumers.
#[derive(Debug, Clone, Serialize)]
pub struct UnitOutputs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub specimen: String,
    /// Reads the classifier ran on.
    pub reads: ReadSet,
    pub kreport: PathBuf,
    pub kraken_output: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputsIndex {
    pub run_id: String,
    pub pipeline_id: String,
    pub run_dir: PathBuf,
    pub units: BTreeMap<String, UnitOutputs>,
    pub typing: Option<PathBuf>,
    pub typing_counts: Option<PathBuf>,
    pub tables_dir: PathBuf,
    pub plots_dir: PathBuf,
    pub steps: PathBuf,
    pub manifest: PathBuf,
}

impl OutputsIndex {
    pub fn write(&self) -> Result<PathBuf> {
        let path = self.run_dir.join(OUTPUTS_FILE);
        write_json(&path, self)?;
        Ok(path)
    }
}

/// Pretty JSON with a trailing newline, written via temp file + rename.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    Ok(())
}
