// src/tools.rs

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::TOOL_ENV_PREFIX;

/// External binaries the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Cutadapt,
    Fastp,
    Minimap2,
    Samtools,
    Kraken2,
    Rscript,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::Cutadapt,
        Tool::Fastp,
        Tool::Minimap2,
        Tool::Samtools,
        Tool::Kraken2,
        Tool::Rscript,
    ];

    /// Executable name looked up on PATH; also the config key under `tools.`.
    pub fn binary(self) -> &'static str {
        match self {
            Tool::Cutadapt => "cutadapt",
            Tool::Fastp => "fastp",
            Tool::Minimap2 => "minimap2",
            Tool::Samtools => "samtools",
            Tool::Kraken2 => "kraken2",
            Tool::Rscript => "Rscript",
        }
    }

    pub fn env_var(self) -> String {
        format!("{TOOL_ENV_PREFIX}{}", self.binary().to_ascii_uppercase())
    }

    /// Guidance shown when the binary cannot be found.
    pub fn remediation(self) -> String {
        format!(
            "install `{bin}` on PATH, set tools.{bin}.bin in the run config, or export {env}",
            bin = self.binary(),
            env = self.env_var()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Config,
    Environment,
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTool {
    pub path: PathBuf,
    pub source: ToolSource,
}

/// Snapshot of the process environment taken once at run start.
#[derive(Debug, Clone, Default)]
pub struct ToolEnv {
    vars: BTreeMap<String, OsString>,
    path: Option<OsString>,
}

impl ToolEnv {
    pub fn capture() -> Self {
        let vars = Tool::ALL
            .iter()
            .filter_map(|t| {
                let key = t.env_var();
                std::env::var_os(&key).map(|v| (key, v))
            })
            .collect();
        Self {
            vars,
            path: std::env::var_os("PATH"),
        }
    }

    pub fn new(vars: BTreeMap<String, OsString>, path: Option<OsString>) -> Self {
        Self { vars, path }
    }
}

/// Where every tool lives for this run. Built once, then only read.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolLocations {
    tools: BTreeMap<Tool, ResolvedTool>,
}

impl ToolLocations {
    /// Config override, then environment override, then PATH.
    pub fn resolve(overrides: &BTreeMap<String, PathBuf>, env: &ToolEnv) -> Self {
        let mut tools = BTreeMap::new();
        for tool in Tool::ALL {
            if let Some(found) = resolve_one(tool, overrides, env) {
                log::debug!(
                    "{} -> {} ({:?})",
                    tool.binary(),
                    found.path.display(),
                    found.source
                );
                tools.insert(tool, found);
            }
        }
        Self { tools }
    }

    pub fn get(&self, tool: Tool) -> Option<&ResolvedTool> {
        self.tools.get(&tool)
    }

    pub fn path(&self, tool: Tool) -> Option<&Path> {
        self.get(tool).map(|t| t.path.as_path())
    }

    pub fn missing(&self) -> Vec<Tool> {
        Tool::ALL
            .into_iter()
            .filter(|t| !self.tools.contains_key(t))
            .collect()
    }
}

fn resolve_one(
    tool: Tool,
    overrides: &BTreeMap<String, PathBuf>,
    env: &ToolEnv,
) -> Option<ResolvedTool> {
    if let Some(p) = overrides.get(tool.binary()) {
        if is_executable(p) {
            return Some(ResolvedTool {
                path: p.clone(),
                source: ToolSource::Config,
            });
        }
        log::warn!(
            "configured {} binary {} is not executable; trying environment and PATH",
            tool.binary(),
            p.display()
        );
    }

    if let Some(v) = env.vars.get(&tool.env_var()) {
        let p = PathBuf::from(v);
        if is_executable(&p) {
            return Some(ResolvedTool {
                path: p,
                source: ToolSource::Environment,
            });
        }
        log::warn!(
            "{} points at {} which is not executable; trying PATH",
            tool.env_var(),
            p.display()
        );
    }

    let path_var = env.path.as_ref()?;
    std::env::split_paths(path_var)
        .map(|dir| dir.join(tool.binary()))
        .find(|candidate| is_executable(candidate))
        .map(|path| ResolvedTool {
            path,
            source: ToolSource::Path,
        })
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    p.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(p: &Path) -> bool {
    p.is_file()
}
