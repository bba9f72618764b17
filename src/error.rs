// src/error.rs

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Every failure the engine can surface.
///
/// Configuration problems are fatal and never retried. Stage-scoped variants
/// carry the stage name, the failing command line and the log that captured
/// its output so the user can act on them without digging through the run dir.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or inconsistent configuration, malformed reference data,
    /// or an input that leaves nothing to process.
    #[error("configuration error at `{key}`: {message}")]
    Configuration { key: String, message: String },

    /// No alias path produced a value and no default was supplied.
    #[error("missing required field (tried: {})", .paths.join(", "))]
    MissingRequiredField { paths: Vec<String> },

    /// A REQUIRED stage's binary could not be located.
    #[error("stage `{stage}` requires `{tool}` which could not be found: {hint}")]
    ToolUnavailable {
        stage: String,
        tool: String,
        hint: String,
    },

    /// An external tool exited non-zero.
    #[error(
        "stage `{stage}` failed for `{unit}` (exit code {}): `{command}`; see {}",
        .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
        .log.display()
    )]
    ExecutionFailure {
        stage: String,
        unit: String,
        command: String,
        exit_code: Option<i32>,
        log: PathBuf,
    },

    /// A classifier report line that could not be parsed.
    #[error("{}:{line}: {message}", .path.display())]
    Report {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Failure after the primary deliverable already exists.
    #[error("postprocess `{stage}` failed: {message}")]
    Postprocess { stage: String, message: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("table error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Configuration {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        EngineError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True for both configuration variants; these abort before any stage runs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration { .. } | EngineError::MissingRequiredField { .. }
        )
    }
}

/// Attach a path to a bare `io::Error`.
pub trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| EngineError::io(path, e))
    }
}
