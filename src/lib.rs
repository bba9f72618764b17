// src/lib.rs
pub mod types;
pub mod error;
pub mod resolver;
pub mod config;
pub mod tools;
pub mod fastq;
pub mod ledger;
pub mod stage;
pub mod fanout;
pub mod stages;
pub mod kreport;
pub mod typing;
pub mod summary;
pub mod manifest;
pub mod runner;

pub use crate::config::RunConfig;
pub use crate::error::{EngineError, Result};
pub use crate::kreport::ClassificationReport;
pub use crate::ledger::StepLedger;
pub use crate::manifest::{Manifest, ManifestWriter};
pub use crate::resolver::ConfigResolver;
pub use crate::runner::{load_document, plan, run_document, run_from_path, RunOptions, RunPlan, RunSummary};
pub use crate::stage::{StageRunner, StageSpec};
pub use crate::tools::{Tool, ToolLocations};
pub use crate::types::{ClassificationAssignment, ReadSet, SampleUnit, StepRecord, StepStatus};
