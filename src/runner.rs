// src/runner.rs

//! Drives one run end to end: resolve, take the run directory, fan out,
//! process units, then type, summarise, plot and index.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;

use crate::config::{keys, RunConfig, TypingMode};
use crate::error::{EngineError, IoContext, Result};
use crate::fanout::UnitFanout;
use crate::ledger::StepLedger;
use crate::manifest::{
    write_json, Manifest, ManifestWriter, OutputsIndex, UnitOutputs, EFFECTIVE_CONFIG_FILE,
    LOGS_DIR, RESULTS_DIR, STEPS_FILE,
};
use crate::stage::StageRunner;
use crate::stages::{
    plots, process_unit, UnitResult, DEMUX_DIR, PLOTS_DIR, PLOTS_STEP, TABLES_DIR, TYPING_DIR,
};
use crate::summary::{write_tables, SUMMARY_STEP};
use crate::tools::{Tool, ToolEnv, ToolLocations};
use crate::typing::{run_typing, CentroidTable, TYPING_STEP};
use crate::types::{ClassificationAssignment, StepRecord, StepStatus};

/// Command-line overrides applied on top of the document.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub overwrite: bool,
    pub workers: Option<usize>,
    /// Draw a progress bar over units.
    pub progress: bool,
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub units: Vec<String>,
    pub assignments: Vec<ClassificationAssignment>,
    pub manifest: Manifest,
    pub steps: usize,
}

/// Everything a run would use, computed without executing anything.
#[derive(Debug, Serialize)]
pub struct RunPlan {
    pub config: RunConfig,
    pub tools: ToolLocations,
    pub missing_tools: Vec<Tool>,
    pub run_dir_exists: bool,
}

#[derive(Serialize)]
struct EffectiveConfig<'a> {
    #[serde(flatten)]
    config: &'a RunConfig,
    tools: &'a ToolLocations,
}

/// Read a JSON document. Relative paths inside it resolve against its directory.
pub fn load_document(path: &Path) -> Result<(Value, PathBuf)> {
    let bytes = fs::read(path).at(path)?;
    let doc: Value = serde_json::from_slice(&bytes)?;
    if !doc.is_object() {
        return Err(EngineError::config(
            path.display().to_string(),
            "configuration must be a JSON object",
        ));
    }
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((doc, base))
}

fn resolve_config(doc: &Value, base_dir: &Path, opts: &RunOptions) -> Result<RunConfig> {
    let mut config = RunConfig::from_document(doc, base_dir)?;
    config.overwrite |= opts.overwrite;
    if let Some(w) = opts.workers {
        if w == 0 {
            return Err(EngineError::config("--workers", "must be at least 1"));
        }
        config.workers = w;
    }
    config.validate()?;
    Ok(config)
}

/// Dry run: resolve configuration and tools, touch nothing.
pub fn plan(doc: &Value, base_dir: &Path, opts: &RunOptions) -> Result<RunPlan> {
    let config = resolve_config(doc, base_dir, opts)?;
    let tools = ToolLocations::resolve(&config.tool_overrides, &ToolEnv::capture());
    Ok(RunPlan {
        missing_tools: tools.missing(),
        run_dir_exists: config.run_dir.exists(),
        tools,
        config,
    })
}

fn load_centroids(config: &RunConfig) -> Result<Option<CentroidTable>> {
    if config.typing.mode == TypingMode::Disabled {
        return Ok(None);
    }
    config
        .typing
        .centroids
        .as_deref()
        .map(|p| CentroidTable::load(p, config.typing.centroid_count, &config.typing.label_column))
        .transpose()
}

/// Claim the run directory. An existing one is an error unless `overwrite`,
/// in which case it is moved aside, deleted and recreated.
fn claim_run_dir(config: &RunConfig) -> Result<()> {
    let dir = &config.run_dir;
    if dir.exists() {
        if !config.overwrite {
            return Err(EngineError::config(
                keys::OVERWRITE[0],
                format!(
                    "run directory {} already exists; set {} or pass --overwrite",
                    dir.display(),
                    keys::OVERWRITE[0]
                ),
            ));
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());
        let stale = dir.with_file_name(format!(
            ".{name}.stale-{}-{}",
            std::process::id(),
            Utc::now().format("%Y%m%dT%H%M%S%9f")
        ));
        if stale.exists() {
            fs::remove_dir_all(&stale).at(&stale)?;
        }
        log::warn!("overwriting existing run directory {}", dir.display());
        fs::rename(dir, &stale).at(dir)?;
        fs::remove_dir_all(&stale).at(&stale)?;
    }
    fs::create_dir_all(dir.join(LOGS_DIR)).at(dir)?;
    fs::create_dir_all(dir.join(RESULTS_DIR)).at(dir)?;
    Ok(())
}

pub fn run_from_path(config_path: &Path, opts: &RunOptions) -> Result<RunSummary> {
    let (doc, base) = load_document(config_path)?;
    run_document(&doc, &base, opts)
}

pub fn run_document(doc: &Value, base_dir: &Path, opts: &RunOptions) -> Result<RunSummary> {
    // Everything that can be rejected is rejected before the run dir is touched.
    let config = resolve_config(doc, base_dir, opts)?;
    let centroids = load_centroids(&config)?;
    claim_run_dir(&config)?;

    let run_dir = config.run_dir.clone();
    let results = run_dir.join(RESULTS_DIR);
    let tools = ToolLocations::resolve(&config.tool_overrides, &ToolEnv::capture());
    write_json(
        &run_dir.join(EFFECTIVE_CONFIG_FILE),
        &EffectiveConfig {
            config: &config,
            tools: &tools,
        },
    )?;
    for t in tools.missing() {
        log::debug!("{} not found; {}", t.binary(), t.remediation());
    }

    let ledger = StepLedger::open(run_dir.join(STEPS_FILE))?;
    let runner = StageRunner::new(&tools, &ledger, run_dir.join(LOGS_DIR));
    log::info!(
        "run {} ({}) in {}",
        config.run_id,
        config.pipeline_id,
        run_dir.display()
    );

    let outcome = execute(&config, centroids.as_ref(), &runner, &results, opts);
    ledger.flush()?;
    let (unit_results, assignments, typing_paths) = outcome?;

    let manifest_writer = ManifestWriter::new(&run_dir);
    let outputs = OutputsIndex {
        run_id: config.run_id.clone(),
        pipeline_id: config.pipeline_id.clone(),
        run_dir: run_dir.clone(),
        units: unit_results
            .iter()
            .map(|r| {
                let profile = assignments
                    .iter()
                    .find(|a| a.unit_id == r.unit.id)
                    .map(|a| a.profile.clone());
                (
                    r.unit.id.clone(),
                    UnitOutputs {
                        name: r.unit.name.clone(),
                        specimen: r.unit.specimen.clone(),
                        reads: r.classified_reads.clone(),
                        kreport: r.kreport.clone(),
                        kraken_output: r.kraken_output.clone(),
                        profile,
                    },
                )
            })
            .collect(),
        typing: typing_paths.0,
        typing_counts: typing_paths.1,
        tables_dir: results.join(TABLES_DIR),
        plots_dir: results.join(PLOTS_DIR),
        steps: ledger.path().to_path_buf(),
        manifest: manifest_writer.path(),
    };
    outputs.write()?;
    let manifest = manifest_writer.write(&config.run_id, &config.pipeline_id)?;

    log::info!(
        "run {} finished: {} unit(s), {} ledger records",
        config.run_id,
        unit_results.len(),
        ledger.len()
    );
    Ok(RunSummary {
        run_dir,
        units: unit_results.into_iter().map(|r| r.unit.id).collect(),
        assignments,
        manifest,
        steps: ledger.len(),
    })
}

type Executed = (
    Vec<UnitResult>,
    Vec<ClassificationAssignment>,
    (Option<PathBuf>, Option<PathBuf>),
);

fn execute(
    config: &RunConfig,
    centroids: Option<&CentroidTable>,
    runner: &StageRunner<'_>,
    results: &Path,
    opts: &RunOptions,
) -> Result<Executed> {
    let ledger = runner.ledger();
    let units = UnitFanout::new(config)?.units(runner, &results.join(DEMUX_DIR))?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| EngineError::config(keys::WORKERS[0], e.to_string()))?;

    let bar = if opts.progress {
        let pb = ProgressBar::new(units.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} units {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    } else {
        ProgressBar::hidden()
    };

    let processed: Result<Vec<UnitResult>> = pool.install(|| {
        units
            .par_iter()
            .map(|unit| {
                let r = process_unit(runner, config, unit, results);
                bar.inc(1);
                r
            })
            .collect()
    });
    match &processed {
        Ok(_) => bar.finish_with_message("done"),
        Err(_) => bar.abandon_with_message("failed"),
    }
    let processed = processed?;

    let reports: Vec<_> = processed
        .iter()
        .map(|r| (r.unit.clone(), r.kreport.clone()))
        .collect();

    // Classification is done; from here on failures are recorded, not raised.
    let started = Utc::now();
    let typing = match run_typing(
        &config.typing,
        centroids,
        &reports,
        &results.join(TYPING_DIR),
        ledger,
    ) {
        Ok(t) => t,
        Err(e) => {
            postprocess_failure(ledger, TYPING_STEP, started, e)?;
            Default::default()
        }
    };

    let started = Utc::now();
    let tables_dir = results.join(TABLES_DIR);
    match write_tables(&config.run_id, &reports, &tables_dir) {
        Ok(out) => {
            let mut message = format!("{} table(s) from {} unit(s)", out.files.len(), out.units);
            if !out.skipped.is_empty() {
                message.push_str(&format!("; left out {}", out.skipped.join(", ")));
            }
            ledger.append(StepRecord::internal(
                SUMMARY_STEP,
                None,
                StepStatus::Succeeded,
                message,
                started,
            ))?;
        }
        Err(e) => postprocess_failure(ledger, SUMMARY_STEP, started, e)?,
    }

    let started = Utc::now();
    if let Err(e) = plots(
        runner,
        config,
        typing.assignments_path.as_deref(),
        &tables_dir,
        &results.join(PLOTS_DIR),
    ) {
        postprocess_failure(ledger, PLOTS_STEP, started, e)?;
    }

    Ok((
        processed,
        typing.assignments,
        (typing.assignments_path, typing.counts_path),
    ))
}

fn postprocess_failure(
    ledger: &StepLedger,
    step: &str,
    started: chrono::DateTime<Utc>,
    cause: EngineError,
) -> Result<()> {
    let err = EngineError::Postprocess {
        stage: step.to_string(),
        message: cause.to_string(),
    };
    log::warn!("{err}");
    ledger.append(StepRecord::internal(
        step,
        None,
        StepStatus::Failed,
        err.to_string(),
        started,
    ))
}
