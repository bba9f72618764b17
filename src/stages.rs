// src/stages.rs

//! The fixed per-unit stage sequence and the run-level plotting stage.
//! Each stage returns the reads the next one consumes.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{keys, RunConfig};
use crate::error::{EngineError, Result};
use crate::fastq::count_read_set;
use crate::ledger::INTERNAL_TOOL;
use crate::stage::{StageCommand, StageOutcome, StageRunner, StageSpec};
use crate::tools::Tool;
use crate::types::{ReadSet, SampleUnit};

pub const TRIM_STEP: &str = "trim";
pub const HOST_STEP: &str = "host_depletion";
pub const CLASSIFY_STEP: &str = "classification";
pub const PLOTS_STEP: &str = "plots";

pub const TRIMMED_DIR: &str = "trimmed";
pub const HOST_DIR: &str = "host_depleted";
pub const CLASSIFICATION_DIR: &str = "classification";
pub const TYPING_DIR: &str = "typing";
pub const TABLES_DIR: &str = "tables";
pub const PLOTS_DIR: &str = "plots";
pub const DEMUX_DIR: &str = "demux";

/// What one unit left behind after its stages.
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub unit: SampleUnit,
    /// Reads handed to the classifier.
    pub classified_reads: ReadSet,
    pub kreport: PathBuf,
    pub kraken_output: PathBuf,
}

/// Trim, deplete and classify one unit. The first failing stage ends it.
pub fn process_unit(
    runner: &StageRunner<'_>,
    config: &RunConfig,
    unit: &SampleUnit,
    results: &Path,
) -> Result<UnitResult> {
    let trimmed = trim(runner, config, unit, &results.join(TRIMMED_DIR).join(&unit.id))?;
    let depleted = deplete_host(runner, config, unit, trimmed, &results.join(HOST_DIR).join(&unit.id))?;
    let (kreport, kraken_output) = classify(
        runner,
        config,
        unit,
        &depleted,
        &results.join(CLASSIFICATION_DIR).join(&unit.id),
    )?;
    Ok(UnitResult {
        unit: unit.clone(),
        classified_reads: depleted,
        kreport,
        kraken_output,
    })
}

/// `<dir>/<stem>.fastq.gz`, or `_R1`/`_R2` files for paired reads.
fn outputs_like(reads: &ReadSet, dir: &Path, stem: &str) -> ReadSet {
    match reads {
        ReadSet::Single { .. } => ReadSet::Single {
            reads: dir.join(format!("{stem}.fastq.gz")),
        },
        ReadSet::Paired { .. } => ReadSet::Paired {
            r1: dir.join(format!("{stem}_R1.fastq.gz")),
            r2: dir.join(format!("{stem}_R2.fastq.gz")),
        },
    }
}

fn read_count(reads: &ReadSet) -> String {
    match count_read_set(reads) {
        Ok(n) => n.to_string(),
        Err(e) => {
            log::debug!("could not count reads: {e}");
            "?".to_string()
        }
    }
}

pub fn trim(
    runner: &StageRunner<'_>,
    config: &RunConfig,
    unit: &SampleUnit,
    out_dir: &Path,
) -> Result<ReadSet> {
    if !config.qfilter.enabled {
        runner.skip(
            TRIM_STEP,
            Some(&unit.id),
            Tool::Fastp.binary(),
            "quality filtering disabled; reads passed through",
        )?;
        return Ok(unit.reads.clone());
    }

    let out = outputs_like(&unit.reads, out_dir, &unit.id);
    let cmd = StageCommand::new(Tool::Fastp);
    let cmd = match (&unit.reads, &out) {
        (ReadSet::Paired { r1, r2 }, ReadSet::Paired { r1: o1, r2: o2 }) => {
            cmd.arg("-i").arg(r1).arg("-I").arg(r2).arg("-o").arg(o1).arg("-O").arg(o2)
        }
        (ReadSet::Single { reads }, ReadSet::Single { reads: o }) => {
            cmd.arg("-i").arg(reads).arg("-o").arg(o)
        }
        (input, _) => {
            return Err(EngineError::config(
                keys::READ1[0],
                format!("cannot derive trimmed outputs for {input:?}"),
            ))
        }
    };
    let cmd = cmd
        .arg("-q")
        .arg(config.qfilter.min_qscore.to_string())
        .arg("-l")
        .arg(config.qfilter.min_length.to_string())
        .arg("-w")
        .arg(config.threads.to_string())
        .arg("-j")
        .arg(out_dir.join(format!("{}.fastp.json", unit.id)))
        .arg("-h")
        .arg(out_dir.join(format!("{}.fastp.html", unit.id)));

    let kept = &out;
    runner.run(
        StageSpec::new(TRIM_STEP, Some(&unit.id), vec![cmd])
            .output_dir(out_dir)
            .summarize(move || format!("kept {} reads", read_count(kept))),
    )?;
    Ok(out)
}

pub fn deplete_host(
    runner: &StageRunner<'_>,
    config: &RunConfig,
    unit: &SampleUnit,
    reads: ReadSet,
    out_dir: &Path,
) -> Result<ReadSet> {
    if !config.host.enabled {
        runner.skip(
            HOST_STEP,
            Some(&unit.id),
            Tool::Minimap2.binary(),
            "host depletion disabled; reads passed through unchanged",
        )?;
        return Ok(reads);
    }
    let index = config.host.index.as_deref().ok_or_else(|| {
        EngineError::config(keys::HOST_INDEX.join(" | "), "host reference index is required")
    })?;

    let sam = out_dir.join(format!("{}.host.sam", unit.id));
    let out = outputs_like(&reads, out_dir, &unit.id);

    let align = StageCommand::new(Tool::Minimap2)
        .arg("-ax")
        .arg(&config.host.preset)
        .arg("-t")
        .arg(config.threads.to_string())
        .arg("-o")
        .arg(&sam)
        .arg(index)
        .args(reads.files());

    // Keep only reads that did not align: both mates unmapped (flag 12)
    // for pairs, the read unmapped (flag 4) otherwise.
    let extract = StageCommand::new(Tool::Samtools).arg("fastq");
    let extract = match &out {
        ReadSet::Paired { r1, r2 } => extract
            .arg("-f")
            .arg("12")
            .arg("-1")
            .arg(r1)
            .arg("-2")
            .arg(r2)
            .arg("-0")
            .arg("/dev/null")
            .arg("-s")
            .arg("/dev/null"),
        ReadSet::Single { reads } => extract.arg("-f").arg("4").arg("-0").arg(reads),
    }
    .arg(&sam);

    let (before, after) = (&reads, &out);
    let outcome = runner.run(
        StageSpec::new(HOST_STEP, Some(&unit.id), vec![align, extract])
            .output_dir(out_dir)
            .summarize(move || {
                match (count_read_set(before), count_read_set(after)) {
                    (Ok(b), Ok(a)) => format!("removed {} of {b} reads", b.saturating_sub(a)),
                    _ => "host reads removed".to_string(),
                }
            }),
    )?;
    if outcome == StageOutcome::Succeeded {
        if let Err(e) = fs::remove_file(&sam) {
            log::debug!("could not remove {}: {e}", sam.display());
        }
    }
    Ok(out)
}

/// Returns the report and per-read output paths.
pub fn classify(
    runner: &StageRunner<'_>,
    config: &RunConfig,
    unit: &SampleUnit,
    reads: &ReadSet,
    out_dir: &Path,
) -> Result<(PathBuf, PathBuf)> {
    let db = config.classifier_db.as_deref().ok_or_else(|| {
        EngineError::config(keys::CLASSIFIER_DB.join(" | "), "classifier database path is required")
    })?;
    let kreport = out_dir.join(format!("{}.kreport", unit.id));
    let kraken_output = out_dir.join(format!("{}.kraken", unit.id));

    let mut cmd = StageCommand::new(Tool::Kraken2)
        .arg("--db")
        .arg(db)
        .arg("--threads")
        .arg(config.threads.to_string())
        .arg("--report")
        .arg(&kreport)
        .arg("--output")
        .arg(&kraken_output);
    if reads.is_paired() {
        cmd = cmd.arg("--paired");
    }
    if reads.is_gzipped() {
        cmd = cmd.arg("--gzip-compressed");
    }
    let cmd = cmd.args(reads.files());

    let report = &kreport;
    runner.run(
        StageSpec::new(CLASSIFY_STEP, Some(&unit.id), vec![cmd])
            .output_dir(out_dir)
            .summarize(move || {
                if report.is_file() {
                    format!("report written to {}", report.display())
                } else {
                    "classifier exited 0 but wrote no report".to_string()
                }
            }),
    )?;
    Ok((kreport, kraken_output))
}

/// Best-effort: a failing plot script is recorded and logged, never fatal.
pub fn plots(
    runner: &StageRunner<'_>,
    config: &RunConfig,
    assignments: Option<&Path>,
    tables_dir: &Path,
    plots_dir: &Path,
) -> Result<()> {
    if !config.postprocess.enabled {
        return runner.skip(PLOTS_STEP, None, INTERNAL_TOOL, "postprocessing disabled");
    }
    let Some(script) = config.postprocess.plot_script.as_deref() else {
        return runner.skip(
            PLOTS_STEP,
            None,
            Tool::Rscript.binary(),
            format!("no plot script configured; set {}", keys::PLOT_SCRIPT[0]),
        );
    };

    let mut cmd = StageCommand::new(Tool::Rscript).arg(script);
    if let Some(a) = assignments {
        cmd = cmd.arg("--assignments").arg(a);
    }
    let cmd = cmd
        .arg("--tables")
        .arg(tables_dir)
        .arg("--outdir")
        .arg(plots_dir);

    let outcome = runner.run(
        StageSpec::new(PLOTS_STEP, None, vec![cmd])
            .optional()
            .best_effort()
            .output_dir(plots_dir),
    )?;
    if let StageOutcome::Failed { exit_code } = outcome {
        let err = EngineError::Postprocess {
            stage: PLOTS_STEP.to_string(),
            message: format!(
                "plot script exited with {}; see {}",
                exit_code
                    .map(|c| format!("code {c}"))
                    .unwrap_or_else(|| "a signal".to_string()),
                runner.log_path(PLOTS_STEP, None).display()
            ),
        };
        log::warn!("{err}");
    }
    Ok(())
}
