// src/stage.rs

//! Runs one external-process stage and records exactly one ledger entry for it.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Utc;

use crate::error::{EngineError, IoContext, Result};
use crate::ledger::StepLedger;
use crate::tools::{Tool, ToolLocations};
use crate::types::{StepRecord, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Missing binary aborts the run.
    Required,
    /// Missing binary is recorded as `skipped` and the run continues.
    Optional,
}

/// One argv invocation inside a stage.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub tool: Tool,
    pub args: Vec<OsString>,
}

impl StageCommand {
    pub fn new(tool: Tool) -> Self {
        Self {
            tool,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, a: impl AsRef<OsStr>) -> Self {
        self.args.push(a.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }
}

/// A stage: one or more commands run in order against one unit (or the run),
/// sharing a log file and a single ledger record.
pub struct StageSpec<'a> {
    pub step: &'a str,
    pub unit: Option<&'a str>,
    pub commands: Vec<StageCommand>,
    pub requirement: Requirement,
    /// A failure is recorded but not returned as an error.
    pub best_effort: bool,
    /// Removed and recreated before the first command runs.
    pub output_dir: Option<PathBuf>,
    /// Builds the success message (e.g. read counts) once all commands exit 0.
    pub summarize: Option<Box<dyn Fn() -> String + 'a>>,
}

impl<'a> StageSpec<'a> {
    pub fn new(step: &'a str, unit: Option<&'a str>, commands: Vec<StageCommand>) -> Self {
        Self {
            step,
            unit,
            commands,
            requirement: Requirement::Required,
            best_effort: false,
            output_dir: None,
            summarize: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.requirement = Requirement::Optional;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn summarize(mut self, f: impl Fn() -> String + 'a) -> Self {
        self.summarize = Some(Box::new(f));
        self
    }

    fn tool_label(&self) -> String {
        self.commands
            .iter()
            .map(|c| c.tool.binary())
            .collect::<Vec<_>>()
            .join("+")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    /// Only returned for best-effort stages; otherwise an error is raised.
    Failed { exit_code: Option<i32> },
    Skipped,
}

/// Executes stages against a fixed set of tool locations and one ledger.
pub struct StageRunner<'a> {
    tools: &'a ToolLocations,
    ledger: &'a StepLedger,
    logs_dir: PathBuf,
}

impl<'a> StageRunner<'a> {
    pub fn new(tools: &'a ToolLocations, ledger: &'a StepLedger, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            ledger,
            logs_dir: logs_dir.into(),
        }
    }

    pub fn ledger(&self) -> &StepLedger {
        self.ledger
    }

    pub fn tools(&self) -> &ToolLocations {
        self.tools
    }

    /// `logs/<step>.log` for run-level stages, `logs/<step>.<unit>.log` per unit.
    pub fn log_path(&self, step: &str, unit: Option<&str>) -> PathBuf {
        match unit {
            Some(u) => self.logs_dir.join(format!("{step}.{u}.log")),
            None => self.logs_dir.join(format!("{step}.log")),
        }
    }

    /// Record a deliberate skip (stage disabled by configuration).
    pub fn skip(&self, step: &str, unit: Option<&str>, tool: &str, message: impl Into<String>) -> Result<()> {
        let now = Utc::now();
        let message = message.into();
        log::info!("{}: skipped: {}", label(step, unit), message);
        self.ledger.append(StepRecord {
            step: step.to_string(),
            unit: unit.map(str::to_string),
            status: StepStatus::Skipped,
            message,
            tool: tool.to_string(),
            command: String::new(),
            exit_code: None,
            started_at: now,
            ended_at: now,
        })
    }

    pub fn run(&self, spec: StageSpec<'_>) -> Result<StageOutcome> {
        let started_at = Utc::now();
        let tool_label = spec.tool_label();
        let stage = label(spec.step, spec.unit);
        let log_path = self.log_path(spec.step, spec.unit);

        let mut record = StepRecord {
            step: spec.step.to_string(),
            unit: spec.unit.map(str::to_string),
            status: StepStatus::Failed,
            message: String::new(),
            tool: tool_label,
            command: String::new(),
            exit_code: None,
            started_at,
            ended_at: started_at,
        };

        // Every command's binary must resolve before anything runs.
        let mut resolved = Vec::with_capacity(spec.commands.len());
        for cmd in &spec.commands {
            match self.tools.path(cmd.tool) {
                Some(p) => resolved.push((p.to_path_buf(), cmd)),
                None => {
                    let hint = cmd.tool.remediation();
                    record.ended_at = Utc::now();
                    return match spec.requirement {
                        Requirement::Optional => {
                            log::warn!("{stage}: `{}` not found, skipping ({hint})", cmd.tool.binary());
                            record.status = StepStatus::Skipped;
                            record.message = format!("`{}` not found; {hint}", cmd.tool.binary());
                            self.ledger.append(record)?;
                            Ok(StageOutcome::Skipped)
                        }
                        Requirement::Required => {
                            record.message = format!("`{}` not found; {hint}", cmd.tool.binary());
                            self.ledger.append(record)?;
                            Err(EngineError::ToolUnavailable {
                                stage: stage.clone(),
                                tool: cmd.tool.binary().to_string(),
                                hint,
                            })
                        }
                    };
                }
            }
        }

        let command_lines: Vec<String> = resolved
            .iter()
            .map(|(bin, cmd)| render_command(bin, &cmd.args))
            .collect();
        record.command = command_lines.join(" && ");

        if let Err(e) = self.prepare(&spec, &log_path) {
            record.message = e.to_string();
            record.ended_at = Utc::now();
            self.ledger.append(record)?;
            if spec.best_effort {
                log::warn!("{stage}: could not prepare (best effort, continuing): {e}");
                return Ok(StageOutcome::Failed { exit_code: None });
            }
            return Err(e);
        }

        let mut exit_code = Some(0);
        let mut failed_command = None;
        for ((bin, cmd), line) in resolved.iter().zip(&command_lines) {
            log::info!("{stage}: {line}");
            match execute(bin, &cmd.args, line, &log_path) {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    exit_code = status.code();
                    failed_command = Some(line.clone());
                    break;
                }
                Err(e) => {
                    exit_code = None;
                    record.message = format!("could not start `{line}`: {e}");
                    failed_command = Some(line.clone());
                    break;
                }
            }
        }

        record.exit_code = exit_code;
        match failed_command {
            None => {
                record.status = StepStatus::Succeeded;
                record.message = spec
                    .summarize
                    .as_ref()
                    .map(|f| f())
                    .unwrap_or_else(|| "completed".to_string());
                record.ended_at = Utc::now();
                log::info!("{stage}: {}", record.message);
                self.ledger.append(record)?;
                Ok(StageOutcome::Succeeded)
            }
            Some(command) => {
                if record.message.is_empty() {
                    record.message = format!(
                        "exited with {}; see {}",
                        exit_code
                            .map(|c| format!("code {c}"))
                            .unwrap_or_else(|| "a signal".to_string()),
                        log_path.display()
                    );
                }
                record.ended_at = Utc::now();
                self.ledger.append(record)?;
                if spec.best_effort {
                    log::warn!("{stage}: failed (best effort, continuing): `{command}`");
                    Ok(StageOutcome::Failed { exit_code })
                } else {
                    log::error!("{stage}: failed: `{command}`");
                    Err(EngineError::ExecutionFailure {
                        stage: spec.step.to_string(),
                        unit: spec.unit.unwrap_or("run").to_string(),
                        command,
                        exit_code,
                        log: log_path,
                    })
                }
            }
        }
    }

    fn prepare(&self, spec: &StageSpec<'_>, log_path: &Path) -> Result<()> {
        fs::create_dir_all(&self.logs_dir).at(&self.logs_dir)?;
        if let Some(dir) = &spec.output_dir {
            if dir.exists() {
                fs::remove_dir_all(dir).at(dir)?;
            }
            fs::create_dir_all(dir).at(dir)?;
        }
        // Truncate any log left by a previous attempt.
        File::create(log_path).at(log_path)?;
        Ok(())
    }
}

fn label(step: &str, unit: Option<&str>) -> String {
    match unit {
        Some(u) => format!("{step}[{u}]"),
        None => step.to_string(),
    }
}

/// Run one command with stdout and stderr appended to `log_path`.
fn execute(
    bin: &Path,
    args: &[OsString],
    line: &str,
    log_path: &Path,
) -> std::io::Result<std::process::ExitStatus> {
    let mut log = fs::OpenOptions::new().append(true).open(log_path)?;
    writeln!(log, "$ {line}")?;
    log.flush()?;
    let stderr = log.try_clone()?;

    let status = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr))
        .status()?;

    let mut log = fs::OpenOptions::new().append(true).open(log_path)?;
    writeln!(
        log,
        "# exit: {}",
        status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    )?;
    Ok(status)
}

/// Shell-style rendering of an argv, for logs and the ledger.
pub fn render_command(bin: &Path, args: &[OsString]) -> String {
    std::iter::once(bin.as_os_str())
        .chain(args.iter().map(OsString::as_os_str))
        .map(|a| quote(&a.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+,^{}".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tools::ToolEnv;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        dir: tempfile::TempDir,
        tools: ToolLocations,
        ledger: StepLedger,
    }

    fn script(dir: &Path, name: &str, body: &str) {
        let p = dir.join(name);
        fs::write(&p, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        script(&bin, "fastp", "echo \"fastp $@\"; echo warn >&2; exit 0");
        script(&bin, "kraken2", "echo boom >&2; exit 2");
        script(&bin, "samtools", "exit 0");
        let env = ToolEnv::new(BTreeMap::new(), Some(bin.into_os_string()));
        let tools = ToolLocations::resolve(&BTreeMap::new(), &env);
        let ledger = StepLedger::open(dir.path().join("steps.json")).unwrap();
        Fixture { dir, tools, ledger }
    }

    #[test]
    fn success_captures_output_and_records_once() {
        let f = fixture();
        let runner = StageRunner::new(&f.tools, &f.ledger, f.dir.path().join("logs"));
        let out = f.dir.path().join("results/trimmed/s1");
        let spec = StageSpec::new(
            "trim",
            Some("s1"),
            vec![StageCommand::new(Tool::Fastp).args(["-i", "in file.fq"])],
        )
        .output_dir(&out)
        .summarize(|| "kept 10 reads".to_string());

        assert_eq!(runner.run(spec).unwrap(), StageOutcome::Succeeded);
        assert!(out.is_dir());

        let log = fs::read_to_string(runner.log_path("trim", Some("s1"))).unwrap();
        assert!(log.contains("fastp -i in file.fq"));
        assert!(log.contains("warn"));
        assert!(log.contains("# exit: 0"));

        let steps = f.ledger.records();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Succeeded);
        assert_eq!(steps[0].message, "kept 10 reads");
        assert_eq!(steps[0].exit_code, Some(0));
        assert!(steps[0].command.ends_with("fastp -i 'in file.fq'"));
    }

    #[test]
    fn failure_is_fatal_unless_best_effort() {
        let f = fixture();
        let runner = StageRunner::new(&f.tools, &f.ledger, f.dir.path().join("logs"));

        let err = runner
            .run(StageSpec::new(
                "classification",
                Some("s1"),
                vec![StageCommand::new(Tool::Kraken2).arg("--db")],
            ))
            .unwrap_err();
        match &err {
            EngineError::ExecutionFailure { exit_code, command, .. } => {
                assert_eq!(*exit_code, Some(2));
                assert!(command.contains("kraken2 --db"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let outcome = runner
            .run(
                StageSpec::new("plots", None, vec![StageCommand::new(Tool::Kraken2)])
                    .best_effort(),
            )
            .unwrap();
        assert_eq!(outcome, StageOutcome::Failed { exit_code: Some(2) });

        let steps = f.ledger.records();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == StepStatus::Failed));
    }

    #[test]
    fn unpreparable_output_dir_is_recorded_and_only_fatal_when_required() {
        let f = fixture();
        let runner = StageRunner::new(&f.tools, &f.ledger, f.dir.path().join("logs"));
        let blocker = f.dir.path().join("results");
        fs::write(&blocker, "not a directory").unwrap();
        let out = blocker.join("plots");

        let outcome = runner
            .run(
                StageSpec::new("plots", None, vec![StageCommand::new(Tool::Fastp)])
                    .best_effort()
                    .output_dir(&out),
            )
            .unwrap();
        assert_eq!(outcome, StageOutcome::Failed { exit_code: None });

        let err = runner
            .run(StageSpec::new("trim", Some("s1"), vec![StageCommand::new(Tool::Fastp)]).output_dir(&out))
            .unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));

        let steps = f.ledger.records();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == StepStatus::Failed));
        assert!(steps[0].message.contains("plots"));
    }

    #[test]
    fn missing_tool_optional_vs_required() {
        let f = fixture();
        let runner = StageRunner::new(&f.tools, &f.ledger, f.dir.path().join("logs"));

        let outcome = runner
            .run(StageSpec::new("plots", None, vec![StageCommand::new(Tool::Rscript)]).optional())
            .unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);

        let err = runner
            .run(StageSpec::new(
                "demultiplex",
                None,
                vec![StageCommand::new(Tool::Cutadapt)],
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolUnavailable { ref tool, .. } if tool == "cutadapt"));

        let steps = f.ledger.records();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Skipped);
        assert!(steps[0].message.contains("STABIOM_RSCRIPT"));
        assert_eq!(steps[1].status, StepStatus::Failed);
    }

    #[test]
    fn multi_command_stage_stops_at_first_failure() {
        let f = fixture();
        let runner = StageRunner::new(&f.tools, &f.ledger, f.dir.path().join("logs"));
        let err = runner
            .run(StageSpec::new(
                "host_depletion",
                Some("s1"),
                vec![
                    StageCommand::new(Tool::Kraken2),
                    StageCommand::new(Tool::Samtools).arg("fastq"),
                ],
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::ExecutionFailure { .. }));
        let log = fs::read_to_string(runner.log_path("host_depletion", Some("s1"))).unwrap();
        assert!(!log.contains("samtools fastq"));
        let steps = f.ledger.records();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].tool, "kraken2+samtools");
    }

    #[test]
    fn rerun_replaces_previous_outputs() {
        let f = fixture();
        let runner = StageRunner::new(&f.tools, &f.ledger, f.dir.path().join("logs"));
        let out = f.dir.path().join("results/trimmed/s1");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("stale.fq"), "old").unwrap();
        runner
            .run(StageSpec::new("trim", Some("s1"), vec![StageCommand::new(Tool::Fastp)]).output_dir(&out))
            .unwrap();
        assert!(!out.join("stale.fq").exists());
    }

    #[test]
    fn n_invocations_append_n_records() {
        let f = fixture();
        let runner = StageRunner::new(&f.tools, &f.ledger, f.dir.path().join("logs"));
        let tools = [Tool::Fastp, Tool::Kraken2, Tool::Rscript, Tool::Samtools, Tool::Cutadapt];
        for (i, tool) in tools.iter().enumerate() {
            let step = format!("s{i}");
            let _ = runner.run(
                StageSpec::new(&step, None, vec![StageCommand::new(*tool)]).optional(),
            );
        }
        runner.skip("host_depletion", Some("u"), "minimap2", "disabled").unwrap();
        assert_eq!(f.ledger.len(), tools.len() + 1);
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("-g"), "-g");
        assert_eq!(quote("^file:/b.fa"), "^file:/b.fa");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }
}
