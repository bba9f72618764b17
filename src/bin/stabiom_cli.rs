use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use stabiom_rs::{load_document, plan, run_document, ManifestWriter, RunOptions};

#[derive(Parser)]
#[command(name = "stabiom-rs", version, about = "Run one microbiome analysis module from a JSON config")]
struct Args {
    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a run
    Run {
        /// Path to the run configuration (JSON)
        config: PathBuf,

        /// Replace an existing run directory
        #[arg(long)]
        overwrite: bool,

        /// Units processed concurrently (overrides resources.workers)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Resolve the configuration and tools and print them; run nothing
    Resolve {
        config: PathBuf,
    },
    /// Rebuild results/manifest.json for an existing run directory
    Manifest {
        run_dir: PathBuf,
    },
}

fn spinner(color: &str, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template(&format!("{{spinner:.{color}}} {{msg}}"))
    {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.quiet { "stabiom_rs=warn" } else { "stabiom_rs=info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();

    let result = match args.command {
        Command::Run {
            config,
            overwrite,
            workers,
        } => run(config, overwrite, workers, args.quiet),
        Command::Resolve { config } => resolve(config),
        Command::Manifest { run_dir } => ManifestWriter::new(run_dir).rebuild().and_then(|m| {
            println!("{}", serde_json::to_string_pretty(&m)?);
            Ok(())
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: PathBuf, overwrite: bool, workers: Option<usize>, quiet: bool) -> stabiom_rs::Result<()> {
    let sp = spinner("blue", &format!("Loading {}...", config.display()));
    let (doc, base) = load_document(&config)?;
    sp.finish_and_clear();

    let opts = RunOptions {
        overwrite,
        workers,
        progress: !quiet,
    };
    let summary = run_document(&doc, &base, &opts)?;

    let sp = spinner("cyan", "");
    sp.finish_with_message(format!(
        "Run finished: {} unit(s), {} step record(s) in {}",
        summary.units.len(),
        summary.steps,
        summary.run_dir.display()
    ));
    for a in &summary.assignments {
        println!("{}\t{}\t{}\t{:.4}", a.unit_id, a.profile, a.group, a.score);
    }
    Ok(())
}

fn resolve(config: PathBuf) -> stabiom_rs::Result<()> {
    let (doc, base) = load_document(&config)?;
    let p = plan(&doc, &base, &RunOptions::default())?;
    println!("{}", serde_json::to_string_pretty(&p)?);
    for t in &p.missing_tools {
        log::warn!("{} not found: {}", t.binary(), t.remediation());
    }
    if p.run_dir_exists && !p.config.overwrite {
        log::warn!(
            "run directory {} exists; a run would fail without --overwrite",
            p.config.run_dir.display()
        );
    }
    Ok(())
}
