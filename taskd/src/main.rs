//! Durable task worker.
//!
//! Polls every `user_<id>/tasks/` directory under the configured users root and
//! advances each user's first eligible task record by one phase per tick.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use taskd::exit_codes;
use taskd::inspect::inspect_file;
use taskd::io::config::{DEFAULT_CONFIG_PATH, WorkerConfig, load_config, write_config};
use taskd::logging;
use taskd::scheduler::WorkerScheduler;

#[derive(Parser)]
#[command(name = "taskd", version, about = "Multi-user durable task worker")]
struct Cli {
    /// Path to the worker config (TOML). Defaults apply when the file is missing.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop.
    Run {
        /// Stop after this many ticks (runs forever when omitted).
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Run a single tick and print what happened.
    Tick,
    /// Parse one record file and show how the worker classifies it.
    Inspect {
        /// Path to a task record (`.md`).
        path: PathBuf,
    },
    /// Write the default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { max_ticks } => cmd_run(&cli.config, max_ticks),
        Command::Tick => cmd_tick(&cli.config),
        Command::Inspect { path } => {
            print!("{}", inspect_file(&path, Utc::now())?);
            Ok(exit_codes::OK)
        }
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

fn cmd_run(config: &Path, max_ticks: Option<u64>) -> Result<i32> {
    let cfg = load_config(config)?;
    let scheduler = WorkerScheduler::from_config(&cfg)?;
    let outcome = scheduler.run(cfg.tick_interval(), max_ticks)?;
    println!(
        "stopped after {} ticks, {} transitions",
        outcome.ticks, outcome.transitions
    );
    Ok(exit_codes::OK)
}

fn cmd_tick(config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let scheduler = WorkerScheduler::from_config(&cfg)?;
    let report = scheduler.tick(scheduler.machine().now())?;
    for (user, task) in &report.resumed {
        println!("user {user}: {task}: resumed from deferral");
    }
    for advanced in &report.advanced {
        println!(
            "user {}: {}: {}",
            advanced.user_id, advanced.task, advanced.transition
        );
    }
    for (user, task) in &report.malformed {
        println!("user {user}: {task}: malformed, skipped");
    }
    for (user, task, err) in &report.errors {
        println!("user {user}: {task}: error: {err}");
    }
    if report.errors.is_empty() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::PARTIAL)
    }
}

fn cmd_init_config(config: &Path, force: bool) -> Result<i32> {
    if config.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config.display());
    }
    write_config(config, &WorkerConfig::default())?;
    println!("wrote {}", config.display());
    Ok(exit_codes::OK)
}
