//! Conveyor CLI - worker entrypoint and queue administration.
//!
//! Provides the `work` command plus queue, dead-letter, and schedule management.

mod commands;
mod context;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{dead_letter, queue, schedule, work};
use context::{Runtime, SettingsSources};
use output::OutputFormat;

/// Conveyor - broker-agnostic job queue
#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Conveyor - broker-agnostic job queue",
    long_about = "Run queue workers and manage queues, dead letters and cron schedules.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Settings file (TOML, YAML or JSON)
    #[arg(long, global = true, env = "CONVEYOR_SETTINGS")]
    settings: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run queue consumers
    Work(work::WorkArgs),

    /// Queue operations
    #[command(subcommand)]
    Queue(queue::QueueCommands),

    /// Dead-letter operations
    #[command(subcommand)]
    DeadLetter(dead_letter::DeadLetterCommands),

    /// Cron schedule operations
    #[command(subcommand)]
    Schedule(schedule::ScheduleCommands),
}

async fn run(cli: Cli) -> Result<()> {
    let sources = SettingsSources {
        file: cli.settings,
        overlay: None,
    };
    let format = cli.output;

    match cli.command {
        Commands::Work(args) => work::execute(args, sources).await,
        admin => {
            let runtime = Runtime::open(sources.load()?).await?;
            match admin {
                Commands::Queue(cmd) => queue::execute(cmd, &runtime, format).await,
                Commands::DeadLetter(cmd) => dead_letter::execute(cmd, &runtime, format).await,
                Commands::Schedule(cmd) => schedule::execute(cmd, &runtime, format).await,
                Commands::Work(_) => Ok(()),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
