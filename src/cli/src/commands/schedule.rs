//! Cron schedule commands.
//!
//! Definitions only outlive the command with a shared store
//! (`scheduler.store = "redis"`); the in-memory store is per process.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use conveyor_core::jobs::{JobOptions, QueuedJob, ScheduledDefinition};

use crate::context::Runtime;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Register a recurring job
    Add {
        /// Unique schedule id
        id: String,

        /// Cron expression (5 or 6 fields)
        #[arg(long)]
        cron: String,

        /// Registered job type, e.g. log_message
        #[arg(long)]
        job: String,

        /// Job properties as JSON
        #[arg(long, default_value = "{}")]
        properties: String,

        /// Target queue (the configured default when omitted)
        #[arg(short, long)]
        queue: Option<String>,

        #[arg(short, long)]
        connection: Option<String>,
    },

    /// List schedules
    List,

    /// Remove a schedule
    Remove { id: String },

    /// Fire every due schedule once
    Tick,
}

#[derive(Debug, Serialize, Tabled)]
struct ScheduleRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Cron")]
    cron: String,
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Job")]
    job: String,
    #[tabled(rename = "Enabled")]
    enabled: bool,
    #[tabled(rename = "Next run")]
    next_run: String,
    #[tabled(rename = "Last run")]
    last_run: String,
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl From<&ScheduledDefinition> for ScheduleRow {
    fn from(def: &ScheduledDefinition) -> Self {
        Self {
            id: def.id.clone(),
            cron: def.cron.clone(),
            queue: def.queue.clone(),
            job: def.template.display_name(),
            enabled: def.enabled,
            next_run: format_ms(Some(def.next_run)),
            last_run: format_ms(def.last_run),
        }
    }
}

pub async fn execute(cmd: ScheduleCommands, runtime: &Runtime, format: OutputFormat) -> Result<()> {
    let scheduler = runtime.scheduler().await?;

    match cmd {
        ScheduleCommands::Add {
            id,
            cron,
            job,
            properties,
            queue,
            connection,
        } => {
            let properties: serde_json::Value =
                serde_json::from_str(&properties).context("--properties must be valid JSON")?;
            let handler = runtime.registry.construct(&job, properties)?;
            let options = JobOptions {
                queue,
                connection,
                ..JobOptions::default()
            };
            let definition = scheduler
                .register(id, &cron, &QueuedJob::from_boxed(handler, options))
                .await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Schedule '{}' registered", definition.id));
                    output::print_detail("Cron", &definition.cron);
                    output::print_detail("Queue", &definition.queue);
                    output::print_detail("Next run", &format_ms(Some(definition.next_run)));
                }
                _ => output::print_item(&definition, format)?,
            }
        }

        ScheduleCommands::List => {
            let definitions = scheduler.list().await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Schedules ({})", definitions.len()));
                    let rows: Vec<ScheduleRow> = definitions.iter().map(ScheduleRow::from).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&definitions, format)?,
            }
        }

        ScheduleCommands::Remove { id } => {
            scheduler.remove(&id).await?;
            output::print_success(&format!("Schedule '{}' removed", id));
        }

        ScheduleCommands::Tick => {
            let fired = scheduler.tick().await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("{} schedules fired", fired.len()));
                    for id in &fired {
                        output::print_detail("Fired", id);
                    }
                }
                _ => output::print_item(&serde_json::json!({ "fired": fired }), format)?,
            }
        }
    }

    Ok(())
}
