//! Dead-letter commands.
//!
//! Only drivers with a dead-letter store (memory, database, redis) support
//! these; the rest report that they have none.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use conveyor_core::jobs::Payload;

use crate::context::{dead_letters, Runtime};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    /// List dead letters, newest first
    List {
        queue: String,

        #[arg(short, long)]
        connection: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Push dead letters back onto their queue, oldest first
    Retry {
        queue: String,

        #[arg(short, long)]
        connection: Option<String>,

        /// How many to move
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Delete every dead letter of a queue
    Purge {
        queue: String,

        #[arg(short, long)]
        connection: Option<String>,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct DeadLetterRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Job")]
    job: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Failed")]
    failed_at: String,
    #[tabled(rename = "Error")]
    error: String,
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl From<&Payload> for DeadLetterRow {
    fn from(payload: &Payload) -> Self {
        Self {
            id: payload.id.to_string(),
            job: payload.display_name(),
            attempts: payload.attempts,
            failed_at: format_ms(payload.failed_at),
            error: payload.error.clone().unwrap_or_default(),
        }
    }
}

pub async fn execute(cmd: DeadLetterCommands, runtime: &Runtime, format: OutputFormat) -> Result<()> {
    match cmd {
        DeadLetterCommands::List {
            queue,
            connection,
            limit,
        } => {
            let driver = runtime.driver(connection.as_deref())?;
            let payloads = dead_letters(driver.as_ref())?.dead_letters(&queue, limit).await?;
            match format {
                OutputFormat::Table => {
                    let rows: Vec<DeadLetterRow> = payloads.iter().map(DeadLetterRow::from).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&payloads, format)?,
            }
        }

        DeadLetterCommands::Retry {
            queue,
            connection,
            count,
        } => {
            let driver = runtime.driver(connection.as_deref())?;
            let store = dead_letters(driver.as_ref())?;
            let mut retried = Vec::new();
            for _ in 0..count {
                match store.retry_dead_letter(&queue).await? {
                    Some(payload) => retried.push(payload.id.to_string()),
                    None => break,
                }
            }
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Moved {} dead letters back onto '{}'", retried.len(), queue));
                    for id in &retried {
                        output::print_detail("ID", id);
                    }
                }
                _ => output::print_item(&serde_json::json!({ "queue": queue, "retried": retried }), format)?,
            }
        }

        DeadLetterCommands::Purge {
            queue,
            connection,
            force,
        } => {
            if !force {
                output::print_info(&format!(
                    "This deletes every dead letter of '{}'. Re-run with --force to confirm.",
                    queue
                ));
                return Ok(());
            }
            let driver = runtime.driver(connection.as_deref())?;
            let purged = dead_letters(driver.as_ref())?.purge_dead_letters(&queue).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Purged {} dead letters of '{}'", purged, queue))
                }
                _ => output::print_item(&serde_json::json!({ "queue": queue, "purged": purged }), format)?,
            }
        }
    }

    Ok(())
}
