//! Queue inspection commands.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use crate::context::Runtime;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Count payloads waiting on a queue
    Size {
        /// Queue name
        queue: String,

        /// Connection name (the configured default when omitted)
        #[arg(short, long)]
        connection: Option<String>,
    },

    /// Remove every payload from a queue
    Clear {
        /// Queue name
        queue: String,

        #[arg(short, long)]
        connection: Option<String>,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct QueueRow {
    #[tabled(rename = "Connection")]
    connection: String,
    #[tabled(rename = "Driver")]
    driver: String,
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Size")]
    size: u64,
}

pub async fn execute(cmd: QueueCommands, runtime: &Runtime, format: OutputFormat) -> Result<()> {
    match cmd {
        QueueCommands::Size { queue, connection } => {
            let driver = runtime.driver(connection.as_deref())?;
            let size = driver.size(&queue).await?;
            let row = QueueRow {
                connection: connection
                    .unwrap_or_else(|| runtime.manager.default_connection().to_string()),
                driver: driver.name().to_string(),
                queue,
                size,
            };
            output::print_list(&[row], format)?;
        }

        QueueCommands::Clear {
            queue,
            connection,
            force,
        } => {
            if !force {
                output::print_info(&format!(
                    "This removes every payload on '{}'. Re-run with --force to confirm.",
                    queue
                ));
                return Ok(());
            }
            runtime.manager.clear(&queue, connection.as_deref()).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Queue '{}' cleared", queue)),
                _ => output::print_item(&serde_json::json!({ "queue": queue, "cleared": true }), format)?,
            }
        }
    }

    Ok(())
}
