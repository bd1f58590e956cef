//! Event store administration: list, inspect, replay and purge.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

const TERMINAL_STATUSES: [&str; 3] = ["done", "error", "dead"];

#[derive(Subcommand)]
pub enum EventCommands {
    /// List events, optionally filtered by status
    List {
        /// pending, claimed, done, error or dead
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Show a single event
    Get { seq: i64 },

    /// Move a dead or parked event back to pending with a fresh attempt count
    Replay { seq: i64 },

    /// Delete terminal events
    Purge {
        /// done, error or dead
        #[arg(short, long)]
        status: String,

        /// Only delete events created at least this long ago, e.g. 7d or 12h
        #[arg(long, value_parser = humantime::parse_duration)]
        older_than: Option<std::time::Duration>,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EventInfo {
    pub seq: i64,
    pub idem_key: String,
    pub correlation_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempt_count: u32,
    pub next_visible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "Seq")]
    seq: i64,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Correlation")]
    correlation_id: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

impl From<&EventInfo> for EventRow {
    fn from(e: &EventInfo) -> Self {
        let mut last_error = e.last_error.clone().unwrap_or_default();
        if last_error.len() > 48 {
            let cut = (0..=45).rev().find(|i| last_error.is_char_boundary(*i)).unwrap_or(0);
            last_error.truncate(cut);
            last_error.push_str("...");
        }
        Self {
            seq: e.seq,
            kind: e.kind.clone(),
            status: output::colored_state(&e.status),
            attempts: e.attempt_count,
            correlation_id: e.correlation_id.clone(),
            last_error,
        }
    }
}

#[derive(Serialize)]
struct ListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    limit: u32,
}

#[derive(Serialize)]
struct PurgeQuery {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    older_than_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
struct PurgeResponse {
    status: String,
    purged: u64,
}

pub async fn execute(cmd: EventCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        EventCommands::List { status, limit } => {
            let events: Vec<EventInfo> = client
                .get_with_query("/v1/admin/events", &ListQuery { status, limit })
                .await
                .context("Failed to list events")?;

            let rows: Vec<EventRow> = events.iter().map(EventRow::from).collect();
            output::print_list(&rows, &events, format)?;
        }

        EventCommands::Get { seq } => {
            let event: EventInfo = client
                .get(&format!("/v1/admin/events/{}", seq))
                .await
                .with_context(|| format!("Failed to fetch event {}", seq))?;

            match format {
                OutputFormat::Table => print_event(&event),
                _ => output::print_item(&event, format)?,
            }
        }

        EventCommands::Replay { seq } => {
            let event: EventInfo = client
                .post_empty(&format!("/v1/admin/events/{}/replay", seq))
                .await
                .with_context(|| format!("Failed to replay event {}", seq))?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Event {} is {} again", event.seq, event.status));
                }
                _ => output::print_item(&event, format)?,
            }
        }

        EventCommands::Purge {
            status,
            older_than,
            force,
        } => {
            if !TERMINAL_STATUSES.contains(&status.as_str()) {
                anyhow::bail!("only done, error or dead events can be purged (got '{}')", status);
            }
            if !force {
                output::print_info(&format!(
                    "This permanently deletes {} events. Use --force to confirm.",
                    status
                ));
                return Ok(());
            }

            let resp: PurgeResponse = client
                .delete(
                    "/v1/admin/events",
                    &PurgeQuery {
                        status,
                        older_than_secs: older_than.map(|d| d.as_secs()),
                    },
                )
                .await
                .context("Failed to purge events")?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Purged {} {} event(s)", resp.purged, resp.status));
                }
                _ => output::print_item(&resp, format)?,
            }
        }
    }

    Ok(())
}

fn print_event(event: &EventInfo) {
    output::print_header(&format!("Event {}", event.seq));
    output::print_detail("Kind", &event.kind);
    output::print_detail("Status", &output::colored_state(&event.status));
    output::print_detail("Attempts", &event.attempt_count.to_string());
    output::print_detail("Idempotency Key", &event.idem_key);
    output::print_detail("Correlation ID", &event.correlation_id);
    output::print_detail("Next Visible", &event.next_visible_at.to_rfc3339());
    if let Some(worker) = &event.claimed_by {
        output::print_detail("Claimed By", worker);
    }
    if let Some(err) = &event.last_error {
        output::print_detail("Last Error", err);
    }
    output::print_detail("Created", &event.created_at.to_rfc3339());
    output::print_detail("Updated", &event.updated_at.to_rfc3339());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&event.payload).unwrap_or_else(|_| event.payload.to_string())
    );
}
