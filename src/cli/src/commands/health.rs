//! Health check command.
//!
//! Queries `/health` and reports whether the event store answered.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Exit non-zero when the event store is down
    #[arg(long)]
    strict: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;
    let store = health
        .get("store")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    match format {
        OutputFormat::Table => {
            let status = health
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            output::print_header("Keel Health");
            output::print_detail("Status", status);
            output::print_detail("Event Store", store);
            output::print_detail("API URL", client.base_url());

            if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
                output::print_detail("Version", version);
            }
            if let Some(ts) = health.get("timestamp").and_then(|v| v.as_str()) {
                output::print_detail("Timestamp", ts);
            }

            if store == "up" {
                output::print_success("Server and event store reachable");
            } else {
                output::print_warning("Server is up but the event store is not answering");
            }
        }
        _ => output::print_item(&health, format)?,
    }

    if args.strict && store != "up" {
        anyhow::bail!("event store is {}", store);
    }
    Ok(())
}
