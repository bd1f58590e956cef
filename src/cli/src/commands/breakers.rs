//! Circuit breaker inspection and manual reset.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum BreakerCommands {
    /// List every registered breaker
    List,

    /// Force a breaker back to closed
    Reset {
        /// Dependency name, e.g. vector_store
        name: String,
    },
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BreakerInfo {
    pub dependency: String,
    pub state: String,
    pub consecutive_failures: u32,
    pub fails: u32,
    pub reset_secs: f64,
    pub half_open_prob: f64,
    pub retry_after_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Tabled)]
struct BreakerRow {
    #[tabled(rename = "Dependency")]
    dependency: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Failures")]
    failures: String,
    #[tabled(rename = "Retry After")]
    retry_after: String,
    #[tabled(rename = "OK / Fail / Rejected")]
    totals: String,
}

impl From<&BreakerInfo> for BreakerRow {
    fn from(b: &BreakerInfo) -> Self {
        Self {
            dependency: b.dependency.clone(),
            state: output::colored_state(&b.state),
            failures: format!("{}/{}", b.consecutive_failures, b.fails),
            retry_after: if b.retry_after_ms == 0 {
                "-".to_string()
            } else {
                format!("{:.1}s", b.retry_after_ms as f64 / 1000.0)
            },
            totals: format!(
                "{} / {} / {}",
                b.total_successes, b.total_failures, b.total_rejections
            ),
        }
    }
}

pub async fn execute(cmd: BreakerCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        BreakerCommands::List => {
            let breakers: Vec<BreakerInfo> = client
                .get("/v1/admin/breakers")
                .await
                .context("Failed to list breakers")?;
            let rows: Vec<BreakerRow> = breakers.iter().map(BreakerRow::from).collect();
            output::print_list(&rows, &breakers, format)?;
        }

        BreakerCommands::Reset { name } => {
            let breaker: BreakerInfo = client
                .post_empty(&format!("/v1/admin/breakers/{}/reset", name))
                .await
                .with_context(|| format!("Failed to reset breaker '{}'", name))?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Breaker '{}' is {}", breaker.dependency, breaker.state));
                }
                _ => output::print_item(&breaker, format)?,
            }
        }
    }

    Ok(())
}
