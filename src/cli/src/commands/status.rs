//! Server status snapshot and saga lookup.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct SagaArgs {
    /// Correlation id of the turn
    correlation_id: String,
}

fn num(v: &Value, path: &[&str]) -> u64 {
    path.iter()
        .try_fold(v, |acc, key| acc.get(*key))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status = client
        .get_raw("/status")
        .await
        .context("Failed to fetch status")?;

    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&status, format);
    }

    output::print_header("Keel Status");
    if let Some(version) = status.get("version").and_then(Value::as_str) {
        output::print_detail("Version", version);
    }
    output::print_detail("Uptime", &format!("{}s", num(&status, &["uptime_secs"])));
    if let Some(mode) = status.get("governor_mode").and_then(Value::as_str) {
        output::print_detail("Governor", mode);
    }

    let degraded = status
        .pointer("/degraded/active")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if degraded {
        let open = status
            .pointer("/degraded/open_dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        output::print_detail("Mode", &format!("{} (open: {})", "DEGRADED".red().bold(), open));
    } else {
        output::print_detail("Mode", &"normal".green().to_string());
    }

    output::print_header("Events");
    match status.get("events").filter(|e| !e.is_null()) {
        Some(events) => {
            for name in ["pending", "claimed", "done", "error", "dead"] {
                output::print_detail(name, &num(events, &[name]).to_string());
            }
        }
        None => output::print_error("event store unavailable"),
    }

    if let Some(dispatcher) = status.get("dispatcher").filter(|d| !d.is_null()) {
        output::print_header("Dispatcher");
        for name in ["processed", "succeeded", "retried", "dead", "parked", "deferred_by_breaker"] {
            output::print_detail(name, &num(dispatcher, &[name]).to_string());
        }
    }

    output::print_header("Admission");
    output::print_detail("Turns", &num(&status, &["admission", "turns_admitted"]).to_string());
    output::print_detail(
        "Rejected (tools / tokens)",
        &format!(
            "{} / {}",
            num(&status, &["admission", "tools_rejected"]),
            num(&status, &["admission", "tokens_rejected"])
        ),
    );

    Ok(())
}

pub async fn sagas(args: SagaArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let records: Vec<Value> = client
        .get(&format!("/v1/sagas/{}", args.correlation_id))
        .await
        .with_context(|| format!("Failed to fetch sagas for {}", args.correlation_id))?;

    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&records, format);
    }
    if records.is_empty() {
        output::print_info(&format!("No sagas recorded for {}", args.correlation_id));
        return Ok(());
    }

    for record in &records {
        let name = record.get("saga_name").and_then(Value::as_str).unwrap_or("?");
        let outcome = match record.get("ended_ok").and_then(Value::as_bool) {
            Some(true) => "ok".green().to_string(),
            Some(false) => "failed".red().to_string(),
            None => "open".yellow().to_string(),
        };
        output::print_header(&format!("{} [{}]", name, outcome));

        for step in record.get("steps").and_then(Value::as_array).into_iter().flatten() {
            let step_name = step.get("name").and_then(Value::as_str).unwrap_or("?");
            let mark = if step.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                "+".green()
            } else {
                "x".red()
            };
            let ts = step.get("ts").and_then(Value::as_str).unwrap_or("");
            println!("  {} {} {}", mark, step_name, ts.dimmed());
        }
        if let Some(summary) = record.get("summary").and_then(Value::as_str) {
            output::print_detail("Summary", summary);
        }
    }

    Ok(())
}
