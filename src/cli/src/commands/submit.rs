//! Write submission through the governed routes.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use crate::client::{ApiClient, WriteHeaders};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct SubmitArgs {
    /// Event kind, e.g. journal.append
    #[arg(long)]
    kind: String,

    /// JSON payload
    #[arg(short, long, default_value = "{}")]
    payload: String,

    /// Correlation id; a fresh UUID when omitted
    #[arg(short, long)]
    correlation_id: Option<String>,

    /// Idempotency key; the server derives one in soft mode when omitted
    #[arg(short = 'k', long = "idem-key")]
    idempotency_key: Option<String>,

    /// Tokens charged against the turn budget
    #[arg(short, long, default_value = "0")]
    tokens: u64,

    /// Attempt the write inline instead of enqueueing it
    #[arg(long)]
    direct: bool,
}

#[derive(Serialize)]
struct SubmitBody {
    kind: String,
    payload: serde_json::Value,
    tokens: u64,
}

pub async fn execute(args: SubmitArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;

    let headers = WriteHeaders {
        correlation_id: args
            .correlation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        idempotency_key: args.idempotency_key,
    };
    let body = SubmitBody {
        kind: args.kind,
        payload,
        tokens: args.tokens,
    };

    let path = if args.direct { "/v1/writes/direct" } else { "/v1/events" };
    let resp = client
        .write(path, &headers, &body)
        .await
        .with_context(|| format!("Failed to submit {}", body.kind))?;

    match format {
        OutputFormat::Table => print_receipt(&resp, &headers),
        _ => output::print_item(&resp, format)?,
    }

    Ok(())
}

fn print_receipt(resp: &serde_json::Value, headers: &WriteHeaders) {
    let field = |name: &str| resp.get(name).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    if resp.get("applied").and_then(|v| v.as_bool()) == Some(true) {
        output::print_success("Write applied");
    } else if resp.get("deferred").and_then(|v| v.as_bool()) == Some(true) {
        output::print_warning("Write deferred to the outbox");
    } else if resp.get("created").and_then(|v| v.as_bool()) == Some(false) {
        output::print_info("Duplicate write; returning the original event");
    } else {
        output::print_success("Event accepted");
    }

    if let Some(id) = field("event_id") {
        output::print_detail("Event", &id);
    }
    if let Some(status) = field("status") {
        output::print_detail("Status", &output::colored_state(&status));
    }
    if let Some(key) = field("idem_key") {
        output::print_detail("Idempotency Key", &key);
    }
    output::print_detail("Correlation ID", &headers.correlation_id);
    if let Some(reason) = field("reason") {
        output::print_detail("Reason", &reason);
    }
}
