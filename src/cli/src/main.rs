//! Keel CLI - operator tooling for the Keel write-reliability server.
//!
//! Inspects and repairs the event store, resets breakers, and submits writes
//! through the governed routes.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{breakers, config, events, health, status, submit};
use output::OutputFormat;

#[derive(Parser)]
#[command(
    name = "keel",
    version,
    about = "Keel - durable, idempotent memory writes for agents",
    long_about = "Operator CLI for the Keel event store, dispatcher, circuit breakers and saga log.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format [default: saved setting, else table]
    #[arg(short, long, global = true)]
    output: Option<OutputFormat>,

    /// Server URL
    #[arg(long, global = true, env = "KEEL_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Event store administration
    #[command(subcommand)]
    Events(events::EventCommands),

    /// Circuit breaker administration
    #[command(subcommand)]
    Breakers(breakers::BreakerCommands),

    /// Submit a write
    Submit(submit::SubmitArgs),

    /// Show saga records for a correlation id
    Sagas(status::SagaArgs),

    /// Show the server status snapshot
    Status,

    /// Check server health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let saved = config::load();
    let api_url = cli
        .api_url
        .clone()
        .unwrap_or_else(|| saved.api_url().to_string());

    let client = client::ApiClient::new(&api_url, saved.timeout())?;
    let format = cli.output.unwrap_or_else(|| saved.output());

    let result = match cli.command {
        Commands::Events(cmd) => events::execute(cmd, &client, format).await,
        Commands::Breakers(cmd) => breakers::execute(cmd, &client, format).await,
        Commands::Submit(args) => submit::execute(args, &client, format).await,
        Commands::Sagas(args) => status::sagas(args, &client, format).await,
        Commands::Status => status::execute(&client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
