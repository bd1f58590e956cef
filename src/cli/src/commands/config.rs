//! Saved CLI defaults in `~/.keel/config.toml`.
//!
//! Flags and `KEEL_API_URL` win over saved values; saved values win over the
//! built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::output::{self, OutputFormat};

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Point the CLI at a Keel server
    SetUrl { url: String },

    /// Default output format when --output is not given
    SetOutput { format: OutputFormat },

    /// HTTP timeout for server calls, e.g. 10s or 2m
    SetTimeout {
        #[arg(value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Show the saved and effective settings
    Show,

    /// Delete the saved settings
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputFormat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CliConfig {
    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    pub fn output(&self) -> OutputFormat {
        self.output.unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Settings as saved on disk. A missing or unreadable file yields defaults.
pub fn load() -> CliConfig {
    match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            output::print_warning(&format!("Ignoring saved config: {:#}", e));
            CliConfig::default()
        }
    }
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".keel").join("config.toml"))
}

fn load_config() -> Result<CliConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse(content: &str) -> Result<CliConfig> {
    let cfg: CliConfig = toml::from_str(content)?;
    if let Some(url) = &cfg.api_url {
        validate_url(url)?;
    }
    Ok(cfg)
}

fn save_config(cfg: &CliConfig) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn validate_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("server URL must start with http:// or https:// (got '{}')", url);
    }
    Ok(())
}

fn update(format: OutputFormat, change: impl FnOnce(&mut CliConfig)) -> Result<()> {
    let mut cfg = load_config()?;
    change(&mut cfg);
    save_config(&cfg)?;
    show(&cfg, format)
}

fn show(cfg: &CliConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            let saved = |set: bool| if set { "" } else { " (default)" };
            output::print_header("Configuration");
            output::print_detail(
                "Server",
                &format!("{}{}", cfg.api_url(), saved(cfg.api_url.is_some())),
            );
            let output_name = cfg
                .output()
                .to_possible_value()
                .map(|v| v.get_name().to_string())
                .unwrap_or_default();
            output::print_detail(
                "Output",
                &format!("{}{}", output_name, saved(cfg.output.is_some())),
            );
            output::print_detail(
                "Timeout",
                &format!(
                    "{}{}",
                    humantime::format_duration(cfg.timeout()),
                    saved(cfg.timeout_secs.is_some())
                ),
            );
            Ok(())
        }
        _ => output::print_item(cfg, format),
    }
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::SetUrl { url } => {
            validate_url(&url)?;
            let url = url.trim_end_matches('/').to_string();
            update(format, |cfg| cfg.api_url = Some(url))?;
        }

        ConfigCommands::SetOutput { format: saved } => {
            update(format, |cfg| cfg.output = Some(saved))?;
        }

        ConfigCommands::SetTimeout { timeout } => {
            if timeout < Duration::from_secs(1) {
                anyhow::bail!("timeout must be at least 1s");
            }
            update(format, |cfg| cfg.timeout_secs = Some(timeout.as_secs()))?;
        }

        ConfigCommands::Show => show(&load_config()?, format)?,

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info(
                    "This deletes the saved server URL, output and timeout. Use --force to confirm.",
                );
                return Ok(());
            }

            let path = config_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}
