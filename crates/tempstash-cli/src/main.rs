//! Tempstash CLI - scratch storage from the shell.
//!
//! Stash text or JSON under a namespace, list what was stashed recently, and
//! clear namespaces when done. The backend is chosen by URL
//! (`sqlite://path/to/file.db` or `memory://`).

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tempstash::{Context, Stash, StashConfig};

mod commands;
mod logging;
mod since;

use logging::{LogConfig, LogFormat, setup_logging};

/// Tempstash - namespaced scratch storage
#[derive(Parser)]
#[command(name = "tempstash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backend URL, e.g. `sqlite://./scratch.db` or `memory://`
    #[arg(long, global = true, env = "TEMPSTASH_URL")]
    url: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true, env = "TEMPSTASH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. `info`, `tempstash=debug`)
    #[arg(long, global = true, default_value = "warn", env = "TEMPSTASH_LOG")]
    log_level: String,

    /// Extra filter directive, repeatable (e.g. `tempstash::dispatch=trace`)
    #[arg(long = "log-directive", global = true)]
    log_directives: Vec<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Disable colored log output
    #[arg(long, global = true)]
    no_color: bool,

    /// Give up on a command after this many seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stash a value
    Put {
        /// Namespace to stash under
        namespace: String,

        /// Free-form label
        #[arg(long, default_value = "")]
        name: String,

        /// Lookup key
        #[arg(short, long, default_value = "")]
        key: String,

        /// Value to stash
        #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
        data: Option<String>,

        /// Read the value from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Parse the value as JSON and store it re-encoded
        #[arg(long)]
        json: bool,

        /// Queue the write and return without waiting for the ID
        #[arg(long = "async")]
        fire_and_forget: bool,
    },

    /// List stashed records, newest first
    Query {
        /// Only this namespace
        #[arg(short, long)]
        namespace: Option<String>,

        /// Only this key
        #[arg(short, long)]
        key: Option<String>,

        /// Only records created at or after this time (RFC 3339, or 90s/5m/2h/1d ago)
        #[arg(short, long)]
        since: Option<String>,

        /// Maximum number of records (default 100)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete stashed records
    Drop {
        /// Delete only this namespace
        #[arg(short, long, conflicts_with = "all", required_unless_present = "all")]
        namespace: Option<String>,

        /// Delete everything
        #[arg(long)]
        all: bool,
    },

    /// Stash a source file and list the last minute of the `examples` namespace
    Demo {
        /// File to stash
        #[arg(default_value = "crates/tempstash-cli/src/main.rs")]
        file: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<StashConfig> {
    let Some(path) = path else {
        return Ok(StashConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = StashConfig::from_toml_str(&text)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

fn log_config(cli: &Cli) -> LogConfig {
    let mut config = LogConfig::new(&cli.log_level).with_format(cli.log_format);
    for directive in &cli.log_directives {
        config = config.with_directive(directive);
    }
    if cli.no_color {
        config = config.without_ansi();
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&log_config(&cli))?;

    let config = load_config(cli.config.as_deref())?;
    let url = cli
        .url
        .as_deref()
        .context("no backend configured: pass --url or set TEMPSTASH_URL")?;

    let stash = Stash::builder()
        .config(config)
        .connect(url)
        .await
        .context("failed to open stash")?;

    let ctx = Context::with_timeout(Duration::from_secs(cli.timeout));
    let result = commands::run(&stash, &ctx, cli.command).await;
    // Close even on failure so queued writes are flushed.
    stash.close().await.context("failed to close stash")?;
    result
}
