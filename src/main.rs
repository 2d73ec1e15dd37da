//! softphone-cli - Terminal SIP softphone for dispatch consoles
//!
//! Registers to a PBX over secure WebSocket and places/receives calls from
//! the terminal.

mod call;
mod config;
mod session;
mod sip;
mod tui;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use call::controller::{self, Intent};
use config::Config;
use session::probe::{self, ProbeOutcome};
use tui::LogBuffer;

#[derive(Parser)]
#[command(name = "softphone-cli")]
#[command(about = "Terminal SIP softphone for dispatch consoles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the configuration summary and file location
    Status,

    /// Check that the signaling endpoint answers, and classify failures
    Probe {
        /// Probe this wss:// URL instead of the configured one
        #[arg(long)]
        url: Option<String>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 8)]
        timeout_secs: u64,
    },

    /// Register to the PBX and wait for calls (headless)
    Connect,

    /// Place a single outbound call (headless)
    Call {
        /// Number or extension to dial
        number: String,

        /// Hang up after this many seconds; 0 keeps the call up until
        /// Ctrl-C or remote hangup
        #[arg(long, default_value_t = 0)]
        duration_secs: u64,
    },

    /// Launch the terminal user interface
    Tui,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // TUI mode routes tracing into the in-memory log pane; every other
    // command logs to stderr.
    if matches!(cli.command, Commands::Tui) {
        let logs = LogBuffer::new();
        init_tracing(cli.verbose, Some(logs.clone()));
        return run_tui(logs).await;
    }
    init_tracing(cli.verbose, None);

    match cli.command {
        Commands::Status => status(),
        Commands::Probe { url, timeout_secs } => run_probe(url, timeout_secs).await,
        Commands::Connect => call::headless::listen(Config::load()?).await,
        Commands::Call { number, duration_secs } => {
            call::headless::dial_once(Config::load()?, number, duration_secs).await
        }
        // Handled before logging was set up.
        Commands::Tui => Ok(()),
    }
}

/// `-v` raises the default level to debug; RUST_LOG overrides both.
fn init_tracing(verbose: bool, tui_logs: Option<LogBuffer>) {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    let registry = tracing_subscriber::registry().with(env_filter);
    match tui_logs {
        Some(logs) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(logs),
            )
            .init(),
        None => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}

async fn run_tui(logs: LogBuffer) -> Result<()> {
    let config = Config::load()?;
    // Go online right away when the config is usable; otherwise the header
    // shows OFFLINE and `c` starts the first attempt.
    let autoconnect = config.enabled && !config.server_url.is_empty();
    let phone = controller::spawn(config);
    if autoconnect {
        phone.send(Intent::Connect);
    }
    tui::run(phone, logs).await
}

fn status() -> Result<()> {
    let path = Config::config_path()?;
    let config = Config::load()?;

    println!("Config file: {}", path.display());
    println!("Server URL:  {}", or_unset(&config.server_url));
    println!("Extension:   {}", or_unset(&config.extension));
    println!(
        "Secret:      {}",
        if config.secret.is_empty() { "(not set)" } else { "(set)" }
    );
    println!("Enabled:     {}", config.enabled);
    match (config.call_log, Config::call_log_path()) {
        (true, Ok(p)) => println!("Call log:    {}", p.display()),
        (true, Err(_)) => println!("Call log:    on"),
        (false, _) => println!("Call log:    off"),
    }
    Ok(())
}

fn or_unset(value: &str) -> &str {
    if value.is_empty() {
        "(not set)"
    } else {
        value
    }
}

async fn run_probe(url: Option<String>, timeout_secs: u64) -> Result<()> {
    let url = match url {
        Some(raw) => {
            let parsed =
                Url::parse(&raw).with_context(|| format!("invalid URL {raw:?}"))?;
            anyhow::ensure!(
                parsed.scheme() == "wss",
                "the probe expects a wss:// URL, got {:?}",
                parsed.scheme()
            );
            parsed
        }
        None => Config::load()?.signaling_url()?,
    };

    let report = probe::run(&url, Duration::from_secs(timeout_secs)).await;
    println!("Endpoint: {}", report.url);
    println!("Outcome:  {}", report.outcome);
    println!("Advice:   {}", report.advice());

    if let ProbeOutcome::TrustFailure { https_url, .. } = &report.outcome {
        println!();
        println!("Fetching certificate detail from {https_url} ...");
        println!("  {}", probe::certificate_detail(https_url).await);
    }
    Ok(())
}
