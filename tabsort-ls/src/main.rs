//! tabsort listener service (tabsort-ls) - Main entry point
//!
//! Accepts the browser extension's WebSocket connection on the first port
//! that wins arbitration and sorts visited video URLs into the music and
//! non-music logs in the data folder.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tabsort_common::classify::Bucket;
use tabsort_common::config::{
    load_toml_config, resolve_config_path, resolve_data_folder, write_toml_config, LoggingConfig,
    ServiceConfig, TomlConfig,
};
use tabsort_common::events::{EventBus, TabsortEvent};
use tabsort_ls::console::{shutdown_signal, spawn_console_reader, ShutdownRequest};
use tabsort_ls::lookup::YtDlpSource;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EVENT_BUS_CAPACITY: usize = 256;

/// Command-line arguments for tabsort-ls
#[derive(Parser, Debug)]
#[command(name = "tabsort-ls")]
#[command(about = "Listener service for the tabsort browser extension")]
#[command(version)]
struct Args {
    /// Config file (default: <config dir>/tabsort/config.toml)
    #[arg(short, long, env = "TABSORT_CONFIG")]
    config: Option<PathBuf>,

    /// Folder holding tab_log.txt and un_log.txt
    #[arg(short, long, env = "TABSORT_DATA_FOLDER")]
    data_folder: Option<PathBuf>,

    /// Candidate port; repeat to give several (replaces the configured list)
    #[arg(short, long = "port", value_name = "PORT")]
    ports: Vec<u16>,

    /// Shared secret expected as the first message
    #[arg(long, env = "TABSORT_TOKEN")]
    token: Option<String>,

    /// Do not read 'q' from stdin (for running as a background service)
    #[arg(long)]
    no_console: bool,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Resolve configuration before tracing so the log level can come from it
    let config_path = resolve_config_path(args.config.as_deref());
    let config_found = config_path.as_ref().is_some_and(|p| p.exists());
    let toml_config = match &config_path {
        Some(path) => load_toml_config(path).context("Failed to load config file")?,
        None => TomlConfig::default(),
    };
    let data_folder = resolve_data_folder(args.data_folder.as_deref(), &toml_config);

    let mut config = ServiceConfig::from_toml(toml_config);
    config.data_folder = data_folder;
    if !args.ports.is_empty() {
        config.ports = args.ports.clone();
    }
    if let Some(token) = args.token.clone() {
        config.token = token;
    }

    init_tracing(&config.logging)?;

    info!(
        "Starting tabsort listener service v{} ({}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match &config_path {
        Some(path) if config_found => info!("Config file: {}", path.display()),
        Some(path) => info!("Config file not found at {}, using defaults", path.display()),
        None => info!("No config directory available, using defaults"),
    }
    info!("Data folder: {}", config.data_folder.display());

    if let Some(path) = &args.write_config {
        write_toml_config(&config.to_toml(), path)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        info!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    let source = YtDlpSource::new(&config.yt_dlp_path).with_timeout(config.lookup_timeout);
    if !source.is_available().await {
        warn!(
            "{} is not available; lookups will fail until it is installed",
            config.yt_dlp_path.display()
        );
    }

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let summary = tokio::spawn(summarize(event_bus.subscribe()));

    let shutdown = CancellationToken::new();
    let console = if args.no_console {
        None
    } else {
        Some(spawn_console_reader().context("Failed to start console reader")?)
    };
    tokio::spawn(watch_shutdown(console, shutdown.clone()));

    tabsort_ls::run_service(&config, Arc::new(source), event_bus, shutdown)
        .await
        .context("Listener service failed")?;

    if let Ok(Ok(tally)) = tokio::time::timeout(Duration::from_secs(1), summary).await {
        info!(
            "This run: {} music, {} non-music, {} skipped, {} lookup failures",
            tally.music, tally.non_music, tally.skipped, tally.failed
        );
    }
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let file_layer = match &logging.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

/// Cancel `shutdown` on a console request or an OS signal
async fn watch_shutdown(
    console: Option<mpsc::UnboundedReceiver<ShutdownRequest>>,
    shutdown: CancellationToken,
) {
    let console_request = async move {
        let request = match console {
            Some(mut rx) => rx.recv().await,
            None => None,
        };
        match request {
            Some(ShutdownRequest::Quit) => info!("Quit requested from console"),
            Some(ShutdownRequest::Eof) => info!("Console input closed, shutting down"),
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = console_request => {}
        _ = shutdown_signal() => {}
    }
    shutdown.cancel();
}

#[derive(Debug, Default)]
struct RunTally {
    music: usize,
    non_music: usize,
    skipped: usize,
    failed: usize,
}

/// Count classification events until the bus closes
async fn summarize(mut rx: broadcast::Receiver<TabsortEvent>) -> RunTally {
    let mut tally = RunTally::default();
    loop {
        match rx.recv().await {
            Ok(TabsortEvent::UrlClassified {
                bucket: Bucket::Music,
                ..
            }) => tally.music += 1,
            Ok(TabsortEvent::UrlClassified { .. }) => tally.non_music += 1,
            Ok(TabsortEvent::UrlSkipped { .. }) => tally.skipped += 1,
            Ok(TabsortEvent::LookupFailed { .. }) => tally.failed += 1,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Run summary missed {} events", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tally
}
