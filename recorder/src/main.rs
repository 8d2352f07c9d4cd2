//! Pulse recorder service main entry point
//!
//! This binary samples host CPU/memory utilization at a fixed interval,
//! persists the samples in a retention-bounded store, and keeps the
//! broadcast layer running for live viewers attached by the transport.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pulse_recorder::{
    broadcast::{run_dispatcher, Broadcaster, StreamDefaults},
    config::RecorderConfig,
    error::Result,
    monitor::{MonitorService, TickCapPolicy},
    sampler::{CounterSource, SystemCounterSource},
    store::MetricsStore,
};

/// Pulse recorder command line interface
#[derive(Parser)]
#[command(name = "pulse-recorder")]
#[command(about = "Pulse recorder service for sampling and streaming host metrics")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sampling interval in milliseconds
    #[arg(short = 'f', long)]
    frequency: Option<u64>,

    /// Retention horizon in days
    #[arg(long)]
    history_days: Option<u32>,

    /// Database file path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Stop after this many completed ticks (bounded debug runs)
    #[arg(long)]
    tick_cap: Option<u64>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Start the recorder service
    Run,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration and fold in CLI overrides
    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = initialize_logging(&cli, &config) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    // Invalid values are fatal before any sampling starts
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        process::exit(1);
    }

    let result = match &cli.command {
        Some(Commands::Config { show }) => handle_config(&config, *show),
        Some(Commands::Run) | None => run_service(config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

/// Initialize logging from CLI switches and the configuration
fn initialize_logging(cli: &Cli, config: &RecorderConfig) -> Result<()> {
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pulse_recorder={}", level).parse().map_err(|e| {
            format!("invalid log level '{}': {}", level, e)
        })?)
        .add_directive(
            "tokio=warn"
                .parse()
                .map_err(|e| format!("invalid log directive: {}", e))?,
        );

    if cli.json_logs || config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Load configuration from file or defaults and apply CLI overrides
fn load_configuration(cli: &Cli) -> Result<RecorderConfig> {
    let mut config = if let Some(config_path) = &cli.config {
        RecorderConfig::from_file(config_path)?
    } else {
        let default_path = RecorderConfig::default_config_path()?;
        if default_path.exists() {
            RecorderConfig::from_file(&default_path)?
        } else {
            RecorderConfig::default()
        }
    };

    if let Some(frequency) = cli.frequency {
        config.sampling.interval_ms = frequency;
    }
    if let Some(history_days) = cli.history_days {
        config.retention.history_days = history_days;
    }
    if let Some(db_path) = &cli.db_path {
        config.storage.db_path = db_path.clone();
    }
    if let Some(tick_cap) = cli.tick_cap {
        config.sampling.tick_cap = Some(tick_cap);
    }

    Ok(config)
}

/// Handle configuration commands
fn handle_config(config: &RecorderConfig, show: bool) -> Result<()> {
    if show {
        println!("Effective configuration:");
        println!(
            "{}",
            toml::to_string_pretty(config)
                .map_err(|e| format!("failed to render configuration: {}", e))?
        );
    } else {
        println!("Configuration is valid");
    }

    Ok(())
}

/// Run the recorder until a shutdown signal arrives
async fn run_service(config: RecorderConfig) -> Result<()> {
    info!(
        interval_ms = config.sampling.interval_ms,
        history_days = config.retention.history_days,
        db_path = %config.storage.db_path.display(),
        "starting Pulse recorder service"
    );

    let store = MetricsStore::open(&config.storage.db_path, config.retention.history_days)?;
    let store = Arc::new(tokio::sync::Mutex::new(store));

    let source = SystemCounterSource::new();
    let host = source.host_info();

    let mut monitor = MonitorService::new(
        config.sampling.clone(),
        store.clone(),
        Box::new(source),
        config.stream.sample_channel_capacity,
    );

    let broadcaster = Arc::new(Broadcaster::new(
        store,
        StreamDefaults::from_config(&config),
        host,
    ));
    let dispatcher = run_dispatcher(broadcaster.clone(), monitor.subscribe_samples());

    if let Some(cap) = config.sampling.tick_cap {
        info!(cap, "bounded run: recorder will stop after the tick cap");
        TickCapPolicy::attach(&monitor, cap);
    }

    monitor.start().await?;
    info!("Pulse recorder service started");

    wait_for_shutdown(&monitor).await?;

    info!("initiating graceful shutdown");
    monitor.stop().await;
    monitor.join().await;
    dispatcher.abort();

    info!(
        subscribers = broadcaster.subscriber_count(),
        "Pulse recorder service stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal or for the loop to finish on its own
/// (bounded runs)
async fn wait_for_shutdown(monitor: &MonitorService) -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("received SIGINT, initiating graceful shutdown");
        }
        _ = monitor.wait_finished() => {
            info!("sampling loop finished");
        }
    }

    Ok(())
}
