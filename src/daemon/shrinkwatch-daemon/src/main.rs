//! Shrinkwatch Daemon - background compaction for SQLite database files
//!
//! Tracks database files touched by the application and reclaims their
//! free pages with VACUUM once they go idle.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use shrinkwatch_daemon::config::{ConfigManager, DaemonConfig, LoggingConfig};
use shrinkwatch_daemon::Daemon;
use shrinkwatch_system::{
    compact_bounded, CompactOutcome, ConnectionFactory, DbAccess, TrackingOptions, WatchRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Shrinkwatch - background SQLite compaction
#[derive(Parser)]
#[command(name = "shrinkwatch")]
#[command(about = "Tracks SQLite database files and compacts them once idle")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground
    Start(StartArgs),
    /// Validate configuration
    Validate(ValidateArgs),
    /// Generate default configuration
    Config(ConfigArgs),
    /// Compact database files once and exit
    Compact(CompactArgs),
    /// Run a write statement against a database file
    Exec(ExecArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "shrinkwatch.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Database file to track from startup (repeatable)
    #[arg(long = "track", value_name = "PATH")]
    track: Vec<PathBuf>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file to validate
    #[arg(short, long, default_value = "shrinkwatch.toml")]
    config: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output file for generated config
    #[arg(short, long, default_value = "shrinkwatch.toml")]
    output: PathBuf,

    /// Overwrite existing file
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct CompactArgs {
    /// Configuration file for connection settings
    #[arg(short, long, default_value = "shrinkwatch.toml")]
    config: PathBuf,

    /// Database files to compact
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Args)]
struct ExecArgs {
    /// Configuration file for connection settings
    #[arg(short, long, default_value = "shrinkwatch.toml")]
    config: PathBuf,

    /// Run without a transaction
    #[arg(long)]
    no_tx: bool,

    /// Database file
    path: PathBuf,

    /// Statement(s) to execute
    sql: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => start_daemon(args).await,
        Commands::Validate(args) => validate_config(args).await,
        Commands::Config(args) => generate_config(args).await,
        Commands::Compact(args) => compact_files(args).await,
        Commands::Exec(args) => exec_statement(args).await,
    }
}

/// Load `path` if it exists, defaults otherwise
async fn load_config(path: &Path) -> Result<ConfigManager> {
    let mut config_manager = ConfigManager::new();
    if path.exists() {
        config_manager
            .load_from_file(path)
            .await
            .with_context(|| "Failed to load configuration")?;
    }
    Ok(config_manager)
}

/// Start the Shrinkwatch daemon
async fn start_daemon(args: StartArgs) -> Result<()> {
    let config_manager = load_config(&args.config).await?;
    let mut config = config_manager.get_config().await;

    init_tracing(args.debug, &config.logging)?;
    info!("Starting Shrinkwatch daemon v{}", env!("CARGO_PKG_VERSION"));

    match config_manager.config_path() {
        Some(path) => info!("Using configuration from: {}", path.display()),
        None => warn!("Configuration file not found, using defaults"),
    }

    // Apply CLI overrides
    if !args.track.is_empty() {
        config.registry.seed_paths.extend(args.track);
        *config_manager.shared().write().await = config.clone();
    }

    ConfigManager::validate(&config)?;

    if config.server.enable_metrics {
        init_metrics(&config)?;
    }

    let daemon = Daemon::new(config_manager).await?;
    daemon.run().await
}

/// Validate configuration file
async fn validate_config(args: ValidateArgs) -> Result<()> {
    let mut config_manager = ConfigManager::new();
    config_manager.load_from_file(&args.config).await?;

    let config = config_manager.get_config().await;
    ConfigManager::validate(&config)?;

    println!("✓ Configuration is valid: {}", args.config.display());
    if !config.compaction_needed() {
        println!("  compaction is disabled or not needed for the configured pragmas");
    }
    Ok(())
}

/// Generate default configuration file
async fn generate_config(args: ConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "Configuration file already exists: {}",
            args.output.display()
        );
    }

    let config_manager = ConfigManager::with_config(DaemonConfig::default());
    config_manager.save_to_file(&args.output).await?;

    println!("Generated configuration file: {}", args.output.display());
    Ok(())
}

/// Compact each file once through a dedicated connection
async fn compact_files(args: CompactArgs) -> Result<()> {
    let config = load_config(&args.config).await?.get_config().await;
    ConfigManager::validate(&config)?;

    let factory = Arc::new(ConnectionFactory::new(config.connection.clone()));
    let limit = config.compaction.policy().statement_timeout;

    let mut failures = 0;
    for path in args.paths {
        match compact_bounded(Arc::clone(&factory), path.clone(), limit).await {
            Ok(CompactOutcome::Compacted { duration }) => {
                println!("✓ {} compacted in {:?}", path.display(), duration);
            }
            Ok(CompactOutcome::Skipped(reason)) => {
                println!("- {} skipped ({:?})", path.display(), reason);
            }
            Err(e) => {
                failures += 1;
                eprintln!("✗ {}: {}", path.display(), e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} file(s) failed to compact", failures);
    }
    Ok(())
}

/// Run a write through the query/write layer
async fn exec_statement(args: ExecArgs) -> Result<()> {
    let config = load_config(&args.config).await?.get_config().await;
    ConfigManager::validate(&config)?;

    let access = DbAccess::new(
        Arc::new(ConnectionFactory::new(config.connection)),
        Arc::new(WatchRegistry::new()),
        TrackingOptions::default(),
    );

    let path = args.path;
    let sql = args.sql;
    let no_tx = args.no_tx;
    let changed = tokio::task::spawn_blocking(move || {
        if no_tx {
            access.execute_non_query_no_tx(&sql, &path)
        } else {
            access.execute_non_query(&sql, &path)
        }
    })
    .await?
    .with_context(|| "Statement failed")?;

    println!("{} row(s) changed", changed);
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(debug: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if debug { "debug" } else { logging.level.as_str() };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).try_init()?,
        "compact" => registry.with(fmt::layer().compact()).try_init()?,
        _ => registry.with(fmt::layer()).try_init()?,
    }

    Ok(())
}

/// Initialize Prometheus metrics
fn init_metrics(config: &DaemonConfig) -> Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        config.server.metrics_bind_address, config.server.metrics_port
    )
    .parse()
    .with_context(|| "Invalid metrics bind address")?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics endpoint started on {}", addr);
    Ok(())
}
