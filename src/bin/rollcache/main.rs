//! rollcache HTTP server
//!
//! # Endpoints
//!
//! - `POST /api/v1/command` - Run one cache command (store, query, fetch, ...)
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics
//!
//! # CLI Commands
//!
//! - `serve` - Start the HTTP server (default if no command specified)
//! - `check-config` - Validate configuration and print a summary
//! - `dump-info` - List dump files in the dump directory
//!
//! # Configuration
//!
//! Settings come from the file given with `--config` (or the defaults),
//! then `ROLLCACHE_*` environment variables, then command-line flags.

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use handlers::AppState;
use rollcache::{
    backend,
    config::Config,
    metrics,
    registry::{list_dumps, CollectionRegistry},
    worker::Worker,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::signal;
use tracing::{debug, info, warn};

// =============================================================================
// Router and Server Setup
// =============================================================================

/// Build the application router
fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/command", post(handlers::command))
        .with_state(state)
}

/// Graceful shutdown signal handler
///
/// A failed signal registration logs a warning and waits forever instead
/// of panicking during startup.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {},
            Err(e) => {
                warn!(
                    error = %e,
                    "Ctrl+C handler installation failed - graceful shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(
                    error = %e,
                    "SIGTERM handler installation failed - SIGTERM shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

/// Dump every collection before exit
async fn dump_on_shutdown(state: &Arc<AppState>) {
    info!("Dumping collections before shutdown...");
    let start = std::time::Instant::now();

    match state.worker.registry().dump_all().await {
        Ok(count) => {
            info!(
                collections = count,
                elapsed_ms = start.elapsed().as_millis(),
                "Dumped all collections"
            );
        },
        Err(e) => {
            warn!(error = %e, "Failed to dump collections during shutdown - data may be lost");
        },
    }
}

// =============================================================================
// CLI Definition
// =============================================================================

/// rollcache - tagged, time-indexed aggregation cache
#[derive(Parser)]
#[command(name = "rollcache")]
#[command(version)]
#[command(about = "Tagged, time-indexed aggregation cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override listen address (e.g., 0.0.0.0:4273)
    #[arg(short, long, global = true)]
    listen: Option<String>,

    /// Override dump directory path
    #[arg(short, long, global = true)]
    dump_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Validate configuration without starting the server
    CheckConfig,

    /// List dump files without starting the server
    DumpInfo {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

/// Load configuration from file or defaults, then env vars, then CLI flags
fn load_config(cli: &Cli) -> rollcache::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file_with_env(path)?,
        None => Config::from_env(),
    };

    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen.clone();
    }
    if let Some(dump_dir) = &cli.dump_dir {
        config.storage.dump_dir = dump_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli)?;

    println!("Configuration is valid!");
    println!();
    println!("Server Settings:");
    println!("  Listen address: {}", config.server.listen_addr);
    println!("  Log level: {}", config.server.log_level);
    println!();
    println!("Storage Settings:");
    println!("  Dump directory: {:?}", config.storage.dump_dir);
    println!("  Restore on start: {}", config.storage.restore_on_start);
    println!("  Dump on shutdown: {}", config.storage.dump_on_shutdown);
    println!();
    println!("Backend Settings:");
    println!("  Kind: {:?}", config.backend.kind);
    if config.backend.kind == rollcache::config::BackendKind::Redis {
        let sanitized = rollcache::backend::redis::util::sanitize_url(&config.backend.redis_url);
        println!("  URL: {}", sanitized);
        println!("  Pool size: {}", config.backend.pool_size);
    }
    println!();
    println!("Collections:");
    println!("  Default expiry: {}s", config.collections.default_expire_secs);
    println!("  Key prefix: {}", config.collections.key_prefix);

    Ok(())
}

/// List dump files in the dump directory
fn cmd_dump_info(cli: &Cli, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli)?;
    let dumps = list_dumps(&config.storage.dump_dir)?;

    if format == "json" {
        let rows: Vec<_> = dumps
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "kind": d.kind.as_str(),
                    "path": d.path,
                    "size_bytes": d.size,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("Dump directory: {:?}", config.storage.dump_dir);
        println!("Dump files: {}", dumps.len());
        for d in &dumps {
            println!("  {} ({}) - {} bytes", d.name, d.kind, d.size);
        }
    }

    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::CheckConfig) => return cmd_check_config(&cli),
        Some(Commands::DumpInfo { format }) => return cmd_dump_info(&cli, format),
        Some(Commands::Serve) | None => {},
    }

    let config = load_config(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.server.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Starting rollcache v{}", env!("CARGO_PKG_VERSION"));
    debug!(
        "Configuration: listen_addr={}, dump_dir={:?}, backend={:?}",
        config.server.listen_addr, config.storage.dump_dir, config.backend.kind
    );

    metrics::init();

    let store = backend::connect(&config.backend).await?;
    info!(backend = store.backend_id(), "Backend connected");

    let registry = Arc::new(CollectionRegistry::from_config(store, &config));
    if config.storage.restore_on_start {
        let restored = registry.restore().await?;
        info!(collections = restored, "Restored collections from dumps");
    }

    let state = Arc::new(AppState {
        worker: Worker::new(registry),
        config: config.clone(),
    });

    let app = build_router(state.clone());

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if state.config.storage.dump_on_shutdown {
        dump_on_shutdown(&state).await;
    }

    info!("Server shutdown complete");
    Ok(())
}
