//! Tempstat Service - Reading ingestion, daily statistics and HTTP API.
//!
//! Run with: `cargo run -p tempstat-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tempstat_service::{Aggregator, AppState, Config, QueueBackend, TzfLocator, app, queue};
use tempstat_store::Store;

/// Tempstat Service - Reading ingestion, daily statistics and HTTP REST API.
#[derive(Parser, Debug)]
#[command(name = "tempstat-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long, global = true)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Disable the aggregation consumer (ingest and query only).
    #[arg(long, global = true)]
    no_consumer: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground (default behavior).
    Run,

    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::CheckConfig) => check_config(&args),
        Some(Command::Run) | None => run_server(args).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Override config with CLI args
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }

    config.validate()?;
    Ok(config)
}

fn check_config(args: &Args) -> anyhow::Result<()> {
    match load_config(args) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  bind:     {}", config.server.bind);
            println!("  database: {}", config.storage.path.display());
            println!("  queue:    {:?}", config.queue.backend);
            Ok(())
        }
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            Err(e)
        }
    }
}

async fn run_server(args: Args) -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tempstat_service=info".parse()?)
                .add_directive("tempstat_store=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    // Open the database
    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)?;

    // Connect the reading queue
    info!("Connecting {:?} reading queue", config.queue.backend);
    let (publisher, source) = queue::connect(&config.queue).await?;

    info!("Loading timezone boundaries");
    let locator = Arc::new(TzfLocator::new());

    let state = AppState::new(store, config.clone(), Arc::clone(&publisher), locator);

    // Start the aggregation consumer. Without it, an in-memory queue would only
    // hold readings until exit, so that combination is refused. Readings sent to
    // a broker stay there for a later consumer.
    let consumer = if args.no_consumer {
        if config.queue.backend == QueueBackend::Memory {
            anyhow::bail!("the memory queue requires the aggregation consumer");
        }
        warn!("Aggregation consumer disabled; readings stay on the broker");
        let mut source = source;
        source.close().await;
        None
    } else {
        Some(Aggregator::new(Arc::clone(&state), source).spawn())
    };

    let router = app(Arc::clone(&state));

    // Parse bind address
    let addr: SocketAddr = config.server.bind.parse()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match consumer {
        Some(handle) => {
            info!("Server stopped, draining reading queue");
            tempstat_service::shutdown(&state, handle, config.aggregation.drain_timeout()).await;
        }
        None => {
            if let Err(e) = publisher.close().await {
                warn!("Failed to close reading queue: {}", e);
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
