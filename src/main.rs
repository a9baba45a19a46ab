//! Dapp Relayer - spools transactions to blockchains and indexes the result
//!
//! `run` loops spool, confirmation wait, index and normalize over every
//! active chain until Ctrl-C or SIGTERM. The other commands run one pass.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use dapp_relayer::chain::ChainRegistry;
use dapp_relayer::config::{Settings, StoreBackend, CONFIG_ENV};
use dapp_relayer::coordination::CoordinationEngine;
use dapp_relayer::index::NormalizerRegistry;
use dapp_relayer::metrics::MetricsServer;
use dapp_relayer::state::{MemoryStore, PgStore, Store};

#[derive(Parser, Debug)]
#[command(name = "dapp-relayer", version, about)]
struct Cli {
    /// Configuration file
    #[arg(long, env = CONFIG_ENV, default_value = "config/default.toml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Spool, wait for confirmations and index every active chain in a loop
    Run,
    /// One spool cycle
    Spool {
        /// Only this chain, defaults to every active chain
        #[arg(long)]
        chain: Option<u64>,
    },
    /// One index pass
    Index {
        #[arg(long)]
        chain: Option<u64>,
    },
    /// One normalization pass
    Normalize {
        #[arg(long)]
        chain: Option<u64>,
    },
    /// Refresh account balances
    RefreshBalances {
        #[arg(long)]
        chain: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    info!("Starting Dapp Relayer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load_from(&cli.config)?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let store = open_store(&settings).await?;
    let registry = Arc::new(ChainRegistry::from_settings(&settings));
    for (chain_id, healthy) in registry.health_check().await {
        if !healthy {
            warn!("Chain {} is not reachable", chain_id);
        }
    }

    let engine = Arc::new(CoordinationEngine::new(
        store.clone(),
        registry,
        Arc::new(NormalizerRegistry::new()),
        settings.relayer.clone(),
    ));
    engine.sync_chains(&settings).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(engine, &settings).await,
        Command::Spool { chain } => {
            for chain_id in chain_ids(store.as_ref(), chain).await? {
                let outcome = engine.spool_once(chain_id).await?;
                info!(
                    "Chain {}: spooled {} transactions",
                    chain_id,
                    outcome.transactions().len()
                );
            }
            Ok(())
        }
        Command::Index { chain } => {
            for chain_id in chain_ids(store.as_ref(), chain).await? {
                let outcome = engine.index_once(chain_id).await?;
                info!("Chain {}: {:?}", chain_id, outcome);
            }
            Ok(())
        }
        Command::Normalize { chain } => {
            for chain_id in chain_ids(store.as_ref(), chain).await? {
                let count = engine.normalize_once(chain_id).await?;
                info!("Chain {}: normalized {} transactions", chain_id, count);
            }
            Ok(())
        }
        Command::RefreshBalances { chain } => {
            for chain_id in chain_ids(store.as_ref(), chain).await? {
                let count = engine.refresh_balances(chain_id).await?;
                info!("Chain {}: {} balances changed", chain_id, count);
            }
            Ok(())
        }
    }
}

async fn run(engine: Arc<CoordinationEngine>, settings: &Settings) -> Result<()> {
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let coordination_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    info!("Dapp Relayer is running");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    engine.stop().await;
    if let Err(e) = coordination_handle.await {
        warn!("Coordination engine task ended abnormally: {}", e);
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Dapp Relayer stopped");
    Ok(())
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn Store>> {
    match settings.database.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store, nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let store = PgStore::new(&settings.database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            info!("Database migrations complete");
            Ok(Arc::new(store))
        }
    }
}

/// The requested chain, or every active chain
async fn chain_ids(store: &dyn Store, chain: Option<u64>) -> Result<Vec<u64>> {
    match chain {
        Some(chain_id) => Ok(vec![chain_id]),
        None => Ok(store
            .chains(true)
            .await?
            .into_iter()
            .map(|chain| chain.id)
            .collect()),
    }
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dapp_relayer=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
