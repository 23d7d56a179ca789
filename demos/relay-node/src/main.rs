//! Ledger relay node.
//!
//! Loads a [`NodeConfig`], wires the selected store and ledger into the relay
//! engine, re-drives whatever a previous run left unfinished and serves the
//! HTTP boundary until SIGINT/SIGTERM.

mod config;

use crate::config::{LedgerConfig, LogFormat, LoggingConfig, NodeConfig, StoreConfig};
use anyhow::{Context, Result};
use clap::Parser;
use relay_core::{
    EngineBuilder, HttpLedgerSubmitter, LedgerSubmitter, MemoryTaskStore, RelayConfig,
    SimulatedLedger, TaskStateMachine,
};
use relay_store_postgres::PgTaskStore;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ledger relay node")]
struct Args {
    /// Path to the TOML config file. Without one, the node runs on defaults
    /// (in-memory store, simulated ledger).
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `listen_addr` from the config file.
    #[arg(long, env = "RELAY_LISTEN_ADDR")]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %format!("{err:#}"), "relay node terminated with error");
        eprintln!("relay-node: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::parse("")?,
    };
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
        config.validate()?;
    }
    init_logging(&config.logging)?;

    info!(
        config = ?args.config,
        listen_addr = %config.listen_addr,
        "starting relay node"
    );

    let ledger = build_ledger(&config.ledger)?;
    let engine = build_engine(&config.store, ledger, config.relay.clone()).await?;

    let report = engine.recover().await.context("recovery pass failed")?;
    info!(?report, "recovered unfinished tasks");
    let sweeper = engine.spawn_timeout_sweeper();

    let app = relay_http::router(engine);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    sweeper.abort();
    info!("relay node stopped");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid log filter `{}`", logging.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let installed = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

fn build_ledger(config: &LedgerConfig) -> Result<Arc<dyn LedgerSubmitter>> {
    match config {
        LedgerConfig::Simulated(simulated) => {
            info!(
                confirm_after_ms = simulated.confirm_after_ms,
                "using simulated ledger"
            );
            Ok(Arc::new(SimulatedLedger::new(simulated.clone())))
        }
        LedgerConfig::Http(http) => {
            info!(base_url = %http.base_url, "using http ledger gateway");
            let submitter =
                HttpLedgerSubmitter::new(http.clone()).context("invalid ledger http config")?;
            Ok(Arc::new(submitter))
        }
    }
}

async fn build_engine(
    store: &StoreConfig,
    ledger: Arc<dyn LedgerSubmitter>,
    relay: RelayConfig,
) -> Result<TaskStateMachine> {
    let engine = match store {
        StoreConfig::Memory => {
            info!("using in-memory task store; tasks do not survive a restart");
            EngineBuilder::new(Arc::new(MemoryTaskStore::new()), ledger)
                .with_config(relay)
                .build()?
        }
        StoreConfig::Postgres(pg) => {
            let pool = PgPoolOptions::new()
                .max_connections(pg.max_connections)
                .connect(&pg.url)
                .await
                .context("failed to connect to postgres")?;
            let store = PgTaskStore::with_first_sequence(pool, pg.first_sequence);
            store.migrate().await.context("failed to migrate relay schema")?;
            info!(max_connections = pg.max_connections, "using postgres task store");
            EngineBuilder::new(Arc::new(store), ledger)
                .with_config(relay)
                .build()?
        }
    };
    Ok(engine)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
