//! vibecheck daemon - repository audit service.
//!
//! A single Rust binary that provides:
//! - HTTP API to submit analyses and read their results
//! - WebSocket stream of live analysis events
//! - DuckDB persistence of records, audit trail and knowledge graphs

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vibecheck_daemon::audit::{AuditLogger, AuditSink, MemoryAuditSink};
use vibecheck_daemon::capability::Capabilities;
use vibecheck_daemon::config::{ApiKeys, DaemonConfig};
use vibecheck_daemon::events::Broadcaster;
use vibecheck_daemon::pipeline::{Engine, EngineDeps, GitCloner};
use vibecheck_daemon::server::{create_router, AppState};
use vibecheck_daemon::storage::{
    AnalysisRepository, GraphBackend, LazyGraphStore, MemoryAnalysisRepository, VibeBase,
};

/// vibecheck repository audit daemon
#[derive(Parser, Debug)]
#[command(name = "vibecheck-daemon")]
#[command(about = "Repository audit daemon with live analysis events")]
#[command(version)]
struct Cli {
    /// HTTP port to listen on (overrides the config file)
    #[arg(short, long, env = "VIBECHECK_PORT")]
    port: Option<u16>,

    /// Path to the DuckDB database file (overrides the config file)
    #[arg(long, env = "VIBECHECK_DB")]
    db: Option<PathBuf>,

    /// Configuration file (default: ./vibecheck.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

type Stores = (
    Arc<dyn AnalysisRepository>,
    Arc<dyn AuditSink>,
    Arc<dyn GraphBackend>,
);

/// Open the database, or fall back to in-process stores.
fn open_stores(config: &DaemonConfig) -> Stores {
    let db_path = &config.storage.path;
    match VibeBase::open(db_path) {
        Ok(db) => {
            info!("Database opened at {:?}", db_path);
            let graph: Arc<dyn GraphBackend> = if config.storage.graph_enabled {
                let handle = db.clone();
                Arc::new(LazyGraphStore::new(move || Ok(handle.clone())))
            } else {
                info!("Graph persistence disabled, keeping snapshots only");
                Arc::new(LazyGraphStore::disabled())
            };
            let repository: Arc<dyn AnalysisRepository> = Arc::new(db.clone());
            let audit_sink: Arc<dyn AuditSink> = Arc::new(db);
            (repository, audit_sink, graph)
        }
        Err(e) => {
            warn!(
                "Database unavailable ({}), records are kept in memory only",
                e
            );
            let repository: Arc<dyn AnalysisRepository> = Arc::new(MemoryAnalysisRepository::new());
            let audit_sink: Arc<dyn AuditSink> = Arc::new(MemoryAuditSink::new());
            let graph: Arc<dyn GraphBackend> = Arc::new(LazyGraphStore::disabled());
            (repository, audit_sink, graph)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
    let mut config = DaemonConfig::load(cli.config.as_deref(), &cwd)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db) = cli.db {
        config.storage.path = db;
    }

    info!("Starting vibecheck daemon v{}", vibecheck_core::VERSION);
    let (repository, audit_sink, graph) = open_stores(&config);

    let audit = Arc::new(AuditLogger::new(Arc::clone(&audit_sink)));
    let capabilities = Capabilities::from_config(
        &config.providers,
        &ApiKeys::from_env(),
        Arc::clone(&audit),
        config.pipeline.provider_timeout(),
    );
    info!(
        "Providers: reasoning {:?}, classification {:?}, research {:?}",
        capabilities.reasoning.provider_names(),
        capabilities.classification.provider_names(),
        capabilities.research.provider_names()
    );

    let events = Arc::new(Broadcaster::new(config.pipeline.event_buffer));
    let cloner = Arc::new(GitCloner::new(
        config.pipeline.clone_base.clone(),
        Arc::clone(&audit),
    ));
    let engine = Engine::new(
        config.pipeline.clone(),
        EngineDeps {
            capabilities: Arc::new(capabilities),
            cloner,
            repository,
            graph,
            audit,
            events,
        },
    );

    let router = create_router(AppState::new(engine, audit_sink));
    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("vibecheck daemon listening on http://{}", addr);

    axum::serve(listener, router).await?;
    Ok(())
}
