//! Storage layer for the vibecheck daemon.
//!
//! Provides:
//! - [`VibeBase`], the DuckDB store for graphs, audit records and analyses
//! - the [`GraphBackend`] and [`AnalysisRepository`] seams the pipeline
//!   writes through
//! - [`LazyGraphStore`], a graph backend opened on first use
//! - in-memory implementations for tests and database-less runs

mod memory;
mod schema;
mod vibebase;

pub use memory::{MemoryAnalysisRepository, MemoryGraphBackend};
pub use schema::{SCHEMA_SQL, SCHEMA_VERSION};
pub use vibebase::{GraphCounts, VibeBase};

use async_trait::async_trait;
use std::sync::OnceLock;
use tracing::warn;
use vibecheck_core::{Analysis, GraphEdge, GraphNode};

use crate::error::StoreError;

/// Destination for knowledge-graph writes.
///
/// Upserts are idempotent per `(analysis_id, id)`.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn is_reachable(&self) -> bool;

    async fn upsert_node(&self, analysis_id: &str, node: &GraphNode) -> Result<(), StoreError>;

    /// Fails if either endpoint is not stored under `analysis_id`.
    async fn upsert_edge(&self, analysis_id: &str, edge: &GraphEdge) -> Result<(), StoreError>;
}

/// Persistence of whole analysis records.
#[async_trait]
pub trait AnalysisRepository: Send + Sync {
    async fn save(&self, analysis: &Analysis) -> Result<(), StoreError>;

    async fn load(&self, analysis_id: &str) -> Result<Option<Analysis>, StoreError>;
}

type Opener = Box<dyn Fn() -> Result<VibeBase, StoreError> + Send + Sync>;

/// Graph backend opened on first use.
///
/// The open result is cached: after a failed open the backend stays
/// unreachable and every write fails with `Unavailable`.
pub struct LazyGraphStore {
    opener: Option<Opener>,
    handle: OnceLock<Option<VibeBase>>,
}

impl LazyGraphStore {
    pub fn new<F>(opener: F) -> Self
    where
        F: Fn() -> Result<VibeBase, StoreError> + Send + Sync + 'static,
    {
        Self {
            opener: Some(Box::new(opener)),
            handle: OnceLock::new(),
        }
    }

    /// A backend that is never reachable (graph persistence switched off).
    pub fn disabled() -> Self {
        Self {
            opener: None,
            handle: OnceLock::new(),
        }
    }

    fn handle(&self) -> Option<&VibeBase> {
        self.handle
            .get_or_init(|| {
                let open = self.opener.as_ref()?;
                match open() {
                    Ok(db) => Some(db),
                    Err(e) => {
                        warn!("Graph backend unavailable, using snapshots: {}", e);
                        None
                    }
                }
            })
            .as_ref()
    }

    fn require(&self) -> Result<&VibeBase, StoreError> {
        self.handle()
            .ok_or_else(|| StoreError::Unavailable("graph backend not open".into()))
    }
}

#[async_trait]
impl GraphBackend for LazyGraphStore {
    fn name(&self) -> &str {
        "duckdb"
    }

    async fn is_reachable(&self) -> bool {
        match self.handle() {
            Some(db) => db.is_reachable().await,
            None => false,
        }
    }

    async fn upsert_node(&self, analysis_id: &str, node: &GraphNode) -> Result<(), StoreError> {
        GraphBackend::upsert_node(self.require()?, analysis_id, node).await
    }

    async fn upsert_edge(&self, analysis_id: &str, edge: &GraphEdge) -> Result<(), StoreError> {
        GraphBackend::upsert_edge(self.require()?, analysis_id, edge).await
    }
}
