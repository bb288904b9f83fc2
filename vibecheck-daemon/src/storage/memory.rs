//! In-process stores.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use vibecheck_core::{Analysis, GraphEdge, GraphNode};

use super::{AnalysisRepository, GraphBackend};
use crate::error::StoreError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Recovering from poisoned store mutex");
            poisoned.into_inner()
        }
    }
}

/// Analysis records kept in a map.
#[derive(Default)]
pub struct MemoryAnalysisRepository {
    records: Mutex<HashMap<String, Analysis>>,
}

impl MemoryAnalysisRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AnalysisRepository for MemoryAnalysisRepository {
    async fn save(&self, analysis: &Analysis) -> Result<(), StoreError> {
        lock(&self.records).insert(analysis.analysis_id.clone(), analysis.clone());
        Ok(())
    }

    async fn load(&self, analysis_id: &str) -> Result<Option<Analysis>, StoreError> {
        Ok(lock(&self.records).get(analysis_id).cloned())
    }
}

/// Graph backend holding nodes and edges keyed by `(analysis_id, id)`.
///
/// Reachability can be toggled and individual ids can be made to fail, so
/// both persistence paths can be exercised without a database.
pub struct MemoryGraphBackend {
    reachable: AtomicBool,
    nodes: Mutex<BTreeMap<(String, String), GraphNode>>,
    edges: Mutex<BTreeMap<(String, String), GraphEdge>>,
    failing_ids: HashSet<String>,
}

impl Default for MemoryGraphBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphBackend {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            nodes: Mutex::new(BTreeMap::new()),
            edges: Mutex::new(BTreeMap::new()),
            failing_ids: HashSet::new(),
        }
    }

    pub fn unreachable() -> Self {
        let backend = Self::new();
        backend.set_reachable(false);
        backend
    }

    /// Writes of these node or edge ids fail.
    pub fn with_failing_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn nodes_for(&self, analysis_id: &str) -> Vec<GraphNode> {
        lock(&self.nodes)
            .iter()
            .filter(|((a, _), _)| a == analysis_id)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn edges_for(&self, analysis_id: &str) -> Vec<GraphEdge> {
        lock(&self.edges)
            .iter()
            .filter(|((a, _), _)| a == analysis_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn check(&self, id: &str) -> Result<(), StoreError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("graph backend unreachable".into()));
        }
        if self.failing_ids.contains(id) {
            return Err(StoreError::Unavailable(format!("write of {} rejected", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphBackend for MemoryGraphBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn upsert_node(&self, analysis_id: &str, node: &GraphNode) -> Result<(), StoreError> {
        self.check(&node.id)?;
        lock(&self.nodes).insert((analysis_id.to_string(), node.id.clone()), node.clone());
        Ok(())
    }

    async fn upsert_edge(&self, analysis_id: &str, edge: &GraphEdge) -> Result<(), StoreError> {
        self.check(&edge.id)?;
        {
            let nodes = lock(&self.nodes);
            for endpoint in [&edge.source, &edge.target] {
                if !nodes.contains_key(&(analysis_id.to_string(), endpoint.clone())) {
                    return Err(StoreError::MissingEndpoint {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }
        lock(&self.edges).insert((analysis_id.to_string(), edge.id.clone()), edge.clone());
        Ok(())
    }
}
