//! Knowledge-graph persistence with snapshot fallback.

use serde_json::json;
use std::time::Instant;
use tracing::{debug, info, warn};
use vibecheck_core::{Graph, GraphPersistence};

use crate::audit::{AuditEntry, AuditLogger};
use crate::storage::GraphBackend;

/// Write `graph` to `backend` when it is reachable.
///
/// Nodes go first so every edge finds its endpoints. A failed write is
/// logged and counted, never returned. An unreachable backend yields
/// [`GraphPersistence::Snapshot`] and nothing is written; the caller keeps
/// the full graph on the analysis record either way.
pub async fn persist_graph(
    backend: &dyn GraphBackend,
    audit: &AuditLogger,
    analysis_id: &str,
    graph: &Graph,
) -> GraphPersistence {
    let started = Instant::now();
    let endpoint = format!("{}:graph", backend.name());
    let request = json!({ "nodes": graph.node_count(), "edges": graph.edge_count() });

    if !backend.is_reachable().await {
        info!(
            "Graph backend {} unreachable, keeping snapshot for {}",
            backend.name(),
            analysis_id
        );
        audit
            .record(
                AuditEntry::new(analysis_id, "graph", "persist_graph", endpoint)
                    .request(request)
                    .latency(started.elapsed())
                    .failed("graph backend unreachable; stored as snapshot"),
            )
            .await;
        return GraphPersistence::Snapshot;
    }

    let mut nodes_written = 0u32;
    let mut edges_written = 0u32;
    let mut failed_writes = 0u32;

    for node in &graph.nodes {
        match backend.upsert_node(analysis_id, node).await {
            Ok(()) => nodes_written += 1,
            Err(e) => {
                failed_writes += 1;
                debug!("Skipping node {}: {}", node.id, e);
            }
        }
    }
    for edge in &graph.edges {
        match backend.upsert_edge(analysis_id, edge).await {
            Ok(()) => edges_written += 1,
            Err(e) => {
                failed_writes += 1;
                debug!("Skipping edge {}: {}", edge.id, e);
            }
        }
    }

    if failed_writes > 0 {
        warn!(
            "Graph persistence for {}: {} writes failed",
            analysis_id, failed_writes
        );
    }

    let persistence = GraphPersistence::Backend {
        nodes_written,
        edges_written,
        failed_writes,
    };
    audit
        .record(
            AuditEntry::new(analysis_id, "graph", "persist_graph", endpoint)
                .request(request)
                .response(json!(persistence))
                .latency(started.elapsed()),
        )
        .await;
    persistence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::storage::MemoryGraphBackend;
    use std::sync::Arc;
    use vibecheck_core::graph::ROOT_NODE_ID;
    use vibecheck_core::{build_graph, FileEntry, RepoMetadata, ToolCallStatus};

    fn sample_graph() -> Graph {
        let metadata = RepoMetadata {
            files: vec![
                FileEntry::new("src/app.py", "Python", 10),
                FileEntry::new("README.md", "unknown", 3),
            ],
            ..Default::default()
        };
        build_graph(&metadata, &[], &[])
    }

    fn logger() -> (AuditLogger, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (AuditLogger::new(sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_reachable_backend_receives_whole_graph() {
        let graph = sample_graph();
        let backend = MemoryGraphBackend::new();
        let (audit, sink) = logger();

        let result = persist_graph(&backend, &audit, "a1", &graph).await;
        assert_eq!(
            result,
            GraphPersistence::Backend {
                nodes_written: graph.node_count() as u32,
                edges_written: graph.edge_count() as u32,
                failed_writes: 0,
            }
        );
        assert_eq!(backend.nodes_for("a1").len(), graph.node_count());

        // Re-running is safe.
        persist_graph(&backend, &audit, "a1", &graph).await;
        assert_eq!(backend.edges_for("a1").len(), graph.edge_count());
        assert_eq!(sink.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_backend_falls_back_to_snapshot() {
        let graph = sample_graph();
        let backend = MemoryGraphBackend::unreachable();
        let (audit, sink) = logger();

        let result = persist_graph(&backend, &audit, "a1", &graph).await;
        assert_eq!(result, GraphPersistence::Snapshot);
        assert!(backend.nodes_for("a1").is_empty());

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ToolCallStatus::Error);
        assert_eq!(calls[0].step_name, "persist_graph");
    }

    #[tokio::test]
    async fn test_failed_writes_are_skipped() {
        let graph = sample_graph();
        let backend = MemoryGraphBackend::new().with_failing_ids([ROOT_NODE_ID]);
        let (audit, _) = logger();

        match persist_graph(&backend, &audit, "a1", &graph).await {
            GraphPersistence::Backend {
                nodes_written,
                failed_writes,
                ..
            } => {
                assert_eq!(nodes_written as usize, graph.node_count() - 1);
                // The root write plus every edge leaving the root.
                let root_edges = graph
                    .edges
                    .iter()
                    .filter(|e| e.source == ROOT_NODE_ID || e.target == ROOT_NODE_ID)
                    .count();
                assert_eq!(failed_writes as usize, 1 + root_edges);
            }
            GraphPersistence::Snapshot => panic!("backend was reachable"),
        }
    }
}
