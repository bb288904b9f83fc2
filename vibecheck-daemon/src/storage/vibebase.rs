//! VibeBase - DuckDB-backed store for graphs, audit records and analyses.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{params, Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use vibecheck_core::graph::{EdgeType, NodeType};
use vibecheck_core::{Analysis, GraphEdge, GraphNode, Severity, ToolCall, ToolCallStatus};

use super::schema::{SCHEMA_SQL, SCHEMA_VERSION};
use super::{AnalysisRepository, GraphBackend};
use crate::audit::AuditSink;
use crate::error::StoreError;

/// DuckDB-based store. Cloning shares the connection.
#[derive(Clone)]
pub struct VibeBase {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

/// Row counts of one analysis' graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphCounts {
    pub nodes: usize,
    pub edges: usize,
}

impl VibeBase {
    /// Open or create a database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("cannot create {:?}: {}", parent, e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquire the connection lock, recovering from a poisoned mutex.
    fn acquire_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering from poisoned database mutex");
                poisoned.into_inner()
            }
        }
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.acquire_conn();
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<String>, StoreError> {
        let conn = self.acquire_conn();
        let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(None),
        }
    }

    /// Cheap liveness check.
    pub fn ping(&self) -> bool {
        let conn = self.acquire_conn();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
            .is_ok()
    }

    // ========================================================================
    // Graph
    // ========================================================================

    pub fn upsert_node(&self, analysis_id: &str, node: &GraphNode) -> Result<(), StoreError> {
        let properties = node
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.acquire_conn();
        conn.execute(
            r#"INSERT OR REPLACE INTO graph_nodes
               (analysis_id, id, type, label, path, version, severity, finding_count, properties)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                analysis_id,
                node.id,
                node.node_type.as_str(),
                node.label,
                node.path,
                node.version,
                node.severity.map(|s| s.as_str()),
                node.finding_count as i64,
                properties,
            ],
        )?;
        Ok(())
    }

    /// Fails with `MissingEndpoint` unless both endpoints exist for `analysis_id`.
    pub fn upsert_edge(&self, analysis_id: &str, edge: &GraphEdge) -> Result<(), StoreError> {
        let conn = self.acquire_conn();
        for endpoint in [&edge.source, &edge.target] {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM graph_nodes WHERE analysis_id = ? AND id = ?",
                params![analysis_id, endpoint],
                |row| row.get(0),
            )?;
            if count == 0 {
                return Err(StoreError::MissingEndpoint {
                    edge: edge.id.clone(),
                    node: endpoint.clone(),
                });
            }
        }

        conn.execute(
            r#"INSERT OR REPLACE INTO graph_edges
               (analysis_id, id, source_id, target_id, type, is_vulnerability_chain, chain_id)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![
                analysis_id,
                edge.id,
                edge.source,
                edge.target,
                edge.edge_type.as_str(),
                edge.is_vulnerability_chain,
                edge.chain_id,
            ],
        )?;
        Ok(())
    }

    pub fn nodes_for(&self, analysis_id: &str) -> Result<Vec<GraphNode>, StoreError> {
        let conn = self.acquire_conn();
        let mut stmt = conn.prepare(
            "SELECT id, type, label, path, version, severity, finding_count, properties
             FROM graph_nodes WHERE analysis_id = ? ORDER BY id",
        )?;
        let mut rows = stmt.query(params![analysis_id])?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            nodes.push(node_from_row(row)?);
        }
        Ok(nodes)
    }

    pub fn edges_for(&self, analysis_id: &str) -> Result<Vec<GraphEdge>, StoreError> {
        let conn = self.acquire_conn();
        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, type, is_vulnerability_chain, chain_id
             FROM graph_edges WHERE analysis_id = ? ORDER BY id",
        )?;
        let mut rows = stmt.query(params![analysis_id])?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            let edge_type: String = row.get(3)?;
            edges.push(GraphEdge {
                id: row.get(0)?,
                source: row.get(1)?,
                target: row.get(2)?,
                edge_type: EdgeType::parse(&edge_type).unwrap_or(EdgeType::Contains),
                is_vulnerability_chain: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
                chain_id: row.get(5)?,
            });
        }
        Ok(edges)
    }

    pub fn graph_counts(&self, analysis_id: &str) -> Result<GraphCounts, StoreError> {
        let conn = self.acquire_conn();
        let nodes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM graph_nodes WHERE analysis_id = ?",
            params![analysis_id],
            |row| row.get(0),
        )?;
        let edges: i64 = conn.query_row(
            "SELECT COUNT(*) FROM graph_edges WHERE analysis_id = ?",
            params![analysis_id],
            |row| row.get(0),
        )?;
        Ok(GraphCounts {
            nodes: nodes as usize,
            edges: edges as usize,
        })
    }

    // ========================================================================
    // Audit trail
    // ========================================================================

    pub fn insert_tool_call(&self, call: &ToolCall) -> Result<(), StoreError> {
        let request = call.request_payload.as_ref().map(serde_json::to_string).transpose()?;
        let response = call.response_payload.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.acquire_conn();
        conn.execute(
            r#"INSERT INTO tool_calls
               (id, analysis_id, tool_name, step_name, endpoint, request_payload, response_payload,
                latency_ms, status, error_message, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                call.id,
                call.analysis_id,
                call.tool_name,
                call.step_name,
                call.endpoint,
                request,
                response,
                call.latency_ms as i64,
                call.status.as_str(),
                call.error_message,
                timestamp(&call.created_at),
            ],
        )?;
        Ok(())
    }

    /// Audit records of one analysis in insertion order.
    pub fn tool_calls_for(&self, analysis_id: &str) -> Result<Vec<ToolCall>, StoreError> {
        let conn = self.acquire_conn();
        let mut stmt = conn.prepare(
            "SELECT id, analysis_id, tool_name, step_name, endpoint, request_payload, response_payload,
                    latency_ms, status, error_message, created_at
             FROM tool_calls WHERE analysis_id = ? ORDER BY created_at, rowid",
        )?;
        let mut rows = stmt.query(params![analysis_id])?;
        let mut calls = Vec::new();
        while let Some(row) = rows.next()? {
            let request: Option<String> = row.get(5)?;
            let response: Option<String> = row.get(6)?;
            let status: String = row.get(8)?;
            let created_at: String = row.get(10)?;
            calls.push(ToolCall {
                id: row.get(0)?,
                analysis_id: row.get(1)?,
                tool_name: row.get(2)?,
                step_name: row.get(3)?,
                endpoint: row.get(4)?,
                request_payload: request.and_then(|s| serde_json::from_str(&s).ok()),
                response_payload: response.and_then(|s| serde_json::from_str(&s).ok()),
                latency_ms: row.get::<_, i64>(7)?.max(0) as u64,
                status: ToolCallStatus::parse(&status).unwrap_or(ToolCallStatus::Error),
                error_message: row.get(9)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(calls)
    }

    // ========================================================================
    // Analyses
    // ========================================================================

    pub fn save_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let record = serde_json::to_string(analysis)?;
        let conn = self.acquire_conn();
        conn.execute(
            "INSERT OR REPLACE INTO analyses (analysis_id, status, record, updated_at) VALUES (?, ?, ?, ?)",
            params![
                analysis.analysis_id,
                analysis.status.as_str(),
                record,
                timestamp(&analysis.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn load_analysis(&self, analysis_id: &str) -> Result<Option<Analysis>, StoreError> {
        let conn = self.acquire_conn();
        let mut stmt = conn.prepare("SELECT record FROM analyses WHERE analysis_id = ?")?;
        let mut rows = stmt.query(params![analysis_id])?;
        match rows.next()? {
            Some(row) => {
                let record: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }
}

fn node_from_row(row: &Row<'_>) -> Result<GraphNode, StoreError> {
    let node_type: String = row.get(1)?;
    let severity: Option<String> = row.get(5)?;
    let properties: Option<String> = row.get(7)?;
    Ok(GraphNode {
        id: row.get(0)?,
        node_type: NodeType::parse(&node_type).unwrap_or(NodeType::File),
        label: row.get(2)?,
        path: row.get(3)?,
        version: row.get(4)?,
        severity: severity.as_deref().and_then(Severity::parse),
        finding_count: row.get::<_, Option<i64>>(6)?.unwrap_or(0).max(0) as u32,
        properties: properties.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

#[async_trait]
impl GraphBackend for VibeBase {
    fn name(&self) -> &str {
        "duckdb"
    }

    async fn is_reachable(&self) -> bool {
        let db = self.clone();
        blocking(move || Ok(db.ping())).await.unwrap_or(false)
    }

    async fn upsert_node(&self, analysis_id: &str, node: &GraphNode) -> Result<(), StoreError> {
        let (db, analysis_id, node) = (self.clone(), analysis_id.to_string(), node.clone());
        blocking(move || db.upsert_node(&analysis_id, &node)).await
    }

    async fn upsert_edge(&self, analysis_id: &str, edge: &GraphEdge) -> Result<(), StoreError> {
        let (db, analysis_id, edge) = (self.clone(), analysis_id.to_string(), edge.clone());
        blocking(move || db.upsert_edge(&analysis_id, &edge)).await
    }
}

#[async_trait]
impl AuditSink for VibeBase {
    async fn append(&self, call: ToolCall) -> Result<(), StoreError> {
        let db = self.clone();
        blocking(move || db.insert_tool_call(&call)).await
    }

    async fn list(&self, analysis_id: &str) -> Result<Vec<ToolCall>, StoreError> {
        let (db, analysis_id) = (self.clone(), analysis_id.to_string());
        blocking(move || db.tool_calls_for(&analysis_id)).await
    }
}

#[async_trait]
impl AnalysisRepository for VibeBase {
    async fn save(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let (db, analysis) = (self.clone(), analysis.clone());
        blocking(move || db.save_analysis(&analysis)).await
    }

    async fn load(&self, analysis_id: &str) -> Result<Option<Analysis>, StoreError> {
        let (db, analysis_id) = (self.clone(), analysis_id.to_string());
        blocking(move || db.load_analysis(&analysis_id)).await
    }
}
