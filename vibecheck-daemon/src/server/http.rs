//! HTTP routes and handlers for the vibecheck daemon API.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;
use vibecheck_core::{Analysis, AnalysisStatus, GraphView};

use super::state::AppState;
use super::websocket::websocket_handler;
use crate::error::CapabilityError;
use crate::pipeline::Submission;

/// Budget of each integration check.
const INTEGRATION_CHECK_TIMEOUT: Duration = Duration::from_secs(8);
const DEFAULT_BLAST_DEPTH: usize = 3;
const MAX_BLAST_DEPTH: usize = 6;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health and status
        .route("/health", get(health))
        .route("/health/integrations", get(integrations))
        .route("/status", get(status))
        // Submission
        .route("/analyze", post(analyze))
        // Results
        .route("/analysis/:id", get(get_analysis))
        .route("/analysis/:id/findings", get(get_findings))
        .route("/analysis/:id/fixes", get(get_fixes))
        .route("/analysis/:id/graph", get(get_graph))
        .route("/analysis/:id/chains", get(get_chains))
        .route("/analysis/:id/blast-radius", get(get_blast_radius))
        .route("/analysis/:id/tool-calls", get(get_tool_calls))
        // Live events
        .route("/ws/analysis/:id", get(websocket_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(Arc::new(state))
}

// =============================================================================
// Errors
// =============================================================================

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (code, Json(json!({ "error": message }))).into_response()
    }
}

async fn load(state: &AppState, id: &str) -> Result<Analysis, ApiError> {
    match state.repository().load(id).await {
        Ok(Some(analysis)) => Ok(analysis),
        Ok(None) => Err(ApiError::NotFound(format!("Analysis not found: {}", id))),
        Err(e) => {
            warn!("Failed to load analysis {}: {}", id, e);
            Err(ApiError::Internal(e.to_string()))
        }
    }
}

// =============================================================================
// Health & Status
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "vibecheck-daemon"
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Timeout,
    Error,
    /// Not configured (no credential).
    Skipped,
}

#[derive(Serialize)]
struct IntegrationCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

impl IntegrationCheck {
    fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
        }
    }
}

/// Run `check` under the integration budget.
async fn timed<F>(name: &str, check: F) -> IntegrationCheck
where
    F: Future<Output = Result<String, String>>,
{
    match tokio::time::timeout(INTEGRATION_CHECK_TIMEOUT, check).await {
        Ok(Ok(message)) => IntegrationCheck::new(name, CheckStatus::Ok, message),
        Ok(Err(message)) => IntegrationCheck::new(name, CheckStatus::Error, message),
        Err(_) => IntegrationCheck::new(
            name,
            CheckStatus::Timeout,
            format!("no answer within {}s", INTEGRATION_CHECK_TIMEOUT.as_secs()),
        ),
    }
}

/// Reachability of storage, the graph backend and every configured provider.
async fn integrations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut checks = Vec::new();

    checks.push(
        timed("storage", async {
            state
                .repository()
                .load("health-check")
                .await
                .map(|_| "analysis store readable".to_string())
                .map_err(|e| e.to_string())
        })
        .await,
    );

    let graph = state.engine.graph_backend();
    let graph_name = format!("graph:{}", graph.name());
    checks.push(
        timed(&graph_name, async {
            if graph.is_reachable().await {
                Ok("reachable".to_string())
            } else {
                Err("unreachable; graphs are kept as snapshots".to_string())
            }
        })
        .await,
    );

    let capabilities = state.engine.capabilities();
    let providers = [
        (capabilities.reasoning.name(), capabilities.reasoning.availability()),
        (capabilities.classification.name(), capabilities.classification.availability()),
        (capabilities.research.name(), capabilities.research.availability()),
    ];
    for (capability, availability) in providers {
        for (provider, result) in availability {
            let name = format!("{}:{}", capability, provider);
            checks.push(match result {
                Ok(()) => IntegrationCheck::new(name, CheckStatus::Ok, "configured"),
                Err(CapabilityError::Unavailable(m)) => {
                    IntegrationCheck::new(name, CheckStatus::Skipped, m)
                }
                Err(e) => IntegrationCheck::new(name, CheckStatus::Error, e.to_string()),
            });
        }
    }

    let healthy = checks
        .iter()
        .all(|c| matches!(c.status, CheckStatus::Ok | CheckStatus::Skipped));
    Json(json!({
        "overall": if healthy { "healthy" } else { "degraded" },
        "integrations": checks,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    version: String,
    live_analyses: usize,
    connections: usize,
    uptime_seconds: f64,
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "running".to_string(),
        version: vibecheck_core::VERSION.to_string(),
        live_analyses: state.events().active_analyses(),
        connections: state.ws_connection_count(),
        uptime_seconds: state.uptime_seconds(),
    })
}

// =============================================================================
// Submission
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest {
    repo_url: String,
    #[serde(default)]
    branch: Option<String>,
    /// Resubmitting a known id never reruns a finished analysis.
    #[serde(default)]
    analysis_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    analysis_id: String,
    status: AnalysisStatus,
    websocket_url: String,
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let repo_url = req.repo_url.trim();
    if repo_url.is_empty() {
        return Err(ApiError::BadRequest("repoUrl is required".to_string()));
    }

    let analysis_id = req
        .analysis_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let status = match state.engine.submit(&analysis_id, repo_url, req.branch).await {
        Submission::Started(_) => {
            info!("Accepted analysis {} of {}", analysis_id, repo_url);
            AnalysisStatus::Queued
        }
        Submission::AlreadyRunning => load(&state, &analysis_id)
            .await
            .map(|a| a.status)
            .unwrap_or(AnalysisStatus::Queued),
        Submission::Finished(status) => status,
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(AnalyzeResponse {
            websocket_url: format!("/ws/analysis/{}", analysis_id),
            analysis_id,
            status,
        }),
    ))
}

// =============================================================================
// Results
// =============================================================================

async fn get_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(load(&state, &id).await?))
}

async fn get_findings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let analysis = load(&state, &id).await?;
    Ok(Json(json!({
        "analysisId": analysis.analysis_id,
        "status": analysis.status,
        "summary": analysis.findings_summary,
        "findings": analysis.findings,
    })))
}

async fn get_fixes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let analysis = load(&state, &id).await?;
    Ok(Json(json!({
        "analysisId": analysis.analysis_id,
        "fixes": analysis.fixes,
    })))
}

#[derive(Deserialize)]
struct GraphQuery {
    view: Option<String>,
}

/// The stored graph. Without `view` every edge is returned.
async fn get_graph(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<GraphQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let view = match query.view.as_deref() {
        None => None,
        Some(v) => Some(GraphView::parse(v).ok_or_else(|| {
            ApiError::BadRequest(format!(
                "unknown view {:?}; expected structure, dependencies or vulnerabilities",
                v
            ))
        })?),
    };

    let analysis = load(&state, &id).await?;
    let graph = analysis.graph.unwrap_or_default();
    let graph = match view {
        Some(view) => graph.view(view),
        None => graph,
    };
    let (algorithm, direction) = view.unwrap_or(GraphView::Vulnerabilities).layout();
    Ok(Json(json!({
        "analysisId": analysis.analysis_id,
        "persistence": analysis.graph_persistence,
        "nodes": graph.nodes,
        "edges": graph.edges,
        "layout": { "algorithm": algorithm, "direction": direction },
    })))
}

async fn get_chains(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let analysis = load(&state, &id).await?;
    let chains = analysis.graph.map(|g| g.chains()).unwrap_or_default();
    Ok(Json(json!({
        "total": chains.len(),
        "chains": chains,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlastRadiusQuery {
    node_id: String,
    depth: Option<usize>,
}

async fn get_blast_radius(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<BlastRadiusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let depth = query
        .depth
        .unwrap_or(DEFAULT_BLAST_DEPTH)
        .clamp(1, MAX_BLAST_DEPTH);
    let analysis = load(&state, &id).await?;
    let radius = analysis
        .graph
        .and_then(|g| g.blast_radius(&query.node_id, depth))
        .ok_or_else(|| ApiError::NotFound(format!("Node not found: {}", query.node_id)))?;
    Ok(Json(json!({
        "analysisId": id,
        "nodeId": query.node_id,
        "depth": depth,
        "blastRadius": radius,
    })))
}

async fn get_tool_calls(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load(&state, &id).await?;
    let calls = state
        .audit_sink
        .list(&id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "analysisId": id,
        "toolCalls": calls,
    })))
}
