//! Orchestration of one analysis from clone to terminal record.

use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vibecheck_core::scanner::{ingest, IngestOptions};
use vibecheck_core::{
    build_graph, merge, score, truncate_chars, Analysis, AnalysisStatus, Finding, FindingsSummary,
    Graph, GraphPersistence, RepoMetadata, ToolCallStatus,
};

use super::clone::Cloner;
use super::persist::persist_graph;
use super::stages::{self, StageEnv};
use crate::audit::{AuditEntry, AuditLogger};
use crate::capability::Capabilities;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::{AnalysisEvent, Broadcaster, StageState};
use crate::storage::{AnalysisRepository, GraphBackend};

/// Characters of a failure kept on the analysis record.
pub const MAX_ERROR_CHARS: usize = 2000;
/// Characters of a failure carried by the error event.
pub const EVENT_ERROR_CHARS: usize = 500;

/// Collaborators of the engine.
pub struct EngineDeps {
    pub capabilities: Arc<Capabilities>,
    pub cloner: Arc<dyn Cloner>,
    pub repository: Arc<dyn AnalysisRepository>,
    pub graph: Arc<dyn GraphBackend>,
    pub audit: Arc<AuditLogger>,
    pub events: Arc<Broadcaster>,
}

/// Result of [`Engine::submit`].
#[derive(Debug)]
pub enum Submission {
    /// A new run was started.
    Started(JoinHandle<()>),
    /// A run of this id is in progress.
    AlreadyRunning,
    /// The id already has a terminal record; nothing was rerun.
    Finished(AnalysisStatus),
}

/// Runs analyses in background tasks.
///
/// At most one run per analysis id is in flight. Status changes are saved
/// as they happen, so an observer reading the record sees the last stage
/// entered.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: PipelineConfig,
    capabilities: Arc<Capabilities>,
    cloner: Arc<dyn Cloner>,
    repository: Arc<dyn AnalysisRepository>,
    graph: Arc<dyn GraphBackend>,
    audit: Arc<AuditLogger>,
    events: Arc<Broadcaster>,
    active: Mutex<HashSet<String>>,
}

fn lock(active: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Marks an analysis id as running until dropped.
struct ActiveGuard {
    inner: Arc<EngineInner>,
    analysis_id: String,
}

impl ActiveGuard {
    fn claim(inner: &Arc<EngineInner>, analysis_id: &str) -> Option<Self> {
        if !lock(&inner.active).insert(analysis_id.to_string()) {
            return None;
        }
        Some(Self {
            inner: Arc::clone(inner),
            analysis_id: analysis_id.to_string(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.inner.active).remove(&self.analysis_id);
    }
}

impl Engine {
    pub fn new(config: PipelineConfig, deps: EngineDeps) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                capabilities: deps.capabilities,
                cloner: deps.cloner,
                repository: deps.repository,
                graph: deps.graph,
                audit: deps.audit,
                events: deps.events,
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn events(&self) -> &Arc<Broadcaster> {
        &self.inner.events
    }

    pub fn repository(&self) -> &Arc<dyn AnalysisRepository> {
        &self.inner.repository
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.inner.capabilities
    }

    pub fn graph_backend(&self) -> &Arc<dyn GraphBackend> {
        &self.inner.graph
    }

    pub fn is_running(&self, analysis_id: &str) -> bool {
        lock(&self.inner.active).contains(analysis_id)
    }

    /// Start an analysis unless one with this id is running or finished.
    ///
    /// A record left in a non-terminal state by an earlier process is
    /// restarted from scratch.
    pub async fn submit(&self, analysis_id: &str, repo_url: &str, branch: Option<String>) -> Submission {
        let Some(guard) = ActiveGuard::claim(&self.inner, analysis_id) else {
            return Submission::AlreadyRunning;
        };

        let mut analysis = Analysis::new(analysis_id, repo_url, branch);
        match self.inner.repository.load(analysis_id).await {
            Ok(Some(existing)) if existing.status.is_terminal() => {
                return Submission::Finished(existing.status);
            }
            Ok(Some(existing)) => {
                warn!(
                    "Restarting analysis {} left in state {}",
                    analysis_id, existing.status
                );
                analysis.created_at = existing.created_at;
            }
            Ok(None) => {}
            Err(e) => warn!("Could not look up analysis {}: {}", analysis_id, e),
        }
        self.inner.save(&analysis).await;

        let inner = Arc::clone(&self.inner);
        Submission::Started(tokio::spawn(async move {
            inner.run(analysis).await;
            drop(guard);
        }))
    }
}

impl EngineInner {
    async fn save(&self, analysis: &Analysis) {
        if let Err(e) = self.repository.save(analysis).await {
            warn!(
                "Failed to save analysis {} ({}): {}",
                analysis.analysis_id, analysis.status, e
            );
        }
    }

    fn publish(&self, analysis_id: &str, event: AnalysisEvent) {
        self.events.publish(analysis_id, event);
    }

    fn status(&self, analysis_id: &str, agent: &str, state: StageState, progress: f64, message: impl Into<String>) {
        self.publish(analysis_id, AnalysisEvent::status(agent, state, progress, message));
    }

    fn publish_findings(&self, analysis_id: &str, findings: &[Finding]) {
        for finding in findings {
            self.publish(
                analysis_id,
                AnalysisEvent::Finding {
                    finding: finding.clone(),
                },
            );
        }
    }

    async fn advance(&self, analysis: &mut Analysis, next: AnalysisStatus) -> Result<(), PipelineError> {
        analysis.transition(next)?;
        self.save(analysis).await;
        Ok(())
    }

    /// Run a stage under the stage timeout. Errors and timeouts degrade to
    /// `None`.
    async fn within<T, F>(&self, analysis_id: &str, stage: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        debug!("Stage {} started for {}", stage, analysis_id);
        match tokio::time::timeout(self.config.stage_timeout(), fut).await {
            Ok(Ok(value)) => {
                info!(
                    "Stage {} finished for {} in {:?}",
                    stage,
                    analysis_id,
                    started.elapsed()
                );
                Some(value)
            }
            Ok(Err(e)) => {
                self.degraded(analysis_id, stage, started, e).await;
                None
            }
            Err(_) => {
                let e = PipelineError::stage(
                    stage,
                    format!("timed out after {}s", self.config.stage_timeout_secs),
                );
                self.degraded(analysis_id, stage, started, e).await;
                None
            }
        }
    }

    /// Audit and announce a stage that contributed nothing.
    async fn degraded(&self, analysis_id: &str, stage: &str, started: Instant, e: PipelineError) {
        warn!("Stage {} degraded for {}: {}", stage, analysis_id, e);
        let message = e.to_string();
        self.audit
            .record(
                AuditEntry::new(analysis_id, "orchestrator", stage, format!("stage:{}", stage))
                    .latency(started.elapsed())
                    .failed(&message),
            )
            .await;
        self.publish(
            analysis_id,
            AnalysisEvent::ToolActivity {
                tool: "orchestrator".to_string(),
                step: stage.to_string(),
                status: ToolCallStatus::Error,
                message,
            },
        );
    }

    async fn run(&self, mut analysis: Analysis) {
        let started = Instant::now();
        info!("Starting analysis {} of {}", analysis.analysis_id, analysis.repo_url);

        let outcome = AssertUnwindSafe(self.execute(&mut analysis, started))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(&mut analysis, &e.to_string(), started).await,
            Err(panic) => {
                let message = format!("internal error: {}", panic_message(&*panic));
                self.fail(&mut analysis, &message, started).await;
            }
        }
    }

    async fn fail(&self, analysis: &mut Analysis, message: &str, started: Instant) {
        error!("Analysis {} failed: {}", analysis.analysis_id, message);
        if let Err(e) = analysis.fail(message, MAX_ERROR_CHARS) {
            warn!("Cannot mark analysis {} failed: {}", analysis.analysis_id, e);
        }
        analysis.duration_seconds = Some(started.elapsed().as_secs());
        self.save(analysis).await;
        self.publish(
            &analysis.analysis_id,
            AnalysisEvent::Error {
                agent: "orchestrator".to_string(),
                message: truncate_chars(message, EVENT_ERROR_CHARS),
                recoverable: false,
            },
        );
    }

    async fn execute(&self, analysis: &mut Analysis, started: Instant) -> Result<(), PipelineError> {
        let id = analysis.analysis_id.clone();
        let env = StageEnv {
            analysis_id: &id,
            capabilities: &self.capabilities,
            config: &self.config,
            events: &self.events,
        };

        // Cloning
        self.advance(analysis, AnalysisStatus::Cloning).await?;
        self.status(&id, "orchestrator", StageState::Running, 0.05, "Cloning repository...");
        let fetch = self
            .cloner
            .fetch(&id, &analysis.repo_url, analysis.branch.as_deref());
        let root = match tokio::time::timeout(self.config.stage_timeout(), fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::CloneFailure(format!(
                    "git clone timed out after {}s",
                    self.config.stage_timeout_secs
                )))
            }
        };
        self.status(&id, "orchestrator", StageState::Running, 0.1, "Repository ready");

        // Mapping
        self.advance(analysis, AnalysisStatus::Mapping).await?;
        let metadata = self.map_repository(&env, &root).await?;
        analysis.detected_stack = Some(metadata.detected_stack.clone());
        analysis.stats = Some(metadata.stats);
        self.save(analysis).await;

        // Analyzing
        self.advance(analysis, AnalysisStatus::Analyzing).await?;
        let findings = self.analyze(&env, &root, &metadata).await;
        let health = score(&findings, &metadata.stats);
        let summary = FindingsSummary::from_findings(&findings);

        // Completing
        self.advance(analysis, AnalysisStatus::Completing).await?;
        self.status(&id, "remediation", StageState::Running, 0.6, "Generating fixes...");
        let fixes = self
            .within(&id, "fixes", async {
                Ok::<_, PipelineError>(stages::generate_fixes(&env, &findings).await)
            })
            .await
            .unwrap_or_else(|| stages::derive_fixes(&findings));
        self.status(
            &id,
            "remediation",
            StageState::Complete,
            1.0,
            format!("Generated {} fixes", fixes.len()),
        );

        self.status(&id, "graph", StageState::Running, 0.85, "Building knowledge graph...");
        let graph = build_graph(&metadata, &findings, &fixes);
        let persistence = self.persist(&id, &graph).await;
        for node in &graph.nodes {
            self.publish(&id, AnalysisEvent::GraphNode { node: node.clone() });
        }
        for edge in &graph.edges {
            self.publish(&id, AnalysisEvent::GraphEdge { edge: edge.clone() });
        }
        self.status(
            &id,
            "graph",
            StageState::Complete,
            1.0,
            format!("{} nodes, {} edges", graph.node_count(), graph.edge_count()),
        );

        // Completed
        analysis.findings = findings;
        analysis.findings_summary = Some(summary);
        analysis.fixes = fixes;
        analysis.health_score = Some(health.clone());
        analysis.graph = Some(graph);
        analysis.graph_persistence = Some(persistence);
        let duration = started.elapsed().as_secs();
        analysis.duration_seconds = Some(duration);
        self.advance(analysis, AnalysisStatus::Completed).await?;

        info!(
            "Analysis {} completed in {}s: {} findings, grade {}",
            id, duration, summary.total, health.letter_grade
        );
        self.status(&id, "orchestrator", StageState::Complete, 1.0, "Analysis complete");
        self.publish(
            &id,
            AnalysisEvent::Complete {
                health_score: health,
                findings_summary: summary,
                duration,
            },
        );
        Ok(())
    }

    /// Graph persistence under the stage timeout. A backend too slow to take
    /// the whole graph leaves the run with its snapshot.
    async fn persist(&self, analysis_id: &str, graph: &Graph) -> GraphPersistence {
        let started = Instant::now();
        let write = persist_graph(self.graph.as_ref(), &self.audit, analysis_id, graph);
        match tokio::time::timeout(self.config.stage_timeout(), write).await {
            Ok(persistence) => persistence,
            Err(_) => {
                let message = format!(
                    "graph persistence timed out after {}s; stored as snapshot",
                    self.config.stage_timeout_secs
                );
                warn!("{} ({})", message, analysis_id);
                self.audit
                    .record(
                        AuditEntry::new(
                            analysis_id,
                            "graph",
                            "persist_graph",
                            format!("{}:graph", self.graph.name()),
                        )
                        .request(json!({ "nodes": graph.node_count(), "edges": graph.edge_count() }))
                        .latency(started.elapsed())
                        .failed(message),
                    )
                    .await;
                GraphPersistence::Snapshot
            }
        }
    }

    async fn map_repository(&self, env: &StageEnv<'_>, root: &Path) -> Result<RepoMetadata, PipelineError> {
        let id = env.analysis_id;
        self.status(id, "mapper", StageState::Running, 0.1, "Scanning files...");

        let options = IngestOptions {
            max_files: self.config.max_files,
        };
        let scan_root: PathBuf = root.to_path_buf();
        let mut metadata = tokio::task::spawn_blocking(move || ingest(&scan_root, &options))
            .await
            .map_err(|e| PipelineError::stage("mapping", e.to_string()))??;

        self.status(id, "mapper", StageState::Running, 0.3, "Classifying files...");
        if let Some(labels) = self
            .within(id, "mapping", async {
                Ok::<_, PipelineError>(stages::classify_files(env, &metadata).await)
            })
            .await
        {
            stages::apply_categories(&mut metadata, labels);
        }

        self.status(
            id,
            "mapper",
            StageState::Complete,
            1.0,
            format!("Mapped {} files", metadata.stats.total_files),
        );
        Ok(metadata)
    }

    /// The three independent stages run concurrently; each publishes its
    /// findings as soon as it completes. Deep analysis runs last with their
    /// output as context.
    async fn analyze(&self, env: &StageEnv<'_>, root: &Path, metadata: &RepoMetadata) -> Vec<Finding> {
        let id = env.analysis_id;

        let security = async {
            self.status(id, "security", StageState::Running, 0.1, "Searching for CVEs...");
            let report = self
                .within(id, "security", async {
                    Ok::<_, PipelineError>(stages::vulnerability_search(env, metadata).await)
                })
                .await
                .unwrap_or_default();
            self.publish_findings(id, &report.findings);
            self.status(
                id,
                "security",
                StageState::Complete,
                1.0,
                format!("Found {} vulnerabilities", report.findings.len()),
            );
            report
        };

        let research = async {
            self.status(id, "research", StageState::Running, 0.1, "Researching best practices...");
            let findings = self
                .within(id, "research", async {
                    Ok::<_, PipelineError>(stages::best_practice_research(env, metadata).await)
                })
                .await
                .unwrap_or_default();
            self.publish_findings(id, &findings);
            self.status(
                id,
                "research",
                StageState::Complete,
                1.0,
                format!("Collected {} recommendations", findings.len()),
            );
            findings
        };

        let quality = async {
            self.status(id, "quality", StageState::Running, 0.2, "Analyzing code quality...");
            let findings = self
                .within(id, "quality", async {
                    Ok::<_, PipelineError>(stages::code_quality(env, root, metadata).await)
                })
                .await
                .unwrap_or_default();
            self.publish_findings(id, &findings);
            self.status(
                id,
                "quality",
                StageState::Complete,
                1.0,
                format!("Found {} quality issues", findings.len()),
            );
            findings
        };

        let (security, research, quality) = tokio::join!(security, research, quality);

        self.status(id, "pattern", StageState::Running, 0.3, "Analyzing cross-cutting patterns...");
        let deep = self
            .within(
                id,
                "pattern",
                stages::deep_patterns(
                    env,
                    metadata,
                    &security.answers,
                    security.findings.len() + research.len() + quality.len(),
                ),
            )
            .await
            .unwrap_or_default();
        self.publish_findings(id, &deep);
        self.status(
            id,
            "pattern",
            StageState::Complete,
            1.0,
            format!("Found {} patterns", deep.len()),
        );

        merge([security.findings, research, quality, deep])
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stage panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::capability::Capability;
    use crate::error::StoreError;
    use crate::storage::{MemoryAnalysisRepository, MemoryGraphBackend};
    use async_trait::async_trait;
    use std::time::Duration;
    use vibecheck_core::{FileEntry, GraphEdge, GraphNode};

    struct FailingCloner;

    #[async_trait]
    impl Cloner for FailingCloner {
        async fn fetch(&self, _: &str, _: &str, _: Option<&str>) -> Result<PathBuf, PipelineError> {
            Err(PipelineError::CloneFailure("git clone failed: not found".into()))
        }
    }

    /// Reachable, but never finishes a write.
    struct StalledGraph;

    #[async_trait]
    impl GraphBackend for StalledGraph {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn is_reachable(&self) -> bool {
            true
        }

        async fn upsert_node(&self, _: &str, _: &GraphNode) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn upsert_edge(&self, _: &str, _: &GraphEdge) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    fn engine(repository: Arc<MemoryAnalysisRepository>) -> Engine {
        engine_with(
            repository,
            PipelineConfig::default(),
            Arc::new(MemoryGraphBackend::new()),
            Arc::new(MemoryAuditSink::new()),
        )
    }

    fn engine_with(
        repository: Arc<MemoryAnalysisRepository>,
        config: PipelineConfig,
        graph: Arc<dyn GraphBackend>,
        sink: Arc<MemoryAuditSink>,
    ) -> Engine {
        let audit = Arc::new(AuditLogger::new(sink));
        let timeout = Duration::from_secs(5);
        let capabilities = Capabilities {
            reasoning: Capability::new("reasoning", Vec::new(), Arc::clone(&audit), timeout),
            classification: Capability::new("classification", Vec::new(), Arc::clone(&audit), timeout),
            research: Capability::new("research", Vec::new(), Arc::clone(&audit), timeout),
        };
        Engine::new(
            config,
            EngineDeps {
                capabilities: Arc::new(capabilities),
                cloner: Arc::new(FailingCloner),
                repository,
                graph,
                audit,
                events: Arc::new(Broadcaster::default()),
            },
        )
    }

    #[tokio::test]
    async fn test_terminal_record_is_not_rerun() {
        let repository = Arc::new(MemoryAnalysisRepository::new());
        let engine = engine(Arc::clone(&repository));

        match engine.submit("a1", "https://example.invalid/r.git", None).await {
            Submission::Started(handle) => handle.await.unwrap(),
            other => panic!("expected a new run, got {:?}", other),
        }
        let record = repository.load("a1").await.unwrap().unwrap();
        assert_eq!(record.status, AnalysisStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("git clone failed: not found"));
        assert!(!engine.is_running("a1"));

        assert!(matches!(
            engine.submit("a1", "https://example.invalid/r.git", None).await,
            Submission::Finished(AnalysisStatus::Failed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_graph_backend_falls_back_to_snapshot() {
        let sink = Arc::new(MemoryAuditSink::new());
        let config = PipelineConfig {
            stage_timeout_secs: 1,
            ..PipelineConfig::default()
        };
        let engine = engine_with(
            Arc::new(MemoryAnalysisRepository::new()),
            config,
            Arc::new(StalledGraph),
            Arc::clone(&sink),
        );
        let metadata = RepoMetadata {
            files: vec![FileEntry::new("src/app.py", "Python", 2)],
            ..Default::default()
        };
        let graph = build_graph(&metadata, &[], &[]);
        assert!(graph.node_count() > 0);

        let persistence = tokio::time::timeout(
            Duration::from_secs(10),
            engine.inner.persist("a3", &graph),
        )
        .await
        .unwrap();
        assert_eq!(persistence, GraphPersistence::Snapshot);

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].step_name, "persist_graph");
        assert_eq!(calls[0].status, ToolCallStatus::Error);
        assert!(calls[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("timed out after 1s"));
    }

    #[test]
    fn test_panic_message_reads_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(format!("index {}", 3));
        assert_eq!(panic_message(&*payload), "index 3");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "stage panicked");
    }

    #[tokio::test]
    async fn test_failure_message_is_truncated() {
        let repository = Arc::new(MemoryAnalysisRepository::new());
        let engine = engine(Arc::clone(&repository));
        let mut analysis = Analysis::new("a2", "r", None);
        let long = "x".repeat(MAX_ERROR_CHARS + 50);

        let mut sub = engine.events().subscribe("a2");
        engine.inner.fail(&mut analysis, &long, Instant::now()).await;

        let stored = repository.load("a2").await.unwrap().unwrap();
        assert_eq!(stored.error_message.unwrap().chars().count(), MAX_ERROR_CHARS);
        match sub.try_recv().as_deref() {
            Some(AnalysisEvent::Error { message, recoverable, .. }) => {
                assert_eq!(message.chars().count(), EVENT_ERROR_CHARS);
                assert!(!recoverable);
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }
}
