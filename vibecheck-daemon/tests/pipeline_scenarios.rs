//! End-to-end pipeline runs against a local repository with scripted providers.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::Notify;
use vibecheck_core::{AnalysisStatus, GraphPersistence, Severity, ToolCallStatus};
use vibecheck_daemon::audit::{AuditLogger, MemoryAuditSink};
use vibecheck_daemon::capability::{
    Capabilities, Capability, ClassificationProvider, LexicalClassifier, Provider, ResearchProvider,
    SearchOptions, SearchResponse, SearchResult,
};
use vibecheck_daemon::config::PipelineConfig;
use vibecheck_daemon::error::{CapabilityError, PipelineError};
use vibecheck_daemon::events::{AnalysisEvent, Broadcaster, StageState};
use vibecheck_daemon::pipeline::{Cloner, Engine, EngineDeps, GitCloner, Submission};
use vibecheck_daemon::storage::{AnalysisRepository, MemoryAnalysisRepository, MemoryGraphBackend};

const CVE_ANSWER: &str =
    "fastapi 0.110.0 is affected by CVE-2024-24762, a high severity ReDoS in form parsing.";

// =============================================================================
// Fixtures
// =============================================================================

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn create_test_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "requirements.txt", "fastapi==0.110.0\nrequests==2.31.0\n");
    write(root, "src/app.py", "def handler():\n    return 1\n");
    write(root, "README.md", "# Demo\n");
    dir
}

struct ScriptedResearch {
    name: &'static str,
    response: Option<SearchResponse>,
}

impl ScriptedResearch {
    fn answering(name: &'static str) -> Self {
        Self {
            name,
            response: Some(SearchResponse {
                answer: Some(CVE_ANSWER.to_string()),
                results: vec![SearchResult {
                    title: "FastAPI security checklist".to_string(),
                    url: "https://example.invalid/fastapi-security".to_string(),
                    content: "Validate request bodies and pin dependencies.".to_string(),
                    score: 0.8,
                }],
            }),
        }
    }

    fn failing(name: &'static str) -> Self {
        Self { name, response: None }
    }
}

impl Provider for ScriptedResearch {
    fn name(&self) -> &str {
        self.name
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("test://{}/{}", self.name, operation)
    }

    fn check_available(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

#[async_trait]
impl ResearchProvider for ScriptedResearch {
    async fn search(&self, _query: &str, _options: &SearchOptions) -> Result<SearchResponse, CapabilityError> {
        self.response
            .clone()
            .ok_or_else(|| CapabilityError::RemoteError("HTTP 502: bad gateway".into()))
    }

    async fn extract_content(&self, _urls: &[String]) -> Result<Vec<String>, CapabilityError> {
        Ok(Vec::new())
    }
}

/// Searches that panic inside the provider.
struct PanickingResearch;

impl Provider for PanickingResearch {
    fn name(&self) -> &str {
        "panicking"
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("test://panicking/{}", operation)
    }

    fn check_available(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

#[async_trait]
impl ResearchProvider for PanickingResearch {
    async fn search(&self, _query: &str, _options: &SearchOptions) -> Result<SearchResponse, CapabilityError> {
        panic!("search index out of range");
    }

    async fn extract_content(&self, _urls: &[String]) -> Result<Vec<String>, CapabilityError> {
        Ok(Vec::new())
    }
}

/// Answers like `answering`, but only after `delay`.
struct SlowResearch {
    delay: Duration,
    inner: ScriptedResearch,
}

impl Provider for SlowResearch {
    fn name(&self) -> &str {
        "slow"
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("test://slow/{}", operation)
    }

    fn check_available(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

#[async_trait]
impl ResearchProvider for SlowResearch {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse, CapabilityError> {
        tokio::time::sleep(self.delay).await;
        self.inner.search(query, options).await
    }

    async fn extract_content(&self, urls: &[String]) -> Result<Vec<String>, CapabilityError> {
        self.inner.extract_content(urls).await
    }
}

struct FailingCloner;

#[async_trait]
impl Cloner for FailingCloner {
    async fn fetch(&self, _: &str, _: &str, _: Option<&str>) -> Result<PathBuf, PipelineError> {
        Err(PipelineError::CloneFailure(
            "git clone failed: repository not found".into(),
        ))
    }
}

/// Hands out `root` once released.
struct GatedCloner {
    root: PathBuf,
    gate: Arc<Notify>,
}

#[async_trait]
impl Cloner for GatedCloner {
    async fn fetch(&self, _: &str, _: &str, _: Option<&str>) -> Result<PathBuf, PipelineError> {
        self.gate.notified().await;
        Ok(self.root.clone())
    }
}

/// Never finishes fetching.
struct HangingCloner;

#[async_trait]
impl Cloner for HangingCloner {
    async fn fetch(&self, _: &str, _: &str, _: Option<&str>) -> Result<PathBuf, PipelineError> {
        std::future::pending().await
    }
}

fn quick_stages() -> PipelineConfig {
    PipelineConfig {
        stage_timeout_secs: 1,
        ..PipelineConfig::default()
    }
}

struct Harness {
    engine: Engine,
    repository: Arc<MemoryAnalysisRepository>,
    audit_sink: Arc<MemoryAuditSink>,
    graph: Arc<MemoryGraphBackend>,
    events: Arc<Broadcaster>,
}

fn harness(
    cloner: Option<Arc<dyn Cloner>>,
    research: Vec<Arc<dyn ResearchProvider>>,
    graph: MemoryGraphBackend,
) -> Harness {
    harness_with(PipelineConfig::default(), cloner, research, graph)
}

fn harness_with(
    config: PipelineConfig,
    cloner: Option<Arc<dyn Cloner>>,
    research: Vec<Arc<dyn ResearchProvider>>,
    graph: MemoryGraphBackend,
) -> Harness {
    let audit_sink = Arc::new(MemoryAuditSink::new());
    let audit = Arc::new(AuditLogger::new(audit_sink.clone()));
    let timeout = Duration::from_secs(5);
    let lexical: Arc<dyn ClassificationProvider> = Arc::new(LexicalClassifier::new());
    let capabilities = Capabilities {
        reasoning: Capability::new("reasoning", Vec::new(), Arc::clone(&audit), timeout),
        classification: Capability::new("classification", vec![lexical], Arc::clone(&audit), timeout),
        research: Capability::new("research", research, Arc::clone(&audit), timeout),
    };

    let repository = Arc::new(MemoryAnalysisRepository::new());
    let graph = Arc::new(graph);
    let events = Arc::new(Broadcaster::default());
    let cloner = cloner.unwrap_or_else(|| {
        Arc::new(GitCloner::new(std::env::temp_dir().join("vibecheck-test"), Arc::clone(&audit)))
    });

    let engine = Engine::new(
        config,
        EngineDeps {
            capabilities: Arc::new(capabilities),
            cloner,
            repository: repository.clone(),
            graph: graph.clone(),
            audit,
            events: Arc::clone(&events),
        },
    );
    Harness {
        engine,
        repository,
        audit_sink,
        graph,
        events,
    }
}

async fn run_to_end(h: &Harness, id: &str, repo_url: &str) -> Vec<Arc<AnalysisEvent>> {
    let mut sub = h.events.subscribe(id);
    match h.engine.submit(id, repo_url, None).await {
        Submission::Started(handle) => handle.await.unwrap(),
        other => panic!("expected a new run, got {:?}", other),
    }
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_clone_failure_fails_the_run() {
    let h = harness(
        Some(Arc::new(FailingCloner)),
        vec![Arc::new(ScriptedResearch::answering("tavily"))],
        MemoryGraphBackend::new(),
    );
    let events = run_to_end(&h, "a-clone", "https://example.invalid/missing.git").await;

    let record = h.repository.load("a-clone").await.unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("git clone failed: repository not found")
    );
    assert!(record.completed_at.is_some());

    let errors: Vec<_> = events.iter().filter(|e| e.kind() == "error").collect();
    assert_eq!(errors.len(), 1);
    match errors[0].as_ref() {
        AnalysisEvent::Error {
            agent, recoverable, ..
        } => {
            assert_eq!(agent, "orchestrator");
            assert!(!recoverable);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Nothing after cloning ran.
    assert!(!events.iter().any(|e| matches!(
        e.as_ref(),
        AnalysisEvent::Status { agent, .. } if agent != "orchestrator"
    )));
    assert!(h.audit_sink.calls().is_empty());
}

#[tokio::test]
async fn test_full_run_streams_events_in_stage_order() {
    let repo = create_test_repo();
    let h = harness(
        None,
        vec![Arc::new(ScriptedResearch::answering("tavily"))],
        MemoryGraphBackend::new(),
    );
    let events = run_to_end(&h, "a-full", repo.path().to_str().unwrap()).await;

    let record = h.repository.load("a-full").await.unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Completed);
    assert!(record.error_message.is_none());

    let vuln = record
        .findings
        .iter()
        .find(|f| f.id == "sec-CVE-2024-24762")
        .expect("CVE finding");
    assert_eq!(vuln.severity, Severity::Critical);
    assert_eq!(vuln.title, "CVE-2024-24762 in fastapi@0.110.0");
    assert_eq!(vuln.location.files, vec!["requirements.txt"]);
    assert!(record.findings.iter().any(|f| f.id == "bp-001"));

    // No reasoning provider: fixes come from the local derivation.
    assert_eq!(record.fixes.len(), 1);
    assert_eq!(record.fixes[0].findings_resolved, vec!["sec-CVE-2024-24762"]);

    let summary = record.findings_summary.unwrap();
    assert_eq!(summary.total as usize, record.findings.len());
    assert_eq!(summary.critical, 1);

    // Event stream: opens with cloning, closes with completion.
    assert!(matches!(
        events.first().map(|e| e.as_ref()),
        Some(AnalysisEvent::Status { agent, status: StageState::Running, .. }) if agent == "orchestrator"
    ));
    assert_eq!(events.last().map(|e| e.kind()), Some("complete"));
    assert!(!events.iter().any(|e| e.kind() == "error"));

    let position = |kind: &str| events.iter().position(|e| e.kind() == kind).unwrap();
    let last_finding = events.iter().rposition(|e| e.kind() == "finding").unwrap();
    assert!(last_finding < position("graph_node"));
    assert!(position("graph_node") < position("graph_edge"));
    assert_eq!(
        events.iter().filter(|e| e.kind() == "finding").count(),
        record.findings.len()
    );
    assert!(events.iter().any(|e| e.kind() == "tool_activity"));

    let mapper_done = events
        .iter()
        .position(|e| matches!(e.as_ref(), AnalysisEvent::Status { agent, status: StageState::Complete, .. } if agent == "mapper"))
        .unwrap();
    assert!(mapper_done < position("finding"));

    match events.last().unwrap().as_ref() {
        AnalysisEvent::Complete {
            findings_summary, ..
        } => assert_eq!(*findings_summary, summary),
        other => panic!("unexpected event {:?}", other),
    }

    // Every agent that reported running also reported completion.
    for agent in ["mapper", "security", "research", "quality", "pattern", "remediation", "graph"] {
        let state_of = |want: StageState| {
            events.iter().position(|e| match e.as_ref() {
                AnalysisEvent::Status { agent: a, status, .. } => a == agent && *status == want,
                _ => false,
            })
        };
        let running = state_of(StageState::Running)
            .unwrap_or_else(|| panic!("{} never ran", agent));
        let complete = state_of(StageState::Complete)
            .unwrap_or_else(|| panic!("{} never completed", agent));
        assert!(running < complete, "{} completed before running", agent);
    }
    let graph_done = events
        .iter()
        .position(|e| match e.as_ref() {
            AnalysisEvent::Status { agent, status, .. } => {
                agent == "graph" && *status == StageState::Complete
            }
            _ => false,
        })
        .unwrap();
    assert!(events.iter().rposition(|e| e.kind() == "graph_edge").unwrap() < graph_done);
}

#[tokio::test]
async fn test_reachable_backend_receives_the_graph() {
    let repo = create_test_repo();
    let h = harness(
        None,
        vec![Arc::new(ScriptedResearch::answering("tavily"))],
        MemoryGraphBackend::new(),
    );
    run_to_end(&h, "a-graph", repo.path().to_str().unwrap()).await;

    let record = h.repository.load("a-graph").await.unwrap().unwrap();
    let graph = record.graph.unwrap();
    assert_eq!(
        record.graph_persistence,
        Some(GraphPersistence::Backend {
            nodes_written: graph.node_count() as u32,
            edges_written: graph.edge_count() as u32,
            failed_writes: 0,
        })
    );
    assert_eq!(h.graph.nodes_for("a-graph").len(), graph.node_count());
    assert!(graph.nodes.iter().any(|n| n.id == "cve:CVE-2024-24762"));
    assert!(graph.nodes.iter().any(|n| n.id == "fix:fix-001"));
    assert!(graph.nodes.iter().any(|n| n.id == "file:src/app.py"));
}

#[tokio::test]
async fn test_unreachable_backend_keeps_snapshot() {
    let repo = create_test_repo();
    let h = harness(
        None,
        vec![Arc::new(ScriptedResearch::answering("tavily"))],
        MemoryGraphBackend::unreachable(),
    );
    let events = run_to_end(&h, "a-snap", repo.path().to_str().unwrap()).await;

    let record = h.repository.load("a-snap").await.unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.graph_persistence, Some(GraphPersistence::Snapshot));
    let graph = record.graph.unwrap();
    assert!(graph.node_count() > 0);
    assert_eq!(
        events.iter().filter(|e| e.kind() == "graph_node").count(),
        graph.node_count()
    );

    let persist = h
        .audit_sink
        .calls()
        .into_iter()
        .find(|c| c.step_name == "persist_graph")
        .unwrap();
    assert_eq!(persist.status, ToolCallStatus::Error);
}

#[tokio::test]
async fn test_research_fallback_is_audited() {
    let repo = create_test_repo();
    let h = harness(
        None,
        vec![
            Arc::new(ScriptedResearch::failing("primary")),
            Arc::new(ScriptedResearch::answering("secondary")),
        ],
        MemoryGraphBackend::new(),
    );
    run_to_end(&h, "a-fallback", repo.path().to_str().unwrap()).await;

    let batch: Vec<_> = h
        .audit_sink
        .calls()
        .into_iter()
        .filter(|c| c.step_name == "cve_search_batch_0")
        .collect();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].tool_name, "primary");
    assert_eq!(batch[0].status, ToolCallStatus::Error);
    assert!(batch[0].error_message.as_deref().unwrap().contains("502"));
    assert_eq!(batch[1].tool_name, "secondary");
    assert_eq!(batch[1].status, ToolCallStatus::Success);

    let record = h.repository.load("a-fallback").await.unwrap().unwrap();
    assert!(record.findings.iter().any(|f| f.cve.as_deref() == Some("CVE-2024-24762")));
}

#[tokio::test]
async fn test_exhausted_research_still_completes() {
    let repo = create_test_repo();
    let h = harness(None, Vec::new(), MemoryGraphBackend::new());
    run_to_end(&h, "a-offline", repo.path().to_str().unwrap()).await;

    let record = h.repository.load("a-offline").await.unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Completed);
    assert!(record.findings.is_empty());
    assert!(record.fixes.is_empty());
    assert_eq!(record.health_score.unwrap().overall, 100);
}

#[tokio::test]
async fn test_submission_is_idempotent() {
    let repo = create_test_repo();
    let gate = Arc::new(Notify::new());
    let h = harness(
        Some(Arc::new(GatedCloner {
            root: repo.path().to_path_buf(),
            gate: Arc::clone(&gate),
        })),
        Vec::new(),
        MemoryGraphBackend::new(),
    );

    let handle = match h.engine.submit("a-once", "local", None).await {
        Submission::Started(handle) => handle,
        other => panic!("expected a new run, got {:?}", other),
    };
    assert!(h.engine.is_running("a-once"));
    assert!(matches!(
        h.engine.submit("a-once", "local", None).await,
        Submission::AlreadyRunning
    ));

    gate.notify_one();
    handle.await.unwrap();
    assert!(matches!(
        h.engine.submit("a-once", "local", None).await,
        Submission::Finished(AnalysisStatus::Completed)
    ));
    assert_eq!(h.repository.len(), 1);
}

#[tokio::test]
async fn test_panicking_stage_fails_the_run() {
    let repo = create_test_repo();
    let h = harness(
        None,
        vec![Arc::new(PanickingResearch)],
        MemoryGraphBackend::new(),
    );
    let events = run_to_end(&h, "a-panic", repo.path().to_str().unwrap()).await;

    let record = h.repository.load("a-panic").await.unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Failed);
    let message = record.error_message.unwrap();
    assert!(message.starts_with("internal error"), "{}", message);
    assert!(message.contains("search index out of range"));
    assert!(record.completed_at.is_some());

    let errors: Vec<_> = events.iter().filter(|e| e.kind() == "error").collect();
    assert_eq!(errors.len(), 1);
    assert!(!events.iter().any(|e| e.kind() == "complete"));
    assert!(!h.engine.is_running("a-panic"));
}

#[tokio::test]
async fn test_hanging_clone_times_out() {
    let h = harness_with(
        quick_stages(),
        Some(Arc::new(HangingCloner)),
        Vec::new(),
        MemoryGraphBackend::new(),
    );
    let started = Instant::now();
    let events = tokio::time::timeout(
        Duration::from_secs(10),
        run_to_end(&h, "a-hang", "https://example.invalid/slow.git"),
    )
    .await
    .expect("run should end at the stage timeout");
    assert!(started.elapsed() < Duration::from_secs(5));

    let record = h.repository.load("a-hang").await.unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("git clone timed out after 1s")
    );
    assert_eq!(events.iter().filter(|e| e.kind() == "error").count(), 1);
}

#[tokio::test]
async fn test_slow_stages_degrade_without_failing() {
    let repo = create_test_repo();
    let slow = SlowResearch {
        delay: Duration::from_secs(3),
        inner: ScriptedResearch::answering("slow"),
    };
    let h = harness_with(
        quick_stages(),
        None,
        vec![Arc::new(slow)],
        MemoryGraphBackend::new(),
    );
    let events = run_to_end(&h, "a-slow", repo.path().to_str().unwrap()).await;

    let record = h.repository.load("a-slow").await.unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Completed);
    assert!(!record
        .findings
        .iter()
        .any(|f| f.id.starts_with("sec-") || f.id.starts_with("bp-")));

    let timed_out: Vec<_> = h
        .audit_sink
        .calls()
        .into_iter()
        .filter(|c| c.tool_name == "orchestrator")
        .collect();
    for stage in ["security", "research"] {
        let call = timed_out
            .iter()
            .find(|c| c.step_name == stage)
            .unwrap_or_else(|| panic!("no audit entry for {}", stage));
        assert_eq!(call.status, ToolCallStatus::Error);
        assert!(call.error_message.as_deref().unwrap().contains("timed out after 1s"));
    }

    let activity = events
        .iter()
        .filter(|e| match e.as_ref() {
            AnalysisEvent::ToolActivity { tool, status, .. } => {
                tool == "orchestrator" && *status == ToolCallStatus::Error
            }
            _ => false,
        })
        .count();
    assert!(activity >= 2);
    assert!(!events.iter().any(|e| e.kind() == "error"));
    assert_eq!(events.last().map(|e| e.kind()), Some("complete"));
}
