//! Data model for an audit run.
//!
//! These types are shared by every stage of the pipeline: the ingested
//! repository metadata, the findings and fixes the stages produce, the
//! per-run [`Analysis`] record with its status state machine, and the
//! [`ToolCall`] audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::graph::{Graph, GraphPersistence};
use crate::score::{FindingsSummary, HealthScore};

// =============================================================================
// Severity
// =============================================================================

/// Finding severity. Ordered so that `Critical > Warning > Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// Lenient parse used for provider output ("High" and "error" map to the
    /// nearest bucket).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "critical" | "high" | "error" => Some(Severity::Critical),
            "warning" | "warn" | "medium" | "moderate" => Some(Severity::Warning),
            "info" | "low" | "note" => Some(Severity::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Findings
// =============================================================================

/// Where a finding lives in the repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub end_line: u32,
}

/// Counts of code transitively affected by a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastRadius {
    #[serde(default)]
    pub files_affected: u32,
    #[serde(default)]
    pub functions_affected: u32,
    #[serde(default)]
    pub endpoints_affected: u32,
}

/// A single detected issue. Immutable once a stage has emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Unique within an analysis. Empty means the producer never assigned
    /// one and the finding is treated as malformed by the aggregator.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub finding_type: String,
    pub severity: Severity,
    /// Stage/agent that produced the finding (`security`, `quality`, ...).
    pub agent: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub blast_radius: BlastRadius,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cve: Option<String>,
    #[serde(default)]
    pub chain_ids: Vec<String>,
}

impl Finding {
    pub fn new(
        id: impl Into<String>,
        finding_type: impl Into<String>,
        severity: Severity,
        agent: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            finding_type: finding_type.into(),
            severity,
            agent: agent.into(),
            title: title.into(),
            description: String::new(),
            location: Location::default(),
            blast_radius: BlastRadius::default(),
            confidence: 0.5,
            cve: None,
            chain_ids: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attach affected files; the blast radius file count follows.
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.blast_radius.files_affected = files.len() as u32;
        self.location.files = files;
        self
    }

    pub fn with_lines(mut self, start_line: u32, end_line: u32) -> Self {
        self.location.start_line = start_line;
        self.location.end_line = end_line;
        self
    }

    /// Confidence is clamped to `[0, 1]`; NaN becomes 0.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }

    pub fn with_cve(mut self, cve: impl Into<String>) -> Self {
        self.cve = Some(cve.into());
        self
    }

    pub fn with_chain(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_ids.push(chain_id.into());
        self
    }

    /// A finding without an id cannot be referenced and is dropped on merge.
    pub fn is_well_formed(&self) -> bool {
        !self.id.trim().is_empty()
    }
}

/// Clamp a score into `[0, 1]`.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// =============================================================================
// Fixes
// =============================================================================

/// Remediation write-up attached to a fix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixDocumentation {
    #[serde(default)]
    pub whats_wrong: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_code: Option<String>,
}

/// A remediation resolving one or more findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    pub id: String,
    /// Ascending: 1 is the most urgent.
    pub priority: u32,
    pub title: String,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub fix_type: String,
    #[serde(default)]
    pub estimated_effort: String,
    pub findings_resolved: Vec<String>,
    #[serde(default)]
    pub documentation: FixDocumentation,
}

// =============================================================================
// Repository metadata
// =============================================================================

/// One file in the ingested inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Relative path with forward slashes.
    pub path: String,
    pub name: String,
    pub extension: String,
    pub language: String,
    pub lines: u32,
    pub category: String,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, language: impl Into<String>, lines: u32) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        let extension = name
            .rfind('.')
            .filter(|idx| *idx > 0)
            .map(|idx| name[idx..].to_lowercase())
            .unwrap_or_default();
        Self {
            path,
            name,
            extension,
            language: language.into(),
            lines,
            category: "unknown".to_string(),
        }
    }
}

/// A declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    pub version: String,
    pub is_dev: bool,
    /// Manifest that declares it (`package.json`, `requirements.txt`, ...).
    #[serde(default)]
    pub manifest: String,
}

impl Dependency {
    pub fn new(name: impl Into<String>, version: impl Into<String>, is_dev: bool) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            is_dev,
            manifest: String::new(),
        }
    }

    pub fn declared_in(mut self, manifest: impl Into<String>) -> Self {
        self.manifest = manifest.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedStack {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub package_manager: String,
    pub build_system: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoStats {
    pub total_files: u64,
    pub total_lines: u64,
    pub total_dependencies: u64,
    pub total_dev_dependencies: u64,
    pub total_functions: u64,
    pub total_endpoints: u64,
}

/// Output of metadata ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoMetadata {
    pub files: Vec<FileEntry>,
    pub dependencies: Vec<Dependency>,
    pub detected_stack: DetectedStack,
    pub stats: RepoStats,
}

// =============================================================================
// Analysis state machine
// =============================================================================

/// Lifecycle of one audit run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Queued,
    Cloning,
    Mapping,
    Analyzing,
    Completing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::Cloning => "cloning",
            AnalysisStatus::Mapping => "mapping",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Completing => "completing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(AnalysisStatus::Queued),
            "cloning" => Some(AnalysisStatus::Cloning),
            "mapping" => Some(AnalysisStatus::Mapping),
            "analyzing" => Some(AnalysisStatus::Analyzing),
            "completing" => Some(AnalysisStatus::Completing),
            "completed" => Some(AnalysisStatus::Completed),
            "failed" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }

    /// The single forward successor on the success path.
    fn successor(&self) -> Option<Self> {
        match self {
            AnalysisStatus::Queued => Some(AnalysisStatus::Cloning),
            AnalysisStatus::Cloning => Some(AnalysisStatus::Mapping),
            AnalysisStatus::Mapping => Some(AnalysisStatus::Analyzing),
            AnalysisStatus::Analyzing => Some(AnalysisStatus::Completing),
            AnalysisStatus::Completing => Some(AnalysisStatus::Completed),
            AnalysisStatus::Completed | AnalysisStatus::Failed => None,
        }
    }

    pub fn can_transition_to(&self, next: AnalysisStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == AnalysisStatus::Failed || self.successor() == Some(next)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: AnalysisStatus,
    pub to: AnalysisStatus,
}

/// One audit run and everything it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub analysis_id: String,
    pub repo_url: String,
    pub repo_name: String,
    pub branch: Option<String>,
    pub status: AnalysisStatus,
    pub detected_stack: Option<DetectedStack>,
    pub stats: Option<RepoStats>,
    pub findings: Vec<Finding>,
    pub findings_summary: Option<FindingsSummary>,
    pub fixes: Vec<Fix>,
    pub health_score: Option<HealthScore>,
    pub graph: Option<Graph>,
    pub graph_persistence: Option<GraphPersistence>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
}

impl Analysis {
    /// A freshly submitted, queued analysis.
    pub fn new(analysis_id: impl Into<String>, repo_url: impl Into<String>, branch: Option<String>) -> Self {
        let repo_url = repo_url.into();
        let now = Utc::now();
        Self {
            analysis_id: analysis_id.into(),
            repo_name: repo_name_from_url(&repo_url),
            repo_url,
            branch: branch.filter(|b| !b.trim().is_empty()),
            status: AnalysisStatus::Queued,
            detected_stack: None,
            stats: None,
            findings: Vec::new(),
            findings_summary: None,
            fixes: Vec::new(),
            health_score: None,
            graph: None,
            graph_persistence: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            duration_seconds: None,
        }
    }

    /// Advance the state machine.
    pub fn transition(&mut self, next: AnalysisStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Move to `Failed` with a message truncated to `max_chars`.
    pub fn fail(&mut self, message: &str, max_chars: usize) -> Result<(), TransitionError> {
        self.transition(AnalysisStatus::Failed)?;
        self.error_message = Some(truncate_chars(message, max_chars));
        Ok(())
    }
}

/// `https://github.com/org/repo.git` -> `repo`.
pub fn repo_name_from_url(repo_url: &str) -> String {
    let trimmed = repo_url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        trimmed.to_string()
    } else {
        name.to_string()
    }
}

/// Cut a string to at most `max_chars` characters (not bytes).
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

// =============================================================================
// Audit trail
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Success => "success",
            ToolCallStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ToolCallStatus::Success),
            "error" => Some(ToolCallStatus::Error),
            _ => None,
        }
    }
}

/// Append-only record of one external capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub analysis_id: String,
    pub tool_name: String,
    pub step_name: String,
    pub endpoint: String,
    pub request_payload: Option<serde_json::Value>,
    pub response_payload: Option<serde_json::Value>,
    pub latency_ms: u64,
    pub status: ToolCallStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_total_order() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(
            [Severity::Info, Severity::Critical, Severity::Warning]
                .iter()
                .max(),
            Some(&Severity::Critical)
        );
    }

    #[test]
    fn test_severity_lenient_parse() {
        assert_eq!(Severity::parse("High"), Some(Severity::Critical));
        assert_eq!(Severity::parse(" warning "), Some(Severity::Warning));
        assert_eq!(Severity::parse("low"), Some(Severity::Info));
        assert_eq!(Severity::parse("???"), None);
    }

    #[test]
    fn test_status_happy_path() {
        let mut analysis = Analysis::new("a1", "https://github.com/acme/shop.git", None);
        for next in [
            AnalysisStatus::Cloning,
            AnalysisStatus::Mapping,
            AnalysisStatus::Analyzing,
            AnalysisStatus::Completing,
            AnalysisStatus::Completed,
        ] {
            analysis.transition(next).unwrap();
        }
        assert_eq!(analysis.status, AnalysisStatus::Completed);
        assert!(analysis.completed_at.is_some());
    }

    #[test]
    fn test_status_rejects_skips_and_terminal_exits() {
        let mut analysis = Analysis::new("a1", "repo", None);
        assert!(analysis.transition(AnalysisStatus::Analyzing).is_err());

        analysis.transition(AnalysisStatus::Failed).unwrap();
        let err = analysis.transition(AnalysisStatus::Cloning).unwrap_err();
        assert_eq!(err.from, AnalysisStatus::Failed);
        assert!(analysis.transition(AnalysisStatus::Failed).is_err());
    }

    #[test]
    fn test_fail_from_any_non_terminal_state() {
        let mut analysis = Analysis::new("a1", "repo", None);
        analysis.transition(AnalysisStatus::Cloning).unwrap();
        analysis.transition(AnalysisStatus::Mapping).unwrap();
        analysis.fail(&"x".repeat(3000), 2000).unwrap();
        assert_eq!(analysis.status, AnalysisStatus::Failed);
        assert_eq!(analysis.error_message.as_ref().unwrap().len(), 2000);
    }

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(repo_name_from_url("https://github.com/acme/shop.git"), "shop");
        assert_eq!(repo_name_from_url("git@github.com:acme/api"), "api");
        assert_eq!(repo_name_from_url("https://github.com/acme/web/"), "web");
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_file_entry_derives_name_and_extension() {
        let entry = FileEntry::new("src/app/Main.TS", "TypeScript", 12);
        assert_eq!(entry.name, "Main.TS");
        assert_eq!(entry.extension, ".ts");
        assert_eq!(entry.category, "unknown");

        let dotfile = FileEntry::new(".env", "", 1);
        assert_eq!(dotfile.extension, "");
    }

    #[test]
    fn test_finding_builder_clamps_confidence() {
        let finding = Finding::new("f1", "code_smell", Severity::Warning, "quality", "x")
            .with_confidence(1.7)
            .with_files(vec!["a.py".into(), "b.py".into()]);
        assert_eq!(finding.confidence, 1.0);
        assert_eq!(finding.blast_radius.files_affected, 2);
        assert!(finding.is_well_formed());
        assert!(!Finding::new("  ", "t", Severity::Info, "a", "t").is_well_formed());
    }
}
