//! The analysis stages.
//!
//! Every stage talks to providers only through [`Capabilities`] and turns an
//! exhausted capability into an empty result. A stage returns `Err` only
//! when its output cannot be interpreted at all; the engine degrades that to
//! an empty contribution.

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vibecheck_core::{
    clamp_unit, truncate_chars, FileEntry, Finding, Fix, FixDocumentation, RepoMetadata, Severity,
};

use crate::capability::classification::cve_ids;
use crate::capability::{CallContext, Capabilities, SearchOptions};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::Broadcaster;

pub const FILE_CATEGORIES: &[&str] = &["source", "test", "config", "docs", "assets", "build", "ci-cd"];
pub const QUALITY_CATEGORIES: &[&str] = &[
    "clean",
    "unhandled_error",
    "type_mismatch",
    "dead_code",
    "god_function",
    "magic_number",
    "deep_nesting",
    "duplicated_logic",
];
pub const CVE_DOMAINS: &[&str] = &["nvd.nist.gov", "github.com/advisories", "security.snyk.io"];

/// In-flight classification calls per stage.
const CLASSIFY_CONCURRENCY: usize = 4;
/// Characters of a source file sent for quality classification.
const QUALITY_SAMPLE_CHARS: usize = 3000;
const STEP_NAME_CHARS: usize = 30;
const DESCRIPTION_CHARS: usize = 500;
const ANSWER_CONTEXT_CHARS: usize = 300;
const CVE_CONTEXT_CHARS: usize = 2000;
const BEST_PRACTICE_RESULTS: usize = 5;
/// Findings listed in the remediation prompt.
const FIX_PROMPT_FINDINGS: usize = 50;

const DEEP_ANALYSIS_SYSTEM: &str = "You are a senior security and code-quality analyst. \
Analyze the repository data and produce structured findings. Focus on critical security \
issues, dependency vulnerabilities, and architecture anti-patterns. Return valid JSON.";

const REMEDIATION_SYSTEM: &str = "You are a senior engineer writing a remediation plan. \
Group related findings into prioritized fixes with concrete steps. Only reference finding \
ids you were given. Return valid JSON.";

/// What every stage needs to reach providers and publish tool activity.
pub struct StageEnv<'a> {
    pub analysis_id: &'a str,
    pub capabilities: &'a Capabilities,
    pub config: &'a PipelineConfig,
    pub events: &'a Arc<Broadcaster>,
}

impl StageEnv<'_> {
    pub fn ctx(&self, step: impl Into<String>) -> CallContext {
        CallContext::new(self.analysis_id, step).with_events(Arc::clone(self.events))
    }
}

fn step_suffix(name: &str) -> String {
    name.chars().take(STEP_NAME_CHARS).collect()
}

fn owned(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Mapping
// =============================================================================

/// Category of each of the first `classify_limit` files, in file order.
///
/// Files whose classification is exhausted get `unknown`. The caller applies
/// the result with [`apply_categories`].
pub async fn classify_files(env: &StageEnv<'_>, metadata: &RepoMetadata) -> Vec<String> {
    let categories = owned(FILE_CATEGORIES);
    let categories = &categories;
    let classification = &env.capabilities.classification;

    let jobs: Vec<(String, CallContext)> = metadata
        .files
        .iter()
        .take(env.config.classify_limit)
        .map(|f| {
            let text = format!("{} | {} | {}", f.path, f.extension, f.language);
            let ctx = env.ctx(format!("classify_file_{}", step_suffix(&f.name)));
            (text, ctx)
        })
        .collect();

    stream::iter(jobs)
        .map(|(text, ctx)| async move {
            classification
                .classify(&ctx, &text, categories)
                .await
                .into_value()
                .map(|c| c.label)
                .unwrap_or_else(|| "unknown".to_string())
        })
        .buffered(CLASSIFY_CONCURRENCY)
        .collect()
        .await
}

pub fn apply_categories(metadata: &mut RepoMetadata, labels: Vec<String>) {
    for (file, label) in metadata.files.iter_mut().zip(labels) {
        file.category = label;
    }
}

// =============================================================================
// Vulnerability search
// =============================================================================

#[derive(Debug, Default)]
pub struct VulnerabilityReport {
    pub findings: Vec<Finding>,
    /// Research answers, kept as context for deep analysis.
    pub answers: Vec<String>,
}

/// Search known vulnerabilities of the runtime dependencies.
///
/// Dependencies are queried in batches; every CVE identifier found in an
/// answer or result becomes one finding, attributed to the batch package
/// named next to it.
pub async fn vulnerability_search(env: &StageEnv<'_>, metadata: &RepoMetadata) -> VulnerabilityReport {
    let runtime: Vec<_> = metadata
        .dependencies
        .iter()
        .filter(|d| !d.is_dev)
        .take(env.config.cve_dependency_limit)
        .collect();
    let mut report = VulnerabilityReport::default();
    if runtime.is_empty() {
        debug!("No runtime dependencies to search for {}", env.analysis_id);
        return report;
    }

    let options = SearchOptions::default().with_domains(CVE_DOMAINS);
    let mut seen = HashSet::new();

    for (i, batch) in runtime.chunks(env.config.cve_batch_size.max(1)).enumerate() {
        let query = batch
            .iter()
            .map(|d| format!("\"{}\" \"{}\" CVE vulnerability", d.name, d.version))
            .collect::<Vec<_>>()
            .join(" ");
        let ctx = env.ctx(format!("cve_search_batch_{}", i));
        let Some(response) = env.capabilities.research.search(&ctx, &query, &options).await.into_value()
        else {
            continue;
        };

        let mut chunks: Vec<(String, f64)> = Vec::new();
        if let Some(answer) = response.answer.filter(|a| !a.trim().is_empty()) {
            report.answers.push(answer.clone());
            chunks.push((answer, 0.7));
        }
        for result in response.results {
            chunks.push((format!("{} {}", result.title, result.content), result.score));
        }

        for (j, (text, score)) in chunks.iter().enumerate() {
            let lowered = text.to_lowercase();
            let extract = ctx.step(format!("cve_extract_batch_{}_{}", i, j));
            for cve in extract_cves(env, &extract, text).await {
                if !seen.insert(cve.clone()) {
                    continue;
                }
                let dep = batch
                    .iter()
                    .find(|d| lowered.contains(&d.name.to_lowercase()))
                    .unwrap_or(&batch[0]);
                let severity = if ["critical", "high", "remote code execution"]
                    .iter()
                    .any(|k| lowered.contains(k))
                {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                let mut finding = Finding::new(
                    format!("sec-{}", cve),
                    "dependency_vulnerability",
                    severity,
                    "security",
                    format!("{} in {}@{}", cve, dep.name, dep.version),
                )
                .with_description(truncate_chars(text.trim(), DESCRIPTION_CHARS))
                .with_confidence(if *score > 0.0 { *score } else { 0.7 })
                .with_cve(cve);
                if !dep.manifest.is_empty() {
                    finding = finding.with_files(vec![dep.manifest.clone()]);
                }
                report.findings.push(finding);
            }
        }
    }

    info!(
        "Vulnerability search for {}: {} findings from {} dependencies",
        env.analysis_id,
        report.findings.len(),
        runtime.len()
    );
    report
}

/// CVE ids named in `text`, in order of appearance.
///
/// Entities come from the classification capability; when it is exhausted
/// the identifiers are matched locally.
async fn extract_cves(env: &StageEnv<'_>, ctx: &CallContext, text: &str) -> Vec<String> {
    let labels = owned(&["cve"]);
    match env
        .capabilities
        .classification
        .extract_entities(ctx, text, &labels)
        .await
        .into_value()
    {
        Some(entities) => {
            let mut seen = HashSet::new();
            entities
                .iter()
                .filter(|e| e.label == "cve")
                .flat_map(|e| cve_ids(&e.text.trim().to_uppercase()))
                .filter(|id| seen.insert(id.clone()))
                .collect()
        }
        None => cve_ids(text),
    }
}

// =============================================================================
// Best-practice research
// =============================================================================

/// Informational findings from one best-practice search on the detected stack.
pub async fn best_practice_research(env: &StageEnv<'_>, metadata: &RepoMetadata) -> Vec<Finding> {
    let stack = &metadata.detected_stack;
    let frameworks: Vec<&String> = stack
        .frameworks
        .iter()
        .filter(|f| f.as_str() != "Unknown")
        .collect();
    let subjects = if frameworks.is_empty() {
        stack.languages.iter().collect()
    } else {
        frameworks
    };
    if subjects.is_empty() {
        return Vec::new();
    }

    let query = format!(
        "Security best practices and common vulnerabilities for {} applications",
        subjects.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
    );
    let options = SearchOptions::default().with_max_results(BEST_PRACTICE_RESULTS as u32);
    let ctx = env.ctx("best_practice_research");
    let Some(response) = env.capabilities.research.search(&ctx, &query, &options).await.into_value()
    else {
        return Vec::new();
    };
    let mut results: Vec<_> = response.results.into_iter().take(BEST_PRACTICE_RESULTS).collect();

    // Results without a snippet get the page text instead.
    let bare: Vec<usize> = (0..results.len())
        .filter(|&i| results[i].content.trim().is_empty() && !results[i].url.is_empty())
        .collect();
    if !bare.is_empty() {
        let urls: Vec<String> = bare.iter().map(|&i| results[i].url.clone()).collect();
        let pages = env
            .capabilities
            .research
            .extract_content(&ctx.step("best_practice_extract"), &urls)
            .await
            .into_value()
            .unwrap_or_default();
        for (&i, page) in bare.iter().zip(pages) {
            results[i].content = page;
        }
    }

    results
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            let title = if r.title.trim().is_empty() { r.url.clone() } else { r.title };
            Finding::new(
                format!("bp-{:03}", i + 1),
                "best_practice",
                Severity::Info,
                "research",
                title,
            )
            .with_description(truncate_chars(&r.content, DESCRIPTION_CHARS))
            .with_confidence(clamp_unit(r.score))
        })
        .collect()
}

// =============================================================================
// Code quality
// =============================================================================

/// Classify a sample of each source file; anything not `clean` is a warning.
pub async fn code_quality(env: &StageEnv<'_>, root: &Path, metadata: &RepoMetadata) -> Vec<Finding> {
    let categories = owned(QUALITY_CATEGORIES);
    let categories = &categories;
    let classification = &env.capabilities.classification;

    let sources: Vec<FileEntry> = metadata
        .files
        .iter()
        .filter(|f| f.category == "source")
        .take(env.config.quality_limit)
        .cloned()
        .collect();

    let labelled: Vec<_> = stream::iter(sources)
        .map(|file| async move {
            let bytes = match tokio::fs::read(root.join(&file.path)).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Skipping quality check of {}: {}", file.path, e);
                    return (file, None);
                }
            };
            let sample = truncate_chars(&String::from_utf8_lossy(&bytes), QUALITY_SAMPLE_CHARS);
            let ctx = env.ctx(format!("quality_{}", step_suffix(&file.name)));
            let label = classification
                .classify(&ctx, &sample, categories)
                .await
                .into_value();
            (file, label)
        })
        .buffered(CLASSIFY_CONCURRENCY)
        .collect()
        .await;

    let mut findings = Vec::new();
    for (file, label) in labelled {
        let Some(label) = label else { continue };
        if label.label == "clean" || label.label.is_empty() {
            continue;
        }
        let readable = label.label.replace('_', " ");
        findings.push(
            Finding::new(
                format!("q-{:03}", findings.len() + 1),
                "code_smell",
                Severity::Warning,
                "quality",
                format!("{} in {}", title_case(&readable), file.name),
            )
            .with_description(format!("detected {} pattern in {}", readable, file.path))
            .with_files(vec![file.path.clone()])
            .with_lines(1, file.lines.max(1))
            .with_confidence(label.score),
        );
    }
    findings
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Deep pattern analysis
// =============================================================================

fn findings_schema() -> Value {
    json!({
        "name": "analysis_findings",
        "strict": true,
        "schema": {
            "type": "object",
            "properties": {
                "findings": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "type": { "type": "string" },
                            "severity": { "type": "string", "enum": ["critical", "warning", "info"] },
                            "agent": { "type": "string" },
                            "title": { "type": "string" },
                            "description": { "type": "string" },
                            "confidence": { "type": "number" },
                            "files": { "type": "array", "items": { "type": "string" } },
                            "chainIds": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["id", "type", "severity", "agent", "title", "description", "confidence",
                                     "files", "chainIds"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["findings"],
            "additionalProperties": false
        }
    })
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    finding_type: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    files: Vec<String>,
    /// Findings that share a chain id exploit each other.
    #[serde(default, rename = "chainIds")]
    chain_ids: Vec<String>,
}

impl From<RawFinding> for Finding {
    fn from(raw: RawFinding) -> Self {
        let severity = raw
            .severity
            .as_deref()
            .and_then(Severity::parse)
            .unwrap_or(Severity::Info);
        let mut finding = Finding::new(
            raw.id.trim(),
            raw.finding_type.unwrap_or_else(|| "code_issue".to_string()),
            severity,
            raw.agent.unwrap_or_else(|| "pattern".to_string()),
            raw.title,
        )
        .with_description(raw.description)
        .with_confidence(raw.confidence.unwrap_or(0.5));
        if !raw.files.is_empty() {
            finding = finding.with_files(raw.files);
        }
        for chain_id in raw.chain_ids.into_iter().filter(|c| !c.trim().is_empty()) {
            finding = finding.with_chain(chain_id.trim());
        }
        finding
    }
}

/// Parse a `{"findings": [...]}` reply. Entries without an id are kept with
/// an empty id; the merge step drops them.
pub fn parse_findings(value: &Value) -> Result<Vec<Finding>, PipelineError> {
    let items = value
        .get("findings")
        .and_then(Value::as_array)
        .ok_or_else(|| PipelineError::stage("deep_analysis", "response has no findings array"))?;
    Ok(items
        .iter()
        .filter_map(|item| match RawFinding::deserialize(item) {
            Ok(raw) => Some(Finding::from(raw)),
            Err(e) => {
                debug!("Dropping unreadable finding: {}", e);
                None
            }
        })
        .collect())
}

/// Cross-cutting findings from the reasoning capability.
pub async fn deep_patterns(
    env: &StageEnv<'_>,
    metadata: &RepoMetadata,
    cve_answers: &[String],
    prior_findings: usize,
) -> Result<Vec<Finding>, PipelineError> {
    let stack = serde_json::to_string(&metadata.detected_stack).unwrap_or_default();
    let intelligence = truncate_chars(
        &cve_answers
            .iter()
            .map(|a| truncate_chars(a, ANSWER_CONTEXT_CHARS))
            .collect::<Vec<_>>()
            .join("\n"),
        CVE_CONTEXT_CHARS,
    );
    let user = format!(
        "Repository context:\n\
         - Files: {}\n\
         - Lines: {}\n\
         - Stack: {}\n\
         - Dependencies: {}\n\
         - CVE search batches with answers: {}\n\
         - Findings so far: {}\n\n\
         CVE intelligence:\n{}\n\n\
         Identify the most important security and architecture findings.",
        metadata.stats.total_files,
        metadata.stats.total_lines,
        stack,
        metadata.dependencies.len(),
        cve_answers.len(),
        prior_findings,
        if intelligence.is_empty() { "none" } else { intelligence.as_str() },
    );

    let ctx = env.ctx("deep_analysis");
    match env
        .capabilities
        .reasoning
        .reason_structured(&ctx, DEEP_ANALYSIS_SYSTEM, &user, &findings_schema())
        .await
        .into_value()
    {
        Some(value) => parse_findings(&value),
        None => Ok(Vec::new()),
    }
}

// =============================================================================
// Fix generation
// =============================================================================

fn fixes_schema() -> Value {
    json!({
        "name": "remediation_plan",
        "strict": true,
        "schema": {
            "type": "object",
            "properties": {
                "fixes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "priority": { "type": "integer" },
                            "title": { "type": "string" },
                            "severity": { "type": "string", "enum": ["critical", "warning", "info"] },
                            "type": { "type": "string" },
                            "estimatedEffort": { "type": "string" },
                            "findingsResolved": { "type": "array", "items": { "type": "string" } },
                            "documentation": {
                                "type": "object",
                                "properties": {
                                    "whatsWrong": { "type": "string" },
                                    "steps": { "type": "array", "items": { "type": "string" } }
                                },
                                "required": ["whatsWrong", "steps"],
                                "additionalProperties": false
                            }
                        },
                        "required": ["id", "priority", "title", "severity", "type", "estimatedEffort",
                                     "findingsResolved", "documentation"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["fixes"],
            "additionalProperties": false
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFix {
    #[serde(default)]
    id: String,
    #[serde(default)]
    priority: Option<u32>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default, rename = "type")]
    fix_type: Option<String>,
    #[serde(default)]
    estimated_effort: String,
    #[serde(default)]
    findings_resolved: Vec<String>,
    #[serde(default)]
    documentation: FixDocumentation,
}

/// Parse a `{"fixes": [...]}` reply against the known finding ids.
///
/// References to unknown findings are dropped, and so is a fix left with
/// none. Missing ids become `fix-NNN`; the result is ordered by priority.
pub fn parse_fixes(value: &Value, findings: &[Finding]) -> Vec<Fix> {
    let known: HashSet<&str> = findings.iter().map(|f| f.id.as_str()).collect();
    let Some(items) = value.get("fixes").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut fixes: Vec<Fix> = items
        .iter()
        .filter_map(|item| RawFix::deserialize(item).ok())
        .filter_map(|raw| {
            let resolved: Vec<String> = raw
                .findings_resolved
                .into_iter()
                .filter(|id| known.contains(id.as_str()))
                .collect();
            if resolved.is_empty() {
                return None;
            }
            let severity = raw
                .severity
                .as_deref()
                .and_then(Severity::parse)
                .unwrap_or_else(|| worst_severity(findings, &resolved));
            Some(Fix {
                id: raw.id.trim().to_string(),
                priority: raw.priority.unwrap_or(u32::MAX),
                title: raw.title,
                severity,
                fix_type: raw.fix_type.unwrap_or_else(|| "remediation".to_string()),
                estimated_effort: raw.estimated_effort,
                findings_resolved: resolved,
                documentation: raw.documentation,
            })
        })
        .collect();

    fixes.sort_by_key(|f| f.priority);
    for (i, fix) in fixes.iter_mut().enumerate() {
        fix.priority = i as u32 + 1;
        if fix.id.is_empty() {
            fix.id = format!("fix-{:03}", i + 1);
        }
    }
    fixes
}

fn worst_severity(findings: &[Finding], ids: &[String]) -> Severity {
    findings
        .iter()
        .filter(|f| ids.contains(&f.id))
        .map(|f| f.severity)
        .max()
        .unwrap_or(Severity::Info)
}

/// One fix per finding type among critical and warning findings.
///
/// Ordered by worst severity, then group size, then type name.
pub fn derive_fixes(findings: &[Finding]) -> Vec<Fix> {
    let mut groups: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for finding in findings.iter().filter(|f| f.severity != Severity::Info) {
        groups.entry(finding.finding_type.as_str()).or_default().push(finding);
    }

    let mut ranked: Vec<(&str, Vec<&Finding>, Severity)> = groups
        .into_iter()
        .map(|(kind, members)| {
            let worst = members
                .iter()
                .map(|f| f.severity)
                .max()
                .unwrap_or(Severity::Warning);
            (kind, members, worst)
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.2.cmp(&a.2)
            .then(b.1.len().cmp(&a.1.len()))
            .then(a.0.cmp(b.0))
    });

    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (kind, members, severity))| {
            let readable = kind.replace('_', " ");
            let count = members.len();
            let steps = if kind == "dependency_vulnerability" {
                vec![
                    "Upgrade each affected package to a patched release".to_string(),
                    "Regenerate the lockfile and rerun the test suite".to_string(),
                ]
            } else {
                vec![
                    format!("Review each {} finding at its reported location", readable),
                    "Apply the fix and add a regression test".to_string(),
                ]
            };
            Fix {
                id: format!("fix-{:03}", i + 1),
                priority: i as u32 + 1,
                title: format!("Resolve {} {} finding{}", count, readable, if count == 1 { "" } else { "s" }),
                severity,
                fix_type: kind.to_string(),
                estimated_effort: match count {
                    0 | 1 => "small",
                    2 | 3 => "medium",
                    _ => "large",
                }
                .to_string(),
                findings_resolved: members.iter().map(|f| f.id.clone()).collect(),
                documentation: FixDocumentation {
                    whats_wrong: members
                        .iter()
                        .map(|f| f.title.as_str())
                        .collect::<Vec<_>>()
                        .join("; "),
                    steps,
                    before_code: None,
                    after_code: None,
                },
            }
        })
        .collect()
}

/// Prioritized fixes for the merged findings.
///
/// The reasoning capability is asked first; an exhausted capability or a
/// plan that resolves nothing falls back to [`derive_fixes`].
pub async fn generate_fixes(env: &StageEnv<'_>, findings: &[Finding]) -> Vec<Fix> {
    if findings.is_empty() {
        return Vec::new();
    }

    let listing = findings
        .iter()
        .take(FIX_PROMPT_FINDINGS)
        .map(|f| format!("- {} [{}] {}: {}", f.id, f.severity.as_str(), f.finding_type, f.title))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!("Findings:\n{}\n\nProduce a prioritized remediation plan.", listing);

    let ctx = env.ctx("generate_fixes");
    let planned = env
        .capabilities
        .reasoning
        .reason_structured(&ctx, REMEDIATION_SYSTEM, &user, &fixes_schema())
        .await
        .into_value()
        .map(|value| parse_fixes(&value, findings))
        .unwrap_or_default();

    if planned.is_empty() {
        warn!(
            "No usable remediation plan for {}, deriving fixes locally",
            env.analysis_id
        );
        return derive_fixes(findings);
    }
    planned
}
