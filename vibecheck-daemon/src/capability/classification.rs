//! Text classification and entity extraction providers.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use vibecheck_core::{clamp_unit, truncate_chars};

use super::http::{post_json, require_key, LazyClient};
use super::Provider;
use crate::error::CapabilityError;

pub const FASTINO_ENDPOINT: &str = "https://api.fastino.com/gliner-2";

/// Hosted model input cap, in characters.
const MAX_TEXT_CHARS: usize = 8000;
const THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    /// Confidence in [0, 1].
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub label: String,
    pub text: String,
    pub score: f64,
}

#[async_trait]
pub trait ClassificationProvider: Provider {
    /// Pick one of `categories` for `text`.
    async fn classify(&self, text: &str, categories: &[String]) -> Result<Classification, CapabilityError>;

    /// Spans of `text` matching any of `labels`.
    async fn extract_entities(&self, text: &str, labels: &[String]) -> Result<Vec<Entity>, CapabilityError>;
}

/// Hosted GLiNER-2 endpoint.
pub struct FastinoProvider {
    api_key: Option<String>,
    client: Arc<LazyClient>,
    timeout: Duration,
}

impl FastinoProvider {
    pub fn new(api_key: Option<String>, client: Arc<LazyClient>, timeout: Duration) -> Self {
        Self {
            api_key,
            client,
            timeout,
        }
    }

    async fn call(&self, body: Value) -> Result<Value, CapabilityError> {
        let key = require_key(&self.api_key, "fastino")?;
        let client = self.client.get()?;
        let data = post_json(
            client,
            FASTINO_ENDPOINT,
            &[("x-api-key", key)],
            &body,
            self.timeout,
        )
        .await?;
        Ok(match data.get("result") {
            Some(result) => result.clone(),
            None => data,
        })
    }
}

impl Provider for FastinoProvider {
    fn name(&self) -> &str {
        "fastino"
    }

    fn endpoint(&self, _operation: &str) -> String {
        FASTINO_ENDPOINT.to_string()
    }

    fn check_available(&self) -> Result<(), CapabilityError> {
        require_key(&self.api_key, "fastino")?;
        self.client.check()
    }
}

#[async_trait]
impl ClassificationProvider for FastinoProvider {
    async fn classify(&self, text: &str, categories: &[String]) -> Result<Classification, CapabilityError> {
        let body = json!({
            "task": "classify_text",
            "text": truncate_chars(text, MAX_TEXT_CHARS),
            "schema": { "categories": categories },
            "threshold": THRESHOLD,
        });
        parse_classification(&self.call(body).await?)
    }

    async fn extract_entities(&self, text: &str, labels: &[String]) -> Result<Vec<Entity>, CapabilityError> {
        let body = json!({
            "task": "extract_entities",
            "text": truncate_chars(text, MAX_TEXT_CHARS),
            "schema": labels,
            "threshold": THRESHOLD,
        });
        Ok(parse_entities(&self.call(body).await?))
    }
}

/// Accepts `{label, score}`, `{category: {label, confidence}}` or
/// `{category: "label"}`.
pub fn parse_classification(result: &Value) -> Result<Classification, CapabilityError> {
    let (label, score) = if let Some(label) = result.get("label").and_then(Value::as_str) {
        (label, result.get("score").and_then(Value::as_f64))
    } else {
        match result.get("category") {
            Some(Value::String(label)) => (label.as_str(), None),
            Some(cat) => match cat.get("label").and_then(Value::as_str) {
                Some(label) => (label, cat.get("confidence").and_then(Value::as_f64)),
                None => {
                    return Err(CapabilityError::InvalidResponse(
                        "classification without label".into(),
                    ))
                }
            },
            None => {
                return Err(CapabilityError::InvalidResponse(
                    "classification without label".into(),
                ))
            }
        }
    };

    Ok(Classification {
        label: label.to_string(),
        score: clamp_unit(score.unwrap_or(THRESHOLD)),
    })
}

/// Accepts a flat `entities` list or a `label -> [span]` map.
pub fn parse_entities(result: &Value) -> Vec<Entity> {
    let entities = result.get("entities").unwrap_or(result);
    let mut out = Vec::new();

    let span = |label: &str, v: &Value| -> Option<Entity> {
        match v {
            Value::String(text) => Some(Entity {
                label: label.to_string(),
                text: text.clone(),
                score: THRESHOLD,
            }),
            Value::Object(_) => {
                let text = v.get("text").or_else(|| v.get("value"))?.as_str()?;
                let score = v
                    .get("confidence")
                    .or_else(|| v.get("score"))
                    .and_then(Value::as_f64)
                    .unwrap_or(THRESHOLD);
                Some(Entity {
                    label: label.to_string(),
                    text: text.to_string(),
                    score: clamp_unit(score),
                })
            }
            _ => None,
        }
    };

    match entities {
        Value::Array(items) => {
            for item in items {
                let label = item
                    .get("label")
                    .or_else(|| item.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                out.extend(span(label, item));
            }
        }
        Value::Object(map) => {
            for (label, values) in map {
                match values {
                    Value::Array(items) => out.extend(items.iter().filter_map(|v| span(label, v))),
                    other => out.extend(span(label, other)),
                }
            }
        }
        _ => {}
    }
    out
}

/// Offline classifier and extractor. Always available.
///
/// Categories with a keyword table score 3 per distinct keyword (1 for
/// `source`, whose table is mostly file extensions); any other category
/// scores 1 when every token of its name occurs in the text. The highest
/// score wins, ties go to the earlier category, and a text that matches
/// nothing gets the first category with score 0.
#[derive(Debug, Default)]
pub struct LexicalClassifier;

impl LexicalClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_sync(&self, text: &str, categories: &[String]) -> Classification {
        let tokens = tokenize(text);
        let mut best: Option<(&String, u32)> = None;

        for category in categories {
            let score = category_score(category, &tokens);
            match best {
                Some((_, top)) if top >= score => {}
                _ => best = Some((category, score)),
            }
        }

        match best {
            Some((label, hits)) => Classification {
                label: label.clone(),
                score: hits as f64 / (hits as f64 + 1.0),
            },
            None => Classification {
                label: "unknown".to_string(),
                score: 0.0,
            },
        }
    }

    pub fn extract_sync(&self, text: &str, labels: &[String]) -> Vec<Entity> {
        let mut out = Vec::new();
        for label in labels {
            let (regex, group, score) = match label.as_str() {
                "cve" => (&*CVE_ID, 0, 0.95),
                "version" => (&*VERSION, 1, 0.6),
                "package" => (&*PACKAGE_SPEC, 1, 0.6),
                _ => continue,
            };
            let mut seen = HashSet::new();
            for caps in regex.captures_iter(text) {
                if let Some(m) = caps.get(group) {
                    let value = m.as_str().to_string();
                    if seen.insert(value.clone()) {
                        out.push(Entity {
                            label: label.clone(),
                            text: value,
                            score,
                        });
                    }
                }
            }
        }
        out
    }
}

impl Provider for LexicalClassifier {
    fn name(&self) -> &str {
        "lexical"
    }

    fn endpoint(&self, _operation: &str) -> String {
        "local:lexical".to_string()
    }

    fn check_available(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

#[async_trait]
impl ClassificationProvider for LexicalClassifier {
    async fn classify(&self, text: &str, categories: &[String]) -> Result<Classification, CapabilityError> {
        Ok(self.classify_sync(text, categories))
    }

    async fn extract_entities(&self, text: &str, labels: &[String]) -> Result<Vec<Entity>, CapabilityError> {
        Ok(self.extract_sync(text, labels))
    }
}

fn keyword_table(category: &str) -> Option<(&'static [&'static str], u32)> {
    let table: (&'static [&'static str], u32) = match category {
        "source" => (
            &[
                "src", "lib", "app", "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "rb",
                "php", "cs", "cpp", "c", "h", "swift", "kt", "vue", "svelte",
            ],
            1,
        ),
        "test" => (
            &["test", "tests", "spec", "specs", "__tests__", "fixtures", "mock", "mocks", "e2e"],
            3,
        ),
        "config" => (
            &[
                "config", "configs", "settings", "toml", "yaml", "yml", "ini", "env", "json",
                "conf", "package", "tsconfig",
            ],
            3,
        ),
        "docs" => (
            &["docs", "doc", "md", "rst", "adoc", "readme", "changelog", "license", "contributing"],
            3,
        ),
        "assets" => (
            &[
                "assets", "static", "public", "images", "img", "png", "jpg", "jpeg", "gif", "svg",
                "ico", "webp", "woff", "woff2", "ttf", "css", "scss",
            ],
            3,
        ),
        "build" => (
            &[
                "build", "dockerfile", "makefile", "gradle", "cmake", "lock", "webpack", "vite",
                "rollup", "dist",
            ],
            3,
        ),
        "ci-cd" => (
            &["ci", "github", "workflows", "gitlab", "jenkinsfile", "circleci", "travis", "deploy"],
            3,
        ),
        _ => return None,
    };
    Some(table)
}

fn category_score(category: &str, tokens: &HashSet<String>) -> u32 {
    match keyword_table(category) {
        Some((keywords, weight)) => {
            keywords.iter().filter(|k| tokens.contains(**k)).count() as u32 * weight
        }
        None => {
            let parts: Vec<String> = category
                .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
                .filter(|p| !p.is_empty())
                .map(str::to_lowercase)
                .collect();
            u32::from(!parts.is_empty() && parts.iter().all(|p| tokens.contains(p)))
        }
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Distinct `CVE-YYYY-NNNN+` identifiers of `text`, in order of appearance.
pub fn cve_ids(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    CVE_ID
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

static CVE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"CVE-\d{4}-\d{4,}").unwrap());
static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bv?(\d+\.\d+(?:\.\d+)?)\b").unwrap());
static PACKAGE_SPEC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(@?[a-z][a-z0-9_.\-/]*)(?:@|==|>=|<=)v?\d").unwrap());
