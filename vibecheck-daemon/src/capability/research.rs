//! Web research providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::http::{post_json, require_key, LazyClient};
use super::Provider;
use crate::error::CapabilityError;

pub const TAVILY_BASE: &str = "https://api.tavily.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub search_depth: String,
    pub max_results: u32,
    pub include_domains: Vec<String>,
    pub include_answer: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            search_depth: "advanced".to_string(),
            max_results: 5,
            include_domains: Vec::new(),
            include_answer: true,
        }
    }
}

impl SearchOptions {
    pub fn with_domains(mut self, domains: &[&str]) -> Self {
        self.include_domains = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

#[async_trait]
pub trait ResearchProvider: Provider {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse, CapabilityError>;

    /// Page text of each URL that could be fetched.
    async fn extract_content(&self, urls: &[String]) -> Result<Vec<String>, CapabilityError>;
}

pub struct TavilyProvider {
    api_key: Option<String>,
    client: Arc<LazyClient>,
    timeout: Duration,
}

impl TavilyProvider {
    pub fn new(api_key: Option<String>, client: Arc<LazyClient>, timeout: Duration) -> Self {
        Self {
            api_key,
            client,
            timeout,
        }
    }

    /// The key travels in the body; callers log the logical request only.
    async fn call(&self, operation: &str, mut body: Value) -> Result<Value, CapabilityError> {
        let key = require_key(&self.api_key, "tavily")?;
        let client = self.client.get()?;
        body["api_key"] = Value::String(key.to_string());
        post_json(client, &self.endpoint(operation), &[], &body, self.timeout).await
    }
}

impl Provider for TavilyProvider {
    fn name(&self) -> &str {
        "tavily"
    }

    fn endpoint(&self, operation: &str) -> String {
        match operation {
            "extract" => format!("{}/extract", TAVILY_BASE),
            _ => format!("{}/search", TAVILY_BASE),
        }
    }

    fn check_available(&self) -> Result<(), CapabilityError> {
        require_key(&self.api_key, "tavily")?;
        self.client.check()
    }
}

#[async_trait]
impl ResearchProvider for TavilyProvider {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse, CapabilityError> {
        let mut body = json!({
            "query": query,
            "search_depth": options.search_depth,
            "max_results": options.max_results,
            "include_answer": options.include_answer,
        });
        if !options.include_domains.is_empty() {
            body["include_domains"] = json!(options.include_domains);
        }
        let data = self.call("search", body).await?;
        serde_json::from_value(data).map_err(|e| CapabilityError::InvalidResponse(e.to_string()))
    }

    async fn extract_content(&self, urls: &[String]) -> Result<Vec<String>, CapabilityError> {
        let data = self.call("extract", json!({ "urls": urls })).await?;
        Ok(parse_extract(&data))
    }
}

/// `results[].raw_content` (or `content`) of an extract response.
pub fn parse_extract(data: &Value) -> Vec<String> {
    data.get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|r| {
                    r.get("raw_content")
                        .or_else(|| r.get("content"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}
