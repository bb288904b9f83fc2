//! Capability providers with ordered fallback.
//!
//! A capability (reasoning, classification, web research) is backed by an
//! ordered list of providers. [`Capability::invoke`] tries them strictly in
//! order:
//!
//! - a provider reporting itself unavailable is skipped without an attempt;
//! - every real attempt runs under a timeout, is recorded by the
//!   [`AuditLogger`] and announced as a `tool_activity` event;
//! - the first success wins, failures fall through to the next provider;
//! - when nothing serves the call the outcome is [`CallOutcome::Exhausted`],
//!   never an error.

pub mod classification;
pub mod http;
pub mod reasoning;
pub mod research;

use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vibecheck_core::ToolCallStatus;

use crate::audit::{AuditEntry, AuditLogger};
use crate::config::{ApiKeys, ProviderConfig};
use crate::error::CapabilityError;
use crate::events::{AnalysisEvent, Broadcaster};

pub use classification::{
    Classification, ClassificationProvider, Entity, FastinoProvider, LexicalClassifier,
};
pub use http::LazyClient;
pub use reasoning::{ChatCompletionsProvider, ReasoningProvider};
pub use research::{ResearchProvider, SearchOptions, SearchResponse, SearchResult, TavilyProvider};

/// Identity shared by every concrete provider.
pub trait Provider: Send + Sync {
    /// Short name, used as the audit `tool_name`.
    fn name(&self) -> &str;

    /// Endpoint recorded for `operation`.
    fn endpoint(&self, operation: &str) -> String;

    /// `Err(Unavailable)` when the provider cannot serve calls at all
    /// (missing credential, client construction failed).
    fn check_available(&self) -> Result<(), CapabilityError>;
}

/// Who is calling: scopes audit records and activity events.
#[derive(Clone)]
pub struct CallContext {
    pub analysis_id: String,
    pub step: String,
    pub events: Option<Arc<Broadcaster>>,
}

impl CallContext {
    pub fn new(analysis_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            step: step.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<Broadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    /// Same caller, different step name.
    pub fn step(&self, step: impl Into<String>) -> Self {
        Self {
            analysis_id: self.analysis_id.clone(),
            step: step.into(),
            events: self.events.clone(),
        }
    }

    fn activity(&self, tool: &str, status: ToolCallStatus, message: String) {
        if let Some(events) = &self.events {
            events.publish(
                &self.analysis_id,
                AnalysisEvent::ToolActivity {
                    tool: tool.to_string(),
                    step: self.step.clone(),
                    status,
                    message,
                },
            );
        }
    }
}

/// Result of a capability call.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Served { provider: String, value: T },
    /// No provider produced a value. Holds every failed or skipped provider.
    Exhausted {
        attempts: Vec<(String, CapabilityError)>,
    },
}

impl<T> CallOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            CallOutcome::Served { value, .. } => Some(value),
            CallOutcome::Exhausted { .. } => None,
        }
    }

    pub fn is_served(&self) -> bool {
        matches!(self, CallOutcome::Served { .. })
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            CallOutcome::Served { provider, .. } => Some(provider),
            CallOutcome::Exhausted { .. } => None,
        }
    }
}

/// One capability: an ordered provider list plus the shared audit logger.
pub struct Capability<P: Provider + ?Sized> {
    name: &'static str,
    providers: Vec<Arc<P>>,
    audit: Arc<AuditLogger>,
    timeout: Duration,
}

impl<P: Provider + ?Sized> Capability<P> {
    pub fn new(
        name: &'static str,
        providers: Vec<Arc<P>>,
        audit: Arc<AuditLogger>,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            providers,
            audit,
            timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Local availability of each provider, in fallback order.
    pub fn availability(&self) -> Vec<(String, Result<(), CapabilityError>)> {
        self.providers
            .iter()
            .map(|p| (p.name().to_string(), p.check_available()))
            .collect()
    }

    /// Run `call` against each provider in order until one succeeds.
    ///
    /// `request` is the logical request logged with every attempt.
    pub async fn invoke<T, F, Fut>(
        &self,
        ctx: &CallContext,
        operation: &str,
        request: Value,
        call: F,
    ) -> CallOutcome<T>
    where
        T: Serialize,
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        let mut attempts = Vec::new();

        for provider in &self.providers {
            let name = provider.name().to_string();
            if let Err(e) = provider.check_available() {
                debug!("{}: skipping {} ({})", self.name, name, e);
                attempts.push((name, e));
                continue;
            }

            let endpoint = provider.endpoint(operation);
            debug!(
                "{}: {} via {} for {}/{}",
                self.name, operation, name, ctx.analysis_id, ctx.step
            );

            let started = Instant::now();
            let result = match tokio::time::timeout(self.timeout, call(Arc::clone(provider))).await
            {
                Ok(result) => result,
                Err(_) => Err(CapabilityError::Timeout(self.timeout)),
            };
            let elapsed = started.elapsed();
            let entry = AuditEntry::new(&ctx.analysis_id, &name, &ctx.step, endpoint)
                .request(request.clone())
                .latency(elapsed);

            match result {
                Ok(value) => {
                    let response = serde_json::to_value(&value).unwrap_or(Value::Null);
                    self.audit.record(entry.response(response)).await;
                    ctx.activity(
                        &name,
                        ToolCallStatus::Success,
                        format!("{} {} ({}ms)", name, operation, elapsed.as_millis()),
                    );
                    return CallOutcome::Served {
                        provider: name,
                        value,
                    };
                }
                Err(e) => {
                    warn!(
                        "{}: {} failed on {} ({}), falling back: {}",
                        self.name,
                        operation,
                        name,
                        e.kind(),
                        e
                    );
                    self.audit.record(entry.failed(e.to_string())).await;
                    ctx.activity(
                        &name,
                        ToolCallStatus::Error,
                        format!("{} {} failed: {}", name, operation, e.kind()),
                    );
                    attempts.push((name, e));
                }
            }
        }

        debug!(
            "{}: no provider served {} for {}/{}",
            self.name, operation, ctx.analysis_id, ctx.step
        );
        CallOutcome::Exhausted { attempts }
    }
}

impl Capability<dyn ReasoningProvider> {
    pub async fn reason(&self, ctx: &CallContext, system: &str, user: &str) -> CallOutcome<String> {
        let request = json!({ "system": system, "user": user });
        self.invoke(ctx, "reason", request, |p| {
            let (system, user) = (system.to_string(), user.to_string());
            async move { p.reason(&system, &user).await }
        })
        .await
    }

    /// `schema` is an OpenAI-style `json_schema` object (`{name, schema}`).
    pub async fn reason_structured(
        &self,
        ctx: &CallContext,
        system: &str,
        user: &str,
        schema: &Value,
    ) -> CallOutcome<Value> {
        let request = json!({ "system": system, "user": user, "schema": schema });
        self.invoke(ctx, "reason_structured", request, |p| {
            let (system, user, schema) = (system.to_string(), user.to_string(), schema.clone());
            async move { p.reason_structured(&system, &user, &schema).await }
        })
        .await
    }
}

impl Capability<dyn ClassificationProvider> {
    pub async fn classify(
        &self,
        ctx: &CallContext,
        text: &str,
        categories: &[String],
    ) -> CallOutcome<Classification> {
        let request = json!({ "text": text, "categories": categories });
        self.invoke(ctx, "classify", request, |p| {
            let (text, categories) = (text.to_string(), categories.to_vec());
            async move { p.classify(&text, &categories).await }
        })
        .await
    }

    pub async fn extract_entities(
        &self,
        ctx: &CallContext,
        text: &str,
        labels: &[String],
    ) -> CallOutcome<Vec<Entity>> {
        let request = json!({ "text": text, "labels": labels });
        self.invoke(ctx, "extract_entities", request, |p| {
            let (text, labels) = (text.to_string(), labels.to_vec());
            async move { p.extract_entities(&text, &labels).await }
        })
        .await
    }
}

impl Capability<dyn ResearchProvider> {
    pub async fn search(
        &self,
        ctx: &CallContext,
        query: &str,
        options: &SearchOptions,
    ) -> CallOutcome<SearchResponse> {
        let request = json!({ "query": query, "options": options });
        self.invoke(ctx, "search", request, |p| {
            let (query, options) = (query.to_string(), options.clone());
            async move { p.search(&query, &options).await }
        })
        .await
    }

    pub async fn extract_content(&self, ctx: &CallContext, urls: &[String]) -> CallOutcome<Vec<String>> {
        let request = json!({ "urls": urls });
        self.invoke(ctx, "extract", request, |p| {
            let urls = urls.to_vec();
            async move { p.extract_content(&urls).await }
        })
        .await
    }
}

/// The provider registry used by the pipeline.
pub struct Capabilities {
    pub reasoning: Capability<dyn ReasoningProvider>,
    pub classification: Capability<dyn ClassificationProvider>,
    pub research: Capability<dyn ResearchProvider>,
}

impl Capabilities {
    /// Build the registry from configured provider names.
    ///
    /// Unknown names are logged and ignored. All HTTP providers share one
    /// lazily built client.
    pub fn from_config(
        config: &ProviderConfig,
        keys: &ApiKeys,
        audit: Arc<AuditLogger>,
        timeout: Duration,
    ) -> Self {
        let client = Arc::new(LazyClient::new());

        let mut reasoning: Vec<Arc<dyn ReasoningProvider>> = Vec::new();
        for name in &config.reasoning {
            match name.as_str() {
                "yutori" => reasoning.push(Arc::new(ChatCompletionsProvider::yutori(
                    keys.yutori.clone(),
                    Arc::clone(&client),
                    timeout,
                ))),
                "openai" => reasoning.push(Arc::new(ChatCompletionsProvider::openai(
                    keys.openai.clone(),
                    Arc::clone(&client),
                    timeout,
                ))),
                other => warn!("Unknown reasoning provider '{}', ignoring", other),
            }
        }

        let mut classification: Vec<Arc<dyn ClassificationProvider>> = Vec::new();
        for name in &config.classification {
            match name.as_str() {
                "fastino" => classification.push(Arc::new(FastinoProvider::new(
                    keys.fastino.clone(),
                    Arc::clone(&client),
                    timeout,
                ))),
                "lexical" => classification.push(Arc::new(LexicalClassifier::new())),
                other => warn!("Unknown classification provider '{}', ignoring", other),
            }
        }

        let mut research: Vec<Arc<dyn ResearchProvider>> = Vec::new();
        for name in &config.research {
            match name.as_str() {
                "tavily" => research.push(Arc::new(TavilyProvider::new(
                    keys.tavily.clone(),
                    Arc::clone(&client),
                    timeout,
                ))),
                other => warn!("Unknown research provider '{}', ignoring", other),
            }
        }

        Self {
            reasoning: Capability::new("reasoning", reasoning, Arc::clone(&audit), timeout),
            classification: Capability::new(
                "classification",
                classification,
                Arc::clone(&audit),
                timeout,
            ),
            research: Capability::new("research", research, audit, timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use async_trait::async_trait;

    struct Scripted {
        name: &'static str,
        available: bool,
        reply: Result<String, CapabilityError>,
        delay: Duration,
    }

    impl Scripted {
        fn ok(name: &'static str, text: &str) -> Self {
            Self {
                name,
                available: true,
                reply: Ok(text.to_string()),
                delay: Duration::ZERO,
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                available: true,
                reply: Err(CapabilityError::RemoteError("HTTP 503".into())),
                delay: Duration::ZERO,
            }
        }

        fn unavailable(name: &'static str) -> Self {
            Self {
                name,
                available: false,
                reply: Ok(String::new()),
                delay: Duration::ZERO,
            }
        }
    }

    impl Provider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn endpoint(&self, operation: &str) -> String {
            format!("test://{}/{}", self.name, operation)
        }

        fn check_available(&self) -> Result<(), CapabilityError> {
            if self.available {
                Ok(())
            } else {
                Err(CapabilityError::Unavailable("no key".into()))
            }
        }
    }

    #[async_trait]
    impl ReasoningProvider for Scripted {
        async fn reason(&self, _system: &str, _user: &str) -> Result<String, CapabilityError> {
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }

        async fn reason_structured(
            &self,
            _system: &str,
            _user: &str,
            _schema: &Value,
        ) -> Result<Value, CapabilityError> {
            self.reply.clone().map(Value::String)
        }
    }

    fn capability(
        providers: Vec<Scripted>,
        timeout: Duration,
    ) -> (Capability<dyn ReasoningProvider>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = Arc::new(AuditLogger::new(sink.clone()));
        let providers = providers
            .into_iter()
            .map(|p| Arc::new(p) as Arc<dyn ReasoningProvider>)
            .collect();
        (Capability::new("reasoning", providers, audit, timeout), sink)
    }

    #[tokio::test]
    async fn test_fallback_uses_second_provider_and_audits_both() {
        let (cap, sink) = capability(
            vec![Scripted::failing("alpha"), Scripted::ok("beta", "answer")],
            Duration::from_secs(5),
        );
        let ctx = CallContext::new("a1", "deep_analysis");
        let outcome = cap.reason(&ctx, "sys", "user").await;

        assert_eq!(outcome.provider(), Some("beta"));
        assert_eq!(outcome.into_value().as_deref(), Some("answer"));

        let calls = sink.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_name, "alpha");
        assert_eq!(calls[0].status, ToolCallStatus::Error);
        assert_eq!(calls[1].tool_name, "beta");
        assert_eq!(calls[1].status, ToolCallStatus::Success);
        assert_eq!(calls[1].step_name, "deep_analysis");
        assert_eq!(calls[1].endpoint, "test://beta/reason");
    }

    #[tokio::test]
    async fn test_all_unavailable_is_exhausted_without_audit() {
        let (cap, sink) = capability(
            vec![Scripted::unavailable("alpha"), Scripted::unavailable("beta")],
            Duration::from_secs(5),
        );
        let outcome = cap.reason(&CallContext::new("a1", "s"), "sys", "user").await;
        match outcome {
            CallOutcome::Exhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts.iter().all(|(_, e)| e.kind() == "unavailable"));
            }
            CallOutcome::Served { .. } => panic!("expected no result"),
        }
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_provider_list_is_exhausted() {
        let (cap, _) = capability(vec![], Duration::from_secs(1));
        let outcome = cap.reason(&CallContext::new("a1", "s"), "sys", "user").await;
        assert!(!outcome.is_served());
    }

    #[tokio::test]
    async fn test_slow_provider_times_out_and_falls_back() {
        let mut slow = Scripted::ok("slow", "late");
        slow.delay = Duration::from_secs(30);
        let (cap, sink) = capability(
            vec![slow, Scripted::ok("fast", "early")],
            Duration::from_millis(50),
        );
        let outcome = cap.reason(&CallContext::new("a1", "s"), "sys", "user").await;
        assert_eq!(outcome.into_value().as_deref(), Some("early"));

        let calls = sink.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let (cap, sink) = capability(
            vec![Scripted::ok("alpha", "one"), Scripted::ok("beta", "two")],
            Duration::from_secs(5),
        );
        let outcome = cap.reason(&CallContext::new("a1", "s"), "sys", "user").await;
        assert_eq!(outcome.provider(), Some("alpha"));
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_attempts_publish_tool_activity() {
        let events = Arc::new(Broadcaster::default());
        let mut sub = events.subscribe("a1");
        let (cap, _) = capability(
            vec![Scripted::failing("alpha"), Scripted::ok("beta", "x")],
            Duration::from_secs(5),
        );
        let ctx = CallContext::new("a1", "fix_generation").with_events(events.clone());
        cap.reason(&ctx, "sys", "user").await;

        let first = sub.try_recv().unwrap();
        let second = sub.try_recv().unwrap();
        assert!(matches!(
            &*first,
            AnalysisEvent::ToolActivity { tool, status: ToolCallStatus::Error, .. } if tool == "alpha"
        ));
        assert!(matches!(
            &*second,
            AnalysisEvent::ToolActivity { tool, status: ToolCallStatus::Success, .. } if tool == "beta"
        ));
    }

    #[test]
    fn test_registry_from_config_skips_unknown_names() {
        let config = ProviderConfig {
            reasoning: vec!["openai".into(), "mystery".into()],
            classification: vec!["lexical".into()],
            research: vec![],
        };
        let audit = Arc::new(AuditLogger::new(Arc::new(MemoryAuditSink::new())));
        let caps = Capabilities::from_config(&config, &ApiKeys::default(), audit, Duration::from_secs(1));
        assert_eq!(caps.reasoning.provider_names(), vec!["openai"]);
        assert_eq!(caps.classification.provider_names(), vec!["lexical"]);
        assert!(caps.research.provider_names().is_empty());
    }
}
