//! Audit trail of external capability invocations.
//!
//! Every provider attempt (success or failure), every clone and every graph
//! persistence pass is recorded as a [`ToolCall`]. Recording is best-effort:
//! a failing or slow sink is logged and skipped, never surfaced to the stage
//! that made the call.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use vibecheck_core::{truncate_chars, ToolCall, ToolCallStatus};

use crate::error::StoreError;

/// Maximum characters kept per string inside a logged payload.
pub const MAX_PAYLOAD_STRING: usize = 4000;
/// Maximum elements kept per list inside a logged payload.
pub const MAX_PAYLOAD_ITEMS: usize = 200;
/// Maximum characters kept of an error message.
pub const MAX_ERROR_MESSAGE: usize = 500;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Append-only destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, call: ToolCall) -> Result<(), StoreError>;

    /// Records of one analysis in insertion order.
    async fn list(&self, analysis_id: &str) -> Result<Vec<ToolCall>, StoreError>;
}

/// One capability invocation about to be recorded.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub analysis_id: String,
    pub tool_name: String,
    pub step_name: String,
    pub endpoint: String,
    pub request: Option<Value>,
    pub response: Option<Value>,
    pub latency_ms: u64,
    pub status: ToolCallStatus,
    pub error_message: Option<String>,
}

impl AuditEntry {
    pub fn new(
        analysis_id: impl Into<String>,
        tool_name: impl Into<String>,
        step_name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            tool_name: tool_name.into(),
            step_name: step_name.into(),
            endpoint: endpoint.into(),
            request: None,
            response: None,
            latency_ms: 0,
            status: ToolCallStatus::Success,
            error_message: None,
        }
    }

    pub fn request(mut self, payload: Value) -> Self {
        self.request = Some(payload);
        self
    }

    pub fn response(mut self, payload: Value) -> Self {
        self.response = Some(payload);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }

    pub fn failed(mut self, message: impl AsRef<str>) -> Self {
        self.status = ToolCallStatus::Error;
        self.error_message = Some(truncate_chars(message.as_ref(), MAX_ERROR_MESSAGE));
        self
    }

    fn into_tool_call(self) -> ToolCall {
        ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            analysis_id: self.analysis_id,
            tool_name: self.tool_name,
            step_name: self.step_name,
            endpoint: self.endpoint,
            request_payload: self.request.map(truncate_payload),
            response_payload: self.response.map(truncate_payload),
            latency_ms: self.latency_ms,
            status: self.status,
            error_message: self.error_message,
            created_at: Utc::now(),
        }
    }
}

/// Bound a payload before it is stored.
///
/// Objects and arrays are truncated recursively; any other top-level value is
/// stringified and wrapped as `{"_raw": ...}`.
pub fn truncate_payload(payload: Value) -> Value {
    match payload {
        Value::Object(_) | Value::Array(_) => truncate_value(payload),
        Value::Null => Value::Null,
        Value::String(s) => json!({ "_raw": truncate_chars(&s, MAX_PAYLOAD_STRING) }),
        other => json!({ "_raw": truncate_chars(&other.to_string(), MAX_PAYLOAD_STRING) }),
    }
}

fn truncate_value(value: Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_PAYLOAD_STRING => {
            Value::String(truncate_chars(&s, MAX_PAYLOAD_STRING))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .take(MAX_PAYLOAD_ITEMS)
                .map(truncate_value)
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, truncate_value(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

/// Records audit entries into a sink without ever failing the caller.
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    write_timeout: Duration,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Persist one entry. Sink errors and slow writes are logged and dropped.
    pub async fn record(&self, entry: AuditEntry) {
        let call = entry.into_tool_call();
        let (tool, step) = (call.tool_name.clone(), call.step_name.clone());
        match tokio::time::timeout(self.write_timeout, self.sink.append(call)).await {
            Ok(Ok(())) => debug!("Recorded tool call {}/{}", tool, step),
            Ok(Err(e)) => warn!("Failed to log tool call ({}/{}): {}", tool, step, e),
            Err(_) => warn!(
                "Timed out logging tool call ({}/{}) after {:?}",
                tool, step, self.write_timeout
            ),
        }
    }
}

/// In-process sink for tests and database-less runs.
#[derive(Default)]
pub struct MemoryAuditSink {
    calls: Mutex<Vec<ToolCall>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded call.
    pub fn calls(&self) -> Vec<ToolCall> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, call: ToolCall) -> Result<(), StoreError> {
        match self.calls.lock() {
            Ok(mut guard) => guard.push(call),
            Err(poisoned) => {
                warn!("Recovering from poisoned audit mutex");
                poisoned.into_inner().push(call)
            }
        }
        Ok(())
    }

    async fn list(&self, analysis_id: &str) -> Result<Vec<ToolCall>, StoreError> {
        Ok(self
            .calls()
            .into_iter()
            .filter(|c| c.analysis_id == analysis_id)
            .collect())
    }
}
