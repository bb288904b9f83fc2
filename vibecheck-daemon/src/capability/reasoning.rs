//! Reasoning providers speaking the chat-completions protocol.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::http::{post_json, require_key, LazyClient};
use super::Provider;
use crate::error::CapabilityError;

pub const YUTORI_BASE: &str = "https://api.yutori.com/v1";
pub const OPENAI_BASE: &str = "https://api.openai.com/v1";

const TEMPERATURE: f64 = 0.2;

#[async_trait]
pub trait ReasoningProvider: Provider {
    /// Free-form completion.
    async fn reason(&self, system: &str, user: &str) -> Result<String, CapabilityError>;

    /// Completion constrained to `schema` (`{name, schema}`), decoded as JSON.
    async fn reason_structured(
        &self,
        system: &str,
        user: &str,
        schema: &Value,
    ) -> Result<Value, CapabilityError>;
}

#[derive(Debug, Clone, Copy)]
enum AuthStyle {
    Bearer,
    ApiKeyHeader,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsProvider {
    name: &'static str,
    base_url: String,
    model: String,
    auth: AuthStyle,
    api_key: Option<String>,
    client: Arc<LazyClient>,
    timeout: Duration,
}

impl ChatCompletionsProvider {
    pub fn yutori(api_key: Option<String>, client: Arc<LazyClient>, timeout: Duration) -> Self {
        Self {
            name: "yutori",
            base_url: YUTORI_BASE.to_string(),
            model: "n1-latest".to_string(),
            auth: AuthStyle::ApiKeyHeader,
            api_key,
            client,
            timeout,
        }
    }

    pub fn openai(api_key: Option<String>, client: Arc<LazyClient>, timeout: Duration) -> Self {
        Self {
            name: "openai",
            base_url: OPENAI_BASE.to_string(),
            model: "gpt-4o-mini".to_string(),
            auth: AuthStyle::Bearer,
            api_key,
            client,
            timeout,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn complete(&self, body: Value) -> Result<String, CapabilityError> {
        let key = require_key(&self.api_key, self.name)?;
        let client = self.client.get()?;
        let url = self.endpoint("chat");

        let bearer;
        let headers: Vec<(&str, &str)> = match self.auth {
            AuthStyle::Bearer => {
                bearer = format!("Bearer {}", key);
                vec![("Authorization", bearer.as_str())]
            }
            AuthStyle::ApiKeyHeader => vec![("X-API-KEY", key)],
        };

        let data = post_json(client, &url, &headers, &body, self.timeout).await?;
        message_content(&data)
    }

    fn request_body(&self, system: &str, user: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": TEMPERATURE,
        })
    }
}

impl Provider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn endpoint(&self, _operation: &str) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn check_available(&self) -> Result<(), CapabilityError> {
        require_key(&self.api_key, self.name)?;
        self.client.check()
    }
}

#[async_trait]
impl ReasoningProvider for ChatCompletionsProvider {
    async fn reason(&self, system: &str, user: &str) -> Result<String, CapabilityError> {
        self.complete(self.request_body(system, user)).await
    }

    async fn reason_structured(
        &self,
        system: &str,
        user: &str,
        schema: &Value,
    ) -> Result<Value, CapabilityError> {
        let mut body = self.request_body(system, user);
        body["response_format"] = json!({ "type": "json_schema", "json_schema": schema });
        let content = self.complete(body).await?;
        parse_structured(&content)
    }
}

/// `choices[0].message.content` of a chat-completions response.
pub fn message_content(data: &Value) -> Result<String, CapabilityError> {
    data.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            CapabilityError::InvalidResponse("missing choices[0].message.content".into())
        })
}

/// Decode structured output, tolerating a fenced ```json block.
pub fn parse_structured(content: &str) -> Result<Value, CapabilityError> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim);

    match unfenced.map(serde_json::from_str::<Value>) {
        Some(Ok(value)) => Ok(value),
        _ => Err(CapabilityError::InvalidResponse(format!(
            "structured output is not JSON: {}",
            vibecheck_core::truncate_chars(trimmed, 120)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_content() {
        let data = json!({"choices": [{"message": {"role": "assistant", "content": "hello"}}]});
        assert_eq!(message_content(&data).unwrap(), "hello");
        assert!(matches!(
            message_content(&json!({"choices": []})),
            Err(CapabilityError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_structured_plain_and_fenced() {
        assert_eq!(parse_structured(r#"{"fixes": []}"#).unwrap(), json!({"fixes": []}));
        assert_eq!(
            parse_structured("```json\n{\"findings\": [1]}\n```").unwrap(),
            json!({"findings": [1]})
        );
        assert!(parse_structured("Sure! Here are the findings").is_err());
    }

    #[test]
    fn test_missing_key_is_unavailable() {
        let provider = ChatCompletionsProvider::openai(None, Arc::new(LazyClient::new()), Duration::from_secs(1));
        assert_eq!(provider.check_available().unwrap_err().kind(), "unavailable");
        assert_eq!(provider.endpoint("reason"), "https://api.openai.com/v1/chat/completions");

        let provider = ChatCompletionsProvider::yutori(
            Some("key".into()),
            Arc::new(LazyClient::new()),
            Duration::from_secs(1),
        );
        assert!(provider.check_available().is_ok());
        assert_eq!(provider.request_body("s", "u")["model"], "n1-latest");
    }
}
