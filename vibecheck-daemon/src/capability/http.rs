//! Shared HTTP plumbing for hosted providers.

use reqwest::Client;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use vibecheck_core::truncate_chars;

use crate::error::CapabilityError;

type ClientBuilderFn = fn() -> Result<Client, String>;

/// A `reqwest::Client` built on first use.
///
/// The build result is cached either way: once construction has failed every
/// later call reports `Unavailable` without trying again.
pub struct LazyClient {
    cell: OnceLock<Result<Client, String>>,
    build: ClientBuilderFn,
}

impl Default for LazyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyClient {
    pub fn new() -> Self {
        Self::with_builder(build_default_client)
    }

    pub fn with_builder(build: ClientBuilderFn) -> Self {
        Self {
            cell: OnceLock::new(),
            build,
        }
    }

    pub fn get(&self) -> Result<&Client, CapabilityError> {
        match self.cell.get_or_init(self.build) {
            Ok(client) => Ok(client),
            Err(e) => Err(CapabilityError::Unavailable(format!(
                "http client construction failed: {}",
                e
            ))),
        }
    }

    /// `Err(Unavailable)` if the client was built and failed. An unbuilt
    /// client counts as available.
    pub fn check(&self) -> Result<(), CapabilityError> {
        match self.cell.get() {
            Some(Err(e)) => Err(CapabilityError::Unavailable(format!(
                "http client construction failed: {}",
                e
            ))),
            _ => Ok(()),
        }
    }
}

fn build_default_client() -> Result<Client, String> {
    Client::builder()
        .user_agent(concat!("vibecheck-daemon/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| e.to_string())
}

/// Require a non-empty credential.
pub fn require_key<'a>(key: &'a Option<String>, provider: &str) -> Result<&'a str, CapabilityError> {
    match key.as_deref() {
        Some(k) if !k.is_empty() => Ok(k),
        _ => Err(CapabilityError::Unavailable(format!(
            "{} API key not configured",
            provider
        ))),
    }
}

/// POST a JSON body and decode a JSON response.
pub async fn post_json(
    client: &Client,
    url: &str,
    headers: &[(&str, &str)],
    body: &Value,
    timeout: Duration,
) -> Result<Value, CapabilityError> {
    let mut request = client.post(url).timeout(timeout).json(body);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    let response = request
        .send()
        .await
        .map_err(|e| classify_transport_error(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(CapabilityError::RemoteError(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_chars(&text, 200)
        )));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| CapabilityError::InvalidResponse(e.to_string()))
}

fn classify_transport_error(error: reqwest::Error, timeout: Duration) -> CapabilityError {
    if error.is_timeout() {
        CapabilityError::Timeout(timeout)
    } else if error.is_connect() {
        CapabilityError::RemoteError(format!("connection failed: {}", error))
    } else if error.is_decode() {
        CapabilityError::InvalidResponse(error.to_string())
    } else {
        CapabilityError::RemoteError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static BUILDS: AtomicUsize = AtomicUsize::new(0);

    fn broken_builder() -> Result<Client, String> {
        BUILDS.fetch_add(1, Ordering::SeqCst);
        Err("tls backend missing".into())
    }

    #[test]
    fn test_construction_failure_is_cached() {
        let client = LazyClient::with_builder(broken_builder);
        assert!(client.check().is_ok());

        for _ in 0..3 {
            match client.get() {
                Err(CapabilityError::Unavailable(msg)) => assert!(msg.contains("tls backend missing")),
                _ => panic!("expected unavailable"),
            }
        }
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
        assert!(client.check().is_err());
    }

    #[test]
    fn test_require_key() {
        assert!(require_key(&None, "tavily").is_err());
        assert!(require_key(&Some(String::new()), "tavily").is_err());
        assert_eq!(require_key(&Some("k".into()), "tavily").unwrap(), "k");
    }
}
