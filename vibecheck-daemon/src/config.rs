//! Daemon configuration loading from `vibecheck.toml`.
//!
//! Configuration is optional: every section falls back to defaults. Secrets
//! are never read from the file, only from the environment (see [`ApiKeys`]).
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! port = 9130
//!
//! [storage]
//! path = ".vibecheck/vibecheck.duckdb"
//! graph_enabled = true
//!
//! [pipeline]
//! stage_timeout_secs = 120
//! provider_timeout_secs = 30
//! max_files = 500
//!
//! [providers]
//! reasoning = ["yutori", "openai"]
//! classification = ["fastino", "lexical"]
//! research = ["tavily"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the implicit configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "vibecheck.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Ordered provider lists per capability.
    #[serde(default)]
    pub providers: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9130 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// DuckDB database file.
    pub path: PathBuf,

    /// When `false` the graph backend reports itself unreachable and graphs
    /// are only kept as snapshots on the analysis record.
    pub graph_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".vibecheck").join("vibecheck.duckdb"),
            graph_enabled: true,
        }
    }
}

/// Limits and timeouts for a pipeline run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parent directory for per-analysis clones.
    pub clone_base: PathBuf,
    pub stage_timeout_secs: u64,
    pub provider_timeout_secs: u64,
    /// File inventory cap (stats still count every file).
    pub max_files: usize,
    /// Files sent to the classification capability.
    pub classify_limit: usize,
    /// Source files sent to code-quality analysis.
    pub quality_limit: usize,
    /// Runtime dependencies searched for CVEs.
    pub cve_dependency_limit: usize,
    pub cve_batch_size: usize,
    /// Per-subscriber event queue length.
    pub event_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clone_base: std::env::temp_dir().join("vibecheck").join("repos"),
            stage_timeout_secs: 120,
            provider_timeout_secs: 30,
            max_files: 500,
            classify_limit: 100,
            quality_limit: 30,
            cve_dependency_limit: 15,
            cve_batch_size: 3,
            event_buffer: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub reasoning: Vec<String>,
    pub classification: Vec<String>,
    pub research: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            reasoning: vec!["yutori".into(), "openai".into()],
            classification: vec!["fastino".into(), "lexical".into()],
            research: vec!["tavily".into()],
        }
    }
}

/// Provider credentials, read from the environment only.
///
/// A missing key leaves the provider constructed but unavailable.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub yutori: Option<String>,
    pub tavily: Option<String>,
    pub fastino: Option<String>,
}

impl ApiKeys {
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            openai: read("OPENAI_API_KEY"),
            yutori: read("YUTORI_API_KEY"),
            tavily: read("TAVILY_API_KEY"),
            fastino: read("FASTINO_API_KEY"),
        }
    }
}

impl DaemonConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist and parse. Without one, `vibecheck.toml`
    /// in `cwd` is used when present; a malformed implicit file is logged and
    /// ignored.
    pub fn load(path: Option<&Path>, cwd: &Path) -> Result<Self> {
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            return toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path));
        }

        let implicit = cwd.join(CONFIG_FILE_NAME);
        if implicit.exists() {
            match std::fs::read_to_string(&implicit) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("Failed to parse {}: {}", CONFIG_FILE_NAME, e),
                },
                Err(e) => tracing::warn!("Failed to read {}: {}", CONFIG_FILE_NAME, e),
            }
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.port, 9130);
        assert!(config.storage.graph_enabled);
        assert_eq!(config.pipeline.cve_batch_size, 3);
        assert_eq!(config.providers.reasoning, vec!["yutori", "openai"]);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
[pipeline]
stage_timeout_secs = 5

[providers]
research = []
"#,
        )
        .unwrap();
        assert_eq!(config.pipeline.stage_timeout(), Duration::from_secs(5));
        assert_eq!(config.pipeline.quality_limit, 30);
        assert!(config.providers.research.is_empty());
        assert_eq!(config.providers.classification, vec!["fastino", "lexical"]);
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(DaemonConfig::load(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn test_load_implicit_malformed_file_falls_back() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[server\nport = ").unwrap();
        let config = DaemonConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.server.port, 9130);
    }

    #[test]
    fn test_load_implicit_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[server]\nport = 8000\n").unwrap();
        let config = DaemonConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.server.port, 8000);
    }
}
