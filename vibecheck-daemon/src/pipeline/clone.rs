//! Repository acquisition.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info};
use vibecheck_core::truncate_chars;

use crate::audit::{AuditEntry, AuditLogger};
use crate::error::PipelineError;

/// Characters of stderr kept in the audit record.
const AUDIT_STDERR_CHARS: usize = 2000;
/// Characters of stderr carried by the failure.
const ERROR_STDERR_CHARS: usize = 500;

/// Produces a local working tree for an analysis.
#[async_trait]
pub trait Cloner: Send + Sync {
    async fn fetch(
        &self,
        analysis_id: &str,
        repo_url: &str,
        branch: Option<&str>,
    ) -> Result<PathBuf, PipelineError>;
}

/// Shallow `git clone` into `<base>/<analysis_id>`.
///
/// A repository reference naming an existing local directory is used in
/// place. An earlier clone of the same analysis is reused.
pub struct GitCloner {
    base: PathBuf,
    audit: Arc<AuditLogger>,
}

impl GitCloner {
    pub fn new(base: impl Into<PathBuf>, audit: Arc<AuditLogger>) -> Self {
        Self {
            base: base.into(),
            audit,
        }
    }

    pub fn clone_dir(&self, analysis_id: &str) -> PathBuf {
        self.base.join(analysis_id)
    }
}

#[async_trait]
impl Cloner for GitCloner {
    async fn fetch(
        &self,
        analysis_id: &str,
        repo_url: &str,
        branch: Option<&str>,
    ) -> Result<PathBuf, PipelineError> {
        let local = Path::new(repo_url);
        if local.is_dir() {
            info!("Analysis {} uses local tree {:?}", analysis_id, local);
            return Ok(local.to_path_buf());
        }

        let target = self.clone_dir(analysis_id);
        if target.join(".git").is_dir() {
            debug!("Reusing clone at {:?}", target);
            return Ok(target);
        }

        tokio::fs::create_dir_all(&self.base).await.map_err(|e| {
            PipelineError::CloneFailure(format!("cannot create clone directory: {}", e))
        })?;

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--depth=1");
        if let Some(branch) = branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.arg(repo_url).arg(&target);
        cmd.kill_on_drop(true);

        let request = json!({ "branch": branch, "depth": 1 });
        let started = Instant::now();
        let entry = |elapsed| {
            AuditEntry::new(analysis_id, "git", "clone", repo_url)
                .request(request.clone())
                .latency(elapsed)
        };

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                let message = format!("git clone failed: {}", e);
                self.audit
                    .record(entry(started.elapsed()).failed(&message))
                    .await;
                return Err(PipelineError::CloneFailure(message));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);
        let mut record = entry(started.elapsed()).response(json!({
            "returncode": code,
            "stderr": truncate_chars(&stderr, AUDIT_STDERR_CHARS),
        }));

        if !output.status.success() {
            let message = format!(
                "git clone failed: {}",
                truncate_chars(stderr.trim(), ERROR_STDERR_CHARS)
            );
            record = record.failed(&message);
            self.audit.record(record).await;
            return Err(PipelineError::CloneFailure(message));
        }

        self.audit.record(record).await;
        info!("Cloned {} into {:?}", repo_url, target);
        Ok(target)
    }
}
