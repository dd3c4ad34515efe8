//! Orchestrator configuration: a single JSON file with serde defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration for the orchestrator.
///
/// Every field has a default, so a missing or partial config file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of tasks in `running` status at any moment.
    pub concurrency_cap: usize,
    /// Supervisor sweep interval in seconds.
    pub check_interval_sec: u64,
    /// Retry ceiling enforced by the supervisor.
    pub max_execution_count: u32,
    /// Running tasks older than this many hours are failed by the supervisor.
    pub max_runtime_hours: f64,
    /// Generation backend connection settings.
    pub backend: BackendConfig,
    /// Directory holding the per-day task history files.
    pub data_dir: PathBuf,
    /// Directory where fetched artifacts are written.
    pub output_dir: PathBuf,
    /// Directory holding the workflow documents, one per task kind.
    pub workflow_dir: PathBuf,
    /// SMTP settings; when absent, failure emails are disabled.
    pub smtp: Option<SmtpConfig>,
    /// Failure notification recipient; when absent, emails are disabled.
    pub notify: Option<NotifyConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 2,
            check_interval_sec: 30,
            max_execution_count: 3,
            max_runtime_hours: 2.0,
            backend: BackendConfig::default(),
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("outputs"),
            workflow_dir: PathBuf::from("workflows"),
            smtp: None,
            notify: None,
        }
    }
}

/// Where the generation backend lives and how to (optionally) start it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Path to a local backend binary to spawn when the backend is down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_spawn: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".to_string(),
            local_spawn: None,
        }
    }
}

/// SMTP session settings for the failure notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    #[serde(default)]
    pub from_name: String,
}

/// Recipient of terminal-failure notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub to_email: String,
    #[serde(default)]
    pub to_name: String,
}

/// Load the configuration from `path` (default `config.json`).
///
/// A missing file yields the defaults; a malformed file is an error rather
/// than a silent fallback.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let path = path.unwrap_or_else(|| Path::new("config.json"));
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found; using defaults");
        return Ok(OrchestratorConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("read config {}: {err}", path.display()))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("parse config {}: {err}", path.display()))?;
    Ok(cfg)
}
