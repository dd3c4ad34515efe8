//! HTTP client for the remote generation backend.
//!
//! The backend executes node-graph workflows and exposes a small polling
//! API: submit a prompt, read per-prompt history, fetch produced artifacts.
//! Every call opens its own request, so one client is safe to share across
//! workers.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::workflow::PromptPayload;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned http {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("backend response carried no prompt id")]
    MissingHandle,
    #[error("wait for outputs cancelled")]
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: Option<String>,
}

/// A single artifact descriptor from a finished history record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_artifact_kind")]
    pub kind: String,
}

fn default_artifact_kind() -> String {
    "output".to_string()
}

/// The `outputs` map of a finished prompt: node id to node output.
#[derive(Debug, Clone, Default)]
pub struct TaskOutputs(Map<String, Value>);

impl TaskOutputs {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First image descriptor across all output nodes, in document order.
    pub fn first_image(&self) -> Option<ArtifactRef> {
        self.first_of("images")
    }

    /// First video descriptor across all output nodes, in document order.
    pub fn first_video(&self) -> Option<ArtifactRef> {
        self.first_of("videos")
    }

    /// The artifact to save: images take precedence over videos.
    pub fn first_artifact(&self) -> Option<ArtifactRef> {
        self.first_image().or_else(|| self.first_video())
    }

    fn first_of(&self, key: &str) -> Option<ArtifactRef> {
        for node in self.0.values() {
            let Some(list) = node.get(key).and_then(Value::as_array) else {
                continue;
            };
            for item in list {
                if let Ok(artifact) = serde_json::from_value::<ArtifactRef>(item.clone()) {
                    return Some(artifact);
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let base_url =
            Url::parse(base_url).map_err(|err| BackendError::InvalidUrl(err.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(path)
            .map_err(|err| BackendError::InvalidUrl(err.to_string()))
    }

    /// Bounded liveness probe against the stats endpoint.
    pub async fn is_alive(&self) -> bool {
        let Ok(url) = self.endpoint("system_stats") else {
            return false;
        };
        match self.http.get(url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        }
    }

    /// Submit a prepared workflow; returns the backend's correlation id.
    pub async fn submit(&self, payload: &PromptPayload) -> Result<String, BackendError> {
        let url = self.endpoint("prompt")?;
        let res = self
            .http
            .post(url)
            .timeout(SUBMIT_TIMEOUT)
            .json(payload)
            .send()
            .await?;
        let res = check_status(res).await?;
        let body: PromptResponse = res.json().await?;
        body.prompt_id
            .filter(|id| !id.is_empty())
            .ok_or(BackendError::MissingHandle)
    }

    /// One history poll. `Ok(None)` means the prompt has not finished yet
    /// (no history entry, or an entry without outputs).
    pub async fn history_outputs(&self, handle: &str) -> Result<Option<TaskOutputs>, BackendError> {
        let url = self.endpoint(&format!("history/{handle}"))?;
        let res = self
            .http
            .get(url)
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await?;
        let res = check_status(res).await?;
        let body: Value = res.json().await?;
        let outputs = body
            .get(handle)
            .and_then(|entry| entry.get("outputs"))
            .and_then(Value::as_object);
        match outputs {
            Some(map) if !map.is_empty() => Ok(Some(TaskOutputs(map.clone()))),
            _ => Ok(None),
        }
    }

    /// Poll once per second until the history record carries outputs.
    ///
    /// There is no wall-clock cap here; the supervisor owns runtime limits
    /// and cancels through the token. Transient poll failures are retried.
    pub async fn wait_for_outputs(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskOutputs, BackendError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            match self.history_outputs(handle).await {
                Ok(Some(outputs)) => return Ok(outputs),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(handle, error = %err, "history poll failed; retrying");
                }
            }
        }
    }

    /// Fetch the raw bytes of one artifact via the view endpoint.
    pub async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Bytes, BackendError> {
        let mut url = self.endpoint("view")?;
        url.query_pairs_mut()
            .append_pair("filename", &artifact.filename)
            .append_pair("subfolder", &artifact.subfolder)
            .append_pair("type", &artifact.kind);
        let res = self.http.get(url).timeout(FETCH_TIMEOUT).send().await?;
        let res = check_status(res).await?;
        Ok(res.bytes().await?)
    }
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(BackendError::Http { status, body })
}
