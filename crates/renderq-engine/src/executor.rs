//! Task execution: workflow preparation, submission and artifact retrieval.
//!
//! Tasks carry only data. What running a task *means* is decided by the
//! executor registered for its kind at startup, which is what lets queued
//! tasks survive a restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use renderq_core::config::OrchestratorConfig;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendClient;
use crate::store::TaskStore;
use crate::task::{Task, TaskKind};
use crate::workflow::Workflow;

/// Grace period after spawning a local backend before re-probing it.
const SPAWN_GRACE: Duration = Duration::from_secs(5);

/// Shared handles an executor needs while running one task.
pub struct ExecutionContext {
    pub store: Arc<TaskStore>,
    pub cancel: CancellationToken,
}

/// What a successful execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub output_filename: String,
}

/// One task kind's execution behavior.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionOutput>;
}

/// Kind-to-executor dispatch table, fixed at startup.
#[derive(Default)]
pub struct ExecutorRegistry {
    by_kind: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) {
        self.by_kind.insert(kind, executor);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.by_kind.get(&kind).cloned()
    }

    /// The production registry: one workflow-driven executor shared by
    /// every task kind.
    pub fn generation(config: &OrchestratorConfig, backend: BackendClient) -> Self {
        let executor: Arc<dyn TaskExecutor> = Arc::new(GenerationExecutor::new(
            backend,
            config.workflow_dir.clone(),
            config.output_dir.clone(),
            config.backend.local_spawn.clone(),
        ));
        let mut registry = Self::new();
        for kind in TaskKind::ALL {
            registry.register(kind, executor.clone());
        }
        registry
    }
}

/// Runs a task end to end against the generation backend.
pub struct GenerationExecutor {
    backend: BackendClient,
    workflow_dir: PathBuf,
    output_dir: PathBuf,
    local_spawn: Option<PathBuf>,
}

impl GenerationExecutor {
    pub fn new(
        backend: BackendClient,
        workflow_dir: PathBuf,
        output_dir: PathBuf,
        local_spawn: Option<PathBuf>,
    ) -> Self {
        Self {
            backend,
            workflow_dir,
            output_dir,
            local_spawn,
        }
    }

    /// Probe the backend, spawning the configured local binary once when it
    /// is down. Returns whether the backend answered.
    async fn ensure_backend(&self) -> bool {
        if self.backend.is_alive().await {
            return true;
        }
        let Some(bin) = &self.local_spawn else {
            return false;
        };
        tracing::warn!(path = %bin.display(), "backend unreachable; starting local backend");
        if let Err(err) = tokio::process::Command::new(bin)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            tracing::error!(path = %bin.display(), error = %err, "local backend spawn failed");
            return false;
        }
        tokio::time::sleep(SPAWN_GRACE).await;
        self.backend.is_alive().await
    }
}

#[async_trait]
impl TaskExecutor for GenerationExecutor {
    async fn execute(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionOutput> {
        let workflow_path = self
            .workflow_dir
            .join(format!("{}.json", task.task_type));
        let workflow = Workflow::load(&workflow_path)?;
        let payload = workflow.inject(&task.params).to_payload();

        if !self.ensure_backend().await {
            anyhow::bail!("backend connection timeout");
        }

        let handle = self.backend.submit(&payload).await?;
        ctx.store
            .update(&task.task_id, |t| t.backend_handle = Some(handle.clone()))?;
        tracing::info!(task_id = %task.task_id, handle = %handle, "workflow submitted");

        let outputs = self.backend.wait_for_outputs(&handle, &ctx.cancel).await?;
        let artifact = outputs
            .first_artifact()
            .ok_or_else(|| anyhow::anyhow!("workflow finished without an image or video output"))?;
        let bytes = self.backend.fetch_artifact(&artifact).await?;

        let output_filename = output_filename(task);
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output_path = self.output_dir.join(&output_filename);
        tokio::fs::write(&output_path, &bytes).await?;
        tracing::info!(
            task_id = %task.task_id,
            path = %output_path.display(),
            bytes = bytes.len(),
            "artifact saved"
        );

        Ok(ExecutionOutput { output_filename })
    }
}

/// Stable artifact name: `<kind>_<unix_seconds>_<id prefix>.<ext>`.
fn output_filename(task: &Task) -> String {
    let stamp = crate::task::unix_now() as u64;
    let short: String = task.task_id.chars().take(8).collect();
    format!(
        "{}_{}_{}.{}",
        task.task_type,
        stamp,
        short,
        task.task_type.output_extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn output_filename_encodes_kind_and_id_prefix() {
        let task = Task::new(
            "0a1b2c3d-ffff-0000-aaaa-bbbbccccdddd".to_string(),
            TaskKind::TextToVideo,
            Map::new(),
        );
        let name = output_filename(&task);
        assert!(name.starts_with("text_to_video_"));
        assert!(name.ends_with("_0a1b2c3d.mp4"));
    }
}
