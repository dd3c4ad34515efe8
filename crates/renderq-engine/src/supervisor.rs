//! Background sweep over today's tasks: retries, runtime ceilings and
//! reconciliation with the backend's own history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendClient;
use crate::notifier::Notifier;
use crate::scheduler::{QueueEntry, Scheduler};
use crate::store::TaskStore;
use crate::task::{unix_now, Task, TaskState};

pub(crate) struct Supervisor {
    store: Arc<TaskStore>,
    scheduler: Arc<Scheduler>,
    backend: BackendClient,
    notifier: Arc<dyn Notifier>,
    check_interval: Duration,
    max_execution_count: u32,
    max_runtime_hours: f64,
}

impl Supervisor {
    pub(crate) fn new(
        store: Arc<TaskStore>,
        scheduler: Arc<Scheduler>,
        backend: BackendClient,
        notifier: Arc<dyn Notifier>,
        check_interval: Duration,
        max_execution_count: u32,
        max_runtime_hours: f64,
    ) -> Self {
        Self {
            store,
            scheduler,
            backend,
            notifier,
            check_interval,
            max_execution_count,
            max_runtime_hours,
        }
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.check_interval.max(Duration::from_secs(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = self.check_interval.as_secs(),
            "supervisor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.sweep().await,
            }
        }
        tracing::info!("supervisor stopped");
    }

    async fn sweep(&self) {
        let today = Local::now().date_naive();
        for task in self.store.tasks_for_date(today) {
            // One past the retry ceiling is the terminal-notification pass;
            // anything beyond that has already been finalized.
            if task.execution_count > self.max_execution_count + 1 {
                continue;
            }
            let task_id = task.task_id.clone();
            let result = match task.status {
                TaskState::Failed => self.handle_failed(task).await,
                TaskState::Running => self.handle_running(task).await,
                // A queued task holding a backend handle is crash-recovered
                // work; the backend may already have finished it.
                TaskState::Queued if task.backend_handle.is_some() => {
                    self.reconcile(task, true).await
                }
                _ => Ok(()),
            };
            if let Err(err) = result {
                tracing::error!(task_id = %task_id, error = %format!("{err:#}"), "supervisor step failed");
            }
        }
    }

    async fn handle_failed(&self, task: Task) -> anyhow::Result<()> {
        if task.execution_count > self.max_execution_count {
            if task.status_message.starts_with("already retried") {
                return Ok(());
            }
            let retries = self.max_execution_count;
            let finalized = self.store.update(&task.task_id, |t| {
                t.status_message = format!("already retried {retries} times: {}", t.status_message);
                if t.ended_at.is_none() {
                    t.ended_at = Some(unix_now());
                }
            })?;
            if let Some(task) = finalized {
                tracing::error!(
                    task_id = %task.task_id,
                    attempts = task.execution_count,
                    "task exhausted its retries"
                );
                self.notifier.task_failed(&task).await;
            }
            return Ok(());
        }

        // Retry: back to queued with the original submission time, so the
        // task keeps its FIFO position.
        let Some(task) = self.store.update(&task.task_id, |t| {
            t.status = TaskState::Queued;
            t.status_message.clear();
            t.started_at = None;
            t.ended_at = None;
        })?
        else {
            return Ok(());
        };
        self.scheduler.push(QueueEntry {
            task_id: task.task_id.clone(),
            kind: task.task_type,
            submitted_at: task.submitted_at,
        });
        tracing::info!(
            task_id = %task.task_id,
            attempts = task.execution_count,
            "failed task re-queued for retry"
        );
        Ok(())
    }

    async fn handle_running(&self, task: Task) -> anyhow::Result<()> {
        let Some(started_at) = task.started_at else {
            tracing::warn!(task_id = %task.task_id, "running task has no start time; skipping");
            return Ok(());
        };

        let runtime = unix_now() - started_at;
        if runtime > self.max_runtime_hours * 3600.0 {
            let hours = self.max_runtime_hours;
            self.scheduler.cancel_running(&task.task_id);
            self.store.update(&task.task_id, |t| {
                t.status = TaskState::Failed;
                t.status_message = format!("runtime exceeded {hours}h");
                t.ended_at = Some(unix_now());
            })?;
            tracing::error!(
                task_id = %task.task_id,
                runtime_secs = runtime as u64,
                "running task exceeded the runtime ceiling"
            );
            return Ok(());
        }

        if task.backend_handle.is_some() {
            return self.reconcile(task, false).await;
        }
        Ok(())
    }

    /// Ask the backend whether it already finished this task; if so, adopt
    /// the result. Recovers work the executor missed, e.g. after a crash.
    async fn reconcile(&self, task: Task, queued: bool) -> anyhow::Result<()> {
        let Some(handle) = task.backend_handle.clone() else {
            return Ok(());
        };

        let outputs = match self.backend.history_outputs(&handle).await {
            Ok(Some(outputs)) => outputs,
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::debug!(task_id = %task.task_id, error = %err, "reconciliation probe failed");
                return Ok(());
            }
        };

        let Some(artifact) = outputs.first_artifact() else {
            tracing::warn!(
                task_id = %task.task_id,
                handle = %handle,
                "history has outputs but no artifact descriptor; leaving task as-is"
            );
            return Ok(());
        };

        let now = unix_now();
        self.store.update(&task.task_id, |t| {
            t.status = TaskState::Completed;
            t.status_message.clear();
            if t.started_at.is_none() {
                t.started_at = Some(t.submitted_at);
            }
            t.ended_at = Some(now);
            t.output_filename = Some(artifact.filename.clone());
        })?;
        if queued {
            self.scheduler.remove_queued(&task.task_id);
        } else {
            self.scheduler.cancel_running(&task.task_id);
        }
        tracing::info!(task_id = %task.task_id, handle = %handle, "task reconciled as completed from backend history");
        Ok(())
    }
}
