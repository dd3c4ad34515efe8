//! Service wiring, the dispatch loop and the public orchestrator handle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use renderq_core::config::OrchestratorConfig;

use crate::backend::BackendClient;
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::notifier::{EmailNotifier, NoopNotifier, Notifier};
use crate::scheduler::{QueueEntry, QueueStatus, Scheduler};
use crate::store::TaskStore;
use crate::supervisor::Supervisor;
use crate::task::{unix_now, Task, TaskId, TaskKind, TaskState};

const DISPATCH_IDLE: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Rejected at enqueue time; these never reach the store.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),
    #[error("failed to persist task: {0}")]
    Storage(String),
}

/// What a submitter gets back for an accepted task.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub task_id: TaskId,
    /// Tasks ahead of or alongside this one, running set included.
    pub queue_position: usize,
    pub estimated_wait_secs: f64,
}

/// Everything the background loops and the handle share. Built once at
/// startup and passed around explicitly.
struct Services {
    store: Arc<TaskStore>,
    scheduler: Arc<Scheduler>,
    registry: ExecutorRegistry,
    notifier: Arc<dyn Notifier>,
}

/// Handle to a running orchestrator instance.
pub struct Orchestrator {
    services: Arc<Services>,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

/// Start the orchestrator with the production executor registry and, when
/// SMTP is configured, the email notifier.
pub fn start(config: OrchestratorConfig) -> anyhow::Result<Orchestrator> {
    let backend = BackendClient::new(&config.backend.base_url)?;
    let registry = ExecutorRegistry::generation(&config, backend);
    let notifier: Arc<dyn Notifier> = match (config.smtp.clone(), config.notify.clone()) {
        (Some(smtp), Some(notify)) => Arc::new(EmailNotifier::new(smtp, notify)),
        _ => Arc::new(NoopNotifier),
    };
    start_with(config, registry, notifier)
}

/// Start the orchestrator with a caller-chosen registry and notifier.
pub fn start_with(
    config: OrchestratorConfig,
    registry: ExecutorRegistry,
    notifier: Arc<dyn Notifier>,
) -> anyhow::Result<Orchestrator> {
    let store = Arc::new(TaskStore::open(&config.data_dir)?);
    let scheduler = Arc::new(Scheduler::new(config.concurrency_cap));
    recover(&store, &scheduler)?;

    let services = Arc::new(Services {
        store: store.clone(),
        scheduler: scheduler.clone(),
        registry,
        notifier: notifier.clone(),
    });
    let shutdown = CancellationToken::new();

    let supervisor = Supervisor::new(
        store,
        scheduler,
        BackendClient::new(&config.backend.base_url)?,
        notifier,
        Duration::from_secs(config.check_interval_sec),
        config.max_execution_count,
        config.max_runtime_hours,
    );

    let background = vec![
        tokio::spawn(dispatch_loop(services.clone(), shutdown.clone())),
        tokio::spawn(supervisor.run(shutdown.clone())),
    ];

    Ok(Orchestrator {
        services,
        shutdown,
        background,
    })
}

/// Rebuild in-memory state from the persisted history.
fn recover(store: &TaskStore, scheduler: &Scheduler) -> anyhow::Result<()> {
    // Tasks interrupted mid-run come back as queued; the backend handle is
    // kept so the supervisor can adopt work the backend already finished.
    for task in store.tasks(None) {
        if task.status == TaskState::Running {
            store.update(&task.task_id, |t| {
                t.status = TaskState::Queued;
                t.ended_at = None;
            })?;
        }
    }

    let today = Local::now().date_naive();
    let mut requeued = 0usize;
    for task in store.tasks_for_date(today) {
        if task.status != TaskState::Queued {
            continue;
        }
        scheduler.push(QueueEntry {
            task_id: task.task_id.clone(),
            kind: task.task_type,
            submitted_at: task.submitted_at,
        });
        requeued += 1;
    }
    if requeued > 0 {
        tracing::info!(requeued, "re-queued today's pending tasks from history");
    }
    Ok(())
}

impl Orchestrator {
    /// Validate and admit a task. Known `task_id`s are updated in place and
    /// re-queued instead of growing the history.
    pub fn enqueue(
        &self,
        kind: TaskKind,
        params: Map<String, Value>,
    ) -> Result<EnqueueReceipt, EnqueueError> {
        validate_params(kind, &params)?;

        let requested_id = params
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let existing = requested_id
            .as_deref()
            .and_then(|id| self.services.store.get(id));

        let task = match existing {
            Some(mut task) => {
                for (key, value) in &params {
                    task.params.insert(key.clone(), value.clone());
                }
                task.task_type = kind;
                task.submitted_at = unix_now();
                task.status = TaskState::Queued;
                task.status_message.clear();
                task.started_at = None;
                task.ended_at = None;
                task
            }
            None => {
                let id = requested_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                Task::new(id, kind, params)
            }
        };

        let task = self
            .services
            .store
            .upsert(task)
            .map_err(|err| EnqueueError::Storage(format!("{err:#}")))?;
        self.services.scheduler.push(QueueEntry {
            task_id: task.task_id.clone(),
            kind,
            submitted_at: task.submitted_at,
        });

        let queue_position = self.services.scheduler.queue_position();
        let estimated_wait_secs = self.services.scheduler.estimate_wait(kind, queue_position);
        tracing::info!(
            task_id = %task.task_id,
            %kind,
            queue_position,
            "task enqueued"
        );
        Ok(EnqueueReceipt {
            task_id: task.task_id,
            queue_position,
            estimated_wait_secs,
        })
    }

    /// Last persisted snapshot of one task.
    pub fn task_status(&self, task_id: &str) -> Option<Task> {
        self.services.store.get(task_id)
    }

    /// Queue counters, optionally filtered by task kind.
    pub fn queue_status(&self, kind: Option<TaskKind>) -> QueueStatus {
        self.services.scheduler.status(kind)
    }

    /// Task history, optionally restricted to one day, newest first.
    pub fn tasks(&self, date: Option<NaiveDate>) -> Vec<Task> {
        self.services.store.tasks(date)
    }

    /// Ask the background loops to stop; in-flight work keeps running.
    pub fn request_stop(&self) {
        self.shutdown.cancel();
    }

    /// Stop the loops and wait briefly for in-flight workers to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.services.scheduler.running_count() > 0 {
                tokio::time::sleep(DISPATCH_IDLE).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("shutdown grace elapsed with workers still in flight");
        }

        for handle in self.background {
            handle.abort();
            let _ = handle.await;
        }
    }
}

fn validate_params(kind: TaskKind, params: &Map<String, Value>) -> Result<(), EnqueueError> {
    let present = |key: &str| params.get(key).is_some_and(|v| !v.is_null());
    if !present("prompt") {
        return Err(EnqueueError::MissingParam("prompt"));
    }
    if kind.needs_input_image() && !present("image_path") {
        return Err(EnqueueError::MissingParam("image_path"));
    }
    Ok(())
}

/// Move tasks from the queue into workers while slots are free.
async fn dispatch_loop(services: Arc<Services>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let Some((entry, cancel)) = services.scheduler.pop_ready() else {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(DISPATCH_IDLE) => {}
            }
            continue;
        };

        let now = unix_now();
        let mut dispatched = false;
        let task = services.store.update(&entry.task_id, |t| {
            // The task may have been completed by reconciliation between the
            // queue pop and this snapshot; only a queued task may start.
            if t.status == TaskState::Queued {
                t.status = TaskState::Running;
                t.execution_count += 1;
                t.started_at = Some(now);
                t.ended_at = None;
                dispatched = true;
            }
        });

        let task = match task {
            Ok(Some(task)) if dispatched => task,
            Ok(_) => {
                services.scheduler.finish_running(&entry.task_id);
                continue;
            }
            Err(err) => {
                tracing::error!(
                    task_id = %entry.task_id,
                    error = %format!("{err:#}"),
                    "failed to persist dispatch; task returned to history as queued"
                );
                services.scheduler.finish_running(&entry.task_id);
                continue;
            }
        };

        tracing::info!(
            task_id = %task.task_id,
            kind = %task.task_type,
            attempt = task.execution_count,
            "task started"
        );
        tokio::spawn(run_worker(services.clone(), task, cancel));
    }
}

/// Drive one task through its executor and record the outcome.
async fn run_worker(services: Arc<Services>, task: Task, cancel: CancellationToken) {
    let task_id = task.task_id.clone();

    let result = match services.registry.get(task.task_type) {
        Some(executor) => {
            let ctx = ExecutionContext {
                store: services.store.clone(),
                cancel,
            };
            executor.execute(&task, &ctx).await
        }
        None => Err(anyhow::anyhow!(
            "no executor registered for {}",
            task.task_type
        )),
    };

    // The supervisor may have cancelled or reconciled this task while we
    // were waiting on the backend. The running-set entry is gone then, and
    // this result must be discarded without touching the store.
    if !services.scheduler.is_running(&task_id) {
        tracing::debug!(task_id = %task_id, "worker result discarded; task was taken over");
        return;
    }

    let now = unix_now();
    let recorded = match result {
        Ok(output) => services.store.update(&task_id, |t| {
            t.status = TaskState::Completed;
            t.status_message.clear();
            t.output_filename = Some(output.output_filename.clone());
            t.ended_at = Some(now);
        }),
        Err(err) => {
            let message = format!("{err:#}");
            tracing::error!(task_id = %task_id, error = %message, "task failed");
            services.store.update(&task_id, |t| {
                t.status = TaskState::Failed;
                t.status_message = message;
                t.ended_at = Some(now);
            })
        }
    };

    match recorded {
        Ok(Some(task)) if task.status == TaskState::Completed => {
            if let Some(duration) = task.duration() {
                services.scheduler.record_duration(task.task_type, duration);
            }
            tracing::info!(
                task_id = %task.task_id,
                output = task.output_filename.as_deref().unwrap_or_default(),
                "task completed"
            );
        }
        Ok(_) => {}
        Err(err) => {
            tracing::error!(task_id = %task_id, error = %format!("{err:#}"), "failed to persist task outcome");
        }
    }

    services.scheduler.finish_running(&task_id);
}
