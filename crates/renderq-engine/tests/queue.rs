//! Queue and supervisor behavior with stub executors: dispatch order,
//! concurrency bounds, idempotent resubmission and the retry ceiling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use renderq_core::config::OrchestratorConfig;
use renderq_engine::executor::{
    ExecutionContext, ExecutionOutput, ExecutorRegistry, TaskExecutor,
};
use renderq_engine::notifier::Notifier;
use renderq_engine::{EnqueueError, Orchestrator, Task, TaskKind, TaskState};

fn test_config(dir: &tempfile::TempDir, cap: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        concurrency_cap: cap,
        check_interval_sec: 1,
        data_dir: dir.path().join("data"),
        output_dir: dir.path().join("outputs"),
        workflow_dir: dir.path().join("workflows"),
        ..OrchestratorConfig::default()
    }
}

fn params(prompt: &str) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("prompt".to_string(), json!(prompt));
    params
}

fn registry_with(executor: Arc<dyn TaskExecutor>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for kind in TaskKind::ALL {
        registry.register(kind, executor.clone());
    }
    registry
}

#[derive(Default)]
struct CountingNotifier {
    sent: AtomicUsize,
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn task_failed(&self, _task: &Task) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }
}

/// Succeeds after a short delay while tracking worker concurrency.
struct TrackingExecutor {
    delay: Duration,
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

impl TrackingExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskExecutor for TrackingExecutor {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionOutput> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutionOutput {
            output_filename: format!("{}_{}.png", task.task_type, task.task_id),
        })
    }
}

struct AlwaysFail;

#[async_trait]
impl TaskExecutor for AlwaysFail {
    async fn execute(
        &self,
        _task: &Task,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionOutput> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        anyhow::bail!("synthetic failure")
    }
}

/// Never finishes on its own; exits only through cancellation.
struct Hang;

#[async_trait]
impl TaskExecutor for Hang {
    async fn execute(
        &self,
        _task: &Task,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionOutput> {
        ctx.cancel.cancelled().await;
        anyhow::bail!("cancelled")
    }
}

async fn wait_for<F>(orchestrator: &Orchestrator, task_id: &str, mut pred: F) -> Task
where
    F: FnMut(&Task) -> bool,
{
    for _ in 0..300 {
        if let Some(task) = orchestrator.task_status(task_id) {
            if pred(&task) {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("task {task_id} never reached the expected state");
}

#[tokio::test]
async fn dispatches_in_submission_order_with_a_single_slot() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = renderq_engine::start_with(
        test_config(&dir, 1),
        registry_with(Arc::new(TrackingExecutor::new(Duration::from_millis(50)))),
        Arc::new(CountingNotifier::default()),
    )
    .unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let receipt = orchestrator
            .enqueue(TaskKind::TextToImage, params(&format!("prompt {i}")))
            .unwrap();
        ids.push(receipt.task_id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut done = Vec::new();
    for id in &ids {
        done.push(wait_for(&orchestrator, id, |t| t.status == TaskState::Completed).await);
    }

    assert!(done[0].submitted_at < done[1].submitted_at);
    assert!(done[1].submitted_at < done[2].submitted_at);
    assert!(done[0].started_at.unwrap() < done[1].started_at.unwrap());
    assert!(done[1].started_at.unwrap() < done[2].started_at.unwrap());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn running_tasks_never_exceed_the_concurrency_cap() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(TrackingExecutor::new(Duration::from_millis(80)));
    let orchestrator = renderq_engine::start_with(
        test_config(&dir, 2),
        registry_with(executor.clone()),
        Arc::new(CountingNotifier::default()),
    )
    .unwrap();

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            orchestrator
                .enqueue(TaskKind::TextToImage, params(&format!("p{i}")))
                .unwrap()
                .task_id,
        );
    }
    for id in &ids {
        wait_for(&orchestrator, id, |t| t.status == TaskState::Completed).await;
    }

    assert!(executor.max_seen.load(Ordering::SeqCst) <= 2);
    assert!(executor.max_seen.load(Ordering::SeqCst) >= 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn resubmitting_a_known_id_updates_the_single_record() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = renderq_engine::start_with(
        test_config(&dir, 1),
        registry_with(Arc::new(TrackingExecutor::new(Duration::from_millis(20)))),
        Arc::new(CountingNotifier::default()),
    )
    .unwrap();

    let mut first = params("x");
    first.insert("task_id".to_string(), json!("abc"));
    let receipt = orchestrator.enqueue(TaskKind::TextToImage, first).unwrap();
    assert_eq!(receipt.task_id, "abc");
    wait_for(&orchestrator, "abc", |t| {
        t.status == TaskState::Completed && t.execution_count == 1
    })
    .await;

    let mut second = params("y");
    second.insert("task_id".to_string(), json!("abc"));
    orchestrator.enqueue(TaskKind::TextToImage, second).unwrap();
    let done = wait_for(&orchestrator, "abc", |t| {
        t.status == TaskState::Completed && t.execution_count == 2
    })
    .await;

    assert_eq!(done.params["prompt"], json!("y"));
    assert_eq!(orchestrator.tasks(None).len(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn retries_stop_at_the_ceiling_with_exactly_one_notification() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(CountingNotifier::default());
    let config = OrchestratorConfig {
        max_execution_count: 1,
        ..test_config(&dir, 1)
    };
    let orchestrator = renderq_engine::start_with(
        config,
        registry_with(Arc::new(AlwaysFail)),
        notifier.clone(),
    )
    .unwrap();

    let id = orchestrator
        .enqueue(TaskKind::TextToImage, params("doomed"))
        .unwrap()
        .task_id;

    let done = wait_for(&orchestrator, &id, |t| {
        t.status == TaskState::Failed && t.status_message.starts_with("already retried")
    })
    .await;
    assert!(
        done.status_message
            .starts_with("already retried 1 times: "),
        "unexpected message: {}",
        done.status_message
    );
    assert_eq!(done.execution_count, 2);
    assert!(done.ended_at.is_some());
    assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);

    // Further sweeps must neither retry nor re-notify.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let still = orchestrator.task_status(&id).unwrap();
    assert_eq!(still.execution_count, 2);
    assert_eq!(still.status, TaskState::Failed);
    assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn stuck_running_tasks_are_timed_out_by_the_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(CountingNotifier::default());
    let config = OrchestratorConfig {
        // Zero retries: the first timeout failure is terminal.
        max_execution_count: 0,
        max_runtime_hours: 0.0001,
        ..test_config(&dir, 1)
    };
    let orchestrator =
        renderq_engine::start_with(config, registry_with(Arc::new(Hang)), notifier.clone())
            .unwrap();

    let id = orchestrator
        .enqueue(TaskKind::TextToVideo, params("stuck"))
        .unwrap()
        .task_id;

    let done = wait_for(&orchestrator, &id, |t| {
        t.status == TaskState::Failed && !t.status_message.is_empty()
    })
    .await;
    assert!(
        done.status_message.contains("runtime exceeded"),
        "unexpected message: {}",
        done.status_message
    );

    wait_for(&orchestrator, &id, |t| {
        t.status_message.starts_with("already retried")
    })
    .await;
    assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn user_errors_are_rejected_before_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = renderq_engine::start_with(
        test_config(&dir, 1),
        registry_with(Arc::new(AlwaysFail)),
        Arc::new(CountingNotifier::default()),
    )
    .unwrap();

    let err = orchestrator
        .enqueue(TaskKind::TextToImage, Map::new())
        .unwrap_err();
    assert!(matches!(err, EnqueueError::MissingParam("prompt")));

    let err = orchestrator
        .enqueue(TaskKind::ImageToImage, params("needs an image"))
        .unwrap_err();
    assert!(matches!(err, EnqueueError::MissingParam("image_path")));

    assert!(orchestrator.tasks(None).is_empty());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn queue_status_reflects_running_and_queued_work() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = renderq_engine::start_with(
        test_config(&dir, 1),
        registry_with(Arc::new(TrackingExecutor::new(Duration::from_millis(400)))),
        Arc::new(CountingNotifier::default()),
    )
    .unwrap();

    for i in 0..3 {
        orchestrator
            .enqueue(TaskKind::TextToImage, params(&format!("p{i}")))
            .unwrap();
    }
    // Give the dispatcher a moment to fill the single slot.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = orchestrator.queue_status(Some(TaskKind::TextToImage));
    assert_eq!(status.running_tasks, 1);
    assert_eq!(status.queued_tasks, 2);
    assert_eq!(status.max_concurrent_tasks, 1);

    let other = orchestrator.queue_status(Some(TaskKind::TextToVideo));
    assert_eq!(other.running_tasks, 0);
    assert_eq!(other.queued_tasks, 0);

    orchestrator.shutdown().await;
}
