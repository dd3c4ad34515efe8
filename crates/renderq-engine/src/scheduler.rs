//! FIFO queue, running-set bookkeeping and duration averages.
//!
//! Ordering is strictly by submission time, so supervisor retries (which
//! keep the original `submitted_at`) re-enter at their original position.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::task::{TaskId, TaskKind};

/// One queued task: just enough to order and dispatch it.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub(crate) task_id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) submitted_at: f64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.submitted_at
            .total_cmp(&other.submitted_at)
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

struct RunningEntry {
    kind: TaskKind,
    cancel: CancellationToken,
}

struct Inner {
    queue: BinaryHeap<Reverse<QueueEntry>>,
    queued_ids: HashSet<TaskId>,
    running: HashMap<TaskId, RunningEntry>,
    averages: HashMap<TaskKind, f64>,
}

/// Aggregate view of the queue, optionally filtered by task kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub total_tasks: usize,
    pub running_tasks: usize,
    pub queued_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub average_task_durations: HashMap<TaskKind, f64>,
    /// Rough wait estimate for the queued backlog, in seconds.
    pub estimated_time: f64,
    /// Placeholder percentage for UI progress displays.
    pub progress: u8,
}

pub struct Scheduler {
    concurrency_cap: usize,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(concurrency_cap: usize) -> Self {
        let averages = TaskKind::ALL
            .into_iter()
            .map(|kind| (kind, kind.default_avg_duration()))
            .collect();
        Self {
            concurrency_cap: concurrency_cap.max(1),
            inner: Mutex::new(Inner {
                queue: BinaryHeap::new(),
                queued_ids: HashSet::new(),
                running: HashMap::new(),
                averages,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("scheduler mutex poisoned; continuing with recovered state");
            poisoned.into_inner()
        })
    }

    pub fn concurrency_cap(&self) -> usize {
        self.concurrency_cap
    }

    /// Queue a task for dispatch. A task already queued or running is left
    /// alone, which keeps an id in at most one of the two sets.
    pub(crate) fn push(&self, entry: QueueEntry) -> bool {
        let mut inner = self.lock();
        if inner.running.contains_key(&entry.task_id) {
            return false;
        }
        if !inner.queued_ids.insert(entry.task_id.clone()) {
            return false;
        }
        inner.queue.push(Reverse(entry));
        true
    }

    /// Pop the earliest queued task when a running slot is free, moving it
    /// into the running set with a fresh cancellation token.
    pub(crate) fn pop_ready(&self) -> Option<(QueueEntry, CancellationToken)> {
        let mut inner = self.lock();
        if inner.running.len() >= self.concurrency_cap {
            return None;
        }
        loop {
            let Reverse(entry) = inner.queue.pop()?;
            // Entries whose id was withdrawn (re-queue dedup, supervisor
            // reconciliation) are stale; skip them.
            if !inner.queued_ids.remove(&entry.task_id) {
                continue;
            }
            let cancel = CancellationToken::new();
            inner.running.insert(
                entry.task_id.clone(),
                RunningEntry {
                    kind: entry.kind,
                    cancel: cancel.clone(),
                },
            );
            return Some((entry, cancel));
        }
    }

    /// Withdraw a queued task without dispatching it.
    pub(crate) fn remove_queued(&self, task_id: &str) -> bool {
        self.lock().queued_ids.remove(task_id)
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.lock().running.contains_key(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Drop a finished task from the running set.
    pub fn finish_running(&self, task_id: &str) -> bool {
        self.lock().running.remove(task_id).is_some()
    }

    /// Remove a running task and fire its cancellation token; the worker
    /// notices the missing entry at its next checkpoint and backs out.
    pub fn cancel_running(&self, task_id: &str) -> bool {
        let entry = self.lock().running.remove(task_id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Queue position counting the running set, per the enqueue receipt
    /// contract: `|running| + |queue|` after insertion.
    pub fn queue_position(&self) -> usize {
        let inner = self.lock();
        inner.running.len() + inner.queued_ids.len()
    }

    /// Fold an observed duration into the per-kind moving average.
    pub fn record_duration(&self, kind: TaskKind, duration_secs: f64) {
        let mut inner = self.lock();
        let old = inner
            .averages
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_avg_duration());
        let new = old * 0.8 + duration_secs * 0.2;
        inner.averages.insert(kind, new);
        tracing::debug!(%kind, old_avg = old, new_avg = new, "task duration average updated");
    }

    pub fn average_duration(&self, kind: TaskKind) -> f64 {
        self.lock()
            .averages
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_avg_duration())
    }

    /// Estimated wait for a task entering at `position`: zero when it fits
    /// under the cap, otherwise backlog depth times the kind's average.
    pub fn estimate_wait(&self, kind: TaskKind, position: usize) -> f64 {
        if position <= self.concurrency_cap {
            return 0.0;
        }
        (position - self.concurrency_cap) as f64 * self.average_duration(kind)
    }

    pub fn status(&self, kind: Option<TaskKind>) -> QueueStatus {
        let inner = self.lock();
        let running_tasks = inner
            .running
            .values()
            .filter(|entry| kind.is_none_or(|k| entry.kind == k))
            .count();
        let queued_tasks = inner
            .queue
            .iter()
            .filter(|Reverse(entry)| {
                inner.queued_ids.contains(&entry.task_id)
                    && kind.is_none_or(|k| entry.kind == k)
            })
            .count();
        let total_tasks = running_tasks + queued_tasks;

        let avg = match kind {
            Some(kind) => inner
                .averages
                .get(&kind)
                .copied()
                .unwrap_or_else(|| kind.default_avg_duration()),
            None => {
                let sum: f64 = inner.averages.values().sum();
                sum / inner.averages.len().max(1) as f64
            }
        };
        let estimated_time = queued_tasks as f64 * avg;
        let progress = if total_tasks == 0 {
            100
        } else {
            (100 / total_tasks).min(100) as u8
        };

        QueueStatus {
            total_tasks,
            running_tasks,
            queued_tasks,
            max_concurrent_tasks: self.concurrency_cap,
            average_task_durations: inner.averages.clone(),
            estimated_time,
            progress,
        }
    }
}
