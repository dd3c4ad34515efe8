//! Durable task history, one JSON file per calendar day.
//!
//! Every state change rewrites the owning day file: read what is on disk,
//! merge by task id, sort by submission time, write back atomically. The
//! store mutex is held for the whole read-merge-write and never across
//! network I/O.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::NaiveDate;
use serde::Serialize;

use crate::task::{local_date_of, Task, TaskId};

const FILE_PREFIX: &str = "task_history_";

pub struct TaskStore {
    data_dir: PathBuf,
    inner: Mutex<HashMap<TaskId, Task>>,
}

/// On-disk record: the task plus a derived duration for operators.
#[derive(Serialize)]
struct TaskRecord<'a> {
    #[serde(flatten)]
    task: &'a Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
}

impl TaskStore {
    /// Open the store, loading every day file under `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;

        let mut tasks: HashMap<TaskId, Task> = HashMap::new();
        for entry in fs::read_dir(&data_dir)
            .with_context(|| format!("read data dir {}", data_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let raw = match fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::error!(file = %name, error = %err, "skipping unreadable history file");
                    continue;
                }
            };
            let records: Vec<Task> = match serde_json::from_str(&raw) {
                Ok(records) => records,
                Err(err) => {
                    tracing::error!(file = %name, error = %err, "skipping malformed history file");
                    continue;
                }
            };
            for task in records {
                // A resubmitted task can appear in two day files; the newer
                // submission wins.
                let newer = tasks
                    .get(&task.task_id)
                    .is_none_or(|existing| task.submitted_at >= existing.submitted_at);
                if newer {
                    tasks.insert(task.task_id.clone(), task);
                }
            }
        }

        tracing::info!(
            count = tasks.len(),
            dir = %data_dir.display(),
            "task history loaded"
        );
        Ok(Self {
            data_dir,
            inner: Mutex::new(tasks),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Task>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("task store mutex poisoned; continuing with recovered state");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.lock().get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Insert or replace a task and snapshot its day file.
    pub fn upsert(&self, task: Task) -> anyhow::Result<Task> {
        let mut guard = self.lock();
        let date = local_date_of(task.submitted_at);
        guard.insert(task.task_id.clone(), task.clone());
        self.write_day_file(&guard, date)?;
        Ok(task)
    }

    /// Mutate a task in place and snapshot. Returns the updated task, or
    /// `None` when the id is unknown.
    pub fn update<F>(&self, task_id: &str, mutate: F) -> anyhow::Result<Option<Task>>
    where
        F: FnOnce(&mut Task),
    {
        let mut guard = self.lock();
        let updated = {
            let Some(task) = guard.get_mut(task_id) else {
                return Ok(None);
            };
            mutate(task);
            task.clone()
        };
        self.write_day_file(&guard, local_date_of(updated.submitted_at))?;
        Ok(Some(updated))
    }

    /// Tasks submitted on `date`, ascending by submission time.
    pub fn tasks_for_date(&self, date: NaiveDate) -> Vec<Task> {
        let guard = self.lock();
        let mut tasks: Vec<Task> = guard
            .values()
            .filter(|t| local_date_of(t.submitted_at) == date)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.submitted_at.total_cmp(&b.submitted_at));
        tasks
    }

    /// Full history, optionally filtered by date, newest first.
    pub fn tasks(&self, date: Option<NaiveDate>) -> Vec<Task> {
        let guard = self.lock();
        let mut tasks: Vec<Task> = guard
            .values()
            .filter(|t| date.is_none_or(|d| local_date_of(t.submitted_at) == d))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.submitted_at.total_cmp(&a.submitted_at));
        tasks
    }

    fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("{FILE_PREFIX}{}.json", date.format("%Y-%m-%d")))
    }

    fn write_day_file(
        &self,
        tasks: &HashMap<TaskId, Task>,
        date: NaiveDate,
    ) -> anyhow::Result<()> {
        let path = self.day_file(date);

        let mut by_id: HashMap<TaskId, Task> = HashMap::new();
        if path.exists() {
            if let Ok(raw) = fs::read_to_string(&path) {
                if let Ok(existing) = serde_json::from_str::<Vec<Task>>(&raw) {
                    for task in existing {
                        by_id.insert(task.task_id.clone(), task);
                    }
                }
            }
        }
        for task in tasks.values() {
            if local_date_of(task.submitted_at) == date {
                by_id.insert(task.task_id.clone(), task.clone());
            }
        }

        let mut records: Vec<Task> = by_id.into_values().collect();
        records.sort_by(|a, b| a.submitted_at.total_cmp(&b.submitted_at));
        let rendered: Vec<TaskRecord<'_>> = records
            .iter()
            .map(|task| TaskRecord {
                task,
                duration: task.duration(),
            })
            .collect();

        let json = serde_json::to_string_pretty(&rendered)
            .context("serialize task history day file")?;
        persist_file(&path, &json)
    }
}

fn persist_file(path: &Path, json: &str) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{unix_now, TaskKind, TaskState};
    use serde_json::{json, Map, Value};

    fn task(id: &str, offset: f64) -> Task {
        let mut params = Map::new();
        params.insert("prompt".to_string(), json!("a cat"));
        let mut task = Task::new(id.to_string(), TaskKind::TextToImage, params);
        task.submitted_at = unix_now() + offset;
        task
    }

    #[test]
    fn round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TaskStore::open(dir.path()).unwrap();
            let mut done = task("t-1", 0.0);
            done.status = TaskState::Completed;
            done.execution_count = 1;
            done.started_at = Some(done.submitted_at + 1.0);
            done.ended_at = Some(done.submitted_at + 5.0);
            done.output_filename = Some("text_to_image_1_t1.png".to_string());
            store.upsert(done).unwrap();
            store.upsert(task("t-2", 1.0)).unwrap();
        }

        let store = TaskStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        let back = store.get("t-1").unwrap();
        assert_eq!(back.status, TaskState::Completed);
        assert_eq!(back.execution_count, 1);
        assert_eq!(back.output_filename.as_deref(), Some("text_to_image_1_t1.png"));
        assert_eq!(back.params["prompt"], json!("a cat"));
    }

    #[test]
    fn day_file_is_sorted_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.upsert(task("late", 2.0)).unwrap();
        store.upsert(task("early", 0.0)).unwrap();
        store.upsert(task("late", 2.0)).unwrap();

        let date = local_date_of(unix_now());
        let path = dir
            .path()
            .join(format!("task_history_{}.json", date.format("%Y-%m-%d")));
        let raw = std::fs::read_to_string(path).unwrap();
        let records: Vec<Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["task_id"], json!("early"));
        assert_eq!(records[1]["task_id"], json!("late"));
    }

    #[test]
    fn update_persists_and_derives_duration() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let created = store.upsert(task("t-1", 0.0)).unwrap();

        store
            .update("t-1", |t| {
                t.status = TaskState::Completed;
                t.started_at = Some(created.submitted_at);
                t.ended_at = Some(created.submitted_at + 12.5);
            })
            .unwrap()
            .unwrap();
        assert!(store.update("missing", |_| ()).unwrap().is_none());

        let date = local_date_of(created.submitted_at);
        let raw = std::fs::read_to_string(
            dir.path()
                .join(format!("task_history_{}.json", date.format("%Y-%m-%d"))),
        )
        .unwrap();
        let records: Vec<Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(records[0]["duration"], json!(12.5));
        assert_eq!(records[0]["status"], json!("completed"));
    }

    #[test]
    fn date_filters_split_the_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let today = store.upsert(task("now", 0.0)).unwrap();
        // Eight days back lands in a different day file.
        store.upsert(task("old", -8.0 * 86_400.0)).unwrap();

        let date = local_date_of(today.submitted_at);
        assert_eq!(store.tasks_for_date(date).len(), 1);
        assert_eq!(store.tasks(None).len(), 2);
        assert_eq!(store.tasks(Some(date))[0].task_id, "now");
    }
}
