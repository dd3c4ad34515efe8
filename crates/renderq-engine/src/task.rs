//! The task record tracked through the queue and persisted per day.

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque task identifier. Generated ids are UUIDv4; resubmission adopts
/// caller-supplied ids verbatim.
pub type TaskId = String;

/// The kind of generation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TextToImage,
    ImageToImage,
    TextToVideo,
    ImageToVideo,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::TextToImage,
        TaskKind::ImageToImage,
        TaskKind::TextToVideo,
        TaskKind::ImageToVideo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::TextToImage => "text_to_image",
            TaskKind::ImageToImage => "image_to_image",
            TaskKind::TextToVideo => "text_to_video",
            TaskKind::ImageToVideo => "image_to_video",
        }
    }

    /// File extension of the artifact this kind produces.
    pub fn output_extension(self) -> &'static str {
        match self {
            TaskKind::TextToImage | TaskKind::ImageToImage => "png",
            TaskKind::TextToVideo | TaskKind::ImageToVideo => "mp4",
        }
    }

    /// Seed value for the per-kind duration moving average, in seconds.
    pub fn default_avg_duration(self) -> f64 {
        match self {
            TaskKind::TextToImage => 60.0,
            TaskKind::ImageToImage => 70.0,
            TaskKind::TextToVideo => 300.0,
            TaskKind::ImageToVideo => 320.0,
        }
    }

    /// Kinds that consume an input image and therefore require `image_path`.
    pub fn needs_input_image(self) -> bool {
        matches!(self, TaskKind::ImageToImage | TaskKind::ImageToVideo)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized task kind.
#[derive(Debug, thiserror::Error)]
#[error("unknown task kind: {0}")]
pub struct UnknownTaskKind(pub String);

impl std::str::FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_to_image" => Ok(TaskKind::TextToImage),
            "image_to_image" => Ok(TaskKind::ImageToImage),
            "text_to_video" => Ok(TaskKind::TextToVideo),
            "image_to_video" => Ok(TaskKind::ImageToVideo),
            other => Err(UnknownTaskKind(other.to_string())),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// A single generation request tracked through its lifecycle.
///
/// Tasks carry only data; execution behavior is looked up by kind in the
/// executor registry, which keeps persisted tasks re-dispatchable after a
/// restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: TaskKind,
    /// Wall-clock submission time in seconds; FIFO ordering key.
    pub submitted_at: f64,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub status: TaskState,
    /// Failure diagnostic; empty unless `status` is `failed`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    /// How many times the scheduler has dispatched this task.
    #[serde(default)]
    pub execution_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
    /// Correlation id assigned by the backend on submit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_handle: Option<String>,
}

impl Task {
    pub fn new(task_id: TaskId, task_type: TaskKind, params: Map<String, Value>) -> Self {
        Self {
            task_id,
            task_type,
            submitted_at: unix_now(),
            params,
            status: TaskState::Queued,
            status_message: String::new(),
            execution_count: 0,
            started_at: None,
            ended_at: None,
            output_filename: None,
            backend_handle: None,
        }
    }

    /// Duration of the most recent run, when both timestamps are present.
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Local calendar date of submission; selects the history day file.
    pub fn submitted_date(&self) -> NaiveDate {
        local_date_of(self.submitted_at)
    }
}

/// Current wall-clock time as fractional unix seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Local calendar date of a unix timestamp.
pub fn local_date_of(ts: f64) -> NaiveDate {
    DateTime::from_timestamp(ts as i64, 0)
        .map(|utc| utc.with_timezone(&Local).date_naive())
        .unwrap_or_else(|| Local::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_state_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskKind::TextToImage).unwrap(),
            r#""text_to_image""#
        );
        assert_eq!(
            serde_json::to_string(&TaskState::Queued).unwrap(),
            r#""queued""#
        );
        assert_eq!(
            "image_to_video".parse::<TaskKind>().unwrap(),
            TaskKind::ImageToVideo
        );
        assert!("gif_to_gif".parse::<TaskKind>().is_err());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut params = Map::new();
        params.insert("prompt".to_string(), serde_json::json!("a cat"));
        let mut task = Task::new("t-1".to_string(), TaskKind::TextToImage, params);
        task.status = TaskState::Completed;
        task.execution_count = 1;
        task.started_at = Some(task.submitted_at + 1.0);
        task.ended_at = Some(task.submitted_at + 31.0);
        task.output_filename = Some("text_to_image_1_abcd1234.png".to_string());
        task.backend_handle = Some("P1".to_string());

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.duration(), Some(30.0));
    }

    #[test]
    fn empty_message_is_omitted_from_json() {
        let task = Task::new("t-2".to_string(), TaskKind::TextToVideo, Map::new());
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("status_message"));
        assert!(!json.contains("started_at"));
    }
}
