use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};

#[derive(Debug, Parser)]
#[command(
    name = "renderq",
    version,
    about = "Durable generation task queue for a ComfyUI backend"
)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "RENDERQ_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestrator until interrupted (the default).
    Serve,
    /// Enqueue a single task, wait for it to finish, and exit.
    Submit(SubmitArgs),
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Task kind: text_to_image, image_to_image, text_to_video or
    /// image_to_video.
    #[arg(long, default_value = "text_to_image")]
    pub kind: String,

    #[arg(long)]
    pub prompt: String,

    #[arg(long, default_value = "")]
    pub negative_prompt: String,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    #[arg(long)]
    pub steps: Option<u32>,

    #[arg(long)]
    pub cfg_scale: Option<f64>,

    #[arg(long)]
    pub denoising_strength: Option<f64>,

    /// Input image for image_to_image / image_to_video tasks.
    #[arg(long)]
    pub image_path: Option<String>,

    /// Video length in seconds.
    #[arg(long)]
    pub duration: Option<u32>,

    #[arg(long)]
    pub fps: Option<u32>,

    /// Resubmit an existing task id instead of creating a new task.
    #[arg(long)]
    pub task_id: Option<String>,
}

impl SubmitArgs {
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("prompt".to_string(), Value::from(self.prompt.clone()));
        params.insert(
            "negative_prompt".to_string(),
            Value::from(self.negative_prompt.clone()),
        );

        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                params.insert(key.to_string(), value);
            }
        };
        put("width", self.width.map(Value::from));
        put("height", self.height.map(Value::from));
        put("steps", self.steps.map(Value::from));
        put("cfg_scale", self.cfg_scale.map(Value::from));
        put(
            "denoising_strength",
            self.denoising_strength.map(Value::from),
        );
        put("image_path", self.image_path.clone().map(Value::from));
        put("duration", self.duration.map(Value::from));
        put("fps", self.fps.map(Value::from));
        put("task_id", self.task_id.clone().map(Value::from));
        params
    }
}
