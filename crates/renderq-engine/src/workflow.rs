//! Workflow documents: loading, shape normalization and parameter injection.
//!
//! Two on-disk shapes are accepted: a `nodes` array with explicit ids, and a
//! map from node id to node (bare, or wrapped under a `prompt` key). Both
//! normalize to the same in-memory node map, which is what gets submitted.

use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow file not found: {0}")]
    NotFound(String),
    #[error("read workflow {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("workflow {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unrecognized workflow document shape")]
    UnknownShape,
    #[error("workflow node {0} is malformed")]
    BadNode(String),
}

/// A normalized node graph: stringified node id to a node object carrying
/// `class_type` and `inputs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    nodes: Map<String, Value>,
}

/// The body POSTed to the backend's prompt endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PromptPayload {
    pub prompt: Map<String, Value>,
    pub client_id: String,
}

impl Workflow {
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        if !path.exists() {
            return Err(WorkflowError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let doc: Value = serde_json::from_str(&raw).map_err(|source| WorkflowError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::normalize(&doc)
    }

    /// Normalize either accepted document shape into a node map.
    pub fn normalize(doc: &Value) -> Result<Self, WorkflowError> {
        let root = doc.as_object().ok_or(WorkflowError::UnknownShape)?;

        let mut nodes = Map::new();
        if let Some(list) = root.get("nodes") {
            let list = list.as_array().ok_or(WorkflowError::UnknownShape)?;
            for node in list {
                let obj = node
                    .as_object()
                    .ok_or_else(|| WorkflowError::BadNode("<array entry>".to_string()))?;
                let id = obj
                    .get("id")
                    .map(node_id_string)
                    .ok_or_else(|| WorkflowError::BadNode("<missing id>".to_string()))?;
                nodes.insert(id.clone(), normalize_node(obj, &id)?);
            }
        } else {
            let map = match root.get("prompt") {
                Some(prompt) => prompt.as_object().ok_or(WorkflowError::UnknownShape)?,
                None => root,
            };
            for (id, node) in map {
                let obj = node
                    .as_object()
                    .ok_or_else(|| WorkflowError::BadNode(id.clone()))?;
                nodes.insert(id.clone(), normalize_node(obj, id)?);
            }
        }

        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &Map<String, Value> {
        &self.nodes
    }

    /// Apply generation parameters, returning a new workflow. The receiver is
    /// left untouched; callers keep their pristine template.
    pub fn inject(&self, params: &Map<String, Value>) -> Workflow {
        let mut nodes = self.nodes.clone();
        let mut positive_done = false;

        for node in nodes.values_mut() {
            let Some(obj) = node.as_object_mut() else {
                continue;
            };
            let kind = obj
                .get("class_type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let Some(inputs) = obj.get_mut("inputs").and_then(Value::as_object_mut) else {
                continue;
            };

            match kind.as_str() {
                "CLIPTextEncode" => {
                    // First encoder in document order is the positive prompt;
                    // every later one takes the negative prompt.
                    if inputs.contains_key("text") {
                        let param = if positive_done {
                            params.get("negative_prompt")
                        } else {
                            params.get("prompt")
                        };
                        if let Some(value) = param {
                            inputs.insert("text".to_string(), value.clone());
                        }
                        positive_done = true;
                    }
                }
                "KSampler" => {
                    set_existing(inputs, "steps", params.get("steps"));
                    set_existing(
                        inputs,
                        "cfg",
                        params.get("cfg_scale").or_else(|| params.get("cfg")),
                    );
                    set_existing(
                        inputs,
                        "denoise",
                        params
                            .get("denoising_strength")
                            .or_else(|| params.get("denoise")),
                    );
                }
                "EmptyLatentImage" => {
                    set_existing(inputs, "width", params.get("width"));
                    set_existing(inputs, "height", params.get("height"));
                }
                "LoadImage" => {
                    set_existing(inputs, "image", params.get("image_path"));
                }
                _ => {}
            }

            set_existing(
                inputs,
                "denoising_strength",
                params.get("denoising_strength"),
            );
        }

        Workflow { nodes }
    }

    /// Backend-ready payload with a fresh client correlation id.
    pub fn to_payload(&self) -> PromptPayload {
        PromptPayload {
            prompt: self.nodes.clone(),
            client_id: Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Overwrite `key` only when the node already carries that input slot.
fn set_existing(inputs: &mut Map<String, Value>, key: &str, value: Option<&Value>) {
    if let Some(value) = value {
        if inputs.contains_key(key) {
            inputs.insert(key.to_string(), value.clone());
        }
    }
}

fn node_id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Rebuild a node object with a guaranteed `class_type` and without the
/// shape-specific `id`/`type` keys, so both input shapes normalize to
/// identical payloads.
fn normalize_node(obj: &Map<String, Value>, id: &str) -> Result<Value, WorkflowError> {
    let kind = obj
        .get("class_type")
        .or_else(|| obj.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| WorkflowError::BadNode(id.to_string()))?
        .to_string();

    let mut out = Map::new();
    out.insert("class_type".to_string(), Value::String(kind));
    for (key, value) in obj {
        if key == "id" || key == "type" || key == "class_type" {
            continue;
        }
        out.insert(key.clone(), value.clone());
    }
    Ok(Value::Object(out))
}
