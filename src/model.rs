use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use thiserror::Error;

use crate::agent::{Action, MouseButton, Point, Role, Turn};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("api key missing")]
    MissingCredentials,
    #[error("transport: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model service returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// What one round-trip produced: an optional textual reply and the requested
/// actions in wire order. `raw_actions` holds the untouched payloads for the
/// assistant turn that goes back into history.
#[derive(Debug)]
pub struct ModelReply {
    pub text: Option<String>,
    pub actions: Vec<Action>,
    pub raw_actions: Vec<Value>,
}

/// The remote instruction-following model, as the dispatcher sees it: one
/// synchronous round-trip taking the assembled history. No retry, no timeout
/// beyond the transport's own.
#[async_trait]
pub trait ModelService: Send + Sync {
    async fn respond(&self, turns: &[Turn]) -> Result<ModelReply, ModelError>;
}

#[derive(Clone)]
pub struct ModelConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub display: (u32, u32),
    pub environment: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("OPENAI_CUA_MODEL")
                .unwrap_or_else(|_| "computer-use-preview".into()),
            display: (1280, 800),
            environment: "browser".into(),
        }
    }
}

#[derive(Clone)]
pub struct ModelClient {
    http: Client,
    cfg: ModelConfig,
}

impl ModelClient {
    pub fn new(cfg: ModelConfig) -> Result<Self, ModelError> {
        if cfg.api_key.is_empty() {
            return Err(ModelError::MissingCredentials);
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    fn build_request(&self, turns: &[Turn]) -> Value {
        json!({
            "model": self.cfg.model,
            "truncation": "auto",
            "tools": [{
                "type": "computer_use_preview",
                "display_width": self.cfg.display.0,
                "display_height": self.cfg.display.1,
                "environment": self.cfg.environment,
                "actions": action_vocabulary(),
            }],
            "input": build_input(turns),
        })
    }
}

#[async_trait]
impl ModelService for ModelClient {
    async fn respond(&self, turns: &[Turn]) -> Result<ModelReply, ModelError> {
        let url = format!("{}/responses", self.cfg.api_base);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&self.build_request(turns))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ModelError::Api { status, body });
        }
        let v: Value = serde_json::from_str(&body)
            .map_err(|e| ModelError::Malformed(format!("invalid json: {e}")))?;
        parse_reply(&v)
    }
}

// ========================= Wire Assembly =========================

/// The declared vocabulary sent with every request: nine action kinds with
/// their parameter schemas.
fn action_vocabulary() -> Value {
    json!([
        {"type": "screenshot", "parameters": {}},
        {"type": "click", "parameters": {"x": "integer", "y": "integer", "button": ["left", "right", "middle"]}},
        {"type": "double_click", "parameters": {"x": "integer", "y": "integer"}},
        {"type": "type", "parameters": {"text": "string"}},
        {"type": "scroll", "parameters": {"x": "integer", "y": "integer", "scroll_x": "integer", "scroll_y": "integer"}},
        {"type": "wait", "parameters": {"duration_ms": "integer"}},
        {"type": "move", "parameters": {"x": "integer", "y": "integer"}},
        {"type": "keypress", "parameters": {"keys": "array of key names"}},
        {"type": "drag", "parameters": {"path": "array of {x, y} points"}},
    ])
}

fn build_input(turns: &[Turn]) -> Value {
    let items: Vec<Value> = turns
        .iter()
        .map(|turn| match turn.role {
            Role::User => {
                let mut content = Vec::new();
                if let Some(text) = &turn.text {
                    content.push(json!({"type": "input_text", "text": text}));
                }
                if let Some(img) = &turn.image_b64 {
                    content.push(json!({
                        "type": "input_image",
                        "image_url": format!("data:image/png;base64,{img}"),
                    }));
                }
                json!({"role": "user", "content": content})
            }
            Role::Assistant => {
                let mut content = Vec::new();
                if let Some(text) = &turn.text {
                    content.push(json!({"type": "output_text", "text": text}));
                }
                let mut item = json!({"role": "assistant", "content": content});
                if !turn.actions.is_empty() {
                    item["actions"] = Value::Array(turn.actions.clone());
                }
                item
            }
        })
        .collect();
    Value::Array(items)
}

// ========================= Response Parsing =========================

/// Walks the response `output` array, collecting the message text and every
/// `computer_call` action in the order the model returned them.
fn parse_reply(v: &Value) -> Result<ModelReply, ModelError> {
    let outputs = v
        .get("output")
        .and_then(|x| x.as_array())
        .ok_or_else(|| ModelError::Malformed("missing output array".into()))?;

    let mut text: Option<String> = None;
    let mut actions = Vec::new();
    let mut raw_actions = Vec::new();

    for o in outputs {
        match o.get("type").and_then(|x| x.as_str()) {
            Some("message") => {
                if let Some(t) = o.pointer("/content/0/text").and_then(|x| x.as_str()) {
                    text = Some(t.to_string());
                }
            }
            Some("computer_call") => {
                let raw = o.get("action").cloned().unwrap_or(Value::Null);
                actions.push(decode_action(&raw));
                raw_actions.push(raw);
            }
            _ => {}
        }
    }

    Ok(ModelReply {
        text,
        actions,
        raw_actions,
    })
}

fn get_i64(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(|x| x.as_i64()).unwrap_or(0)
}

/// Decodes one wire action object into the vocabulary. Anything outside the
/// nine known kinds comes back as `Action::Unknown` for the dispatcher to
/// log and skip.
pub fn decode_action(v: &Value) -> Action {
    let kind = v.get("type").and_then(|x| x.as_str()).unwrap_or("unknown");
    match kind {
        "screenshot" => Action::Screenshot,
        "click" => Action::Click {
            x: get_i64(v, "x"),
            y: get_i64(v, "y"),
            button: match v.get("button").and_then(|x| x.as_str()) {
                Some("right") => MouseButton::Right,
                Some("middle") => MouseButton::Middle,
                _ => MouseButton::Left,
            },
        },
        "double_click" => Action::DoubleClick {
            x: get_i64(v, "x"),
            y: get_i64(v, "y"),
        },
        "type" => Action::Type {
            text: v
                .get("text")
                .and_then(|x| x.as_str())
                .unwrap_or("")
                .to_string(),
        },
        "scroll" => Action::Scroll {
            x: get_i64(v, "x"),
            y: get_i64(v, "y"),
            dx: v
                .get("scroll_x")
                .or_else(|| v.get("dx"))
                .and_then(|x| x.as_i64())
                .unwrap_or(0),
            dy: v
                .get("scroll_y")
                .or_else(|| v.get("dy"))
                .and_then(|x| x.as_i64())
                .unwrap_or(0),
        },
        "wait" => Action::Wait {
            duration_ms: v
                .get("duration_ms")
                .or_else(|| v.get("ms"))
                .and_then(|x| x.as_u64())
                .unwrap_or(1000),
        },
        "move" => Action::Move {
            x: get_i64(v, "x"),
            y: get_i64(v, "y"),
        },
        "keypress" => {
            let keys = match v.get("keys").and_then(|x| x.as_array()) {
                Some(arr) => arr
                    .iter()
                    .filter_map(|k| k.as_str())
                    .map(|k| k.to_string())
                    .collect(),
                // Some deployments send a single "key" string instead.
                None => v
                    .get("key")
                    .and_then(|x| x.as_str())
                    .map(|k| vec![k.to_string()])
                    .unwrap_or_default(),
            };
            Action::Keypress { keys }
        }
        "drag" => {
            let path = v
                .get("path")
                .and_then(|x| x.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| {
                            Some(Point {
                                x: p.get("x")?.as_i64()?,
                                y: p.get("y")?.as_i64()?,
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Action::Drag { path }
        }
        other => Action::Unknown {
            kind: other.to_string(),
        },
    }
}

// ========================= Tests =========================
