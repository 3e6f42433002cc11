//! OpenCode HTTP connector
//!
//! The remote agent answers a message request with a single JSON document
//! `{info, parts}`. There is no streaming: [`OpenCodeTransform`] synthesizes a
//! chunk sequence from the finished parts.

use async_trait::async_trait;
use serde_json::{json, Value};
use subchat_protocol::{Chunk, ErrorDebugInfo, MessageMetadata};
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::{ConnectorError, ModelRef};

/// One prompt for the remote agent
#[derive(Debug, Clone, Default)]
pub struct RemoteMessageRequest {
    pub text: String,
    pub model: Option<ModelRef>,
    /// `plan` or `build`
    pub agent: Option<String>,
    /// Working tree the agent should operate in
    pub directory: Option<String>,
}

impl RemoteMessageRequest {
    fn body(&self, with_model: bool) -> Value {
        let mut body = json!({
            "parts": [{"type": "text", "text": self.text}],
        });
        if let (true, Some(model)) = (with_model, &self.model) {
            body["model"] = json!({
                "providerID": model.provider_id,
                "modelID": model.model_id,
            });
        }
        if let Some(agent) = &self.agent {
            body["agent"] = json!(agent);
        }
        body
    }
}

/// Finished assistant message returned by the remote agent
#[derive(Debug, Clone, Default)]
pub struct RemoteResponse {
    pub info: Value,
    pub parts: Vec<Value>,
}

#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Create a backend session and return its id.
    async fn create_session(&self, directory: Option<&str>) -> Result<String, ConnectorError>;

    async fn send_message(
        &self,
        session_id: &str,
        request: &RemoteMessageRequest,
    ) -> Result<RemoteResponse, ConnectorError>;
}

/// reqwest client for an OpenCode server
#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str, directory: Option<&str>) -> reqwest::RequestBuilder {
        let builder = self.http.post(format!("{}{}", self.base_url, path));
        match directory {
            Some(dir) => builder.query(&[("directory", dir)]),
            None => builder,
        }
    }

    async fn post_message(
        &self,
        session_id: &str,
        request: &RemoteMessageRequest,
        with_model: bool,
    ) -> Result<reqwest::Response, ConnectorError> {
        let resp = self
            .url(
                &format!("/session/{session_id}/message"),
                request.directory.as_deref(),
            )
            .json(&request.body(with_model))
            .send()
            .await?;
        Ok(resp)
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value, ConnectorError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ConnectorError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp.json().await?)
}

#[async_trait]
impl RemoteAgent for OpenCodeClient {
    async fn create_session(&self, directory: Option<&str>) -> Result<String, ConnectorError> {
        let resp = self.url("/session", directory).json(&json!({})).send().await?;
        let body = read_json(resp).await?;
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::ProviderError("Session response has no id".into()))?;
        info!(
            component = "opencode_connector",
            event = "opencode.session.created",
            session_id = %id,
            "Created remote session"
        );
        Ok(id.to_string())
    }

    async fn send_message(
        &self,
        session_id: &str,
        request: &RemoteMessageRequest,
    ) -> Result<RemoteResponse, ConnectorError> {
        let mut resp = self.post_message(session_id, request, true).await?;

        // Unknown provider/model pairs are rejected with 400; retry once on the server default.
        if resp.status() == reqwest::StatusCode::BAD_REQUEST && request.model.is_some() {
            warn!(
                component = "opencode_connector",
                event = "opencode.message.retry_without_model",
                session_id = %session_id,
                model = ?request.model,
                "Remote rejected model, retrying with server default"
            );
            resp = self.post_message(session_id, request, false).await?;
        }

        let body = read_json(resp).await?;
        let parts = body
            .get("parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(
            component = "opencode_connector",
            event = "opencode.message.received",
            session_id = %session_id,
            part_count = parts.len(),
            "Remote message completed"
        );
        Ok(RemoteResponse {
            info: body.get("info").cloned().unwrap_or(Value::Null),
            parts,
        })
    }
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// Synthesizes chunks from a finished remote response.
pub struct OpenCodeTransform {
    session_id: String,
    next_run: u64,
}

impl OpenCodeTransform {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next_run: 0,
        }
    }

    fn run_id(&mut self, prefix: &str) -> String {
        self.next_run += 1;
        format!("{prefix}-{}", self.next_run)
    }

    fn run(&mut self, reasoning: bool, text: &str) -> Vec<Chunk> {
        if reasoning {
            let id = self.run_id("reasoning");
            vec![
                Chunk::ReasoningStart { id: id.clone() },
                Chunk::ReasoningDelta {
                    id: id.clone(),
                    delta: text.to_string(),
                },
                Chunk::ReasoningEnd { id },
            ]
        } else {
            let id = self.run_id("text");
            vec![
                Chunk::TextStart { id: id.clone() },
                Chunk::TextDelta {
                    id: id.clone(),
                    delta: text.to_string(),
                },
                Chunk::TextEnd { id },
            ]
        }
    }

    pub fn transform(&mut self, response: &RemoteResponse) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for part in &response.parts {
            chunks.extend(self.part(part));
        }

        if let Some(err) = response.info.get("error").filter(|v| !v.is_null()) {
            let text = err
                .pointer("/data/message")
                .or_else(|| err.get("message"))
                .or_else(|| err.get("name"))
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| err.to_string());
            chunks.push(self.error_chunk(&text, response));
        }

        let metadata = info_metadata(&self.session_id, &response.info);
        if !metadata.is_empty() {
            chunks.push(Chunk::MessageMetadata {
                message_metadata: metadata,
            });
        }
        chunks
    }

    fn error_chunk(&self, text: &str, response: &RemoteResponse) -> Chunk {
        let category = classify(text);
        if category.is_auth() {
            return Chunk::AuthError {
                error_text: category.describe(text),
            };
        }
        Chunk::Error {
            error_text: category.describe(text),
            debug_info: Some(ErrorDebugInfo {
                category: Some(category.as_str().to_string()),
                session_id: Some(self.session_id.clone()),
                message_id: response
                    .info
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from),
                stderr: None,
            }),
        }
    }

    fn part(&mut self, part: &Value) -> Vec<Chunk> {
        match part.get("type").and_then(Value::as_str).unwrap_or("") {
            kind @ ("text" | "reasoning") => {
                let text = part.get("text").and_then(Value::as_str).unwrap_or("");
                if text.trim().is_empty() {
                    return vec![];
                }
                self.run(kind == "reasoning", text)
            }
            "tool" => tool_part(part),
            "file" => {
                let url = part.get("url").and_then(Value::as_str).unwrap_or("");
                if url.is_empty() {
                    return vec![];
                }
                let name = part
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or("file");
                self.run(false, &format!("[{name}]({url})"))
            }
            _ => vec![],
        }
    }
}

fn tool_part(part: &Value) -> Vec<Chunk> {
    let Some(call_id) = part
        .get("callID")
        .or_else(|| part.get("id"))
        .and_then(Value::as_str)
    else {
        return vec![];
    };
    let state = part.get("state").unwrap_or(&Value::Null);
    let mut chunks = vec![Chunk::ToolInputAvailable {
        tool_call_id: call_id.to_string(),
        tool_name: part
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        input: state
            .get("input")
            .cloned()
            .unwrap_or(Value::Object(Default::default())),
    }];

    match state.get("status").and_then(Value::as_str).unwrap_or("") {
        "completed" => chunks.push(Chunk::ToolOutputAvailable {
            tool_call_id: call_id.to_string(),
            output: state.get("output").cloned().unwrap_or(Value::Null),
        }),
        "error" => chunks.push(Chunk::ToolOutputError {
            tool_call_id: call_id.to_string(),
            error_text: state
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Tool failed")
                .to_string(),
        }),
        // pending/running: the call stays open
        _ => {}
    }
    chunks
}

fn info_metadata(session_id: &str, info: &Value) -> MessageMetadata {
    if info.is_null() {
        return MessageMetadata::default();
    }
    let model = match (
        info.get("providerID").and_then(Value::as_str),
        info.get("modelID").and_then(Value::as_str),
    ) {
        (Some(provider), Some(model)) => Some(format!("{provider}/{model}")),
        (None, Some(model)) => Some(model.to_string()),
        _ => None,
    };
    let duration_ms = match (
        info.pointer("/time/created").and_then(Value::as_u64),
        info.pointer("/time/completed").and_then(Value::as_u64),
    ) {
        (Some(start), Some(end)) if end >= start => Some(end - start),
        _ => None,
    };
    MessageMetadata {
        session_id: Some(session_id.to_string()),
        model,
        input_tokens: info.pointer("/tokens/input").and_then(Value::as_u64),
        output_tokens: info.pointer("/tokens/output").and_then(Value::as_u64),
        total_cost_usd: info.get("cost").and_then(Value::as_f64),
        duration_ms,
        result_subtype: None,
    }
}
