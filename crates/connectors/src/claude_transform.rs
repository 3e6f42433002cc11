//! Claude stream-json → chunk protocol.
//!
//! One transform per turn. It is fed native messages in order and returns the
//! chunks each one produces. Streaming (`stream_event`) and whole
//! (`assistant`) deliveries of the same content are reconciled here so the
//! consumer never sees text or a tool call twice.

use std::collections::HashSet;

use serde_json::Value;
use subchat_protocol::{Chunk, ErrorDebugInfo, MessageMetadata};
use tracing::{debug, info};

use crate::classify::classify;

/// Tool call whose input is still arriving as JSON fragments
struct StreamingTool {
    id: String,
    name: String,
    json: String,
    seed: Value,
}

#[derive(Default)]
pub struct ClaudeTransform {
    session_id: Option<String>,
    next_run: u64,
    open_text: Option<String>,
    open_reasoning: Option<String>,
    open_tool: Option<StreamingTool>,
    /// The current API message already delivered its text through deltas
    streamed_text: bool,
    streamed_reasoning: bool,
    emitted_tools: HashSet<String>,
    finished_tools: HashSet<String>,
}

impl ClaudeTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest backend session id seen on the stream.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn transform(&mut self, raw: &Value) -> Vec<Chunk> {
        if let Some(sid) = raw.get("session_id").and_then(Value::as_str) {
            if !sid.is_empty() {
                self.session_id = Some(sid.to_string());
            }
        }

        if let Some(text) = embedded_error(raw) {
            let mut chunks = self.close_runs();
            chunks.push(self.error_chunk(&text, raw));
            return chunks;
        }

        match raw.get("type").and_then(Value::as_str).unwrap_or("") {
            "system" => self.on_system(raw),
            "stream_event" => self.on_stream_event(raw),
            "assistant" => self.on_assistant(raw),
            "user" => self.on_user(raw),
            "result" => self.on_result(raw),
            _ => vec![],
        }
    }

    fn run_id(&mut self, prefix: &str) -> String {
        self.next_run += 1;
        format!("{prefix}-{}", self.next_run)
    }

    fn error_chunk(&self, text: &str, raw: &Value) -> Chunk {
        let category = classify(text);
        info!(
            component = "claude_transform",
            event = "claude.embedded_error",
            category = category.as_str(),
            error = %text,
            "Backend reported an error in-stream"
        );
        if category.is_auth() {
            return Chunk::AuthError {
                error_text: category.describe(text),
            };
        }
        let message_id = raw
            .pointer("/message/id")
            .or_else(|| raw.get("uuid"))
            .and_then(Value::as_str)
            .map(String::from);
        Chunk::Error {
            error_text: category.describe(text),
            debug_info: Some(ErrorDebugInfo {
                category: Some(category.as_str().to_string()),
                session_id: self.session_id.clone(),
                message_id,
                stderr: None,
            }),
        }
    }

    fn on_system(&mut self, raw: &Value) -> Vec<Chunk> {
        if raw.get("subtype").and_then(Value::as_str) != Some("init") {
            return vec![];
        }
        let model = raw.get("model").and_then(Value::as_str).map(String::from);
        debug!(
            component = "claude_transform",
            event = "claude.init",
            session_id = ?self.session_id,
            model = ?model,
            "Claude session initialized"
        );
        vec![Chunk::MessageMetadata {
            message_metadata: MessageMetadata {
                session_id: self.session_id.clone(),
                model,
                ..Default::default()
            },
        }]
    }

    fn on_stream_event(&mut self, raw: &Value) -> Vec<Chunk> {
        let Some(event) = raw.get("event") else {
            return vec![];
        };
        let mut chunks = Vec::new();

        match event.get("type").and_then(Value::as_str).unwrap_or("") {
            "message_start" => {
                self.streamed_text = false;
                self.streamed_reasoning = false;
            }
            "content_block_start" => {
                chunks.extend(self.close_runs());
                let block = event.get("content_block").unwrap_or(&Value::Null);
                match block.get("type").and_then(Value::as_str).unwrap_or("") {
                    "text" => {
                        let id = self.run_id("text");
                        chunks.push(Chunk::TextStart { id: id.clone() });
                        self.open_text = Some(id);
                    }
                    "thinking" => {
                        let id = self.run_id("reasoning");
                        chunks.push(Chunk::ReasoningStart { id: id.clone() });
                        self.open_reasoning = Some(id);
                    }
                    "tool_use" => {
                        let id = block.get("id").and_then(Value::as_str).unwrap_or("");
                        if !id.is_empty() {
                            self.open_tool = Some(StreamingTool {
                                id: id.to_string(),
                                name: block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown")
                                    .to_string(),
                                json: String::new(),
                                seed: block.get("input").cloned().unwrap_or(Value::Null),
                            });
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = event.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                    "text_delta" => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or("");
                        if text.is_empty() {
                            return chunks;
                        }
                        let id = match &self.open_text {
                            Some(id) => id.clone(),
                            None => {
                                let id = self.run_id("text");
                                chunks.push(Chunk::TextStart { id: id.clone() });
                                self.open_text = Some(id.clone());
                                id
                            }
                        };
                        self.streamed_text = true;
                        chunks.push(Chunk::TextDelta {
                            id,
                            delta: text.to_string(),
                        });
                    }
                    "thinking_delta" => {
                        let text = delta.get("thinking").and_then(Value::as_str).unwrap_or("");
                        if text.is_empty() {
                            return chunks;
                        }
                        let id = match &self.open_reasoning {
                            Some(id) => id.clone(),
                            None => {
                                let id = self.run_id("reasoning");
                                chunks.push(Chunk::ReasoningStart { id: id.clone() });
                                self.open_reasoning = Some(id.clone());
                                id
                            }
                        };
                        self.streamed_reasoning = true;
                        chunks.push(Chunk::ReasoningDelta {
                            id,
                            delta: text.to_string(),
                        });
                    }
                    "input_json_delta" => {
                        if let Some(tool) = &mut self.open_tool {
                            let partial = delta
                                .get("partial_json")
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            tool.json.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" | "message_stop" => chunks.extend(self.close_runs()),
            _ => {}
        }

        chunks
    }

    /// Close whatever run is open; a streamed tool call becomes available here.
    fn close_runs(&mut self) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        if let Some(id) = self.open_text.take() {
            chunks.push(Chunk::TextEnd { id });
        }
        if let Some(id) = self.open_reasoning.take() {
            chunks.push(Chunk::ReasoningEnd { id });
        }
        if let Some(tool) = self.open_tool.take() {
            let input = if tool.json.trim().is_empty() {
                match tool.seed {
                    Value::Null => Value::Object(Default::default()),
                    seed => seed,
                }
            } else {
                serde_json::from_str(&tool.json).unwrap_or(Value::String(tool.json))
            };
            chunks.extend(self.tool_input(tool.id, tool.name, input));
        }
        chunks
    }

    fn tool_input(&mut self, id: String, name: String, input: Value) -> Option<Chunk> {
        if !self.emitted_tools.insert(id.clone()) {
            return None;
        }
        Some(Chunk::ToolInputAvailable {
            tool_call_id: id,
            tool_name: name,
            input,
        })
    }

    fn on_assistant(&mut self, raw: &Value) -> Vec<Chunk> {
        let Some(blocks) = raw.pointer("/message/content").and_then(Value::as_array) else {
            debug!(
                component = "claude_transform",
                event = "claude.assistant.no_content_blocks",
                "Assistant message missing 'content' array"
            );
            return vec![];
        };

        let mut chunks = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str).unwrap_or("") {
                // Deltas already delivered this content
                "text" if self.streamed_text => {}
                "thinking" if self.streamed_reasoning => {}
                "text" => {
                    let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                    if !text.is_empty() {
                        let id = self.run_id("text");
                        chunks.push(Chunk::TextStart { id: id.clone() });
                        chunks.push(Chunk::TextDelta {
                            id: id.clone(),
                            delta: text.to_string(),
                        });
                        chunks.push(Chunk::TextEnd { id });
                    }
                }
                "thinking" => {
                    let text = block.get("thinking").and_then(Value::as_str).unwrap_or("");
                    if !text.is_empty() {
                        let id = self.run_id("reasoning");
                        chunks.push(Chunk::ReasoningStart { id: id.clone() });
                        chunks.push(Chunk::ReasoningDelta {
                            id: id.clone(),
                            delta: text.to_string(),
                        });
                        chunks.push(Chunk::ReasoningEnd { id });
                    }
                }
                "tool_use" => {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or("");
                    if id.is_empty() {
                        continue;
                    }
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let input = block
                        .get("input")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default()));
                    chunks.extend(self.tool_input(id.to_string(), name, input));
                }
                _ => {}
            }
        }
        chunks
    }

    /// Echoed `user` messages carry tool results.
    fn on_user(&mut self, raw: &Value) -> Vec<Chunk> {
        if raw.get("isReplay").and_then(Value::as_bool).unwrap_or(false) {
            return vec![];
        }
        let Some(blocks) = raw.pointer("/message/content").and_then(Value::as_array) else {
            return vec![];
        };

        let mut chunks = Vec::new();
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let Some(id) = block.get("tool_use_id").and_then(Value::as_str) else {
                continue;
            };
            if !self.finished_tools.insert(id.to_string()) {
                continue;
            }
            let output = tool_result_output(block.get("content"));
            let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            if is_error {
                let error_text = match output {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                chunks.push(Chunk::ToolOutputError {
                    tool_call_id: id.to_string(),
                    error_text,
                });
            } else {
                chunks.push(Chunk::ToolOutputAvailable {
                    tool_call_id: id.to_string(),
                    output,
                });
            }
        }
        chunks
    }

    fn on_result(&mut self, raw: &Value) -> Vec<Chunk> {
        let mut chunks = self.close_runs();
        let (input_tokens, output_tokens) = extract_token_usage(raw);
        chunks.push(Chunk::MessageMetadata {
            message_metadata: MessageMetadata {
                session_id: self.session_id.clone(),
                model: None,
                input_tokens,
                output_tokens,
                total_cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
                duration_ms: raw.get("duration_ms").and_then(Value::as_u64),
                result_subtype: raw.get("subtype").and_then(Value::as_str).map(String::from),
            },
        });
        chunks
    }
}

/// Error text carried by a native message, if it reports one.
fn embedded_error(raw: &Value) -> Option<String> {
    let msg_type = raw.get("type").and_then(Value::as_str).unwrap_or("");
    if msg_type == "error" {
        let text = raw
            .pointer("/error/message")
            .or_else(|| raw.get("error"))
            .or_else(|| raw.get("message"))
            .map(value_text)
            .unwrap_or_else(|| "Unknown error".to_string());
        return Some(text);
    }

    if let Some(err) = raw.get("error").filter(|v| !v.is_null()) {
        // The assistant text usually carries the human-readable form
        let detail = raw
            .pointer("/message/content/0/text")
            .and_then(Value::as_str)
            .map(String::from);
        let code = err
            .get("message")
            .map(value_text)
            .unwrap_or_else(|| value_text(err));
        return Some(match detail {
            Some(detail) if !detail.is_empty() => format!("{code}: {detail}"),
            _ => code,
        });
    }

    if msg_type == "result" && raw.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
        let text = raw
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .map(value_text)
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .filter(|s| !s.is_empty())
            .or_else(|| raw.get("result").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| {
                raw.get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or("error")
                    .to_string()
            });
        return Some(text);
    }

    None
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Tool result content is a string or a list of text blocks; anything else is kept as-is.
fn tool_result_output(content: Option<&Value>) -> Value {
    match content {
        None => Value::String(String::new()),
        Some(Value::Array(blocks)) => {
            let texts: Option<Vec<&str>> = blocks
                .iter()
                .map(|b| {
                    (b.get("type").and_then(Value::as_str) == Some("text"))
                        .then(|| b.get("text").and_then(Value::as_str))
                        .flatten()
                })
                .collect();
            match texts {
                Some(texts) => Value::String(texts.join("\n")),
                None => Value::Array(blocks.clone()),
            }
        }
        Some(other) => other.clone(),
    }
}

/// Sum per-model usage, falling back to the flat `usage` object.
fn extract_token_usage(raw: &Value) -> (Option<u64>, Option<u64>) {
    if let Some(Value::Object(models)) = raw.get("modelUsage") {
        let (mut input, mut output) = (0u64, 0u64);
        for stats in models.values() {
            input += stats.get("inputTokens").and_then(Value::as_u64).unwrap_or(0);
            input += stats
                .get("cacheReadInputTokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            output += stats.get("outputTokens").and_then(Value::as_u64).unwrap_or(0);
        }
        if input > 0 || output > 0 {
            return (Some(input), Some(output));
        }
    }

    if let Some(usage) = raw.get("usage") {
        let input = usage.get("input_tokens").and_then(Value::as_u64);
        let cached = usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output = usage.get("output_tokens").and_then(Value::as_u64);
        return (input.map(|i| i + cached), output);
    }

    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(transform: &mut ClaudeTransform, items: &[Value]) -> Vec<Chunk> {
        items.iter().flat_map(|item| transform.transform(item)).collect()
    }

    fn stream_event(event: Value) -> Value {
        json!({"type": "stream_event", "session_id": "s-1", "event": event})
    }

    #[test]
    fn init_reports_session_and_model() {
        let mut t = ClaudeTransform::new();
        let chunks = t.transform(&json!({
            "type": "system", "subtype": "init", "session_id": "s-1", "model": "claude-sonnet"
        }));
        assert_eq!(t.session_id(), Some("s-1"));
        match &chunks[..] {
            [Chunk::MessageMetadata { message_metadata }] => {
                assert_eq!(message_metadata.session_id.as_deref(), Some("s-1"));
                assert_eq!(message_metadata.model.as_deref(), Some("claude-sonnet"));
            }
            other => panic!("unexpected chunks: {other:?}"),
        }
    }

    #[test]
    fn streamed_text_is_not_repeated_by_assistant_message() {
        let mut t = ClaudeTransform::new();
        let chunks = feed(
            &mut t,
            &[
                stream_event(json!({"type": "message_start"})),
                stream_event(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
                stream_event(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}})),
                stream_event(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}})),
                stream_event(json!({"type": "content_block_stop", "index": 0})),
                json!({"type": "assistant", "message": {"id": "m1", "content": [{"type": "text", "text": "Hello"}]}}),
            ],
        );
        let kinds: Vec<_> = chunks.iter().map(Chunk::kind).collect();
        assert_eq!(
            kinds,
            vec!["text-start", "text-delta", "text-delta", "text-end"]
        );
    }

    #[test]
    fn unstreamed_assistant_blocks_are_emitted_whole() {
        let mut t = ClaudeTransform::new();
        let chunks = t.transform(&json!({
            "type": "assistant",
            "message": {"id": "m1", "content": [
                {"type": "thinking", "thinking": "pondering"},
                {"type": "text", "text": "Done."},
                {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}}
            ]}
        }));
        let kinds: Vec<_> = chunks.iter().map(Chunk::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "reasoning-start",
                "reasoning-delta",
                "reasoning-end",
                "text-start",
                "text-delta",
                "text-end",
                "tool-input-available"
            ]
        );
    }

    #[test]
    fn streamed_tool_input_is_parsed_at_block_stop_and_not_duplicated() {
        let mut t = ClaudeTransform::new();
        let chunks = feed(
            &mut t,
            &[
                stream_event(json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {}}})),
                stream_event(json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"file_path\":"}})),
                stream_event(json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"/tmp/a\"}"}})),
                stream_event(json!({"type": "content_block_stop", "index": 1})),
                json!({"type": "assistant", "message": {"content": [{"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/tmp/a"}}]}}),
            ],
        );
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            Chunk::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                assert_eq!(tool_call_id, "toolu_1");
                assert_eq!(tool_name, "Read");
                assert_eq!(input["file_path"], "/tmp/a");
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn tool_results_map_to_output_or_error_once() {
        let mut t = ClaudeTransform::new();
        let result = json!({
            "type": "user",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "a.txt"}]},
                {"type": "tool_result", "tool_use_id": "toolu_2", "content": "permission denied", "is_error": true}
            ]}
        });
        let chunks = t.transform(&result);
        assert_eq!(
            chunks,
            vec![
                Chunk::ToolOutputAvailable {
                    tool_call_id: "toolu_1".into(),
                    output: json!("a.txt"),
                },
                Chunk::ToolOutputError {
                    tool_call_id: "toolu_2".into(),
                    error_text: "permission denied".into(),
                },
            ]
        );
        assert!(t.transform(&result).is_empty());
    }

    #[test]
    fn result_closes_runs_and_reports_usage() {
        let mut t = ClaudeTransform::new();
        feed(
            &mut t,
            &[stream_event(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "partial"}}))],
        );
        let chunks = t.transform(&json!({
            "type": "result", "subtype": "success", "is_error": false, "session_id": "s-2",
            "duration_ms": 1200, "total_cost_usd": 0.02,
            "usage": {"input_tokens": 10, "cache_read_input_tokens": 5, "output_tokens": 7}
        }));
        assert_eq!(chunks[0].kind(), "text-end");
        match &chunks[1] {
            Chunk::MessageMetadata { message_metadata } => {
                assert_eq!(message_metadata.session_id.as_deref(), Some("s-2"));
                assert_eq!(message_metadata.input_tokens, Some(15));
                assert_eq!(message_metadata.output_tokens, Some(7));
                assert_eq!(message_metadata.duration_ms, Some(1200));
                assert_eq!(message_metadata.result_subtype.as_deref(), Some("success"));
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn embedded_authentication_error_becomes_auth_error() {
        let mut t = ClaudeTransform::new();
        let chunks = t.transform(&json!({
            "type": "assistant",
            "error": "authentication_failed",
            "message": {"id": "m1", "content": [{"type": "text", "text": "Invalid API key · Please run /login"}]}
        }));
        assert!(matches!(&chunks[..], [Chunk::AuthError { .. }]));
    }

    #[test]
    fn embedded_rate_limit_carries_debug_info() {
        let mut t = ClaudeTransform::new();
        t.transform(&json!({"type": "system", "subtype": "init", "session_id": "s-3"}));
        let chunks = t.transform(&json!({
            "type": "error", "error": {"type": "rate_limit_error", "message": "rate limit reached"}
        }));
        match &chunks[..] {
            [Chunk::Error {
                debug_info: Some(info),
                ..
            }] => {
                assert_eq!(info.category.as_deref(), Some("rate_limit_exceeded"));
                assert_eq!(info.session_id.as_deref(), Some("s-3"));
            }
            other => panic!("unexpected chunks: {other:?}"),
        }
    }

    #[test]
    fn failed_resume_result_is_classified_as_session_not_found() {
        let mut t = ClaudeTransform::new();
        let chunks = t.transform(&json!({
            "type": "result", "subtype": "error_during_execution", "is_error": true,
            "errors": ["No conversation found with session ID: abc"]
        }));
        match &chunks[..] {
            [Chunk::Error {
                debug_info: Some(info),
                ..
            }] => assert_eq!(info.category.as_deref(), Some("session_not_found")),
            other => panic!("unexpected chunks: {other:?}"),
        }
    }
}
