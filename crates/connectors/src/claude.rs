//! Claude CLI connector
//!
//! Spawns the `claude` CLI for a single turn and talks to it over stdin/stdout
//! using the NDJSON stream-json protocol. Control traffic (initialize,
//! thinking budget, `can_use_tool` permission prompts) is handled here; every
//! other stdout message is handed to the caller as a native stream item.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use subchat_protocol::ImageAttachment;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ConnectorError, NativeStream};

/// Bytes of stderr kept for error reports
const STDERR_TAIL_BYTES: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Stdin messages (Rust → CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        session_id: String,
        message: UserMessagePayload,
        parent_tool_use_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    Initialize {},
    SetMaxThinkingTokens { max_thinking_tokens: Option<u64> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponsePayload {
    Success { request_id: String, response: Value },
}

fn encode(msg: &StdinMessage) -> Result<String, ConnectorError> {
    serde_json::to_string(msg).map_err(ConnectorError::JsonError)
}

// ---------------------------------------------------------------------------
// Permission callback
// ---------------------------------------------------------------------------

/// A `can_use_tool` prompt raised by the CLI
#[derive(Debug, Clone)]
pub struct ToolPermissionRequest {
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: String,
}

/// Answer to a permission prompt
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow { updated_input: Value },
    Deny { message: String, interrupt: bool },
}

impl PermissionDecision {
    /// Wire shape the CLI expects inside a `control_response`.
    pub fn into_payload(self, tool_use_id: &str) -> Value {
        match self {
            PermissionDecision::Allow { updated_input } => json!({
                "behavior": "allow",
                "updatedInput": updated_input,
                "toolUseID": tool_use_id,
            }),
            PermissionDecision::Deny { message, interrupt } => json!({
                "behavior": "deny",
                "message": message,
                "interrupt": interrupt,
                "toolUseID": tool_use_id,
            }),
        }
    }
}

/// Decides tool permission prompts for one turn.
#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn can_use_tool(&self, request: ToolPermissionRequest) -> PermissionDecision;
}

// ---------------------------------------------------------------------------
// Query + launcher
// ---------------------------------------------------------------------------

/// Shared tail of the CLI's stderr, read when a turn fails.
#[derive(Debug, Clone, Default)]
pub struct StderrSink {
    buf: Arc<Mutex<String>>,
}

impl StderrSink {
    pub fn push_line(&self, line: &str) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.push_str(line);
        buf.push('\n');
        if buf.len() > STDERR_TAIL_BYTES {
            let mut cut = buf.len() - STDERR_TAIL_BYTES;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    pub fn snapshot(&self) -> Option<String> {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let trimmed = buf.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Everything needed to run one turn against the local agent
pub struct SdkQuery {
    pub prompt: String,
    pub images: Vec<ImageAttachment>,
    pub cwd: String,
    /// `plan` or `bypassPermissions`
    pub permission_mode: String,
    pub resume: Option<String>,
    pub model: Option<String>,
    pub max_thinking_tokens: Option<u64>,
    pub env: Vec<(String, String)>,
    pub tool_gate: Arc<dyn ToolGate>,
    pub stderr: StderrSink,
    pub cancel: CancellationToken,
}

impl SdkQuery {
    fn cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--verbose",
            "--input-format",
            "stream-json",
            "--permission-prompt-tool",
            "stdio",
            "--include-partial-messages",
            "--permission-mode",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(self.permission_mode.clone());

        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(resume) = &self.resume {
            args.extend(["--resume".to_string(), resume.clone()]);
        }
        args
    }

    fn user_message(&self) -> StdinMessage {
        let mut content = vec![UserContentBlock::Text {
            text: self.prompt.clone(),
        }];
        content.extend(self.images.iter().map(|image| UserContentBlock::Image {
            source: ImageSource {
                kind: "base64",
                media_type: image.media_type.clone(),
                data: image.base64_data.clone(),
            },
        }));
        StdinMessage::User {
            session_id: String::new(),
            message: UserMessagePayload {
                role: "user",
                content,
            },
            parent_tool_use_id: None,
        }
    }
}

/// Starts the local agent for a turn.
#[async_trait]
pub trait SdkLauncher: Send + Sync {
    async fn launch(&self, query: SdkQuery) -> Result<NativeStream, ConnectorError>;
}

/// Launches the real `claude` binary
#[derive(Debug, Clone, Default)]
pub struct ClaudeLauncher {
    binary: Option<PathBuf>,
}

impl ClaudeLauncher {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl SdkLauncher for ClaudeLauncher {
    async fn launch(&self, query: SdkQuery) -> Result<NativeStream, ConnectorError> {
        let claude_bin = resolve_claude_binary(self.binary.as_deref())?;
        let args = query.cli_args();

        info!(
            component = "claude_connector",
            event = "claude.spawn",
            cwd = %query.cwd,
            claude_bin = %claude_bin.display(),
            resume_id = ?query.resume,
            permission_mode = %query.permission_mode,
            "Spawning Claude CLI"
        );

        let mut child = tokio::process::Command::new(&claude_bin)
            .args(&args)
            .current_dir(&query.cwd)
            .envs(query.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CLAUDE_CODE_ENTRYPOINT", "subchat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectorError::SpawnError(format!("claude CLI: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::ProviderError("No stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::ProviderError("No stdout on child".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let sink = query.stderr.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "claude_connector",
                        event = "claude.stderr",
                        line = %line,
                        "Claude CLI stderr"
                    );
                    sink.push_line(&line);
                }
            });
        }

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(64);
        tokio::spawn(stdin_writer(stdin, stdin_rx));

        stdin_tx
            .send(encode(&StdinMessage::ControlRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                request: ControlRequestBody::Initialize {},
            })?)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)?;
        if query.max_thinking_tokens.is_some() {
            stdin_tx
                .send(encode(&StdinMessage::ControlRequest {
                    request_id: uuid::Uuid::new_v4().to_string(),
                    request: ControlRequestBody::SetMaxThinkingTokens {
                        max_thinking_tokens: query.max_thinking_tokens,
                    },
                })?)
                .await
                .map_err(|_| ConnectorError::ChannelClosed)?;
        }
        stdin_tx
            .send(encode(&query.user_message())?)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)?;

        let (out_tx, out_rx) = mpsc::channel(256);
        tokio::spawn(supervise(
            child,
            stdout,
            stdin_tx,
            out_tx,
            query.tool_gate,
            query.cancel,
        ));

        Ok(futures::stream::unfold(out_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

/// Dedicated stdin writer task: reads from channel, writes to child stdin.
/// Dropping every sender closes stdin, which ends the CLI after its turn.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.write_error",
                error = %e,
                "Failed to write to CLI stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.flush_error",
                error = %e,
                "Failed to flush CLI stdin"
            );
            break;
        }
    }
    debug!(
        component = "claude_connector",
        event = "claude.stdin.closed",
        "Stdin writer task ended"
    );
}

/// Read stdout line-by-line until EOF, cancellation, or the consumer going away.
async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stdin_tx: mpsc::Sender<String>,
    out_tx: mpsc::Sender<Result<Value, ConnectorError>>,
    gate: Arc<dyn ToolGate>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut stdin_tx = Some(stdin_tx);
    let mut saw_result = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(
                    component = "claude_connector",
                    event = "claude.cancelled",
                    "Turn cancelled, killing Claude CLI"
                );
                let _ = child.start_kill();
                return;
            }
            _ = out_tx.closed() => {
                debug!(
                    component = "claude_connector",
                    event = "claude.consumer_gone",
                    "Stream consumer dropped, killing Claude CLI"
                );
                let _ = child.start_kill();
                return;
            }
            line = lines.next_line() => line,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(
                    component = "claude_connector",
                    event = "claude.stdout.read_error",
                    error = %e,
                    "Error reading CLI stdout"
                );
                let _ = out_tx.send(Err(e.into())).await;
                let _ = child.start_kill();
                return;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    component = "claude_connector",
                    event = "claude.stdout.parse_error",
                    error = %e,
                    line_preview = %line.chars().take(200).collect::<String>(),
                    "Failed to parse stdout JSON"
                );
                continue;
            }
        };

        match raw.get("type").and_then(Value::as_str).unwrap_or("") {
            "control_request" => {
                if let Some(tx) = &stdin_tx {
                    handle_cli_control_request(&raw, tx.clone(), gate.clone());
                }
            }
            "control_response" => log_control_response(&raw),
            "control_cancel_request" | "keep_alive" => {}
            msg_type => {
                let is_result = msg_type == "result";
                if out_tx.send(Ok(raw)).await.is_err() {
                    let _ = child.start_kill();
                    return;
                }
                if is_result {
                    // One prompt per process: closing stdin lets the CLI exit.
                    saw_result = true;
                    stdin_tx = None;
                }
            }
        }
    }

    info!(
        component = "claude_connector",
        event = "claude.stdout.eof",
        saw_result,
        "Claude CLI stdout EOF"
    );

    match child.wait().await {
        Ok(status) if !status.success() && !saw_result => {
            let _ = out_tx
                .send(Err(ConnectorError::ProcessExited {
                    code: status.code(),
                }))
                .await;
        }
        Err(e) if !saw_result => {
            let _ = out_tx.send(Err(e.into())).await;
        }
        _ => {}
    }
}

/// Answer a `can_use_tool` prompt off the read loop so other output keeps flowing.
fn handle_cli_control_request(raw: &Value, stdin_tx: mpsc::Sender<String>, gate: Arc<dyn ToolGate>) {
    let Some(request) = raw.get("request") else {
        return;
    };
    let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or("");
    if subtype != "can_use_tool" {
        debug!(
            component = "claude_connector",
            event = "claude.control_request.unhandled",
            subtype = %subtype,
            "Unhandled CLI control request subtype"
        );
        return;
    }

    let request_id = raw
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let permission = ToolPermissionRequest {
        tool_name: request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        input: request.get("input").cloned().unwrap_or(Value::Null),
        tool_use_id: request
            .get("tool_use_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    };

    debug!(
        component = "claude_connector",
        event = "claude.approval_requested",
        request_id = %request_id,
        tool_name = %permission.tool_name,
        tool_use_id = %permission.tool_use_id,
        "CLI requesting tool permission"
    );

    tokio::spawn(async move {
        let tool_use_id = permission.tool_use_id.clone();
        let decision = gate.can_use_tool(permission).await;
        let msg = StdinMessage::ControlResponse {
            response: ControlResponsePayload::Success {
                request_id,
                response: decision.into_payload(&tool_use_id),
            },
        };
        match encode(&msg) {
            Ok(line) => {
                let _ = stdin_tx.send(line).await;
            }
            Err(e) => warn!(
                component = "claude_connector",
                event = "claude.control_response.encode_failed",
                error = %e,
                "Failed to encode permission response"
            ),
        }
    });
}

fn log_control_response(raw: &Value) {
    let response = raw.get("response");
    let subtype = response
        .and_then(|r| r.get("subtype"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if subtype == "error" {
        warn!(
            component = "claude_connector",
            event = "claude.control_response.error",
            error = ?response.and_then(|r| r.get("error")),
            "CLI rejected control request"
        );
    }
}

/// Resolve the claude binary path.
/// 1. Explicit configuration
/// 2. Search PATH via `which`
/// 3. ~/.claude/local/claude
fn resolve_claude_binary(explicit: Option<&Path>) -> Result<PathBuf, ConnectorError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        warn!(
            component = "claude_connector",
            event = "claude.binary.configured_not_found",
            path = %path.display(),
            "Configured claude binary does not exist, trying fallbacks"
        );
    }

    if let Ok(output) = std::process::Command::new("which").arg("claude").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() && Path::new(&path).exists() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let local_path = PathBuf::from(home).join(".claude/local/claude");
        if local_path.exists() {
            return Ok(local_path);
        }
    }

    Err(ConnectorError::ProviderError(
        "Claude CLI binary not found. Install Claude Code or set SUBCHAT_CLAUDE_BIN.".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowAll;

    #[async_trait]
    impl ToolGate for AllowAll {
        async fn can_use_tool(&self, request: ToolPermissionRequest) -> PermissionDecision {
            PermissionDecision::Allow {
                updated_input: request.input,
            }
        }
    }

    fn query(permission_mode: &str) -> SdkQuery {
        SdkQuery {
            prompt: "hello".into(),
            images: vec![],
            cwd: std::env::temp_dir().display().to_string(),
            permission_mode: permission_mode.into(),
            resume: None,
            model: None,
            max_thinking_tokens: None,
            env: vec![],
            tool_gate: Arc::new(AllowAll),
            stderr: StderrSink::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn args_carry_mode_model_and_resume() {
        let mut q = query("plan");
        q.model = Some("opus".into());
        q.resume = Some("sess-9".into());
        let args = q.cli_args();
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--permission-mode") + 1], "plan");
        assert_eq!(args[pos("--model") + 1], "opus");
        assert_eq!(args[pos("--resume") + 1], "sess-9");
        assert!(args.contains(&"--include-partial-messages".to_string()));
    }

    #[test]
    fn user_message_carries_images_as_base64_blocks() {
        let mut q = query("bypassPermissions");
        q.images.push(ImageAttachment {
            base64_data: "aGk=".into(),
            media_type: "image/png".into(),
            filename: None,
        });
        let value = serde_json::to_value(q.user_message()).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"][0]["text"], "hello");
        assert_eq!(value["message"]["content"][1]["type"], "image");
        assert_eq!(value["message"]["content"][1]["source"]["type"], "base64");
        assert_eq!(value["message"]["content"][1]["source"]["media_type"], "image/png");
    }

    #[test]
    fn permission_payloads_match_cli_shape() {
        let deny = PermissionDecision::Deny {
            message: "Timed out".into(),
            interrupt: false,
        }
        .into_payload("toolu_1");
        assert_eq!(deny["behavior"], "deny");
        assert_eq!(deny["message"], "Timed out");
        assert_eq!(deny["toolUseID"], "toolu_1");

        let allow = PermissionDecision::Allow {
            updated_input: json!({"answers": {"q": "yes"}}),
        }
        .into_payload("toolu_2");
        assert_eq!(allow["behavior"], "allow");
        assert_eq!(allow["updatedInput"]["answers"]["q"], "yes");
    }

    #[test]
    fn stderr_sink_keeps_only_the_tail() {
        let sink = StderrSink::default();
        assert!(sink.snapshot().is_none());
        for i in 0..2000 {
            sink.push_line(&format!("line {i}"));
        }
        let tail = sink.snapshot().unwrap();
        assert!(tail.len() <= STDERR_TAIL_BYTES);
        assert!(tail.ends_with("line 1999"));
    }

    #[test]
    fn missing_configured_binary_falls_through() {
        let result = resolve_claude_binary(Some(Path::new("/definitely/not/here/claude")));
        if let Err(err) = result {
            assert!(err.to_string().contains("binary not found"));
        }
    }

    #[cfg(unix)]
    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_messages_and_ends_after_result() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_cli(
            dir.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"s-1","model":"sonnet"}'
echo '{"type":"keep_alive"}'
echo '{"type":"result","subtype":"success","session_id":"s-1","is_error":false}'"#,
        );
        let launcher = ClaudeLauncher::new(Some(bin));
        let mut stream = launcher.launch(query("bypassPermissions")).await.unwrap();

        let mut types = Vec::new();
        while let Some(item) = stream.next().await {
            let value = item.unwrap();
            types.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(types, vec!["system", "result"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crash_without_result_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_cli(dir.path(), "echo 'boom' >&2\nexit 3");
        let launcher = ClaudeLauncher::new(Some(bin));
        let q = query("bypassPermissions");
        let stderr = q.stderr.clone();
        let mut stream = launcher.launch(q).await.unwrap();

        let item = stream.next().await.expect("one error item");
        match item {
            Err(ConnectorError::ProcessExited { code }) => assert_eq!(code, Some(3)),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().await.is_none());
        // stderr reader may lag the exit slightly
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(stderr.snapshot().as_deref(), Some("boom"));
    }
}
