//! Scripted backends and an in-memory store for exercising turns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use subchat_connectors::{
    ConnectorError, NativeStream, RemoteAgent, RemoteMessageRequest, RemoteResponse, SdkLauncher,
    SdkQuery, ToolPermissionRequest,
};
use subchat_protocol::{Chunk, Message, TurnMode, TurnRequest};

use crate::config::OrchestratorConfig;
use crate::orchestrator::Orchestrator;
use crate::persistence::{SessionIdWrite, StoreError, TurnSnapshot, TurnStore, TurnWrite};
use crate::registry::SessionRegistry;

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub(crate) rows: Mutex<HashMap<String, (TurnSnapshot, Option<String>)>>,
    pub(crate) touched: Mutex<Vec<String>>,
    pub(crate) failing_saves: Mutex<usize>,
}

impl MemoryStore {
    pub(crate) fn seed(&self, turn_id: &str, messages: Vec<Message>, session_id: Option<&str>) {
        self.rows.lock().unwrap().insert(
            turn_id.to_string(),
            (
                TurnSnapshot {
                    messages,
                    session_id: session_id.map(String::from),
                },
                None,
            ),
        );
    }

    pub(crate) fn snapshot(&self, turn_id: &str) -> TurnSnapshot {
        self.rows
            .lock()
            .unwrap()
            .get(turn_id)
            .map(|(snapshot, _)| snapshot.clone())
            .unwrap_or_default()
    }

    pub(crate) fn stream_id(&self, turn_id: &str) -> Option<String> {
        self.rows
            .lock()
            .unwrap()
            .get(turn_id)
            .and_then(|(_, stream)| stream.clone())
    }

    pub(crate) fn fail_next_saves(&self, count: usize) {
        *self.failing_saves.lock().unwrap() = count;
    }
}

#[async_trait]
impl TurnStore for MemoryStore {
    async fn load_turn(&self, turn_id: &str) -> Result<TurnSnapshot, StoreError> {
        Ok(self.snapshot(turn_id))
    }

    async fn save_turn(&self, turn_id: &str, write: TurnWrite) -> Result<(), StoreError> {
        {
            let mut failing = self.failing_saves.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
            }
        }
        let mut rows = self.rows.lock().unwrap();
        let entry = rows.entry(turn_id.to_string()).or_default();
        entry.0.messages = write.messages;
        match write.session_id {
            SessionIdWrite::Keep => {}
            SessionIdWrite::Set(id) => entry.0.session_id = Some(id),
            SessionIdWrite::Clear => entry.0.session_id = None,
        }
        entry.1 = write.stream_id;
        Ok(())
    }

    async fn touch_chat(
        &self,
        chat_id: &str,
        _updated_at: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.touched.lock().unwrap().push(chat_id.to_string());
        Ok(())
    }
}

pub(crate) enum Step {
    Item(Value),
    Fail(&'static str),
    /// Write the line to stderr, then exit non-zero
    Crash(&'static str),
    Ask(&'static str),
    /// Block until the backend is cancelled
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub(crate) resume: Option<String>,
    pub(crate) permission_mode: String,
    pub(crate) env: Vec<(String, String)>,
}

#[derive(Default)]
pub(crate) struct ScriptedLauncher {
    script: Mutex<Vec<Step>>,
    launches: Mutex<Vec<Launch>>,
}

impl ScriptedLauncher {
    pub(crate) fn with(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps),
            launches: Mutex::default(),
        }
    }

    pub(crate) fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl SdkLauncher for ScriptedLauncher {
    async fn launch(&self, query: SdkQuery) -> Result<NativeStream, ConnectorError> {
        self.launches.lock().unwrap().push(Launch {
            resume: query.resume.clone(),
            permission_mode: query.permission_mode.clone(),
            env: query.env.clone(),
        });
        let steps = std::mem::take(&mut *self.script.lock().unwrap());
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Item(value) => {
                        if tx.send(Ok(value)).await.is_err() {
                            return;
                        }
                    }
                    Step::Fail(message) => {
                        query.stderr.push_line("fatal: something broke");
                        let _ = tx
                            .send(Err(ConnectorError::ProviderError(message.to_string())))
                            .await;
                        return;
                    }
                    Step::Crash(line) => {
                        query.stderr.push_line(line);
                        let _ = tx
                            .send(Err(ConnectorError::ProcessExited { code: Some(1) }))
                            .await;
                        return;
                    }
                    Step::Ask(id) => {
                        query
                            .tool_gate
                            .can_use_tool(ToolPermissionRequest {
                                tool_name: "AskUserQuestion".into(),
                                input: json!({"questions": [{"question": "Proceed?"}]}),
                                tool_use_id: id.into(),
                            })
                            .await;
                    }
                    Step::Hang => {
                        query.cancel.cancelled().await;
                        return;
                    }
                }
            }
        });
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    pub(crate) created: Mutex<usize>,
    pub(crate) sent: Mutex<Vec<(String, RemoteMessageRequest)>>,
    /// Parts of the next reply; `None` answers with one text part
    pub(crate) reply: Mutex<Option<Vec<Value>>>,
}

#[async_trait]
impl RemoteAgent for FakeRemote {
    async fn create_session(&self, _directory: Option<&str>) -> Result<String, ConnectorError> {
        *self.created.lock().unwrap() += 1;
        Ok("ses_remote".into())
    }

    async fn send_message(
        &self,
        session_id: &str,
        request: &RemoteMessageRequest,
    ) -> Result<RemoteResponse, ConnectorError> {
        self.sent
            .lock()
            .unwrap()
            .push((session_id.to_string(), request.clone()));
        let parts = self
            .reply
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| vec![json!({"type": "text", "text": "remote hello"})]);
        Ok(RemoteResponse {
            info: json!({"id": "msg_1", "providerID": "anthropic", "modelID": "claude"}),
            parts,
        })
    }
}

pub(crate) struct Harness<S = MemoryStore> {
    pub(crate) orchestrator: Orchestrator,
    pub(crate) store: Arc<S>,
    pub(crate) launcher: Arc<ScriptedLauncher>,
    pub(crate) remote: Arc<FakeRemote>,
    pub(crate) registry: Arc<SessionRegistry>,
}

/// Quiet errors and a fast write retry
pub(crate) fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        verbose_errors: false,
        write_retry_delay: Duration::from_millis(1),
        ..OrchestratorConfig::default()
    }
}

pub(crate) fn harness(steps: Vec<Step>) -> Harness {
    harness_with(steps, Arc::new(MemoryStore::default()), test_config())
}

pub(crate) fn harness_with<S: TurnStore + 'static>(
    steps: Vec<Step>,
    store: Arc<S>,
    config: OrchestratorConfig,
) -> Harness<S> {
    let launcher = Arc::new(ScriptedLauncher::with(steps));
    let remote = Arc::new(FakeRemote::default());
    let registry = Arc::new(SessionRegistry::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        registry.clone(),
        launcher.clone(),
        remote.clone(),
        config,
    );
    Harness {
        orchestrator,
        store,
        launcher,
        remote,
        registry,
    }
}

pub(crate) fn request(prompt: &str) -> TurnRequest {
    TurnRequest {
        sub_chat_id: "sub-1".into(),
        chat_id: "chat-1".into(),
        prompt: prompt.into(),
        cwd: "/tmp/project".into(),
        mode: TurnMode::Agent,
        session_id: None,
        model: None,
        max_thinking_tokens: None,
        images: Vec::new(),
    }
}

pub(crate) fn stream_event(event: Value) -> Step {
    Step::Item(json!({"type": "stream_event", "session_id": "s-1", "event": event}))
}

pub(crate) fn text_delta(text: &str) -> Step {
    stream_event(json!({
        "type": "content_block_delta", "index": 0,
        "delta": {"type": "text_delta", "text": text}
    }))
}

pub(crate) fn init() -> Step {
    Step::Item(json!({"type": "system", "subtype": "init", "session_id": "s-1", "model": "claude-sonnet"}))
}

pub(crate) fn result() -> Step {
    Step::Item(json!({"type": "result", "subtype": "success", "session_id": "s-1", "is_error": false}))
}

pub(crate) fn finishes(chunks: &[Chunk]) -> usize {
    chunks.iter().filter(|c| c.is_finish()).count()
}
