//! Session orchestrator
//!
//! One spawned driver per turn. The driver loads the sub-chat, persists the
//! prompt, runs the backend chosen by the model id and streams the transformed
//! chunks to the subscriber. Every exit path goes through `finalize`, which
//! writes whatever was accumulated and sends the closing `finish`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use subchat_connectors::{
    classify_with_stderr, BackendRoute, ClaudeTransform, ConnectorError, ModelRef,
    OpenCodeTransform, RemoteAgent, RemoteMessageRequest, SdkLauncher, SdkQuery, StderrSink,
};
use subchat_protocol::{
    new_id, ApprovalResponse, Chunk, ErrorDebugInfo, ImagePart, Message, MessagePart, Role,
    TurnMode, TurnOutcome, TurnRequest,
};

use crate::accumulator::PartAccumulator;
use crate::approval::{ApprovalGate, SESSION_ENDED};
use crate::config::OrchestratorConfig;
use crate::persistence::{SessionIdWrite, StoreError, TurnStore, TurnWrite};
use crate::registry::SessionRegistry;
use crate::turn::{transition, TurnEffect, TurnEvent, TurnState};

pub const TURN_ALREADY_ACTIVE: &str = "A response is already streaming for this chat";
const SAVE_FAILED: &str = "Failed to save the conversation";
const INTERNAL_FAILURE: &str = "Something went wrong while running this turn";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] ConnectorError),
}

pub struct Orchestrator {
    store: Arc<dyn TurnStore>,
    registry: Arc<SessionRegistry>,
    launcher: Arc<dyn SdkLauncher>,
    remote: Arc<dyn RemoteAgent>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TurnStore>,
        registry: Arc<SessionRegistry>,
        launcher: Arc<dyn SdkLauncher>,
        remote: Arc<dyn RemoteAgent>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            launcher,
            remote,
            config,
        }
    }

    /// Start a turn. A second subscription for a turn that is still live is
    /// answered with an error and `finish`; the running stream is untouched.
    pub fn subscribe(&self, request: TurnRequest) -> TurnSubscription {
        let turn_id = request.sub_chat_id.clone();
        let stream_id = new_id();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.chunk_buffer.max(2));

        if !self.registry.register_turn(&turn_id, &stream_id, cancel.clone()) {
            warn!(
                component = "orchestrator",
                event = "turn.rejected_duplicate",
                turn_id = %turn_id,
                "Turn already has a live stream"
            );
            let task = tokio::spawn(async move {
                let _ = tx.send(Chunk::error(TURN_ALREADY_ACTIVE)).await;
                let _ = tx.send(Chunk::Finish).await;
                TurnOutcome::Errored
            });
            return TurnSubscription {
                turn_id,
                rx,
                cancel,
                task,
            };
        }

        let driver = TurnDriver {
            state: TurnState::new(request.mode),
            request,
            stream_id,
            store: self.store.clone(),
            registry: self.registry.clone(),
            launcher: self.launcher.clone(),
            remote: self.remote.clone(),
            config: self.config.clone(),
            tx,
            backend_cancel: cancel.child_token(),
            cancel: cancel.clone(),
            accumulator: PartAccumulator::new(),
            messages: Vec::new(),
            loaded: false,
            session_id: None,
            session_invalid: false,
            stderr: None,
        };
        let task = tokio::spawn(driver.run());

        TurnSubscription {
            turn_id,
            rx,
            cancel,
            task,
        }
    }

    /// Stop a live turn; its subscriber still receives `finish`.
    pub fn cancel(&self, turn_id: &str) -> bool {
        self.registry.cancel_turn(turn_id)
    }

    pub fn is_active(&self, turn_id: &str) -> bool {
        self.registry.is_active(turn_id)
    }

    pub fn respond_tool_approval(&self, response: ApprovalResponse) -> bool {
        let tool_use_id = response.tool_use_id.clone();
        let ok = self.registry.resolve_approval(response);
        info!(
            component = "orchestrator",
            event = "approval.responded",
            tool_use_id = %tool_use_id,
            ok = ok,
            "Tool approval response"
        );
        ok
    }
}

/// Subscriber side of one turn
pub struct TurnSubscription {
    turn_id: String,
    rx: mpsc::Receiver<Chunk>,
    cancel: CancellationToken,
    task: JoinHandle<TurnOutcome>,
}

impl TurnSubscription {
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub async fn next(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Outcome once the stream has been drained.
    pub async fn outcome(self) -> TurnOutcome {
        join_outcome(self.task).await
    }

    /// Detach and tear the turn down. Returns after finalization, so pending
    /// approvals are resolved and the turn is persisted.
    pub async fn unsubscribe(self) -> TurnOutcome {
        self.cancel.cancel();
        drop(self.rx);
        join_outcome(self.task).await
    }

    pub async fn collect(mut self) -> (Vec<Chunk>, TurnOutcome) {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            chunks.push(chunk);
        }
        (chunks, join_outcome(self.task).await)
    }
}

async fn join_outcome(task: JoinHandle<TurnOutcome>) -> TurnOutcome {
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                component = "orchestrator",
                event = "turn.task_failed",
                error = %e,
                "Turn task failed"
            );
            TurnOutcome::Errored
        }
    }
}

fn permission_mode(mode: TurnMode) -> &'static str {
    if mode.is_plan() {
        "plan"
    } else {
        "bypassPermissions"
    }
}

fn remote_agent(mode: TurnMode) -> &'static str {
    if mode.is_plan() {
        "plan"
    } else {
        "build"
    }
}

struct TurnDriver {
    request: TurnRequest,
    stream_id: String,
    store: Arc<dyn TurnStore>,
    registry: Arc<SessionRegistry>,
    launcher: Arc<dyn SdkLauncher>,
    remote: Arc<dyn RemoteAgent>,
    config: OrchestratorConfig,
    tx: mpsc::Sender<Chunk>,
    /// User stop / subscriber teardown
    cancel: CancellationToken,
    /// Stops the backend only (plan-mode stop, detach, finalize)
    backend_cancel: CancellationToken,
    state: TurnState,
    accumulator: PartAccumulator,
    messages: Vec<Message>,
    /// Stored messages were read; only then may the row be rewritten
    loaded: bool,
    session_id: Option<String>,
    /// The stored resume token points at a conversation the backend lost
    session_invalid: bool,
    stderr: Option<StderrSink>,
}

impl TurnDriver {
    async fn run(mut self) -> TurnOutcome {
        info!(
            component = "orchestrator",
            event = "turn.started",
            turn_id = %self.request.sub_chat_id,
            stream_id = %self.stream_id,
            mode = ?self.request.mode,
            model = ?self.request.model,
            "Turn started"
        );
        self.apply(TurnEvent::Started).await;

        if let Err(err) = self.execute().await {
            let chunk = self.render_failure(&err);
            self.note_error(&chunk);
            self.apply(TurnEvent::Failed(chunk)).await;
        }

        self.finalize().await
    }

    async fn execute(&mut self) -> Result<(), OrchestratorError> {
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let turn_id = self.request.sub_chat_id.clone();
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.apply(TurnEvent::Cancelled).await;
                return Ok(());
            }
            snapshot = store.load_turn(&turn_id) => snapshot?,
        };
        self.messages = snapshot.messages;
        self.loaded = true;

        if self.repeats_last_prompt() {
            debug!(
                component = "orchestrator",
                event = "turn.user_message_deduped",
                turn_id = %turn_id,
                "Prompt already stored as the last user message"
            );
        } else {
            self.messages.push(self.user_message());
        }
        self.save_with_retry(self.progress_write(SessionIdWrite::Keep))
            .await?;

        if self.cancel.is_cancelled() {
            self.apply(TurnEvent::Cancelled).await;
            return Ok(());
        }

        let resume = self
            .request
            .session_id
            .clone()
            .filter(|id| !id.is_empty())
            .or(snapshot.session_id);
        let route = BackendRoute::for_model(self.request.model.as_deref());
        info!(
            component = "orchestrator",
            event = "turn.backend_resolved",
            turn_id = %self.request.sub_chat_id,
            route = ?route,
            resume = resume.is_some(),
            "Backend resolved"
        );
        self.apply(TurnEvent::BackendResolved).await;

        match route {
            BackendRoute::LocalSdk => self.stream_local(resume).await,
            BackendRoute::RemoteHttp => self.stream_remote(resume).await,
        }
    }

    async fn stream_local(&mut self, resume: Option<String>) -> Result<(), OrchestratorError> {
        let (gate, mut questions) = ApprovalGate::new(
            self.request.sub_chat_id.clone(),
            self.registry.clone(),
            self.config.approval_timeout,
        );
        let stderr = StderrSink::default();
        self.stderr = Some(stderr.clone());

        let query = SdkQuery {
            prompt: self.request.prompt.clone(),
            images: self.request.images.clone(),
            cwd: self.request.cwd.clone(),
            permission_mode: permission_mode(self.request.mode).to_string(),
            resume,
            model: self.request.model.clone(),
            max_thinking_tokens: self.request.max_thinking_tokens,
            env: self.config.backend_env.clone(),
            tool_gate: Arc::new(gate),
            stderr,
            cancel: self.backend_cancel.clone(),
        };

        let launcher = self.launcher.clone();
        let cancel = self.cancel.clone();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.apply(TurnEvent::Cancelled).await;
                return Ok(());
            }
            stream = launcher.launch(query) => stream?,
        };

        let mut transform = ClaudeTransform::new();
        let mut items_seen = 0usize;
        while self.state.is_consuming() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => self.apply(TurnEvent::Cancelled).await,
                Some(question) = questions.recv() => self.absorb(question).await,
                item = stream.next() => match item {
                    Some(Ok(raw)) => {
                        items_seen += 1;
                        let chunks = transform.transform(&raw);
                        if let Some(id) = transform.session_id() {
                            self.session_id = Some(id.to_string());
                        }
                        for chunk in chunks {
                            if !self.state.is_consuming() {
                                break;
                            }
                            self.absorb(chunk).await;
                        }
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => self.apply(TurnEvent::Exhausted { items_seen }).await,
                },
            }
        }
        Ok(())
    }

    async fn stream_remote(&mut self, resume: Option<String>) -> Result<(), OrchestratorError> {
        let remote = self.remote.clone();
        let cancel = self.cancel.clone();
        let directory = self.request.cwd.clone();

        let session_id = match resume {
            Some(id) => id,
            None => {
                let id = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.apply(TurnEvent::Cancelled).await;
                        return Ok(());
                    }
                    id = remote.create_session(Some(&directory)) => id?,
                };
                info!(
                    component = "orchestrator",
                    event = "turn.remote_session_created",
                    turn_id = %self.request.sub_chat_id,
                    session_id = %id,
                    "Created remote agent session"
                );
                self.save_with_retry(self.progress_write(SessionIdWrite::Set(id.clone())))
                    .await?;
                id
            }
        };
        self.session_id = Some(session_id.clone());

        let request = RemoteMessageRequest {
            text: self.request.prompt.clone(),
            model: self.request.model.as_deref().and_then(ModelRef::parse),
            agent: Some(remote_agent(self.request.mode).to_string()),
            directory: Some(directory),
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.apply(TurnEvent::Cancelled).await;
                return Ok(());
            }
            response = remote.send_message(&session_id, &request) => response?,
        };

        let chunks = OpenCodeTransform::new(session_id).transform(&response);
        // Metadata alone is not a reply.
        let items_seen = chunks
            .iter()
            .filter(|chunk| !matches!(chunk, Chunk::MessageMetadata { .. }))
            .count();
        for chunk in chunks {
            if !self.state.is_consuming() {
                break;
            }
            self.absorb(chunk).await;
        }
        if self.state.is_consuming() {
            self.apply(TurnEvent::Exhausted { items_seen }).await;
        }
        Ok(())
    }

    /// Apply to the accumulator, then emit.
    async fn absorb(&mut self, chunk: Chunk) {
        self.accumulator.apply(&chunk);
        self.note_error(&chunk);
        self.apply(TurnEvent::Chunk(chunk)).await;
    }

    async fn apply(&mut self, event: TurnEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let (state, effects) = transition(std::mem::take(&mut self.state), event);
            self.state = state;
            for effect in effects {
                match effect {
                    TurnEffect::Emit(chunk) => {
                        let kind = chunk.kind();
                        if self.tx.send(chunk).await.is_err() && !self.state.detached {
                            debug!(
                                component = "orchestrator",
                                event = "turn.subscriber_detached",
                                turn_id = %self.request.sub_chat_id,
                                chunk = kind,
                                "Subscriber went away"
                            );
                            if !queue.iter().any(|e| matches!(e, TurnEvent::Detached)) {
                                queue.push_back(TurnEvent::Detached);
                            }
                        }
                    }
                    TurnEffect::CancelBackend => self.backend_cancel.cancel(),
                }
            }
        }
    }

    fn note_error(&mut self, chunk: &Chunk) {
        if let Chunk::Error {
            debug_info: Some(info),
            ..
        } = chunk
        {
            if info.category.as_deref() == Some("session_not_found") {
                self.session_invalid = true;
            }
        }
    }

    fn render_failure(&self, err: &OrchestratorError) -> Chunk {
        match err {
            OrchestratorError::Backend(e) => self.backend_failure(&e.to_string()),
            OrchestratorError::Store(e) => {
                error!(
                    component = "orchestrator",
                    event = "turn.store_failed",
                    turn_id = %self.request.sub_chat_id,
                    error = %e,
                    "Turn storage failed"
                );
                if self.config.verbose_errors {
                    Chunk::error(format!("{INTERNAL_FAILURE}: {e}"))
                } else {
                    Chunk::error(INTERNAL_FAILURE)
                }
            }
        }
    }

    fn backend_failure(&self, message: &str) -> Chunk {
        let stderr = self.stderr.as_ref().and_then(StderrSink::snapshot);
        let category = classify_with_stderr(message, stderr.as_deref());
        warn!(
            component = "orchestrator",
            event = "turn.backend_failed",
            turn_id = %self.request.sub_chat_id,
            category = category.as_str(),
            error = %message,
            "Backend failed mid-turn"
        );

        let mut text = category.describe(message);
        if category.is_auth() {
            return Chunk::AuthError { error_text: text };
        }
        let mut debug_info = ErrorDebugInfo {
            category: Some(category.as_str().to_string()),
            session_id: self.session_id.clone(),
            message_id: None,
            stderr: None,
        };
        if self.config.verbose_errors {
            if text != message.trim() {
                text = format!("{text}\n\n{}", message.trim());
            }
            debug_info.stderr = stderr;
        }
        Chunk::Error {
            error_text: text,
            debug_info: Some(debug_info),
        }
    }

    fn repeats_last_prompt(&self) -> bool {
        self.messages.last().is_some_and(|last| {
            last.role == Role::User && last.text().trim() == self.request.prompt.trim()
        })
    }

    fn user_message(&self) -> Message {
        let mut parts = Vec::new();
        if !self.request.prompt.trim().is_empty() {
            parts.push(MessagePart::text(self.request.prompt.clone()));
        }
        parts.extend(self.request.images.iter().map(|image| {
            MessagePart::Image(ImagePart {
                media_type: image.media_type.clone(),
                filename: image.filename.clone(),
                base64_data: image.base64_data.clone(),
            })
        }));
        Message::user(parts)
    }

    fn progress_write(&self, session_id: SessionIdWrite) -> TurnWrite {
        TurnWrite {
            chat_id: self.request.chat_id.clone(),
            messages: self.messages.clone(),
            session_id,
            stream_id: Some(self.stream_id.clone()),
            updated_at: Utc::now(),
        }
    }

    async fn save_with_retry(&self, write: TurnWrite) -> Result<(), StoreError> {
        let turn_id = &self.request.sub_chat_id;
        match self.store.save_turn(turn_id, write.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    component = "orchestrator",
                    event = "turn.save_retry",
                    turn_id = %turn_id,
                    error = %first,
                    "Turn write failed, retrying once"
                );
                tokio::time::sleep(self.config.write_retry_delay).await;
                self.store.save_turn(turn_id, write).await.inspect_err(|e| {
                    error!(
                        component = "orchestrator",
                        event = "turn.save_failed",
                        turn_id = %turn_id,
                        error = %e,
                        "Turn write failed after retry"
                    );
                })
            }
        }
    }

    async fn finalize(mut self) -> TurnOutcome {
        let turn_id = self.request.sub_chat_id.clone();
        let (parts, metadata) = self.accumulator.finish();
        let mut trailing = None;

        if self.loaded {
            let mut messages = std::mem::take(&mut self.messages);
            let part_count = parts.len();
            if !parts.is_empty() {
                messages.push(Message::assistant(parts, metadata));
            }
            let session_id = match (&self.session_id, self.session_invalid) {
                (_, true) => SessionIdWrite::Clear,
                (Some(id), false) => SessionIdWrite::Set(id.clone()),
                (None, false) => SessionIdWrite::Keep,
            };
            let write = TurnWrite {
                chat_id: self.request.chat_id.clone(),
                messages,
                session_id,
                stream_id: None,
                updated_at: Utc::now(),
            };
            if self.save_with_retry(write).await.is_err() {
                trailing = Some(Chunk::error(SAVE_FAILED));
            } else {
                debug!(
                    component = "orchestrator",
                    event = "turn.persisted",
                    turn_id = %turn_id,
                    parts = part_count,
                    "Persisted turn"
                );
            }
        }

        if let Err(e) = self.store.touch_chat(&self.request.chat_id, Utc::now()).await {
            warn!(
                component = "orchestrator",
                event = "turn.touch_chat_failed",
                chat_id = %self.request.chat_id,
                error = %e,
                "Failed to bump chat activity"
            );
        }

        self.registry.remove_turn(&turn_id, &self.stream_id);
        self.registry.resolve_all_for_turn(&turn_id, SESSION_ENDED);
        self.backend_cancel.cancel();
        self.apply(TurnEvent::Close { trailing }).await;

        let outcome = self.state.outcome();
        info!(
            component = "orchestrator",
            event = "turn.ended",
            turn_id = %turn_id,
            outcome = ?outcome,
            "Turn ended"
        );
        outcome
    }
}
