//! Approval gate for interactive tool calls.
//!
//! `AskUserQuestion` calls are parked until a client answers (or the wait
//! times out); every other tool passes straight through. The question is
//! surfaced to the turn's subscriber as an `ask-user-question` chunk through
//! the channel returned by [`ApprovalGate::new`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use subchat_connectors::{PermissionDecision, ToolGate, ToolPermissionRequest};
use subchat_protocol::{ApprovalResponse, Chunk};

use crate::registry::SessionRegistry;

pub const GATED_TOOL: &str = "AskUserQuestion";
pub const TIMED_OUT: &str = "Timed out";
pub const SESSION_ENDED: &str = "Session ended";
const USER_DECLINED: &str = "User declined";

pub struct ApprovalGate {
    turn_id: String,
    registry: Arc<SessionRegistry>,
    timeout: Duration,
    questions: mpsc::UnboundedSender<Chunk>,
}

impl ApprovalGate {
    pub fn new(
        turn_id: impl Into<String>,
        registry: Arc<SessionRegistry>,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Chunk>) {
        let (questions, rx) = mpsc::unbounded_channel();
        (
            Self {
                turn_id: turn_id.into(),
                registry,
                timeout,
                questions,
            },
            rx,
        )
    }

    /// Park until the question is answered, the wait times out or the turn
    /// tears down.
    pub async fn request(&self, tool_use_id: &str, questions: Value) -> ApprovalResponse {
        let (tx, rx) = oneshot::channel();
        if !self.registry.insert_approval(tool_use_id, &self.turn_id, tx) {
            warn!(
                component = "approval",
                event = "approval.duplicate",
                turn_id = %self.turn_id,
                tool_use_id = %tool_use_id,
                "Approval already pending for tool call"
            );
            return ApprovalResponse::denied(tool_use_id, "Approval already pending");
        }

        let _ = self.questions.send(Chunk::AskUserQuestion {
            tool_use_id: tool_use_id.to_string(),
            questions,
        });
        info!(
            component = "approval",
            event = "approval.requested",
            turn_id = %self.turn_id,
            tool_use_id = %tool_use_id,
            "Waiting for user answer"
        );

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => ApprovalResponse::denied(tool_use_id, SESSION_ENDED),
            Err(_) => {
                self.registry.discard_approval(tool_use_id);
                warn!(
                    component = "approval",
                    event = "approval.timed_out",
                    turn_id = %self.turn_id,
                    tool_use_id = %tool_use_id,
                    timeout_secs = self.timeout.as_secs(),
                    "Approval timed out"
                );
                ApprovalResponse::denied(tool_use_id, TIMED_OUT)
            }
        }
    }
}

/// Shape an answer the way the tool expects it.
pub fn decision_for(response: ApprovalResponse, original_input: Value) -> PermissionDecision {
    if response.approved {
        PermissionDecision::Allow {
            updated_input: response.updated_input.unwrap_or(original_input),
        }
    } else {
        PermissionDecision::Deny {
            message: response
                .message
                .unwrap_or_else(|| USER_DECLINED.to_string()),
            interrupt: false,
        }
    }
}

#[async_trait]
impl ToolGate for ApprovalGate {
    async fn can_use_tool(&self, request: ToolPermissionRequest) -> PermissionDecision {
        if request.tool_name != GATED_TOOL {
            return PermissionDecision::Allow {
                updated_input: request.input,
            };
        }
        let questions = request
            .input
            .get("questions")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let response = self.request(&request.tool_use_id, questions).await;
        decision_for(response, request.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(registry: &Arc<SessionRegistry>) -> (ApprovalGate, mpsc::UnboundedReceiver<Chunk>) {
        ApprovalGate::new("turn-1", registry.clone(), Duration::from_secs(60))
    }

    fn ask(id: &str) -> ToolPermissionRequest {
        ToolPermissionRequest {
            tool_name: GATED_TOOL.into(),
            input: json!({"questions": [{"question": "Which db?"}]}),
            tool_use_id: id.into(),
        }
    }

    #[tokio::test]
    async fn other_tools_pass_through() {
        let registry = Arc::new(SessionRegistry::new());
        let (gate, mut rx) = gate(&registry);
        let decision = gate
            .can_use_tool(ToolPermissionRequest {
                tool_name: "Bash".into(),
                input: json!({"command": "ls"}),
                tool_use_id: "toolu_b".into(),
            })
            .await;
        assert_eq!(
            decision,
            PermissionDecision::Allow {
                updated_input: json!({"command": "ls"})
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn answer_becomes_allow_with_updated_input() {
        let registry = Arc::new(SessionRegistry::new());
        let (gate, mut rx) = gate(&registry);
        let waiter = tokio::spawn(async move { gate.can_use_tool(ask("toolu_q")).await });

        let chunk = rx.recv().await.unwrap();
        assert_eq!(
            chunk,
            Chunk::AskUserQuestion {
                tool_use_id: "toolu_q".into(),
                questions: json!([{"question": "Which db?"}]),
            }
        );

        assert!(registry.resolve_approval(ApprovalResponse {
            tool_use_id: "toolu_q".into(),
            approved: true,
            message: None,
            updated_input: Some(json!({"answers": {"Which db?": "sqlite"}})),
        }));
        assert_eq!(
            waiter.await.unwrap(),
            PermissionDecision::Allow {
                updated_input: json!({"answers": {"Which db?": "sqlite"}})
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_question_times_out() {
        let registry = Arc::new(SessionRegistry::new());
        let (gate, mut rx) = gate(&registry);
        let waiter = tokio::spawn(async move { gate.request("toolu_t", json!([])).await });
        rx.recv().await.unwrap();

        let response = waiter.await.unwrap();
        assert!(!response.approved);
        assert_eq!(response.message.as_deref(), Some(TIMED_OUT));

        let late = ApprovalResponse {
            tool_use_id: "toolu_t".into(),
            approved: true,
            message: None,
            updated_input: None,
        };
        assert!(!registry.resolve_approval(late));
    }

    #[tokio::test]
    async fn teardown_denies_with_session_ended() {
        let registry = Arc::new(SessionRegistry::new());
        let (gate, mut rx) = gate(&registry);
        let waiter = tokio::spawn(async move { gate.can_use_tool(ask("toolu_s")).await });
        rx.recv().await.unwrap();

        assert_eq!(registry.resolve_all_for_turn("turn-1", SESSION_ENDED), 1);
        assert_eq!(
            waiter.await.unwrap(),
            PermissionDecision::Deny {
                message: SESSION_ENDED.into(),
                interrupt: false
            }
        );
    }

    #[test]
    fn denial_without_message_uses_default() {
        let decision = decision_for(
            ApprovalResponse {
                tool_use_id: "x".into(),
                approved: false,
                message: None,
                updated_input: None,
            },
            json!({}),
        );
        assert_eq!(
            decision,
            PermissionDecision::Deny {
                message: USER_DECLINED.into(),
                interrupt: false
            }
        );
    }
}
