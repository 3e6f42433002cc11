//! Session registry
//!
//! Two maps shared by every live turn: turn id → cancellation handle, and
//! tool-use id → pending approval. Constructed once and passed around; tests
//! build their own.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use subchat_protocol::ApprovalResponse;

struct LiveTurn {
    stream_id: String,
    cancel: CancellationToken,
}

struct PendingApproval {
    turn_id: String,
    resolver: oneshot::Sender<ApprovalResponse>,
}

#[derive(Default)]
pub struct SessionRegistry {
    turns: DashMap<String, LiveTurn>,
    approvals: DashMap<String, PendingApproval>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live turn. Fails if the turn already has one.
    pub fn register_turn(&self, turn_id: &str, stream_id: &str, cancel: CancellationToken) -> bool {
        match self.turns.entry(turn_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(LiveTurn {
                    stream_id: stream_id.to_string(),
                    cancel,
                });
                true
            }
        }
    }

    /// Cancel a live turn. Returns whether this call cancelled anything.
    pub fn cancel_turn(&self, turn_id: &str) -> bool {
        let Some(turn) = self.turns.get(turn_id) else {
            return false;
        };
        if turn.cancel.is_cancelled() {
            return false;
        }
        turn.cancel.cancel();
        debug!(
            component = "registry",
            event = "registry.turn.cancelled",
            turn_id = %turn_id,
            "Cancelled live turn"
        );
        true
    }

    pub fn is_active(&self, turn_id: &str) -> bool {
        self.turns.contains_key(turn_id)
    }

    /// Remove the handle owned by `stream_id`; a newer stream's handle is left alone.
    pub fn remove_turn(&self, turn_id: &str, stream_id: &str) -> bool {
        self.turns
            .remove_if(turn_id, |_, turn| turn.stream_id == stream_id)
            .is_some()
    }

    /// Park a resolver for a gated tool call. At most one per tool-use id.
    pub fn insert_approval(
        &self,
        tool_use_id: &str,
        turn_id: &str,
        resolver: oneshot::Sender<ApprovalResponse>,
    ) -> bool {
        match self.approvals.entry(tool_use_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(PendingApproval {
                    turn_id: turn_id.to_string(),
                    resolver,
                });
                true
            }
        }
    }

    /// Deliver an external answer. `false` when nothing was waiting for it.
    pub fn resolve_approval(&self, response: ApprovalResponse) -> bool {
        let Some((_, pending)) = self.approvals.remove(&response.tool_use_id) else {
            return false;
        };
        pending.resolver.send(response).is_ok()
    }

    /// Drop an entry without answering it (the waiter gave up).
    pub fn discard_approval(&self, tool_use_id: &str) {
        self.approvals.remove(tool_use_id);
    }

    pub fn has_approval(&self, tool_use_id: &str) -> bool {
        self.approvals.contains_key(tool_use_id)
    }

    /// Deny every approval owned by a turn. Returns how many were resolved.
    pub fn resolve_all_for_turn(&self, turn_id: &str, message: &str) -> usize {
        let ids: Vec<String> = self
            .approvals
            .iter()
            .filter(|entry| entry.value().turn_id == turn_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut resolved = 0;
        for id in ids {
            if let Some((id, pending)) = self.approvals.remove(&id) {
                let _ = pending
                    .resolver
                    .send(ApprovalResponse::denied(id, message.to_string()));
                resolved += 1;
            }
        }
        if resolved > 0 {
            debug!(
                component = "registry",
                event = "registry.approvals.denied",
                turn_id = %turn_id,
                count = resolved,
                "Denied pending approvals for turn"
            );
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_registration_for_live_turn_is_rejected() {
        let registry = SessionRegistry::new();
        assert!(registry.register_turn("t1", "s1", CancellationToken::new()));
        assert!(!registry.register_turn("t1", "s2", CancellationToken::new()));
        assert!(registry.is_active("t1"));
    }

    #[test]
    fn cancel_is_idempotent() {
        let registry = SessionRegistry::new();
        let token = CancellationToken::new();
        registry.register_turn("t1", "s1", token.clone());

        assert!(registry.cancel_turn("t1"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel_turn("t1"));
        assert!(registry.remove_turn("t1", "s1"));
        assert!(!registry.cancel_turn("t1"));
        assert!(!registry.is_active("t1"));
    }

    #[test]
    fn remove_only_touches_own_stream() {
        let registry = SessionRegistry::new();
        registry.register_turn("t1", "s1", CancellationToken::new());
        assert!(!registry.remove_turn("t1", "other"));
        assert!(registry.is_active("t1"));
    }

    #[tokio::test]
    async fn approval_resolves_once() {
        let registry = SessionRegistry::new();
        let (tx, rx) = oneshot::channel();
        assert!(registry.insert_approval("toolu_1", "t1", tx));

        let answer = ApprovalResponse {
            tool_use_id: "toolu_1".into(),
            approved: true,
            message: None,
            updated_input: None,
        };
        assert!(registry.resolve_approval(answer.clone()));
        assert!(!registry.resolve_approval(answer.clone()));
        assert_eq!(rx.await.unwrap(), answer);
    }

    #[tokio::test]
    async fn resolve_all_only_touches_the_turn() {
        let registry = SessionRegistry::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        registry.insert_approval("a", "t1", tx1);
        registry.insert_approval("b", "t2", tx2);

        assert_eq!(registry.resolve_all_for_turn("t1", "Session ended"), 1);
        let denied = rx1.await.unwrap();
        assert!(!denied.approved);
        assert_eq!(denied.message.as_deref(), Some("Session ended"));
        assert!(registry.has_approval("b"));
    }
}
