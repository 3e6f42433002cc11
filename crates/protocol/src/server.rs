//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::types::TurnOutcome;

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Chunk {
        sub_chat_id: String,
        chunk: Chunk,
    },
    /// Sent after the turn's `finish` chunk has been forwarded
    TurnEnded {
        sub_chat_id: String,
        outcome: TurnOutcome,
    },
    TurnCancelled {
        sub_chat_id: String,
        cancelled: bool,
    },
    TurnActive {
        sub_chat_id: String,
        active: bool,
    },
    ToolApprovalAck {
        tool_use_id: String,
        ok: bool,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_chat_id: Option<String>,
    },
}
