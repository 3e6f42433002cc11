//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::TurnMode;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start streaming a turn for a sub-chat
    SubscribeTurn(TurnRequest),
    /// Detach from a turn; tears the stream down
    UnsubscribeTurn {
        sub_chat_id: String,
    },
    /// Stop the turn but keep the subscription until `finish`
    CancelTurn {
        sub_chat_id: String,
    },
    IsTurnActive {
        sub_chat_id: String,
    },
    RespondToolApproval(ApprovalResponse),
}

/// Inbound request that opens a turn subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub sub_chat_id: String,
    pub chat_id: String,
    pub prompt: String,
    pub cwd: String,
    #[serde(default)]
    pub mode: TurnMode,
    /// Backend resume token; falls back to the one stored for the sub-chat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

/// Image attached to a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub base64_data: String,
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Human answer for a gated tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub tool_use_id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

impl ApprovalResponse {
    pub fn denied(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            approved: false,
            message: Some(message.into()),
            updated_input: None,
        }
    }
}
