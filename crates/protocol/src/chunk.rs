//! Chunk protocol: the closed set of events every backend is normalized into.
//!
//! A subscription receives zero or more chunks followed by exactly one
//! `Finish`. Nothing is ever sent after `Finish`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::MessageMetadata;

/// One normalized stream event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Chunk {
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: String,
        output: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    #[serde(rename_all = "camelCase")]
    MessageMetadata {
        message_metadata: MessageMetadata,
    },
    #[serde(rename_all = "camelCase")]
    AskUserQuestion {
        tool_use_id: String,
        questions: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debug_info: Option<ErrorDebugInfo>,
    },
    #[serde(rename_all = "camelCase")]
    AuthError {
        error_text: String,
    },
    Finish,
}

impl Chunk {
    /// Plain `error` chunk without debug payload.
    pub fn error(text: impl Into<String>) -> Self {
        Chunk::Error {
            error_text: text.into(),
            debug_info: None,
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Chunk::Finish)
    }

    /// True for `error` and `auth-error`.
    pub fn is_error(&self) -> bool {
        matches!(self, Chunk::Error { .. } | Chunk::AuthError { .. })
    }

    /// Short wire name, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Chunk::TextStart { .. } => "text-start",
            Chunk::TextDelta { .. } => "text-delta",
            Chunk::TextEnd { .. } => "text-end",
            Chunk::ReasoningStart { .. } => "reasoning-start",
            Chunk::ReasoningDelta { .. } => "reasoning-delta",
            Chunk::ReasoningEnd { .. } => "reasoning-end",
            Chunk::ToolInputAvailable { .. } => "tool-input-available",
            Chunk::ToolOutputAvailable { .. } => "tool-output-available",
            Chunk::ToolOutputError { .. } => "tool-output-error",
            Chunk::MessageMetadata { .. } => "message-metadata",
            Chunk::AskUserQuestion { .. } => "ask-user-question",
            Chunk::Error { .. } => "error",
            Chunk::AuthError { .. } => "auth-error",
            Chunk::Finish => "finish",
        }
    }
}

/// Diagnostic payload attached to `error` chunks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDebugInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_delta_uses_kebab_type_tag() {
        let chunk = Chunk::TextDelta {
            id: "text-1".into(),
            delta: "Hel".into(),
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(
            value,
            json!({"type": "text-delta", "id": "text-1", "delta": "Hel"})
        );
    }

    #[test]
    fn tool_fields_are_camel_case() {
        let chunk = Chunk::ToolInputAvailable {
            tool_call_id: "toolu_1".into(),
            tool_name: "Bash".into(),
            input: json!({"command": "ls"}),
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["type"], "tool-input-available");
        assert_eq!(value["toolCallId"], "toolu_1");
        assert_eq!(value["toolName"], "Bash");
    }

    #[test]
    fn finish_serializes_as_bare_tag() {
        let value = serde_json::to_value(Chunk::Finish).unwrap();
        assert_eq!(value, json!({"type": "finish"}));
    }

    #[test]
    fn error_omits_missing_debug_info() {
        let value = serde_json::to_value(Chunk::error("boom")).unwrap();
        assert_eq!(value, json!({"type": "error", "errorText": "boom"}));
    }

    #[test]
    fn parses_ask_user_question() {
        let parsed: Chunk = serde_json::from_value(json!({
            "type": "ask-user-question",
            "toolUseId": "toolu_9",
            "questions": [{"question": "Which DB?"}]
        }))
        .unwrap();
        match parsed {
            Chunk::AskUserQuestion { tool_use_id, .. } => assert_eq!(tool_use_id, "toolu_9"),
            other => panic!("unexpected chunk: {other:?}"),
        }
    }
}
