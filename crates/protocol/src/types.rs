//! Core types shared across the protocol

use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::new_id;

/// Prefix of the `type` tag on tool parts (`tool-Bash`, `tool-Edit`, ...)
pub const TOOL_PART_PREFIX: &str = "tool-";

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Operating mode as the orchestrator sees it.
///
/// The UI offers plan | build | scaling | designer | debug; only `plan`
/// changes orchestrator behavior, everything else runs as `Agent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    Plan,
    #[default]
    #[serde(alias = "build", alias = "scaling", alias = "designer", alias = "debug")]
    Agent,
}

impl TurnMode {
    pub fn is_plan(self) -> bool {
        self == TurnMode::Plan
    }
}

/// How a turn's subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Errored,
    /// Stopped by the user or by subscriber teardown
    Aborted,
}

/// Tool part lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Call,
    Result,
}

/// Running metadata attached to assistant messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_subtype: Option<String>,
}

impl MessageMetadata {
    /// Field-wise merge; values present in `other` win.
    pub fn merge(&mut self, other: &MessageMetadata) {
        if other.session_id.is_some() {
            self.session_id = other.session_id.clone();
        }
        if other.model.is_some() {
            self.model = other.model.clone();
        }
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
        if other.total_cost_usd.is_some() {
            self.total_cost_usd = other.total_cost_usd;
        }
        if other.duration_ms.is_some() {
            self.duration_ms = other.duration_ms;
        }
        if other.result_subtype.is_some() {
            self.result_subtype = other.result_subtype.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == MessageMetadata::default()
    }
}

/// A tool invocation recorded inside an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPart {
    /// Carried in the part's `type` tag, not as a field
    #[serde(skip)]
    pub tool_name: String,
    pub tool_call_id: String,
    #[serde(default)]
    pub input: Value,
    pub state: ToolState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

/// User-attached image, stored inline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePart {
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub base64_data: String,
}

/// File reference (attachments, remote agent file outputs)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePart {
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
}

/// One part of a message. The JSON form is tagged by `type`; tool parts use
/// a dynamic tag `tool-<Name>`, so serde is implemented by hand.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    Tool(ToolPart),
    Image(ImagePart),
    File(FilePart),
    /// Part kinds written by other producers, kept verbatim so a rewrite
    /// of the message array never drops them.
    Unknown(Value),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match self {
            MessagePart::Tool(tool) => Some(tool),
            _ => None,
        }
    }
}

impl Serialize for MessagePart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (kind, body) = match self {
            MessagePart::Unknown(value) => return value.serialize(serializer),
            MessagePart::Text { text } => ("text".to_string(), text_body(text)),
            MessagePart::Reasoning { text } => ("reasoning".to_string(), text_body(text)),
            MessagePart::Tool(tool) => (
                format!("{TOOL_PART_PREFIX}{}", tool.tool_name),
                serde_json::to_value(tool).map_err(ser::Error::custom)?,
            ),
            MessagePart::Image(image) => (
                "data-image".to_string(),
                serde_json::to_value(image).map_err(ser::Error::custom)?,
            ),
            MessagePart::File(file) => (
                "data-file".to_string(),
                serde_json::to_value(file).map_err(ser::Error::custom)?,
            ),
        };

        let mut map = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert("type".to_string(), Value::String(kind));
        Value::Object(map).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessagePart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
            return Ok(MessagePart::Unknown(value));
        };

        match kind.as_str() {
            "text" => Ok(MessagePart::Text {
                text: text_of(&value),
            }),
            "reasoning" => Ok(MessagePart::Reasoning {
                text: text_of(&value),
            }),
            "data-image" => Ok(typed_or_verbatim(value, MessagePart::Image)),
            "data-file" => Ok(typed_or_verbatim(value, MessagePart::File)),
            other => match other.strip_prefix(TOOL_PART_PREFIX) {
                Some(name) => {
                    let name = name.to_string();
                    Ok(typed_or_verbatim(value, |mut tool: ToolPart| {
                        tool.tool_name = name;
                        MessagePart::Tool(tool)
                    }))
                }
                None => Ok(MessagePart::Unknown(value)),
            },
        }
    }
}

/// A known part kind with a shape this version cannot read is kept verbatim.
fn typed_or_verbatim<T, F>(value: Value, wrap: F) -> MessagePart
where
    T: DeserializeOwned,
    F: FnOnce(T) -> MessagePart,
{
    match T::deserialize(&value) {
        Ok(typed) => wrap(typed),
        Err(_) => MessagePart::Unknown(value),
    }
}

fn text_of(value: &Value) -> String {
    value
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn text_body(text: &str) -> Value {
    let mut map = Map::new();
    map.insert("text".to_string(), Value::String(text.to_string()));
    Value::Object(map)
}

/// A message in a sub-chat's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn user(parts: Vec<MessagePart>) -> Self {
        Self {
            id: new_id(),
            role: Role::User,
            parts,
            metadata: None,
        }
    }

    pub fn assistant(parts: Vec<MessagePart>, metadata: MessageMetadata) -> Self {
        Self {
            id: new_id(),
            role: Role::Assistant,
            parts,
            metadata: (!metadata.is_empty()).then_some(metadata),
        }
    }

    /// Concatenated text of all `text` parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}
