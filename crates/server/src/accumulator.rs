//! Folds emitted chunks into the parts of the assistant message being built.

use subchat_protocol::{Chunk, MessageMetadata, MessagePart, ToolPart, ToolState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Text,
    Reasoning,
}

#[derive(Debug)]
struct OpenRun {
    kind: RunKind,
    id: String,
    text: String,
}

#[derive(Debug, Default)]
pub struct PartAccumulator {
    parts: Vec<MessagePart>,
    run: Option<OpenRun>,
    metadata: MessageMetadata,
}

impl PartAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, chunk: &Chunk) {
        match chunk {
            Chunk::TextStart { id } => self.open(RunKind::Text, id),
            Chunk::ReasoningStart { id } => self.open(RunKind::Reasoning, id),
            Chunk::TextDelta { id, delta } => self.append(RunKind::Text, id, delta),
            Chunk::ReasoningDelta { id, delta } => self.append(RunKind::Reasoning, id, delta),
            Chunk::TextEnd { id } | Chunk::ReasoningEnd { id } => {
                if self.run.as_ref().is_some_and(|run| &run.id == id) {
                    self.flush();
                }
            }
            Chunk::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                self.flush();
                if self.tool_mut(tool_call_id).is_none() {
                    self.parts.push(MessagePart::Tool(ToolPart {
                        tool_name: tool_name.clone(),
                        tool_call_id: tool_call_id.clone(),
                        input: input.clone(),
                        state: ToolState::Call,
                        result: None,
                        error_text: None,
                    }));
                }
            }
            Chunk::ToolOutputAvailable {
                tool_call_id,
                output,
            } => {
                if let Some(tool) = self.pending_call(tool_call_id) {
                    tool.state = ToolState::Result;
                    tool.result = Some(output.clone());
                }
            }
            Chunk::ToolOutputError {
                tool_call_id,
                error_text,
            } => {
                if let Some(tool) = self.pending_call(tool_call_id) {
                    tool.state = ToolState::Result;
                    tool.error_text = Some(error_text.clone());
                }
            }
            Chunk::MessageMetadata { message_metadata } => self.metadata.merge(message_metadata),
            Chunk::AskUserQuestion { .. }
            | Chunk::Error { .. }
            | Chunk::AuthError { .. }
            | Chunk::Finish => {}
        }
    }

    /// Close any open run and hand back everything gathered so far.
    pub fn finish(&mut self) -> (Vec<MessagePart>, MessageMetadata) {
        self.flush();
        (
            std::mem::take(&mut self.parts),
            std::mem::take(&mut self.metadata),
        )
    }

    fn open(&mut self, kind: RunKind, id: &str) {
        self.flush();
        self.run = Some(OpenRun {
            kind,
            id: id.to_string(),
            text: String::new(),
        });
    }

    fn append(&mut self, kind: RunKind, id: &str, delta: &str) {
        let continues = self
            .run
            .as_ref()
            .is_some_and(|run| run.kind == kind && run.id == id);
        if !continues {
            self.open(kind, id);
        }
        if let Some(run) = self.run.as_mut() {
            run.text.push_str(delta);
        }
    }

    fn flush(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        if run.text.trim().is_empty() {
            return;
        }
        self.parts.push(match run.kind {
            RunKind::Text => MessagePart::Text { text: run.text },
            RunKind::Reasoning => MessagePart::Reasoning { text: run.text },
        });
    }

    fn tool_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolPart> {
        self.parts.iter_mut().find_map(|part| match part {
            MessagePart::Tool(tool) if tool.tool_call_id == tool_call_id => Some(tool),
            _ => None,
        })
    }

    /// Tool part still waiting for its result; a second result is ignored.
    fn pending_call(&mut self, tool_call_id: &str) -> Option<&mut ToolPart> {
        self.tool_mut(tool_call_id)
            .filter(|tool| tool.state == ToolState::Call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deltas_join_into_one_text_part() {
        let mut acc = PartAccumulator::new();
        acc.apply(&Chunk::TextStart { id: "t1".into() });
        acc.apply(&Chunk::TextDelta {
            id: "t1".into(),
            delta: "Hel".into(),
        });
        acc.apply(&Chunk::TextDelta {
            id: "t1".into(),
            delta: "lo".into(),
        });
        let (parts, _) = acc.finish();
        assert_eq!(parts, vec![MessagePart::text("Hello")]);
    }

    #[test]
    fn whitespace_runs_are_dropped() {
        let mut acc = PartAccumulator::new();
        acc.apply(&Chunk::ReasoningDelta {
            id: "r1".into(),
            delta: "  \n".into(),
        });
        acc.apply(&Chunk::ReasoningEnd { id: "r1".into() });
        assert!(acc.finish().0.is_empty());
    }

    #[test]
    fn tool_result_applies_once_in_order() {
        let mut acc = PartAccumulator::new();
        acc.apply(&Chunk::TextDelta {
            id: "t1".into(),
            delta: "Running".into(),
        });
        acc.apply(&Chunk::ToolInputAvailable {
            tool_call_id: "toolu_1".into(),
            tool_name: "Bash".into(),
            input: json!({"command": "ls"}),
        });
        acc.apply(&Chunk::ToolOutputError {
            tool_call_id: "toolu_1".into(),
            error_text: "denied".into(),
        });
        acc.apply(&Chunk::ToolOutputAvailable {
            tool_call_id: "toolu_1".into(),
            output: json!("late"),
        });
        acc.apply(&Chunk::ToolOutputAvailable {
            tool_call_id: "unknown".into(),
            output: json!("orphan"),
        });

        let (parts, _) = acc.finish();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], MessagePart::text("Running"));
        let tool = parts[1].as_tool().unwrap();
        assert_eq!(tool.state, ToolState::Result);
        assert_eq!(tool.error_text.as_deref(), Some("denied"));
        assert!(tool.result.is_none());
    }

    #[test]
    fn metadata_merges_across_chunks() {
        let mut acc = PartAccumulator::new();
        acc.apply(&Chunk::MessageMetadata {
            message_metadata: MessageMetadata {
                session_id: Some("s-1".into()),
                ..Default::default()
            },
        });
        acc.apply(&Chunk::MessageMetadata {
            message_metadata: MessageMetadata {
                output_tokens: Some(12),
                ..Default::default()
            },
        });
        let (_, meta) = acc.finish();
        assert_eq!(meta.session_id.as_deref(), Some("s-1"));
        assert_eq!(meta.output_tokens, Some(12));
    }
}
