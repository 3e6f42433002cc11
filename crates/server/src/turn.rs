//! Turn state machine
//!
//! `transition(state, event) -> (state, effects)` decides what a turn emits
//! and when the backend is stopped. No IO, no async. The driver in
//! `orchestrator` feeds it events and executes the effects.

use subchat_protocol::{Chunk, TurnMode, TurnOutcome};

pub const EXIT_PLAN_TOOL: &str = "ExitPlanMode";
pub const NO_RESPONSE: &str = "No response received";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TurnPhase {
    #[default]
    Idle,
    ResolvingBackend,
    Streaming,
    Finished,
    Errored,
    Aborted,
}

impl TurnPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnPhase::Finished | TurnPhase::Errored | TurnPhase::Aborted
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnState {
    pub phase: TurnPhase,
    pub mode: TurnMode,
    /// Subscriber went away; nothing more is sent
    pub detached: bool,
    pub finish_sent: bool,
    pub saw_error: bool,
    /// Pending `ExitPlanMode` call in plan mode
    exit_plan_call: Option<String>,
}

impl TurnState {
    pub fn new(mode: TurnMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    fn can_emit(&self) -> bool {
        !self.detached && !self.finish_sent
    }

    /// Whether the driver should keep pulling backend items.
    pub fn is_consuming(&self) -> bool {
        !self.detached && matches!(self.phase, TurnPhase::ResolvingBackend | TurnPhase::Streaming)
    }

    pub fn outcome(&self) -> TurnOutcome {
        match self.phase {
            TurnPhase::Aborted => TurnOutcome::Aborted,
            TurnPhase::Errored => TurnOutcome::Errored,
            _ if self.saw_error => TurnOutcome::Errored,
            _ => TurnOutcome::Completed,
        }
    }

    fn settle(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = if self.saw_error {
                TurnPhase::Errored
            } else {
                TurnPhase::Finished
            };
        }
    }
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    Started,
    BackendResolved,
    /// A transformed backend chunk (or an approval question)
    Chunk(Chunk),
    /// Backend ran dry; `items_seen` counts what it produced
    Exhausted { items_seen: usize },
    /// Backend or orchestrator failure, already rendered as a chunk
    Failed(Chunk),
    Cancelled,
    Detached,
    /// Finalization done; `trailing` is sent just before `finish`
    Close { trailing: Option<Chunk> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEffect {
    Emit(Chunk),
    CancelBackend,
}

pub fn transition(mut state: TurnState, event: TurnEvent) -> (TurnState, Vec<TurnEffect>) {
    let mut effects = Vec::new();

    match event {
        TurnEvent::Started => {
            if state.phase == TurnPhase::Idle {
                state.phase = TurnPhase::ResolvingBackend;
            }
        }

        TurnEvent::BackendResolved => {
            if state.phase == TurnPhase::ResolvingBackend {
                state.phase = TurnPhase::Streaming;
            }
        }

        TurnEvent::Chunk(chunk) => {
            if state.phase.is_terminal() || !state.can_emit() {
                return (state, effects);
            }
            if chunk.is_error() {
                state.saw_error = true;
            }

            let ends_plan = state.mode.is_plan() && plan_boundary(&mut state, &chunk);
            effects.push(TurnEffect::Emit(chunk));
            if ends_plan {
                effects.push(TurnEffect::Emit(Chunk::Finish));
                effects.push(TurnEffect::CancelBackend);
                state.finish_sent = true;
                state.phase = TurnPhase::Finished;
            }
        }

        TurnEvent::Exhausted { items_seen } => {
            if state.phase.is_terminal() {
                return (state, effects);
            }
            if items_seen == 0 {
                state.saw_error = true;
                if state.can_emit() {
                    effects.push(TurnEffect::Emit(Chunk::error(NO_RESPONSE)));
                }
            }
            state.settle();
        }

        TurnEvent::Failed(chunk) => {
            if state.phase.is_terminal() {
                return (state, effects);
            }
            state.saw_error = true;
            state.phase = TurnPhase::Errored;
            if state.can_emit() {
                effects.push(TurnEffect::Emit(chunk));
            }
            effects.push(TurnEffect::CancelBackend);
        }

        TurnEvent::Cancelled => {
            if !state.phase.is_terminal() {
                state.phase = TurnPhase::Aborted;
            }
            effects.push(TurnEffect::CancelBackend);
        }

        TurnEvent::Detached => {
            if state.detached {
                return (state, effects);
            }
            state.detached = true;
            if !state.phase.is_terminal() {
                state.phase = TurnPhase::Aborted;
            }
            effects.push(TurnEffect::CancelBackend);
        }

        TurnEvent::Close { trailing } => {
            if let Some(chunk) = trailing {
                if chunk.is_error() {
                    state.saw_error = true;
                    if state.phase == TurnPhase::Finished {
                        state.phase = TurnPhase::Errored;
                    }
                }
                if state.can_emit() {
                    effects.push(TurnEffect::Emit(chunk));
                }
            }
            state.settle();
            if state.can_emit() {
                effects.push(TurnEffect::Emit(Chunk::Finish));
                state.finish_sent = true;
            }
        }
    }

    (state, effects)
}

/// Track the `ExitPlanMode` call; true once its result arrives.
fn plan_boundary(state: &mut TurnState, chunk: &Chunk) -> bool {
    match chunk {
        Chunk::ToolInputAvailable {
            tool_call_id,
            tool_name,
            ..
        } if tool_name == EXIT_PLAN_TOOL => {
            state.exit_plan_call = Some(tool_call_id.clone());
            false
        }
        Chunk::ToolOutputAvailable { tool_call_id, .. }
        | Chunk::ToolOutputError { tool_call_id, .. } => {
            state.exit_plan_call.as_deref() == Some(tool_call_id.as_str())
        }
        _ => false,
    }
}
