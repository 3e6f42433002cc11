//! subchat Protocol
//!
//! Shared types for the subchat service: the chunk protocol streamed to
//! subscribers, the persisted message/part model, and the JSON messages
//! exchanged with clients over WebSocket.

use uuid::Uuid;

// Re-exports
pub mod chunk;
pub mod client;
pub mod server;
pub mod types;

pub use chunk::{Chunk, ErrorDebugInfo};
pub use client::{ApprovalResponse, ClientMessage, ImageAttachment, TurnRequest};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
