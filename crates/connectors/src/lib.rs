//! subchat Connectors
//!
//! Backends a turn can run against (the local Claude CLI and a remote
//! OpenCode server) and the adapters that translate their native output
//! into the chunk protocol.

pub mod claude;
pub mod claude_transform;
pub mod classify;
pub mod opencode;

pub use claude::{
    ClaudeLauncher, PermissionDecision, SdkLauncher, SdkQuery, StderrSink, ToolGate,
    ToolPermissionRequest,
};
pub use claude_transform::ClaudeTransform;
pub use classify::{classify, classify_with_stderr, ErrorCategory};
pub use opencode::{OpenCodeClient, OpenCodeTransform, RemoteAgent, RemoteMessageRequest, RemoteResponse};

use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process communication error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Claude Code process exited with code {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()))]
    ProcessExited { code: Option<i32> },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote agent returned {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

/// Pull-based stream of native backend messages, one JSON object per item
pub type NativeStream = BoxStream<'static, Result<Value, ConnectorError>>;

/// Which adapter serves a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRoute {
    /// Spawned Claude CLI speaking stream-json
    LocalSdk,
    /// OpenCode HTTP server
    RemoteHttp,
}

impl BackendRoute {
    /// Model ids shaped `provider/model` belong to the remote agent.
    pub fn for_model(model: Option<&str>) -> Self {
        match model {
            Some(id) if id.contains('/') => BackendRoute::RemoteHttp,
            _ => BackendRoute::LocalSdk,
        }
    }
}

/// `provider/model` split at the first separator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn parse(model: &str) -> Option<Self> {
        let (provider, model) = model.split_once('/')?;
        let (provider, model) = (provider.trim(), model.trim());
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider.to_string(),
            model_id: model.to_string(),
        })
    }
}
