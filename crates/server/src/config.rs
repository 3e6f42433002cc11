//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::logging::{LogFormat, LogSettings};

/// Streaming session orchestrator for coding-agent chats
#[derive(Debug, Parser)]
#[command(name = "subchat", version)]
#[command(about = "Streaming session orchestrator for coding-agent chats")]
pub struct Cli {
    /// Directory holding the database and logs (default: ~/.subchat)
    #[arg(long, env = "SUBCHAT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "SUBCHAT_BIND", default_value = "127.0.0.1:4100")]
    pub bind: SocketAddr,

    /// Base URL of the OpenCode server used for `provider/model` turns
    #[arg(long, env = "SUBCHAT_OPENCODE_URL", default_value = "http://127.0.0.1:4096")]
    pub opencode_url: String,

    /// Path to the `claude` binary (default: PATH lookup, then ~/.claude/local/claude)
    #[arg(long, env = "SUBCHAT_CLAUDE_BIN")]
    pub claude_bin: Option<PathBuf>,

    /// Attach captured stderr to error chunks
    #[arg(
        long,
        env = "SUBCHAT_VERBOSE_ERRORS",
        default_value_t = cfg!(debug_assertions),
        action = ArgAction::Set
    )]
    pub verbose_errors: bool,

    /// Seconds an unanswered question waits before it is denied
    #[arg(long, env = "SUBCHAT_APPROVAL_TIMEOUT_SECS", default_value_t = 60)]
    pub approval_timeout_secs: u64,

    /// Extra `KEY=VALUE` variables for the spawned agent CLI (repeatable)
    #[arg(
        long = "claude-env",
        env = "SUBCHAT_CLAUDE_ENV",
        value_delimiter = ',',
        value_parser = parse_env_pair
    )]
    pub claude_env: Vec<(String, String)>,

    /// Log filter directives (falls back to RUST_LOG)
    #[arg(long, env = "SUBCHAT_LOG_FILTER")]
    pub log_filter: Option<String>,

    #[arg(long, env = "SUBCHAT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

impl Cli {
    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            filter: self.log_filter.clone(),
            format: self.log_format,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            approval_timeout: Duration::from_secs(self.approval_timeout_secs),
            verbose_errors: self.verbose_errors,
            backend_env: self.claude_env.clone(),
            ..OrchestratorConfig::default()
        }
    }
}

/// Tunables for turn execution
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub approval_timeout: Duration,
    pub verbose_errors: bool,
    /// Delay before the single retry of a failed turn write
    pub write_retry_delay: Duration,
    /// Subscriber channel depth
    pub chunk_buffer: usize,
    /// Added to the environment of every local backend process
    pub backend_env: Vec<(String, String)>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(60),
            verbose_errors: cfg!(debug_assertions),
            write_retry_delay: Duration::from_millis(100),
            chunk_buffer: 256,
            backend_env: Vec::new(),
        }
    }
}
