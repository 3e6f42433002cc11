//! Structured logging to a daily-rolled file under the data directory.

use std::path::Path;

use chrono::Utc;
use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE_PREFIX: &str = "subchat.log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One flattened JSON object per event
    #[default]
    Json,
    /// Multi-line human-readable events
    Pretty,
}

/// Logging knobs resolved from the command line
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// `EnvFilter` directives; `RUST_LOG` and then the default apply when unset
    pub filter: Option<String>,
    pub format: LogFormat,
}

pub struct LoggingHandle {
    pub run_id: String,
    /// Flushes the file writer on drop
    pub guard: WorkerGuard,
}

/// Directives in effect: explicit, then `RUST_LOG`, then the default. Invalid
/// directives fall through to the next source.
fn resolve_filter(explicit: Option<&str>) -> (EnvFilter, String) {
    explicit
        .map(str::to_string)
        .into_iter()
        .chain(std::env::var("RUST_LOG").ok())
        .find_map(|directives| {
            EnvFilter::try_new(&directives)
                .ok()
                .map(|filter| (filter, directives))
        })
        .unwrap_or_else(|| (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER.to_string()))
}

fn run_id() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), std::process::id())
}

pub fn init_logging(log_dir: &Path, settings: &LogSettings) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let (filter, directives) = resolve_filter(settings.filter.as_deref());

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

    let registry = tracing_subscriber::registry().with(filter);
    match settings.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    let run_id = run_id();
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_dir = %log_dir.display(),
        format = ?settings.format,
        filter = %directives,
    );

    Ok(LoggingHandle { run_id, guard })
}
