//! subchat server
//!
//! Streams coding-agent turns for sub-chats over WebSocket and persists
//! every turn to SQLite.

mod accumulator;
mod approval;
mod config;
mod logging;
mod migration_runner;
mod orchestrator;
mod paths;
mod persistence;
mod registry;
#[cfg(test)]
mod test_support;
mod turn;
mod websocket;

use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use subchat_connectors::{ClaudeLauncher, OpenCodeClient};

use crate::config::Cli;
use crate::logging::init_logging;
use crate::orchestrator::Orchestrator;
use crate::paths::DataPaths;
use crate::persistence::SqliteStore;
use crate::registry::SessionRegistry;
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    paths.ensure_dirs()?;
    let logging = init_logging(&paths.log_dir(), &cli.log_settings())?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths.root().display(),
        bind = %cli.bind,
        opencode_url = %cli.opencode_url,
        "Starting subchat server"
    );

    let store = SqliteStore::open(paths.db_path())?;
    store.clear_stale_streams().await?;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(store),
        Arc::new(SessionRegistry::new()),
        Arc::new(ClaudeLauncher::new(cli.claude_bin.clone())),
        Arc::new(OpenCodeClient::new(cli.opencode_url.clone())),
        cli.orchestrator_config(),
    ));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(orchestrator);

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %cli.bind,
        "Listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
