pub mod api;
pub mod artifacts;
pub mod config;
pub mod diff;
pub mod error;
pub mod grader;
pub mod metrics;
pub mod models;
pub mod package;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod workspace;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::{AppState, routes},
    config::EngineConfig,
    metrics::MetricsRegistry,
    sandbox::{ProcessSandbox, SandboxBackend},
    session::SessionRegistry,
    store::GradeStore,
    workspace::WorkspaceManager,
};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let metrics = Arc::new(MetricsRegistry::new());
    let store = GradeStore::open(config.store_path.clone())
        .await
        .context("failed to open grade store")?;
    let workspaces = WorkspaceManager::new(config.workspace_root.clone());
    let sandbox: Arc<dyn SandboxBackend> = Arc::new(ProcessSandbox::new(
        workspaces.clone(),
        config.interpreter.clone(),
        config.max_output_bytes,
        config.max_concurrent_runs,
        metrics.clone(),
    ));
    let sessions = SessionRegistry::new(
        workspaces.clone(),
        config.session_idle_timeout,
        metrics.clone(),
    );
    let sweeper = sessions.spawn_sweeper(config.session_sweep_interval);

    tracing::info!(
        backend = sandbox.name(),
        interpreter = %config.interpreter.command,
        workspace_root = %workspaces.base_dir().display(),
        submissions_dir = %config.submissions_dir.display(),
        "execution backend configured"
    );

    let app: Router = routes(AppState::new(
        config.clone(),
        store,
        sandbox,
        sessions.clone(),
        metrics,
    ));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, "grading service ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.shutdown().await;
    sessions.close_all().await;
    tracing::info!("grading service stopped");
    served.context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
