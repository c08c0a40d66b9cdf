//! Orchestrator server binary.
//!
//! Stands up the full actor tree (skill registry, blackboard, dispatcher,
//! task graph, worker supervisor, viewport) and serves the HTTP/WebSocket
//! boundary on top of it.

use std::net::SocketAddr;

use orchestrator::api::routes::{create_router, task_outcome_logger, AppState};
use orchestrator::blackboard::Blackboard;
use orchestrator::config::AppConfig;
use orchestrator::dispatcher::Dispatcher;
use orchestrator::events::EventBus;
use orchestrator::graph::TaskGraph;
use orchestrator::memory::InMemorySidecar;
use orchestrator::skill_registry::SkillRegistry;
use orchestrator::viewport::Viewport;
use orchestrator::worker::WorkerSupervisor;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("ORCHESTRATOR_CONFIG").ok().map(std::path::PathBuf::from);
    let config = AppConfig::from_env_with_defaults(config_path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()))
        .init();

    tracing::info!(
        bind_addr = %config.http_bind_addr,
        default_runtime_id = %config.default_runtime_id,
        "starting orchestrator",
    );

    let event_bus = EventBus::new();
    let registry = SkillRegistry::spawn();
    let blackboard = Blackboard::spawn(event_bus.clone());
    let sidecar = Arc::new(InMemorySidecar::new());

    let dispatcher = Dispatcher::spawn(registry.clone(), config.bid_window(), event_bus.clone());
    let supervisor = WorkerSupervisor::spawn(
        dispatcher.clone(),
        registry,
        sidecar,
        event_bus.clone(),
        config.restart_policy(),
    );
    let graph = TaskGraph::spawn(dispatcher.clone(), event_bus.clone(), config.graph_limits());
    let viewport = Viewport::spawn(event_bus);

    let state = AppState {
        dispatcher,
        supervisor,
        graph,
        viewport,
        blackboard,
        task_outcomes: task_outcome_logger(),
        config: config.clone(),
    };

    let app = create_router(state);
    let addr: SocketAddr = config.http_bind_addr.parse()?;

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("orchestrator shut down gracefully");
    Ok(())
}

/// Waits for SIGINT or SIGTERM. `axum::serve` stops accepting new
/// connections the moment this resolves and lets in-flight requests drain;
/// the actor tree itself is torn down when the process exits, since it
/// holds no state that needs flushing to disk.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received CTRL-C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
