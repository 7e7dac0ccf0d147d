//! Record-reconciliation matching daemon
//!
//! Hosts the review HTTP API and the asynchronous matching pipeline:
//! coordinator fan-out, worker pool, and the repair sweeper all run in
//! this process against one SQLite-backed store and job queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relink_common::events::EventBus;
use relink_matcher::config::{CliArgs, MatcherConfig};
use relink_matcher::db::queue::{Broker, SqliteBroker};
use relink_matcher::services::{
    Coordinator, JobDispatcher, Matcher, Sweeper, WikidataClient, WorkerPool,
};
use relink_matcher::{build_router, db, AppState};

/// Broadcast capacity before slow SSE subscribers start lagging
const EVENT_BUS_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = MatcherConfig::resolve(&args).context("Failed to resolve configuration")?;

    // Initialize tracing
    let default_filter = format!(
        "relink_matcher={level},relink_common={level}",
        level = config.log_level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting relink-matcher on port {}", config.listen_port);
    info!("Root folder: {}", config.root_folder.display());

    let db_path = config.database_path();
    let db = db::init_database_pool(&db_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database ready at {}", db_path.display());

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::new(
        db.clone(),
        Duration::from_secs(config.pipeline.visibility_timeout_secs),
    ));
    let dispatcher = JobDispatcher::new(broker.clone(), config.pipeline.max_attempts);

    let search = Arc::new(
        WikidataClient::new(&config.search).context("Failed to build search client")?,
    );
    let matcher = Matcher::new(db.clone(), search, config.scoring.clone());
    let coordinator = Coordinator::new(
        db.clone(),
        dispatcher.clone(),
        event_bus.clone(),
        config.pipeline.chunk_size,
    );

    let shutdown = CancellationToken::new();

    let workers = Arc::new(WorkerPool::new(
        db.clone(),
        broker.clone(),
        dispatcher.clone(),
        matcher,
        coordinator,
        event_bus.clone(),
        &config.pipeline,
    ));
    let mut handles = workers.spawn(shutdown.clone());
    info!(
        "Worker pool started ({} workers)",
        config.pipeline.worker_count.max(1)
    );

    let sweeper = Arc::new(Sweeper::new(
        db.clone(),
        dispatcher.clone(),
        event_bus.clone(),
        &config.pipeline,
    ));
    handles.push(sweeper.spawn(shutdown.clone()));

    // Build the application router
    let app_state = AppState::new(db, event_bus, dispatcher);
    let app = build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain the pipeline before exiting
    info!("Stopping pipeline tasks");
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
