//! Keel Server - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;

use keel_core::{
    api::{self, AppState},
    config::Config,
    db::{Database, PgEventStore},
    dispatch::{HandlerRegistry, IdempotentSink},
    observability,
    outbox::{EventStore, InMemoryEventStore},
};
use tokio_util::sync::CancellationToken;

/// Built-in kinds served by in-process sinks, with the dependency each calls.
const BUILTIN_KINDS: [(&str, Option<&str>); 3] = [
    ("journal.append", None),
    ("vector.upsert", Some("vector_store")),
    ("belief.update", Some("belief_processor")),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match std::env::var("KEEL_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load()?,
    };

    // Recorder first so the descriptions registered by `init` land in it
    let metrics = observability::install_prometheus()?;
    observability::init("keel-server", &config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        governor = ?config.governor.mode,
        "Starting Keel Server"
    );

    let (store, database): (Arc<dyn EventStore>, Option<Database>) = match config.database.url.as_deref() {
        Some(url) => {
            let db = Database::new(url, &config.database).await?;
            db.migrate().await?;
            tracing::info!("Connected to database, migrations applied");
            (Arc::new(PgEventStore::new(db.clone())), Some(db))
        }
        None => {
            tracing::warn!("No database.url configured; using the in-memory event store");
            (Arc::new(InMemoryEventStore::new()), None)
        }
    };

    let mut handlers = HandlerRegistry::new();
    for (kind, dependency) in BUILTIN_KINDS {
        handlers.register(kind, dependency, Arc::new(IdempotentSink::new(kind)))?;
    }

    let mut state = AppState::new(store, handlers, &config)?.with_metrics(metrics);
    if let Some(db) = database {
        state = state.with_database(db);
    }

    let dispatcher = if config.dispatcher.enabled {
        let dispatcher = Arc::new(state.dispatcher(&config.dispatcher));
        state = state.with_dispatcher_stats(dispatcher.stats().clone());
        Some(dispatcher.spawn(CancellationToken::new()))
    } else {
        tracing::info!("Dispatcher disabled");
        None
    };

    let app = api::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    if let Some(handle) = dispatcher {
        handle.shutdown().await;
    }
    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
