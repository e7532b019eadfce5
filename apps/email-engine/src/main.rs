mod config;
mod db;
mod dispatch;
mod errors;
mod flows;
mod ledger;
mod models;
mod routes;
mod state;
mod store;
mod suppressions;
mod templates;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::dispatch::provider::{EmailProvider, ResendProvider};
use crate::dispatch::worker::DispatchWorker;
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::{EmailStore, MemoryEmailStore, PgEmailStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting email engine v{}", env!("CARGO_PKG_VERSION"));

    // Initialize storage
    let store: Arc<dyn EmailStore> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            Arc::new(PgEmailStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL is not set; using the in-memory store (data is lost on restart)");
            Arc::new(MemoryEmailStore::new())
        }
    };

    // Initialize the outbound provider
    let provider: Arc<dyn EmailProvider> = Arc::new(
        ResendProvider::new(config.resend_api_key.clone(), &config.resend_api_url)
            .context("failed to build the Resend client")?,
    );
    info!("Resend client initialized ({})", config.resend_api_url);

    // Start the dispatch worker
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = if config.dispatch.enabled {
        let worker = DispatchWorker::new(store.clone(), provider.clone(), &config);
        info!("Spawning dispatch worker {}", worker.worker_id());
        Some(tokio::spawn(worker.run(shutdown_rx)))
    } else {
        warn!("DISPATCH_ENABLED=false; scheduled emails will not be sent by this process");
        None
    };

    // Build app state
    let state = AppState {
        store,
        provider,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins to the admin dashboard host

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped; draining dispatch worker");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker {
        handle.await.context("dispatch worker panicked")?;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
