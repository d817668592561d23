//! Documentation of the activity catalog write and propagation pipeline.
//!
//!
//!
//! # General Infrastructure
//! - `catalog` owns canonical activity records and is the only writer
//! - `search` serves filtered listings out of a search engine behind two cache tiers
//! - Every catalog write publishes a change event onto a Redis stream
//! - `search` consumes that stream, re-fetches canonical state from `catalog`,
//!   reindexes, then flushes both cache tiers
//! - `reindex` republishes a create event for every record, for rebuilding a lost index
//!
//!
//!
//! # Write Path
//!
//! **Goal**: A client mutation either fully lands (record stored and event published) or is reverted.
//!
//! - Validate, write the record store, publish the event
//! - Publish failure triggers a compensating store write and returns a rolled back error
//! - A compensation that itself fails is reported as inconsistent and logged at `error!`
//! - Enroll and unenroll are single Lua scripts, so two requests racing for the last seat
//!   can never both win
//!
//!
//!
//! # Read Path
//!
//! - Local moka tier, then shared Redis tier, then the search engine
//! - Only non-empty engine results are cached
//! - Any cache error is a miss, reads never fail because of a cache
//! - Staleness is bounded by TTL plus queue latency
//!
//!
//!
//! # Notes
//!
//! ## Redis for everything stateful
//! Records, the event stream and the shared cache tier all live in Redis. The record store needs
//! atomic conditional updates, which Lua scripts give without a transaction manager. Streams give
//! consumer groups with explicit acks and a pending list, which is exactly the at-least-once
//! contract the synchronizer is written for.
//!
//! Flushing the shared tier never touches record keys. It bumps a generation counter and the
//! old generation ages out through its TTL.
//!
//! ## Duplicates
//! Events can arrive twice or out of order. The synchronizer never trusts the event body and
//! always re-fetches, so replaying any prefix of the stream converges to the store's state.
//!
//!
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//! Run the catalog and the search service.
//! ```sh
//! RUST_LOG=info cargo run --bin catalog
//! RUST_PORT=8081 RUST_LOG=info cargo run --bin search
//! ```
//!
//! Rebuild the index from the record store.
//! ```sh
//! cargo run -p reindex -- --dry-run
//! cargo run -p reindex
//! ```
use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod models;
pub mod queue;
pub mod routes;
pub mod search;
pub mod state;
pub mod stats;
pub mod synchronizer;
pub mod utils;

use config::Config;
use error::QueueError;
use queue::StreamConsumer;
use routes::{
    create_activity_handler, delete_activity_handler, enroll_handler, enrollments_handler,
    get_activity_handler, health_handler, list_activities_handler, many_activities_handler,
    search_by_id_handler, search_handler, statistics_handler, unenroll_handler,
    update_activity_handler,
};
use state::{CatalogState, SearchState};

pub fn catalog_router(state: Arc<CatalogState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/healthz", get(health_handler))
        .route(
            "/activities",
            get(list_activities_handler).post(create_activity_handler),
        )
        .route("/activities/many", get(many_activities_handler))
        .route("/activities/statistics", get(statistics_handler))
        .route(
            "/activities/{id}",
            get(get_activity_handler)
                .put(update_activity_handler)
                .delete(delete_activity_handler),
        )
        .route("/activities/{id}/enroll", post(enroll_handler))
        .route("/activities/{id}/unenroll", post(unenroll_handler))
        .route("/inscriptions/{participant}", get(enrollments_handler))
        .layer(cors)
        .with_state(state)
}

pub fn search_router(state: Arc<SearchState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/search", get(search_handler))
        .route("/search/{id}", get(search_by_id_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_catalog_server() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::load()?;

    info!("Initializing state...");
    let state = CatalogState::new(config).await?;

    info!("Starting catalog server...");
    let address = format!("0.0.0.0:{}", state.config.port);
    let app = catalog_router(state);

    serve(app, &address).await?;

    info!("Catalog server shutting down...");
    Ok(())
}

pub async fn start_search_server() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::load()?;

    info!("Initializing state...");
    let (state, synchronizer, queue_connection) = SearchState::new(config).await?;

    let consumer = StreamConsumer::new(queue_connection, &state.config);
    let consumer_task = tokio::spawn(async move { consumer.run(&synchronizer).await });

    info!("Starting search server...");
    let address = format!("0.0.0.0:{}", state.config.port);
    let app = search_router(state);

    serve_with_consumer(serve(app, &address), consumer_task).await?;

    info!("Search server shutting down...");
    Ok(())
}

/// Runs the server alongside the event consumer. The consumer ending first is
/// an error.
async fn serve_with_consumer<S>(
    served: S,
    mut consumer: JoinHandle<Result<(), QueueError>>,
) -> anyhow::Result<()>
where
    S: Future<Output = anyhow::Result<()>>,
{
    tokio::select! {
        served = served => {
            // Unacked entries stay pending and are redelivered on the next start.
            consumer.abort();
            served
        }
        finished = &mut consumer => {
            let error = match finished {
                Ok(Ok(())) => anyhow::anyhow!("Event consumer stopped"),
                Ok(Err(e)) => anyhow::Error::new(e).context("Event consumer failed"),
                Err(e) => anyhow::Error::new(e).context("Event consumer task aborted"),
            };
            error!("{error:#}");
            Err(error)
        }
    }
}

async fn serve(app: Router, address: &str) -> anyhow::Result<()> {
    info!("Binding to {address}");
    let listener = TcpListener::bind(address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
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
}

#[cfg(test)]
mod tests {
    use std::future::pending;

    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn test_consumer_exit_stops_the_server() {
        let consumer = tokio::spawn(async { Err(QueueError::Unavailable) });

        let result = serve_with_consumer(pending(), consumer).await;

        let error = result.unwrap_err();
        assert!(format!("{error:#}").contains("Event consumer failed"));
    }

    #[tokio::test]
    async fn test_server_exit_aborts_consumer() {
        let consumer = tokio::spawn(async {
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        let result = serve_with_consumer(async { Ok(()) }, consumer).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_server_error_is_returned() {
        let consumer = tokio::spawn(pending::<Result<(), QueueError>>());

        let served = async { Err(anyhow::anyhow!("bind failed")) };
        let result = serve_with_consumer(served, consumer).await;

        assert_eq!(result.unwrap_err().to_string(), "bind failed");
    }
}
