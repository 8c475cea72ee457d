//! Visit tracking for a single NFC checkpoint.
//!
//! Badges get tapped on a reader that opens `/?nfcid=<id>`. The first tap of a badge
//! means the holder is **entering**, the next one **exiting**, and so on. Every exit
//! records a visit with how long the holder stayed.
//!
//!
//!
//! # General Infrastructure
//! - Reader (or kiosk browser) hits the server directly or through one reverse proxy
//! - Behind a proxy, `X-Forwarded-For` carries the reader address
//! - One process, one store; the store is picked with `STORE_BACKEND`
//!
//!
//!
//! # Stores
//!
//! ## SQLite
//! Append only table of sightings, plus a visits table. Simple to run next to the
//! server on one box. See [`relational`].
//!
//! ## Redis
//! Current status per badge in one hash, visits in another. Use this when several
//! kiosks share state. See [`database`].
//!
//! ## Memory
//! Nothing persisted. Handy for trying the screens out.
//!
//!
//!
//! # Setup
//!
//! Run against a local SQLite file.
//! ```sh
//! DATABASE_URL=sqlite:tap.db RUST_LOG=info cargo run -p tapper
//! ```
//!
//! Run against Redis, password from `/run/secrets/REDIS_PASSWORD` or the environment.
//! ```sh
//! STORE_BACKEND=redis REDIS_URL=redis://localhost:6379 cargo run -p tapper
//! ```
//!
//! Tap.
//! ```sh
//! curl 'http://localhost:5000/?nfcid=04A2B3'
//! ```
//!
//!
//!
//! ## Operator commands
//!
//! Last status of every badge.
//! ```sh
//! cargo run -p admin -- list
//! ```
//!
//! Visits of one badge.
//! ```sh
//! cargo run -p admin -- visits 04A2B3
//! ```
//!
//! Wipe everything.
//! ```sh
//! cargo run -p admin -- drop --yes
//! ```
use std::{net::SocketAddr, sync::Arc};

use axum::{Router, routing::get};
use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod checkpoint;
pub mod config;
pub mod database;
pub mod error;
pub mod memory;
pub mod page;
pub mod relational;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;

use config::Config;
use error::ServerError;
use routes::{health_handler, tap_handler};
use state::State;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();
}

pub fn build_router(state: Arc<State>) -> Router {
    Router::new()
        .route("/", get(tap_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server() -> Result<(), ServerError> {
    init_tracing();

    let config = Config::load()?;

    info!("Initializing state...");
    let state = State::new(config).await?;

    info!("Starting server...");
    let app = build_router(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutting down, closing store...");
    state.checkpoint.store().close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
