// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP server for the pelican Action API.
//!
//! Exposes the five state-changing operations of the action pipeline
//! (broadcast ack, clock record, attendance check-in, session open and the
//! session close/extend transitions) over a small axum router. All handler
//! state lives behind the store traits from `pelican-store`, so the same
//! router runs against the in-memory store in tests and SQLite in
//! production.
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::{ApiError, ErrorBody};
pub use state::{AppState, ServerStore};

use axum::Router;
use axum::routing::post;
use tokio::net::TcpListener;
use tracing::info;

/// Build the Action API router over the given state.
pub fn app<S: ServerStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/v1/broadcasts/{id}/ack", post(routes::ack::<S>))
        .route("/v1/clock/records", post(routes::clock_record::<S>))
        .route("/v1/attendance/check", post(routes::attendance_check::<S>))
        .route("/v1/attendance/sessions", post(routes::create_session::<S>))
        .route(
            "/v1/attendance/sessions/{id}/close",
            post(routes::close_session::<S>),
        )
        .route(
            "/v1/attendance/sessions/{id}/extend",
            post(routes::extend_session::<S>),
        )
        .with_state(state)
}

/// Bind and serve the Action API until `SIGINT` or `SIGTERM`.
pub async fn serve<S: ServerStore>(store: S, config: ServerConfig) -> std::io::Result<()> {
    let addr = config.bind_addr;
    let router = app(AppState::new(store, config));

    let listener = TcpListener::bind(addr).await?;
    info!("action api listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install ctrl-c handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!("failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
