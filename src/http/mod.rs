//! Owner-facing HTTP API.
//!
//! Thin by design: handlers validate, check ownership, and delegate to the
//! store and the chart engine. Errors map to status codes with a single
//! error-shaped JSON body; ownership mismatches surface as 404 so the API
//! never acts as an existence oracle.

pub mod auth;
pub mod dashboard;
pub mod enroll;
pub mod machines;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::health::HealthMetrics;
use crate::rpc::connection::ConnectionRegistry;
use crate::store::{Store, StoreError};

/// Shared state for API handlers.
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: ConnectionRegistry,
    pub health: Arc<HealthMetrics>,
    /// Advertised to dashboards so poll cadence matches recording cadence.
    pub snapshot_interval: Duration,
    /// Stream address handed to enrolling agents.
    pub rpc_advertise: String,
}

/// API error, rendered as `{"error": "..."}` with the matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            other => Self::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Internal(e) => {
                error!(error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Builds the API router. Everything except agent enrollment requires a
/// bearer token.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        .route(
            "/machines",
            get(machines::list).post(machines::create),
        )
        .route(
            "/machines/:id",
            get(machines::get_one).delete(machines::remove),
        )
        .route("/machines/:id/re-enable", post(machines::re_enable))
        .route(
            "/machines/:id/commands",
            get(machines::list_commands).post(machines::queue_command),
        )
        .route("/claim-codes", post(enroll::issue_claim_code))
        .route("/dashboard/stats", get(dashboard::stats))
        .route("/dashboard/config", get(dashboard::config))
        .route("/dashboard/uptime", get(dashboard::uptime))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_user,
        ));

    let public = Router::new().route("/agents/enroll", post(enroll::enroll));

    Router::new()
        .nest("/api/v1", authed.merge(public))
        .with_state(state)
}

/// Binds and serves the API with graceful shutdown on cancellation.
pub async fn serve(
    host: &str,
    port: u16,
    router: Router,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let bind_addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))?;
    let local_addr = listener.local_addr().context("getting local address")?;

    info!(addr = %local_addr, "api server started");

    let handle = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "api server error");
        }
    });

    Ok((local_addr, handle))
}
