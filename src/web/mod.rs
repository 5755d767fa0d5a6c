//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::{CancelToken, DbError, Store};
use crate::scheduler::{IngestError, IngestQueue};

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub ingest: IngestQueue,
}

/// Errors returned by handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("ingest queue is full, retry later")]
    Overloaded,
    #[error("service is shutting down")]
    Unavailable,
    #[error("request timed out")]
    Timeout,
    #[error("internal server error")]
    Internal,
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Validation(msg) => ApiError::BadRequest(msg),
            DbError::Cancelled => ApiError::Timeout,
            other => {
                tracing::error!("Storage error: {}", other);
                ApiError::Internal
            }
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Overloaded => ApiError::Overloaded,
            IngestError::Closed => ApiError::Unavailable,
            IngestError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Overloaded | ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

/// Run a store call on the blocking pool, bounded by the query timeout.
/// When the deadline passes, reads still running are interrupted so their
/// connections return to the pool.
pub(crate) async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T, DbError> + Send + 'static,
{
    let token = CancelToken::new();
    let store = state.store.with_cancel(&token);
    let task = tokio::task::spawn_blocking(move || f(&store));

    match tokio::time::timeout(state.config.query_timeout, task).await {
        Err(_) => {
            token.cancel();
            tracing::warn!(
                "Store call exceeded {}, cancelled",
                humantime::format_duration(state.config.query_timeout)
            );
            Err(ApiError::Timeout)
        }
        Ok(Err(e)) => {
            tracing::error!("Store task failed: {}", e);
            Err(ApiError::Internal)
        }
        Ok(Ok(result)) => result.map_err(ApiError::from),
    }
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/data", post(handlers::handle_monitoring_data))
        .route("/api/clients", get(handlers::handle_get_clients))
        .route("/api/dashboard_data", get(handlers::handle_dashboard_data))
        .route("/api/history", get(handlers::handle_get_history))
        .route("/api/anomalies", get(handlers::handle_get_anomalies))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// Web server for probetrail.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, ingest: IngestQueue) -> Self {
        Self {
            state: AppState {
                config,
                store,
                ingest,
            },
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<S>(self, shutdown: S) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = routes(self.state);

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
