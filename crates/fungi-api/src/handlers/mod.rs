//! HTTP API handlers: the signaling server's view of the peer registry.

pub mod nodes;
pub mod status;

use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use fungi_core::api::ErrorBody;
use fungi_registry::{PeerRegistry, RegistryError};

#[derive(Clone)]
pub struct ApiState {
    pub registry: PeerRegistry,
    /// When the server started, for `/status` uptime.
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(registry: PeerRegistry) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Invalid(v) => ApiError::BadRequest(v.to_string()),
            RegistryError::Unavailable(msg) => ApiError::Unavailable(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "bad_request", detail),
            ApiError::Unavailable(detail) => {
                tracing::warn!(detail = %detail, "registry backend unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", detail)
            }
        };
        let body = ErrorBody {
            error: error.to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}

// Re-export handler functions for use in router setup.
pub use nodes::{handle_deregister, handle_list_peers, handle_register};
pub use status::handle_status;
