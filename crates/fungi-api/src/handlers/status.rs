//! /status handler.

use std::time::Instant;

use axum::extract::State;
use axum::Json;

use fungi_core::api::StatusResponse;

use super::{ApiError, ApiState};

pub async fn handle_status(
    State(state): State<ApiState>,
) -> Result<Json<StatusResponse>, ApiError> {
    let active_nodes = state.registry.active_count(Instant::now())?;

    Ok(Json(StatusResponse {
        active_nodes,
        ttl_secs: state.registry.ttl().as_secs(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}
