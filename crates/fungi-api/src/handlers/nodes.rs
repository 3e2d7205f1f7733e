//! /nodes handlers: Register, ListPeers, Deregister.

use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use fungi_core::api::{DeregisterResponse, PeerInfo, RegisterRequest, RegisterResponse};
use fungi_core::record::validate_node_id;

use super::{ApiError, ApiState};

// ── /nodes (POST) ─────────────────────────────────────────────────────────────

pub async fn handle_register(
    State(state): State<ApiState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let addr = state
        .registry
        .register(&req.node_id, &req.ip, req.port, Instant::now())?;

    tracing::debug!(node_id = %req.node_id, endpoint = %addr, "register");

    Ok(Json(RegisterResponse {
        node_id: req.node_id,
        ip: addr.ip().to_string(),
        port: addr.port(),
    }))
}

// ── /nodes (GET) ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListPeersQuery {
    pub caller_id: String,
}

pub async fn handle_list_peers(
    State(state): State<ApiState>,
    query: Result<Query<ListPeersQuery>, QueryRejection>,
) -> Result<Json<Vec<PeerInfo>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    validate_node_id(&query.caller_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let now = Instant::now();
    let peers = state
        .registry
        .list_active(&query.caller_id, now)?
        .into_iter()
        .map(|r| PeerInfo {
            last_seen_secs: now.saturating_duration_since(r.last_seen).as_secs(),
            ip: r.public_ip.to_string(),
            port: r.public_port,
            node_id: r.node_id,
        })
        .collect();

    Ok(Json(peers))
}

// ── /nodes/{node_id} (DELETE) ─────────────────────────────────────────────────

pub async fn handle_deregister(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
) -> Result<Json<DeregisterResponse>, ApiError> {
    let removed = state.registry.remove(&node_id)?;
    Ok(Json(DeregisterResponse { node_id, removed }))
}
