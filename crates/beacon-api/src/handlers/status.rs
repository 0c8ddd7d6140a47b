//! /status, /connections, /transitions, /filters handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use beacon_core::policy::FilterRule;
use beacon_services::{ConnectionInfo, SourceTransition};

use super::{hub_unavailable, ApiState};

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub sources: usize,
    pub pending_removals: usize,
    pub connections: usize,
    pub filters: usize,
    pub uptime_secs: u64,
}

pub async fn handle_status(
    State(state): State<ApiState>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let stats = state.hub.stats().await.map_err(hub_unavailable)?;
    Ok(Json(StatusResponse {
        sources: stats.sources,
        pending_removals: stats.pending_removals,
        connections: stats.connections,
        filters: state.hub.policy().rules().len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

// ── /connections ─────────────────────────────────────────────────────────────

pub async fn handle_connections(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ConnectionInfo>>, (StatusCode, String)> {
    state
        .hub
        .connections()
        .await
        .map(Json)
        .map_err(hub_unavailable)
}

// ── /transitions ─────────────────────────────────────────────────────────────

pub async fn handle_transitions(
    State(state): State<ApiState>,
) -> Result<Json<Vec<SourceTransition>>, (StatusCode, String)> {
    state
        .hub
        .transitions()
        .await
        .map(Json)
        .map_err(hub_unavailable)
}

// ── /filters ─────────────────────────────────────────────────────────────────

pub async fn handle_filters(State(state): State<ApiState>) -> Json<Vec<FilterRule>> {
    Json(state.hub.policy().rules().to_vec())
}
