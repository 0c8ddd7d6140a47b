//! /sources and /sources/visible/{addr} handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use beacon_core::policy::{parse_ipv4, PolicyAnnotation};
use beacon_services::{SourceRecord, SourceState, SourceView};

use super::{hub_unavailable, ApiState};

// ── /sources ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SourcesResponse {
    pub sources: Vec<SourceInfo>,
}

#[derive(Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub metadata: String,
    pub address: String,
    pub port: u16,
    pub groups: Vec<String>,
    pub state: SourceState,
    pub owners: usize,
    #[serde(flatten)]
    pub policy: PolicyAnnotation,
}

impl From<SourceView> for SourceInfo {
    fn from(view: SourceView) -> Self {
        let r = view.record;
        SourceInfo {
            name: r.name,
            metadata: r.metadata,
            address: r.address.to_string(),
            port: r.port,
            groups: r.groups,
            state: r.state,
            owners: r.owners.len(),
            policy: view.policy,
        }
    }
}

pub async fn handle_sources(
    State(state): State<ApiState>,
) -> Result<Json<SourcesResponse>, (StatusCode, String)> {
    let views = state.hub.list_all().await.map_err(hub_unavailable)?;
    Ok(Json(SourcesResponse {
        sources: views.into_iter().map(SourceInfo::from).collect(),
    }))
}

// ── /sources/visible/{addr} ───────────────────────────────────────────────────

#[derive(Serialize)]
pub struct VisibleResponse {
    pub watcher: String,
    pub sources: Vec<VisibleSource>,
}

#[derive(Serialize)]
pub struct VisibleSource {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub groups: Vec<String>,
}

pub async fn handle_visible(
    State(state): State<ApiState>,
    Path(addr): Path<String>,
) -> Result<Json<VisibleResponse>, (StatusCode, String)> {
    let watcher = parse_ipv4(&addr)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("invalid IPv4 address: {addr}")))?;
    let records = state
        .hub
        .list_visible_to(watcher)
        .await
        .map_err(hub_unavailable)?;

    Ok(Json(VisibleResponse {
        watcher: watcher.to_string(),
        sources: records
            .into_iter()
            .map(|r: SourceRecord| VisibleSource {
                name: r.name,
                address: r.address.to_string(),
                port: r.port,
                groups: r.groups,
            })
            .collect(),
    }))
}
