//! HTTP API handlers: exposes registry state as JSON.

pub mod sources;
pub mod status;

use std::time::Instant;

use axum::http::StatusCode;

use beacon_services::{HubError, HubHandle};

#[derive(Clone)]
pub struct ApiState {
    pub hub: HubHandle,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(hub: HubHandle) -> Self {
        Self {
            hub,
            started_at: Instant::now(),
        }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn hub_unavailable(e: HubError) -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use sources::{handle_sources, handle_visible};
pub use status::{handle_connections, handle_filters, handle_status, handle_transitions};
