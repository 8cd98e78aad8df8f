//! Liveness endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

/// Which implementation backs each infrastructure dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendKinds {
    pub store: &'static str,
    pub queue: &'static str,
    pub lock: &'static str,
}

impl Default for BackendKinds {
    fn default() -> Self {
        Self {
            store: "memory",
            queue: "memory",
            lock: "memory",
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backends: BackendKinds,
}

/// GET /health — the process is up; reports the backends it was wired with.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backends: state.backends,
    })
}
