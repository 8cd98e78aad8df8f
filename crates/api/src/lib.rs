//! HTTP producers and queue workers for the orchestration core.
//!
//! The HTTP handlers are the API side of every saga: they insert or lock the
//! entity row, enqueue the saga's first message and optimistically advance
//! the commit state to `sent_to_queue`. Responses report the commit state the
//! row is in; clients poll `GET` for progress.

pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::SagaProducers;
use store::{OrgSubStore, RepoStore};

use crate::routes::health::BackendKinds;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub repos: Arc<dyn RepoStore>,
    pub subs: Arc<dyn OrgSubStore>,
    pub producers: SagaProducers,
    pub backends: BackendKinds,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/repos", axum::routing::post(routes::repos::create))
        .route(
            "/repos/{id}",
            get(routes::repos::get).delete(routes::repos::delete),
        )
        .route("/subs", axum::routing::post(routes::subs::create))
        .route(
            "/subs/{id}",
            get(routes::subs::get)
                .put(routes::subs::update)
                .delete(routes::subs::delete),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
