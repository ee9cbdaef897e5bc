//! HTTP API of the ctcache server
//!
//! This module contains the routes, the write-key middleware and the
//! handlers translating requests into [`CacheService`] calls.

use axum::{
    extract::{DefaultBodyLimit, Query, Request, State},
    http::{header, Method, StatusCode},
    middleware::{self as axum_middleware, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub mod cache;
pub mod errors;
pub mod stats;

use crate::error::ServerError;
use crate::service::CacheService;

/// Largest accepted upload
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared state of the handlers
#[derive(Debug)]
pub struct ApiState {
    pub cache: Arc<CacheService>,
    /// Key required by write requests, if any
    pub write_key: Option<String>,
}

impl ApiState {
    pub fn new(cache: Arc<CacheService>, write_key: Option<String>) -> Self {
        Self { cache, write_key }
    }

    /// True if no key is configured or `key` matches it
    pub fn write_allowed(&self, key: Option<&str>) -> bool {
        match &self.write_key {
            Some(expected) => key == Some(expected.as_str()),
            None => true,
        }
    }
}

/// The `key` query parameter
#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    pub key: Option<String>,
}

/// Build the router for all endpoints
pub fn build_router(state: Arc<ApiState>) -> Router {
    let static_dir = state.cache.settings().static_dir.clone();

    Router::new()
        // Cache entries
        .route(
            "/cache/:hash",
            get(cache::fetch_entry).put(cache::store_entry).post(cache::store_entry),
        )
        .route("/is_cached/:hash", get(cache::is_cached))
        .route("/purge_cache", get(cache::purge_cache))

        // Statistics
        .route("/stats", get(stats::stats))
        .route("/stats/cached_count", get(stats::cached_count))
        .route("/stats/cleaned_count", get(stats::cleaned_count))
        .route("/stats/hit_count", get(stats::hit_count))
        .route("/stats/miss_count", get(stats::miss_count))
        .route("/stats/hit_rate", get(stats::hit_rate))
        .route("/stats/miss_rate", get(stats::miss_rate))
        .route("/stats/ctcache.json", get(stats::saved_stats))
        .route("/info", get(stats::info))
        .route("/image/:name", get(stats::image))

        // Dashboard
        .nest_service("/static", ServeDir::new(static_dir))
        .route("/", get(root_redirect))

        .layer(axum_middleware::from_fn_with_state(state.clone(), require_write_key))
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rejects non-GET requests whose `key` parameter does not match the write key
async fn require_write_key(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<KeyQuery>,
    request: Request,
    next: Next,
) -> Response {
    let is_read = request.method() == Method::GET || request.method() == Method::HEAD;
    if !is_read && !state.write_allowed(query.key.as_deref()) {
        warn!(method = %request.method(), path = %request.uri().path(), "Rejected write with missing or wrong key");
        return ServerError::Forbidden("Missing or wrong write key".to_string()).into_response();
    }

    next.run(request).await
}

async fn root_redirect() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/static/index.html")]).into_response()
}
