//! Statistics, info and chart handlers

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use super::ApiState;
use crate::charts::ChartKind;
use crate::error::ServerError;
use crate::stats::format_rate;

/// GET /stats
pub async fn stats(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.cache.stats().await).into_response()
}

/// GET /info
pub async fn info(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.cache.info()).into_response()
}

pub async fn cached_count(State(state): State<Arc<ApiState>>) -> String {
    state.cache.cached_count().await.to_string()
}

pub async fn cleaned_count(State(state): State<Arc<ApiState>>) -> String {
    state.cache.counters().await.cleaned.to_string()
}

pub async fn hit_count(State(state): State<Arc<ApiState>>) -> String {
    state.cache.counters().await.hits.to_string()
}

pub async fn miss_count(State(state): State<Arc<ApiState>>) -> String {
    state.cache.counters().await.misses.to_string()
}

pub async fn hit_rate(State(state): State<Arc<ApiState>>) -> String {
    format_rate(state.cache.hit_rate().await)
}

pub async fn miss_rate(State(state): State<Arc<ApiState>>) -> String {
    format_rate(state.cache.miss_rate().await)
}

/// GET /stats/ctcache.json, streamed file by file
pub async fn saved_stats(State(state): State<Arc<ApiState>>) -> Response {
    let body = Body::from_stream(state.cache.saved_stats_stream());
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// GET /image/{name}.svg
pub async fn image(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    let kind = match name
        .strip_suffix(".svg")
        .ok_or_else(|| ServerError::NotFound(format!("Image {}", name)))
        .and_then(str::parse::<ChartKind>)
    {
        Ok(kind) => kind,
        Err(err) => return err.into_response(),
    };

    let svg = state.cache.chart(kind).await;
    ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response()
}
