//! Cache entry handlers

use axum::{
    body::Bytes,
    extract::{FromRequest, Path, Query, Request, State},
    http::header,
    response::{IntoResponse, Response},
    Form,
};
use ctcache_content_store::CacheHash;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ApiState, KeyQuery};
use crate::error::{ServerError, ServerResult};

/// Form body sent by clients uploading a result
#[derive(Debug, Deserialize)]
pub struct StoreForm {
    pub data: String,
}

/// GET /cache/{hash}
pub async fn fetch_entry(State(state): State<Arc<ApiState>>, Path(hash): Path<String>) -> Response {
    match state.cache.fetch(&hash).await {
        Ok(content) => ([(header::CONTENT_TYPE, "application/octet-stream")], content).into_response(),
        Err(err) => err.into_response(),
    }
}

/// PUT|POST /cache/{hash}
pub async fn store_entry(State(state): State<Arc<ApiState>>, Path(hash): Path<String>, request: Request) -> Response {
    if !CacheHash::is_valid(&hash) {
        return ServerError::ValidationError(format!("Invalid cache hash format: {}", hash)).into_response();
    }

    let payload = match read_payload(request).await {
        Ok(payload) => payload,
        Err(err) => return err.into_response(),
    };

    match state.cache.store(&hash, &payload).await {
        Ok(_) => "true".into_response(),
        Err(err) => err.into_response(),
    }
}

/// The `data` field of a form upload, or the raw body for any other content type
async fn read_payload(request: Request) -> ServerResult<Vec<u8>> {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        let Form(form) = Form::<StoreForm>::from_request(request, &())
            .await
            .map_err(|rejection| ServerError::ValidationError(rejection.body_text()))?;
        Ok(form.data.into_bytes())
    } else {
        let body = Bytes::from_request(request, &())
            .await
            .map_err(|rejection| ServerError::ValidationError(rejection.body_text()))?;
        Ok(body.to_vec())
    }
}

/// GET /is_cached/{hash}
pub async fn is_cached(State(state): State<Arc<ApiState>>, Path(hash): Path<String>) -> Response {
    match state.cache.is_cached(&hash).await {
        Ok(cached) => cached.to_string().into_response(),
        Err(err) => err.into_response(),
    }
}

/// GET /purge_cache
///
/// Without a configured write key anyone can purge the cache.
pub async fn purge_cache(State(state): State<Arc<ApiState>>, Query(query): Query<KeyQuery>) -> Response {
    if !state.write_allowed(query.key.as_deref()) {
        warn!("Rejected purge with missing or wrong write key");
        return ServerError::Forbidden("Purging requires the write key".to_string()).into_response();
    }

    match state.cache.purge().await {
        Ok(()) => {
            info!("Cache purged on request");
            "success".into_response()
        }
        Err(err) => err.into_response(),
    }
}
