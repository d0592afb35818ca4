//! API key check applied to every route.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use super::error::ApiError;
use super::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_PARAM: &str = "key";

/// Reject the request unless it carries the configured key, in the `key`
/// query parameter or the `X-Api-Key` header. An empty configured key
/// matches nothing.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| {
            Query::<HashMap<String, String>>::try_from_uri(request.uri())
                .ok()
                .and_then(|Query(mut params)| params.remove(API_KEY_PARAM))
        });

    let authorized = match provided {
        Some(key) => state.live.read(|c| !c.api_key.is_empty() && c.api_key == key),
        None => false,
    };
    if !authorized {
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}
