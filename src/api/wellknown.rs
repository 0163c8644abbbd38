//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use super::observed;
use crate::AppState;
use crate::error::AppError;
use crate::federation::{JRD_JSON, generate_webfinger_response, resolve_resource};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for hosted actors.
///
/// Query: ?resource=acct:user@domain (or the actor URI)
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Response {
    observed(
        "GET",
        "/.well-known/webfinger",
        webfinger_document(&state, query),
    )
}

fn webfinger_document(state: &AppState, query: WebFingerQuery) -> Result<Response, AppError> {
    let resource = query
        .resource
        .ok_or_else(|| AppError::Validation("Missing resource parameter".to_string()))?;

    let registry = &state.federation.registry;
    let identifier = resolve_resource(registry, &resource)?;
    let response = generate_webfinger_response(registry, &identifier);

    let body = serde_json::to_string(&response).map_err(|e| AppError::Internal(e.into()))?;

    Ok(([(header::CONTENT_TYPE, JRD_JSON)], body).into_response())
}
