//! Prometheus scrape endpoint

use axum::{
    Router,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::error::AppError;
use crate::metrics::REGISTRY;

/// Render every registered instrument in the Prometheus text format
pub fn render_metrics() -> Result<String, AppError> {
    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to encode metrics: {e}")))
}

async fn scrape() -> Result<Response, AppError> {
    let body = render_metrics()?;
    Ok(([(header::CONTENT_TYPE, TextEncoder::new().format_type())], body).into_response())
}

/// `GET /metrics`
///
/// Unauthenticated; deploy behind a private listener if exposure matters.
pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(scrape))
}
