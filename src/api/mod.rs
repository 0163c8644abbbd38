//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor, inboxes)
//! - WebFinger
//! - Metrics (Prometheus)

mod activitypub;
mod metrics;
mod wellknown;

use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::metrics::HTTP_REQUESTS_TOTAL;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;

/// Turn a handler result into a response, counting it under its final status
fn observed<T: IntoResponse>(
    method: &str,
    endpoint: &str,
    result: Result<T, AppError>,
) -> Response {
    let response = result.into_response();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, response.status().as_str()])
        .inc();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn observed_counts_error_statuses() {
        let endpoint = "/observed-test";
        let not_found = HTTP_REQUESTS_TOTAL.with_label_values(&["GET", endpoint, "404"]);
        let unauthorized = HTTP_REQUESTS_TOTAL.with_label_values(&["POST", endpoint, "401"]);
        let accepted = HTTP_REQUESTS_TOTAL.with_label_values(&["POST", endpoint, "202"]);
        let before = (not_found.get(), unauthorized.get(), accepted.get());

        let response = observed("GET", endpoint, Err::<StatusCode, _>(AppError::NotFound));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        observed(
            "POST",
            endpoint,
            Err::<StatusCode, _>(AppError::SignatureMissing),
        );
        observed("POST", endpoint, Ok::<_, AppError>(StatusCode::ACCEPTED));

        assert_eq!(not_found.get(), before.0 + 1);
        assert_eq!(unauthorized.get(), before.1 + 1);
        assert_eq!(accepted.get(), before.2 + 1);
    }
}
