//! ActivityPub endpoints
//!
//! - Actor profile
//! - Personal inbox
//! - Shared inbox

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use super::observed;
use crate::AppState;
use crate::error::AppError;
use crate::federation::{ACTIVITY_JSON, Activity, DispatchOutcome, InboxMessage, InboxTarget};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:identifier - Actor profile
/// - POST /users/:identifier/inbox - Personal inbox
/// - POST /inbox - Shared inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:identifier", get(actor))
        .route("/users/:identifier/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
}

/// Whether the client asked for an ActivityPub representation
fn accepts_activity_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            let value = value.to_ascii_lowercase();
            value.contains("application/activity+json") || value.contains("application/ld+json")
        })
}

/// GET /users/:identifier
///
/// Returns ActivityPub Actor document.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
) -> Response {
    observed(
        "GET",
        "/users/:identifier",
        actor_document(&state, &identifier, &headers).await,
    )
}

async fn actor_document(
    state: &AppState,
    identifier: &str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    // No HTML profile is served; other representations are simply absent.
    if !accepts_activity_json(headers) {
        return Err(AppError::NotFound);
    }

    let registry = &state.federation.registry;
    let identity = registry.dispatch_actor(identifier)?;
    let key_pair = state
        .federation
        .key_store
        .get_or_create_key_pair(identifier)
        .await?;
    let document = registry.actor_document(&identity, &key_pair)?;

    Ok((
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        document.to_string(),
    )
        .into_response())
}

/// POST /users/:identifier/inbox
///
/// Receives incoming ActivityPub activities for one actor.
async fn inbox(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = if state.federation.registry.is_hosted(&identifier) {
        receive(
            &state,
            InboxTarget::Personal(identifier),
            &uri,
            &headers,
            &body,
        )
        .await
    } else {
        Err(AppError::UnknownIdentifier(identifier))
    };

    observed("POST", "/users/:identifier/inbox", result)
}

/// POST /inbox
///
/// Shared inbox for all actors on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    observed(
        "POST",
        "/inbox",
        receive(&state, InboxTarget::Shared, &uri, &headers, &body).await,
    )
}

/// Common inbox pipeline
///
/// # Steps
/// 1. Verify HTTP Signature
/// 2. Parse activity
/// 3. Check the signer is the activity's actor
/// 4. Dispatch and enqueue resulting deliveries
async fn receive(
    state: &AppState,
    target: InboxTarget,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let result = receive_inner(state, target, uri, headers, body).await;

    let status = match &result {
        Ok(_) => "accepted",
        Err(e) if e.is_auth_failure() => "unauthorized",
        Err(_) => "rejected",
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", status])
        .inc();

    result
}

async fn receive_inner(
    state: &AppState,
    target: InboxTarget,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    // 1. Verify the HTTP signature before looking at the body.
    let verified = state.verifier.verify("POST", path, headers, body).await?;

    // 2. Parse the activity
    let document: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::MalformedActivity(format!("Invalid JSON: {}", e)))?;
    let activity = Activity::parse(document)?;

    // 3. The key owner must be the actor the activity claims.
    if let Some(actor) = activity.actor.as_deref() {
        if actor != verified.owner {
            tracing::warn!(
                key_id = %verified.key_id,
                owner = %verified.owner,
                actor = %actor,
                "Signature owner does not match activity actor"
            );
            return Err(AppError::SignatureInvalid(
                "Signature keyId actor mismatch".to_string(),
            ));
        }
    }

    tracing::debug!(
        activity_type = %activity.kind,
        activity_id = ?activity.id,
        signer = %verified.owner,
        inbox = ?target,
        "Verified inbound activity"
    );

    let message = InboxMessage {
        activity,
        key_id: verified.key_id,
        signer: verified.owner,
        inbox: target,
    };

    // 4. Dispatch; deliveries run in the background.
    let outcome = state.dispatcher.dispatch(&state.federation, &message).await;
    if let DispatchOutcome::Dispatched(handler_outcome) = &outcome {
        tracing::debug!(outcome = ?handler_outcome, "Activity dispatched");
    }

    for task in outcome.into_intents() {
        if let Err(e) = state.delivery_queue.enqueue(task) {
            tracing::error!(error = %e, "Failed to enqueue delivery");
        }
    }

    Ok(StatusCode::ACCEPTED)
}
