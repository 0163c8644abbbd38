//! Fedicore - a single-actor ActivityPub federation core
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Actor, inbox and shared inbox endpoints                  │
//! │  - WebFinger                                                │
//! │  - Health and metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Signature verification, inbox dispatch                   │
//! │  - Outbound delivery queue                                  │
//! │  - Actor registry, key store                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Key-value store (SQLite via sqlx, or in-memory)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and WebFinger
//! - `federation`: ActivityPub federation handling
//! - `data`: Key-value persistence
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use federation::{
    ActorRegistry, DeliveryPolicy, DeliveryQueue, FederationContext, InboxDispatcher, KeyStore,
    OutboxDelivery, PublicKeyCache, SeenActivities, SignatureVerifier,
};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the key store, caches, and HTTP client.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Registry and key store handed to inbox handlers
    pub federation: Arc<FederationContext>,

    /// Inbound HTTP signature verification
    pub verifier: Arc<SignatureVerifier>,

    /// Inbox dispatch table
    pub dispatcher: Arc<InboxDispatcher>,

    /// Outbound delivery queue (drained by a background worker)
    pub delivery_queue: DeliveryQueue,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Build the federation HTTP client
    /// 2. Build the actor registry and key store
    /// 3. Build the signature verifier and inbox dispatcher
    /// 4. Spawn the delivery worker
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns error if the configuration does not form a usable base URL
    /// or the HTTP client cannot be built
    pub fn new(
        config: config::AppConfig,
        kv: Arc<dyn data::KvStore>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Initialize HTTP client
        let http_client = Arc::new(federation::federation_client(
            &config.federation.user_agent,
            Duration::from_secs(config.delivery.timeout_seconds),
        )?);

        // 2. Actors and keys
        let registry = Arc::new(ActorRegistry::new(&config, http_client.clone())?);
        let key_store = Arc::new(KeyStore::new(
            kv,
            &config.federation.identifiers,
            config.federation.key_bits,
        ));

        // 3. Inbound pipeline
        let key_cache = Arc::new(PublicKeyCache::new(
            registry.clone(),
            Duration::from_secs(config.federation.key_cache_ttl_seconds),
        ));
        let verifier = Arc::new(SignatureVerifier::new(
            key_cache,
            config.federation.signature_max_skew_seconds,
        ));
        let dispatcher = Arc::new(InboxDispatcher::with_default_handlers(SeenActivities::new(
            Duration::from_secs(config.federation.dedup_window_seconds),
            config.federation.dedup_max_entries,
        )));

        // 4. Outbound pipeline
        let delivery = Arc::new(OutboxDelivery::new(
            http_client.clone(),
            key_store.clone(),
            registry.clone(),
            DeliveryPolicy::from_config(&config.delivery),
        ));
        let (delivery_queue, receiver) = DeliveryQueue::new();
        federation::spawn_delivery_worker(delivery, receiver, config.delivery.max_concurrent);

        tracing::info!(
            identifiers = ?config.federation.identifiers,
            base_url = %registry.base_url(),
            "Application state initialized successfully"
        );

        Ok(Self {
            config: Arc::new(config),
            federation: Arc::new(FederationContext::new(registry, key_store)),
            verifier,
            dispatcher,
            delivery_queue,
            http_client,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

/// Spawn the periodic cache maintenance task
///
/// Prunes expired public keys and dedup entries.
pub fn spawn_maintenance_task(state: AppState, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;

            let key_cache = state.verifier.key_cache();
            key_cache.prune_expired().await;
            let stats = key_cache.stats().await;
            tracing::debug!(
                total = stats.total_entries,
                valid = stats.valid_entries,
                "Public key cache"
            );

            let pruned = state.dispatcher.seen().prune_expired().await;
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned expired activity ids");
            }
        }
    })
}

async fn health_check() -> &'static str {
    "OK"
}
