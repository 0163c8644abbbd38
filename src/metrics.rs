//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_activitypub_activities_sent_total", "Total number of ActivityPub activities sent"),
        &["activity_type", "result"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_delivery_attempts_total", "Total number of outbound delivery attempts"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "fedicore_delivery_queue_depth",
        "Deliveries enqueued but not yet finished"
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedicore_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Call once at startup; registering twice fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()))?;
    REGISTRY.register(Box::new(ACTIVITYPUB_ACTIVITIES_SENT.clone()))?;
    REGISTRY.register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DELIVERY_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;

    tracing::info!("Metrics registry initialized");
    Ok(())
}
