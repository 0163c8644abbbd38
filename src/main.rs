//! Fedicore binary entry point

use std::time::Duration;

use fedicore::{AppState, config, data};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Open the key-value store and build AppState
/// 5. Build Axum router
/// 6. Start background maintenance and the HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("fedicore={},tower_http=debug", config.logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Fedicore...");
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        identifiers = ?config.federation.identifiers,
        "Configuration loaded"
    );

    // 3. Initialize metrics
    fedicore::metrics::init_metrics()?;

    // 4. Initialize application state
    let kv = data::open_kv_store(&config.storage).await?;
    let state = AppState::new(config.clone(), kv)?;

    // 5. Build Axum router
    let app = fedicore::build_router(state.clone());

    // 6. Start background tasks and HTTP server
    let maintenance_every = Duration::from_secs(config.federation.key_cache_ttl_seconds.max(60));
    fedicore::spawn_maintenance_task(state, maintenance_every);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}
