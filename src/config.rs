//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8000)
    pub port: u16,
    /// Public domain, optionally with port (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Locally hosted actor identifiers
    pub identifiers: Vec<String>,
    /// Display name of hosted actors
    pub display_name: String,
    /// Bio of hosted actors
    pub summary: String,
    /// RSA modulus size for generated key pairs
    pub key_bits: usize,
    /// Accepted clock skew for signed requests, in seconds
    pub signature_max_skew_seconds: i64,
    /// Lifetime of cached remote public keys, in seconds
    pub key_cache_ttl_seconds: u64,
    /// How long a seen activity id suppresses redelivery, in seconds
    pub dedup_window_seconds: u64,
    /// Maximum number of remembered activity ids
    pub dedup_max_entries: usize,
    /// Permit fetching from and delivering to loopback/private addresses
    pub allow_private_networks: bool,
    /// Timeout for remote document fetches, in seconds
    pub fetch_timeout_seconds: u64,
    /// User-Agent sent on outbound requests
    pub user_agent: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            identifiers: vec!["me".to_string()],
            display_name: "Me".to_string(),
            summary: "This is me!".to_string(),
            key_bits: 2048,
            signature_max_skew_seconds: 300,
            key_cache_ttl_seconds: 600,
            dedup_window_seconds: 3600,
            dedup_max_entries: 10_000,
            allow_private_networks: false,
            fetch_timeout_seconds: 10,
            user_agent: format!("Fedicore/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per delivery, including the first one
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff, in milliseconds
    pub max_delay_ms: u64,
    /// Concurrent outbound deliveries
    pub max_concurrent: usize,
    /// Per-request timeout, in seconds
    pub timeout_seconds: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_concurrent: 10,
            timeout_seconds: 30,
        }
    }
}

/// Key-value storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite key-value file
    pub kv_path: PathBuf,
    /// Keep everything in memory (lost on restart)
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kv_path: PathBuf::from("data/kv.db"),
            in_memory: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDICORE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("server.domain", "localhost:8000")?
            .set_default("server.protocol", "http")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDICORE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("federation.identifiers")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Parsed base URL of the instance
    pub fn base_url(&self) -> Result<url::Url, crate::error::AppError> {
        url::Url::parse(&self.server.base_url()).map_err(|e| {
            crate::error::AppError::Config(format!(
                "server.domain/server.protocol do not form a valid URL: {}",
                e
            ))
        })
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(
                "server.protocol must be http or https".to_string(),
            ));
        }

        let base = self.base_url()?;
        if base.host_str().is_none() || base.path() != "/" {
            return Err(AppError::Config(
                "server.domain must be a bare host[:port]".to_string(),
            ));
        }

        if !is_local_server_domain(&self.server.domain)
            && !self.server.protocol.eq_ignore_ascii_case("https")
        {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.identifiers.is_empty() {
            return Err(AppError::Config(
                "federation.identifiers must name at least one actor".to_string(),
            ));
        }

        if let Some(bad) = self
            .federation
            .identifiers
            .iter()
            .find(|id| !is_valid_identifier(id))
        {
            return Err(AppError::Config(format!(
                "federation.identifiers contains an invalid identifier: {:?}",
                bad
            )));
        }

        if self.federation.key_bits < 1024 {
            return Err(AppError::Config(
                "federation.key_bits must be at least 1024".to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if !is_local_server_domain(&self.server.domain) && self.federation.allow_private_networks {
            tracing::warn!(
                domain = %self.server.domain,
                "federation.allow_private_networks is enabled on a public instance"
            );
        }

        Ok(())
    }
}

/// Identifiers appear verbatim in URL paths.
fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
