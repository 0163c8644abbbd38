//! Public Key Caching
//!
//! Caches resolved remote public keys so that a burst of inbound
//! activities from one server does not refetch the key per request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::actor::{ActorPublicKey, ActorRegistry};
use crate::error::AppError;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    key: ActorPublicKey,
    /// When this entry was cached
    cached_at: Instant,
}

/// Public key cache
///
/// Thread-safe cache for remote actor public keys, keyed by key ID.
/// Readers share a read lock; inserts take the write lock briefly.
pub struct PublicKeyCache {
    /// Cache storage: key_id -> cached key
    cache: RwLock<HashMap<String, CachedKey>>,
    registry: Arc<ActorRegistry>,
    ttl: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `registry` - Registry used to resolve keys on miss
    /// * `ttl` - Lifetime of cached keys
    pub fn new(registry: Arc<ActorRegistry>, ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            registry,
            ttl,
        }
    }

    fn is_valid(&self, entry: &CachedKey) -> bool {
        entry.cached_at.elapsed() < self.ttl
    }

    /// Get public key for a key ID
    ///
    /// Checks cache first, resolves from remote if not cached or expired.
    ///
    /// # Errors
    /// `KeyUnresolvable` if the key cannot be fetched
    pub async fn get(&self, key_id: &str) -> Result<ActorPublicKey, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if self.is_valid(cached) {
                    tracing::debug!(key_id = %key_id, "Public key cache hit");
                    CACHE_HITS_TOTAL.with_label_values(&["public_key"]).inc();
                    return Ok(cached.key.clone());
                }
                tracing::debug!(key_id = %key_id, "Public key cache expired");
            }
        }

        CACHE_MISSES_TOTAL.with_label_values(&["public_key"]).inc();
        self.refresh(key_id).await
    }

    /// Resolve the key from remote regardless of cache state
    pub async fn refresh(&self, key_id: &str) -> Result<ActorPublicKey, AppError> {
        tracing::debug!(key_id = %key_id, "Fetching public key");
        let key = self.registry.resolve_public_key(key_id).await?;
        self.insert(key_id, key.clone()).await;
        Ok(key)
    }

    /// Seed or overwrite an entry
    pub async fn insert(&self, key_id: &str, key: ActorPublicKey) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key_id.to_string(),
            CachedKey {
                key,
                cached_at: Instant::now(),
            },
        );
    }

    /// Invalidate a cached key
    ///
    /// Used when verification fails with a cached key, in case it rotated.
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!(key_id = %key_id, "Invalidated public key cache entry");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| self.is_valid(v)).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    ///
    /// Called periodically by the maintenance task.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, v| v.cached_at.elapsed() < ttl);
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}
