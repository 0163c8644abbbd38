//! Data layer module
//!
//! Handles persistence for the federation core:
//! - Key-value store trait
//! - In-memory backend (volatile)
//! - SQLite backend

mod kv;

use std::sync::Arc;

pub use kv::{KvStore, MemoryKvStore, SqliteKvStore};

use crate::config::StorageConfig;
use crate::error::AppError;

/// Open the configured key-value backend
pub async fn open_kv_store(config: &StorageConfig) -> Result<Arc<dyn KvStore>, AppError> {
    if config.in_memory {
        tracing::warn!("Using in-memory key-value store; key pairs are lost on restart");
        return Ok(Arc::new(MemoryKvStore::new()));
    }

    Ok(Arc::new(SqliteKvStore::connect(&config.kv_path).await?))
}
