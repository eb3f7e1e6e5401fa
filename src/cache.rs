//! Identity cache.
//!
//! Entries are JSON-encoded [`Identity`](crate::user::Identity) snapshots stored under
//! `identity:{email}`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;

use crate::clock::Clock;
use crate::error::Result;

/// Cached identities live for 5 minutes.
pub const IDENTITY_TTL: u64 = 60 * 5;

/// Build the cache key of an email.
pub fn identity_key(email: &str) -> String {
    format!("identity:{email}")
}

/// Key-value cache port.
#[async_trait]
pub trait IdentityCache: Send + Sync {
    /// Get the raw value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store `value` at `key`, without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Make `key` expire after `seconds`.
    async fn expire(&self, key: &str, seconds: u64) -> Result<()>;
}

/// Redis adapter.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis and check the connection.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;

        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        tracing::info!("redis connected");

        Ok(Self { conn })
    }
}

#[async_trait]
impl IdentityCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expire_at: Option<u64>,
}

/// In-process adapter, used when Redis is not configured.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    /// Create a new [`MemoryCache`].
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl IdentityCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();

        let value = match self.entries.get(key) {
            Some(entry) if entry.expire_at.is_none_or(|at| at > now) => {
                return Ok(Some(entry.value.clone()));
            },
            Some(_) => None,
            None => return Ok(None),
        };

        // elapsed entry.
        self.entries.remove(key);
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expire_at: None,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let at = self.clock.now() + seconds;
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expire_at = Some(at);
        }
        Ok(())
    }
}
