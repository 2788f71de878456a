//! Idempotency records for delivered events.
//!
//! Records live under `webhook:<event id>` and hold one of the
//! [`IdempotencyStatus`] wire strings. Every record carries its own TTL; once
//! it lapses a replay of the same event is treated as new.

use crate::error::Result;
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

#[cfg(feature = "redis")]
use crate::error::InboxError;

/// Status stored against an idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdempotencyStatus {
    /// A handler completed successfully.
    Processed,
    /// No handler was registered for the event type.
    Unhandled,
    /// A delivery holds the claim and is running the handler.
    Processing,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Unhandled => "unhandled",
            Self::Processing => "processing",
        }
    }

    /// Whether a later delivery of the same event must be skipped
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Unhandled)
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Self::Processed),
            "unhandled" => Ok(Self::Unhandled),
            "processing" => Ok(Self::Processing),
            other => Err(format!("unknown idempotency status: {}", other)),
        }
    }
}

/// Key/value store with per-entry expiry used to deduplicate deliveries
///
/// Implementations must never return an entry whose TTL has elapsed.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Read a record, `None` when missing or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a record, replacing any existing value and TTL
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Write a record only if none exists
    ///
    /// Returns `true` when this call created the record. Must be atomic with
    /// respect to concurrent callers.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove a record if present
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if the store is reachable
    fn is_healthy(&self) -> bool {
        true
    }
}

#[derive(Clone)]
struct StoredValue {
    value: String,
    ttl: Duration,
}

struct RecordExpiry;

impl Expiry<String, StoredValue> for RecordExpiry {
    fn expire_after_create(&self, _key: &String, value: &StoredValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_read(
        &self,
        _key: &String,
        _value: &StoredValue,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        // Reads never extend a record
        duration_until_expiry
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Process-local idempotency store backed by moka
///
/// Expired records are never returned and are evicted lazily. Capacity is
/// bounded by `max_entries`; under pressure moka may evict live records early,
/// which can let a duplicate through, so size it above the expected number of
/// events per TTL window.
///
/// Only suitable for a single process. Multi-instance deployments need a
/// shared store such as [`RedisIdempotencyStore`].
#[derive(Clone)]
pub struct MemoryIdempotencyStore {
    inner: MokaCache<String, StoredValue>,
}

impl MemoryIdempotencyStore {
    /// Create a store holding at most `max_entries` records
    pub fn new(max_entries: u64) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(RecordExpiry)
            .build();

        Self { inner: cache }
    }

    /// Run pending maintenance tasks (eviction, expiration)
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Get the current number of records
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.get(key).await.map(|stored| stored.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let stored = StoredValue {
            value: value.to_string(),
            ttl,
        };
        self.inner.insert(key.to_string(), stored).await;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let stored = StoredValue {
            value: value.to_string(),
            ttl,
        };
        let entry = self.inner.entry(key.to_string()).or_insert(stored).await;
        Ok(entry.is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await;
        Ok(())
    }
}

/// Redis-backed idempotency store shared across instances
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    client: redis::Client,
    prefix: Option<String>,
}

#[cfg(feature = "redis")]
impl RedisIdempotencyStore {
    /// Create a new store from a connection URL
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| InboxError::store(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self { client, prefix: None })
    }

    /// Namespace every key, e.g. per environment
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key.to_string(),
        }
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| InboxError::store(format!("Failed to get Redis connection: {}", e)))
    }
}

// `EX 0` is rejected by Redis
#[cfg(feature = "redis")]
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[cfg(feature = "redis")]
#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;

        redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| InboxError::store(format!("Redis GET failed: {}", e)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.get_connection().await?;

        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| InboxError::store(format!("Redis SET failed: {}", e)))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_connection().await?;

        // Nil reply when the key already exists
        let reply = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| InboxError::store(format!("Redis SET NX failed: {}", e)))?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;

        redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| InboxError::store(format!("Redis DEL failed: {}", e)))
    }

    fn is_healthy(&self) -> bool {
        self.client.get_connection().is_ok()
    }
}
