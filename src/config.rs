use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{InboxError, Result};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};
use crate::webhooks::idempotency::{IdempotencyStore, MemoryIdempotencyStore};

/// Main configuration for a webhook inbox deployment
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Delivery processor settings
///
/// The signing secret is never serialized and is redacted from `Debug` output.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboxConfig {
    /// Shared signing secret issued by the provider (e.g. `whsec_...`)
    #[serde(skip)]
    pub secret: Option<SecretString>,

    /// Maximum allowed distance between the signed timestamp and now
    #[serde(default = "default_tolerance_seconds")]
    pub tolerance_seconds: u64,

    /// Total handler invocations per delivery, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Lifetime of `processed`/`unhandled` records
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,

    /// When set and non-empty, only these event types enter the pipeline
    #[serde(default)]
    pub allowed_event_types: Option<Vec<String>>,

    /// Backoff unit: the wait after attempt `n` is `backoff_base * 2^n`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound of the random jitter added to each backoff (0 disables)
    #[serde(default)]
    pub retry_jitter_ms: u64,

    /// Enables atomic claims with this lease length
    #[serde(default)]
    pub claim_ttl_seconds: Option<u64>,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            secret: None,
            tolerance_seconds: default_tolerance_seconds(),
            max_retries: default_max_retries(),
            idempotency_ttl_seconds: default_idempotency_ttl_seconds(),
            allowed_event_types: None,
            backoff_base_ms: default_backoff_base_ms(),
            retry_jitter_ms: 0,
            claim_ttl_seconds: None,
        }
    }
}

impl InboxConfig {
    /// Create a config with the given secret and default settings
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Load processor settings from environment variables
    ///
    /// The secret is read from `WEBHOOK_INBOX_WEBHOOK_SECRET`, `WEBHOOK_SECRET`
    /// or `STRIPE_WEBHOOK_SECRET`, in that order.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overwrite settings whose environment variables are present
    pub fn apply_env(&mut self) {
        if let Some(secret) = get_env_with_prefix("WEBHOOK_SECRET")
            .or_else(|| std::env::var("STRIPE_WEBHOOK_SECRET").ok())
        {
            self.secret = Some(SecretString::from(secret));
        }

        if let Some(tolerance) = parse_env_with_prefix("TOLERANCE_SECONDS") {
            self.tolerance_seconds = tolerance;
        }

        if let Some(retries) = parse_env_with_prefix("MAX_RETRIES") {
            self.max_retries = retries;
        }

        if let Some(ttl) = parse_env_with_prefix("IDEMPOTENCY_TTL_SECONDS") {
            self.idempotency_ttl_seconds = ttl;
        }

        if let Some(types) = get_env_with_prefix("ALLOWED_EVENT_TYPES") {
            let types: Vec<String> = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
            if !types.is_empty() {
                self.allowed_event_types = Some(types);
            }
        }

        if let Some(base) = parse_env_with_prefix("BACKOFF_BASE_MS") {
            self.backoff_base_ms = base;
        }

        if let Some(jitter) = parse_env_with_prefix("RETRY_JITTER_MS") {
            self.retry_jitter_ms = jitter;
        }

        if let Some(claim) = parse_env_with_prefix("CLAIM_TTL_SECONDS") {
            self.claim_ttl_seconds = Some(claim);
        }
    }

    /// Check that the settings can drive a processor
    pub fn validate(&self) -> Result<()> {
        match &self.secret {
            Some(secret) if !secret.expose_secret().is_empty() => {}
            _ => return Err(InboxError::config("webhook signing secret is required")),
        }

        if self.max_retries == 0 {
            return Err(InboxError::config("max_retries must be at least 1"));
        }

        if self.tolerance_seconds == 0 {
            return Err(InboxError::config("tolerance_seconds must be greater than 0"));
        }

        if self.idempotency_ttl_seconds == 0 {
            return Err(InboxError::config("idempotency_ttl_seconds must be greater than 0"));
        }

        if self.claim_ttl_seconds == Some(0) {
            return Err(InboxError::config("claim_ttl_seconds must be greater than 0"));
        }

        Ok(())
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_secs(self.tolerance_seconds)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn claim_ttl(&self) -> Option<Duration> {
        self.claim_ttl_seconds.map(Duration::from_secs)
    }
}

/// Idempotency store backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store (single instance only)
    #[default]
    Memory,
    /// Redis store (requires the `redis` feature)
    #[cfg(feature = "redis")]
    Redis,
}

/// Idempotency store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL (only used for the Redis backend)
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every key (only used for the Redis backend)
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Maximum number of records kept by the in-memory store
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: None,
            max_entries: default_max_entries(),
        }
    }
}

impl StoreConfig {
    /// Load store configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overwrite settings whose environment variables are present
    pub fn apply_env(&mut self) {
        if let Some(backend) = get_env_with_prefix("STORE_BACKEND") {
            self.backend = match backend.to_lowercase().as_str() {
                "redis" => {
                    #[cfg(feature = "redis")]
                    {
                        StoreBackend::Redis
                    }
                    #[cfg(not(feature = "redis"))]
                    {
                        tracing::warn!("Redis store requested but redis feature not enabled, using in-memory");
                        StoreBackend::Memory
                    }
                }
                _ => StoreBackend::Memory,
            };
        }

        if let Some(url) = get_env_with_prefix("REDIS_URL") {
            self.redis_url = Some(url);
        }

        if let Some(prefix) = get_env_with_prefix("STORE_KEY_PREFIX") {
            self.key_prefix = Some(prefix);
        }

        if let Some(max) = parse_env_with_prefix("STORE_MAX_ENTRIES") {
            self.max_entries = max;
        }
    }

    /// Construct the configured store
    pub fn build_store(&self) -> Result<Arc<dyn IdempotencyStore>> {
        match self.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryIdempotencyStore::new(self.max_entries))),
            #[cfg(feature = "redis")]
            StoreBackend::Redis => {
                let url = self
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| InboxError::config("redis_url is required for the redis store"))?;
                let store = crate::webhooks::idempotency::RedisIdempotencyStore::new(url)?;
                let store = match &self.key_prefix {
                    Some(prefix) => store.with_prefix(prefix.clone()),
                    None => store,
                };
                Ok(Arc::new(store))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.config.inbox.secret = Some(secret.into());
        self
    }

    pub fn with_tolerance_seconds(mut self, seconds: u64) -> Self {
        self.config.inbox.tolerance_seconds = seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.inbox.max_retries = max_retries;
        self
    }

    pub fn with_idempotency_ttl_seconds(mut self, seconds: u64) -> Self {
        self.config.inbox.idempotency_ttl_seconds = seconds;
        self
    }

    pub fn with_allowed_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.inbox.allowed_event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_backoff_base_ms(mut self, millis: u64) -> Self {
        self.config.inbox.backoff_base_ms = millis;
        self
    }

    pub fn with_retry_jitter_ms(mut self, millis: u64) -> Self {
        self.config.inbox.retry_jitter_ms = millis;
        self
    }

    /// Enable atomic claims so concurrent deliveries of one event run the handler once
    pub fn with_claim_ttl_seconds(mut self, seconds: u64) -> Self {
        self.config.inbox.claim_ttl_seconds = Some(seconds);
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Load configuration from environment variables with WEBHOOK_INBOX_ prefix
    ///
    /// Values already set on the builder are overwritten only when the
    /// corresponding variable is present.
    pub fn from_env(mut self) -> Self {
        self.config.inbox.apply_env();
        self.config.store.apply_env();

        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No signing secret was provided
    /// - `max_retries` is zero
    /// - Any TTL or tolerance is zero
    /// - The log level is not recognised
    pub fn build(self) -> Result<Config> {
        self.config.inbox.validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(InboxError::config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_tolerance_seconds() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_idempotency_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_entries() -> u64 {
    100_000
}

fn default_log_level() -> String {
    "info".to_string()
}
