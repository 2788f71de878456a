/// Environment variable prefix used by the inbox.
pub const ENV_PREFIX: &str = "WEBHOOK_INBOX_";

/// Get environment variable with WEBHOOK_INBOX_ prefix, falling back to unprefixed version
///
/// This helper checks for `WEBHOOK_INBOX_{key}` first, then falls back to `{key}`
/// so deployments can share variables such as `REDIS_URL` with other services.
///
/// # Examples
///
/// ```rust
/// use webhook_inbox::utils::get_env_with_prefix;
///
/// // Checks WEBHOOK_INBOX_MAX_RETRIES first, then MAX_RETRIES
/// let retries = get_env_with_prefix("MAX_RETRIES");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse an environment variable, ignoring values that fail to parse
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}
