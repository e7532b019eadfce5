use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. `None` runs the engine on the in-memory store.
    pub database_url: Option<String>,
    pub resend_api_key: String,
    pub resend_api_url: String,
    pub email_from: String,
    pub unsubscribe_base_url: String,
    pub port: u16,
    pub rust_log: String,
    pub dispatch: DispatchConfig,
    pub list_default_limit: i64,
    pub list_max_limit: i64,
}

/// Dispatch worker tuning. All values are deployment parameters.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub claim_lease: Duration,
    /// Rows due within this horizon are handed to the provider's own scheduler.
    /// Zero disables hand-off.
    pub schedule_ahead: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(1000),
            batch_size: 50,
            claim_lease: Duration::from_secs(300),
            schedule_ahead: Duration::ZERO,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(3600),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            enabled: parse_env("DISPATCH_ENABLED", defaults.enabled)?,
            poll_interval: Duration::from_millis(parse_env("DISPATCH_POLL_INTERVAL_MS", 1000)?),
            batch_size: parse_env("DISPATCH_BATCH_SIZE", defaults.batch_size)?,
            claim_lease: Duration::from_secs(parse_env("DISPATCH_CLAIM_LEASE_SECS", 300)?),
            schedule_ahead: Duration::from_secs(
                60 * parse_env::<u64>("PROVIDER_SCHEDULE_AHEAD_MINUTES", 0)?,
            ),
            retry_max_attempts: parse_env("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_base_delay: Duration::from_secs(parse_env("RETRY_BASE_DELAY_SECS", 60)?),
            retry_max_delay: Duration::from_secs(parse_env("RETRY_MAX_DELAY_SECS", 3600)?),
        };

        if dispatch.batch_size <= 0 {
            anyhow::bail!("DISPATCH_BATCH_SIZE must be positive");
        }

        let list_default_limit = parse_env("LIST_DEFAULT_LIMIT", 50)?;
        let list_max_limit = parse_env("LIST_MAX_LIMIT", 500)?;
        if list_default_limit <= 0 || list_default_limit > list_max_limit {
            anyhow::bail!("LIST_DEFAULT_LIMIT must be between 1 and LIST_MAX_LIMIT");
        }

        Ok(Config {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            resend_api_key: require_env("RESEND_API_KEY")?,
            resend_api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            email_from: require_env("EMAIL_FROM")?,
            unsubscribe_base_url: std::env::var("UNSUBSCRIBE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000/unsubscribe".to_string()),
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            dispatch,
            list_default_limit,
            list_max_limit,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value: {raw}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Config {
            database_url: None,
            resend_api_key: "re_test".to_string(),
            resend_api_url: "http://127.0.0.1:9".to_string(),
            email_from: "Coach <coach@example.com>".to_string(),
            unsubscribe_base_url: "https://app.example.com/unsubscribe".to_string(),
            port: 0,
            rust_log: "debug".to_string(),
            dispatch: DispatchConfig::default(),
            list_default_limit: 50,
            list_max_limit: 500,
        }
    }
}
