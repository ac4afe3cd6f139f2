use std::env;
use std::time::Duration;

/// Configuration errors abort startup with exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required but not set")]
    Missing { name: &'static str },
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-wide configuration, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub allowed_origin: Option<String>,

    // Upstream moderator
    pub llm_endpoint: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_timeout: Duration,
    pub llm_max_retries: u32,
    pub llm_concurrency: usize,

    // Lightweight filter
    pub enable_lightweight_filter: bool,
    pub filter_window: Duration,
    pub filter_max_per_window: usize,
    pub pattern_file: Option<String>,

    // Circuit breaker
    pub circuit_failure_ratio: f64,
    pub circuit_min_samples: usize,
    pub circuit_cooldown: Duration,

    // Templates
    pub template_file: Option<String>,

    // Violation store
    pub violation_store_url: Option<String>,
    pub retention_days: i64,

    // Rate-limit backing
    pub redis_url: Option<String>,

    // Sessions
    pub session_queue_size: usize,
    pub session_ping: Duration,

    // Notifications
    pub enable_notifications: bool,
    pub notification_webhook_url: Option<String>,

    // Simulator
    pub simulator_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_or("PORT", 8080)?,
            allowed_origin: env::var("ALLOWED_ORIGIN").ok(),

            llm_endpoint: env::var("LLM_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:8080/v1/chat/completions".to_string()),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "moderation-8b".to_string()),
            llm_timeout: Duration::from_millis(parse_or("LLM_TIMEOUT_MS", 30_000u64)?),
            llm_max_retries: parse_or("LLM_MAX_RETRIES", 3u32)?,
            llm_concurrency: parse_nonzero("LLM_CONCURRENCY", 8)?,

            enable_lightweight_filter: parse_or("ENABLE_LIGHTWEIGHT_FILTER", true)?,
            filter_window: Duration::from_secs(parse_or("FILTER_WINDOW_S", 60u64)?),
            filter_max_per_window: parse_nonzero("FILTER_MAX_PER_WINDOW", 10)?,
            pattern_file: env::var("PATTERN_FILE").ok(),

            circuit_failure_ratio: parse_ratio("CIRCUIT_FAILURE_RATIO", 0.5)?,
            circuit_min_samples: parse_nonzero("CIRCUIT_MIN_SAMPLES", 20)?,
            circuit_cooldown: Duration::from_secs(parse_or("CIRCUIT_COOLDOWN_S", 15u64)?),

            template_file: env::var("TEMPLATE_FILE").ok(),

            violation_store_url: env::var("VIOLATION_STORE_URL").ok(),
            retention_days: parse_or("RETENTION_DAYS", 90i64)?,

            redis_url: env::var("REDIS_URL").ok(),

            session_queue_size: parse_nonzero("SESSION_QUEUE_SIZE", 64)?,
            session_ping: Duration::from_secs(parse_or("SESSION_PING_S", 30u64)?),

            enable_notifications: parse_or("ENABLE_NOTIFICATIONS", false)?,
            notification_webhook_url: env::var("NOTIFICATION_WEBHOOK_URL").ok(),

            simulator_interval: Duration::from_millis(parse_or("SIMULATOR_INTERVAL_MS", 2_000u64)?),
        };

        if config.enable_notifications && config.notification_webhook_url.is_none() {
            return Err(ConfigError::Missing {
                name: "NOTIFICATION_WEBHOOK_URL",
            });
        }

        Ok(config)
    }

    /// Violation store pool size, derived from expected pipeline concurrency.
    pub fn store_pool_size(&self) -> u32 {
        (self.llm_concurrency / 2).max(2) as u32
    }
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_nonzero(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let value: usize = parse_or(name, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_ratio(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let value: f64 = parse_or(name, default)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be within 0.0..=1.0".to_string(),
        });
    }
    Ok(value)
}
