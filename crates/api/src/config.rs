//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use liverelay_shared::EventKind;
use liverelay_worker::AdapterConfig;

/// Which Broadcast Channel implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastBackend {
    /// In-process rings; ingestion and gateway share this process
    Memory,
    /// Redis pub/sub; topics are visible to every instance on the same Redis
    Redis,
}

impl FromStr for BroadcastBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BroadcastBackend::Memory),
            "redis" => Ok(BroadcastBackend::Redis),
            other => Err(format!("expected 'memory' or 'redis', got '{}'", other)),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Broadcast channel
    pub broadcast_backend: BroadcastBackend,
    pub redis_url: String,
    pub broadcast_capacity: usize,

    // Ingestion
    pub live_source_url: String,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_max: Duration,
    pub reconnect_max_attempts: u32,
    pub supported_event_kinds: Vec<EventKind>,

    // Overlay gateway
    pub gateway_queue_bound: usize,

    // Billing
    pub billing_webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,
    /// Period of the entitlement sweep; `None` disables it
    pub entitlement_recheck: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            broadcast_backend: BroadcastBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            broadcast_capacity: 1024,
            live_source_url: "ws://localhost:8765/live".to_string(),
            reconnect_backoff_base: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(30),
            reconnect_max_attempts: 8,
            supported_event_kinds: EventKind::ALL.to_vec(),
            gateway_queue_bound: 256,
            billing_webhook_secret: None,
            webhook_tolerance_secs: 300,
            entitlement_recheck: Some(Duration::from_secs(60)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset variables take their defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let reconnect_backoff_base =
            Duration::from_millis(parse_var("RECONNECT_BACKOFF_BASE_MS", 500u64)?);
        let reconnect_backoff_max =
            Duration::from_millis(parse_var("RECONNECT_BACKOFF_MAX_MS", 30_000u64)?);
        if reconnect_backoff_base.is_zero() {
            return Err(ConfigError::invalid(
                "RECONNECT_BACKOFF_BASE_MS",
                "must be greater than zero",
            ));
        }
        if reconnect_backoff_max < reconnect_backoff_base {
            return Err(ConfigError::invalid(
                "RECONNECT_BACKOFF_MAX_MS",
                "must not be smaller than RECONNECT_BACKOFF_BASE_MS",
            ));
        }

        let reconnect_max_attempts = parse_var("RECONNECT_MAX_ATTEMPTS", 8u32)?;
        if reconnect_max_attempts == 0 {
            return Err(ConfigError::invalid(
                "RECONNECT_MAX_ATTEMPTS",
                "must be at least 1",
            ));
        }

        let gateway_queue_bound = parse_var("GATEWAY_QUEUE_BOUND", 256usize)?;
        if gateway_queue_bound == 0 {
            return Err(ConfigError::invalid(
                "GATEWAY_QUEUE_BOUND",
                "must be at least 1",
            ));
        }

        let broadcast_capacity = parse_var("BROADCAST_CAPACITY", 1024usize)?;
        if broadcast_capacity == 0 {
            return Err(ConfigError::invalid(
                "BROADCAST_CAPACITY",
                "must be at least 1",
            ));
        }

        let recheck_secs = parse_var("ENTITLEMENT_RECHECK_SECS", 60u64)?;

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),

            broadcast_backend: parse_var("BROADCAST_BACKEND", BroadcastBackend::Memory)?,
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            broadcast_capacity,

            live_source_url: env::var("LIVE_SOURCE_URL").unwrap_or(defaults.live_source_url),
            reconnect_backoff_base,
            reconnect_backoff_max,
            reconnect_max_attempts,
            supported_event_kinds: parse_event_kinds()?,

            gateway_queue_bound,

            billing_webhook_secret: env::var("BILLING_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            webhook_tolerance_secs: parse_var("WEBHOOK_TOLERANCE_SECS", 300i64)?,
            entitlement_recheck: (recheck_secs > 0).then(|| Duration::from_secs(recheck_secs)),
        })
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            backoff_base: self.reconnect_backoff_base,
            backoff_max: self.reconnect_backoff_max,
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(var, e.to_string())),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::invalid(var, "not valid unicode")),
    }
}

fn parse_event_kinds() -> Result<Vec<EventKind>, ConfigError> {
    const VAR: &str = "SUPPORTED_EVENT_KINDS";

    let raw = match env::var(VAR) {
        Ok(raw) => raw,
        Err(_) => return Ok(EventKind::ALL.to_vec()),
    };

    let mut kinds = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let kind: EventKind = part.parse().map_err(|e: String| ConfigError::invalid(VAR, e))?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }

    if kinds.is_empty() {
        return Err(ConfigError::Missing(VAR));
    }
    Ok(kinds)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            reason: reason.into(),
        }
    }
}
