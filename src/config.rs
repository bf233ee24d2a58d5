//! Application configuration
//!
//! Centralized configuration management with environment variable support
//! and sensible defaults.

use std::env;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Pipeline tuning (retry bounds, delays, simulated failure rate)
    pub pipeline: PipelineConfig,
    /// Event stream configuration
    pub events: EventsConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host address to bind to
    pub host: String,
}

/// Pipeline tuning knobs
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum payment execution attempts (including the first)
    pub payment_attempts: u32,
    /// Base delay for the payment exponential backoff, in milliseconds
    pub payment_backoff_base_ms: u64,
    /// Hard execution timeout per payment attempt, in milliseconds
    pub payment_timeout_ms: u64,
    /// Delay before the notification job runs, so it logically follows
    /// shipping, in milliseconds
    pub notification_delay_ms: u64,
    /// Simulated payment decline rate, percent 0-100
    pub payment_decline_rate: u8,
    /// Interval for the scheduled analytics report, in seconds
    pub report_interval_secs: u64,
}

/// Event stream configuration
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Keep-alive heartbeat interval for SSE connections, in seconds
    pub heartbeat_secs: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                port: env_parse("PORT", 3000),
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            },
            pipeline: PipelineConfig {
                payment_attempts: env_parse("PAYMENT_MAX_ATTEMPTS", 3),
                payment_backoff_base_ms: env_parse("PAYMENT_BACKOFF_BASE_MS", 1_000),
                payment_timeout_ms: env_parse("PAYMENT_TIMEOUT_MS", 5_000),
                notification_delay_ms: env_parse("NOTIFICATION_DELAY_MS", 2_000),
                payment_decline_rate: env_parse::<u8>("PAYMENT_DECLINE_RATE", 30).min(100),
                report_interval_secs: env_parse("REPORT_INTERVAL_SECS", 30),
            },
            events: EventsConfig {
                heartbeat_secs: env_parse("EVENTS_HEARTBEAT_SECS", 15),
            },
        }
    }

    /// Get the server address as a string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults only; does not consult the environment
        Self {
            server: ServerConfig {
                port: 3000,
                host: "0.0.0.0".to_string(),
            },
            pipeline: PipelineConfig {
                payment_attempts: 3,
                payment_backoff_base_ms: 1_000,
                payment_timeout_ms: 5_000,
                notification_delay_ms: 2_000,
                payment_decline_rate: 30,
                report_interval_secs: 30,
            },
            events: EventsConfig { heartbeat_secs: 15 },
        }
    }
}
