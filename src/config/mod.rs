//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Optional second listener speaking line-delimited JSON over raw TCP
    pub tcp_addr: Option<SocketAddr>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated), any origin when unset
    pub client_origin: Option<String>,

    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Seed for the built-in sandbox world
    pub world_seed: u64,
    /// Connection pool capacity
    pub max_connections: usize,
    /// Outbound byte/s ceiling the bandwidth monitor reports against
    pub bandwidth_budget_bps: u64,
    /// Seconds of snapshots kept by the recording engine
    pub recording_window_secs: u32,
    /// Events kept by the event log before FIFO eviction
    pub event_log_max_size: usize,
    /// Entries kept per state inspector series
    pub inspector_max_history: usize,
    /// Longest one client's send may take before the pool gives up on it
    pub send_timeout: Duration,
    /// Sent snapshots kept as candidate delta bases
    pub baseline_history: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = Self::default();

        let config = Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            tcp_addr: match env::var("RAW_TCP_ADDR") {
                Ok(raw) if !raw.trim().is_empty() => Some(
                    raw.trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidAddress)?,
                ),
                _ => None,
            },

            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            client_origin: env::var("CLIENT_ORIGIN").ok().filter(|s| !s.trim().is_empty()),

            tick_rate: parse_or("TICK_RATE", defaults.tick_rate)?,
            world_seed: parse_or("WORLD_SEED", defaults.world_seed)?,
            max_connections: parse_or("MAX_CONNECTIONS", defaults.max_connections)?,
            bandwidth_budget_bps: parse_or("BANDWIDTH_BUDGET_BPS", defaults.bandwidth_budget_bps)?,
            recording_window_secs: parse_or(
                "RECORDING_WINDOW_SECS",
                defaults.recording_window_secs,
            )?,
            event_log_max_size: parse_or("EVENT_LOG_MAX_SIZE", defaults.event_log_max_size)?,
            inspector_max_history: parse_or(
                "INSPECTOR_MAX_HISTORY",
                defaults.inspector_max_history,
            )?,
            send_timeout: Duration::from_millis(parse_or(
                "SEND_TIMEOUT_MS",
                defaults.send_timeout.as_millis() as u64,
            )?),
            baseline_history: parse_or("BASELINE_HISTORY", defaults.baseline_history)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the tick loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > 240 {
            return Err(ConfigError::Invalid {
                key: "TICK_RATE",
                reason: "must be between 1 and 240".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONNECTIONS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SEND_TIMEOUT_MS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.baseline_history == 0 {
            return Err(ConfigError::Invalid {
                key: "BASELINE_HISTORY",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tcp_addr: None,
            log_level: "info".to_string(),
            client_origin: None,
            tick_rate: 30,
            world_seed: 0x5EED,
            max_connections: 64,
            bandwidth_budget_bps: 100_000,
            recording_window_secs: 30,
            event_log_max_size: 10_000,
            inspector_max_history: 1_000,
            send_timeout: Duration::from_millis(100),
            baseline_history: 64,
        }
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_tick_rate_is_rejected() {
        let config = Config {
            tick_rate: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "TICK_RATE", .. })
        ));
    }

    #[test]
    fn zero_send_timeout_is_rejected() {
        let config = Config {
            send_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "SEND_TIMEOUT_MS", .. })
        ));
    }

    #[test]
    fn malformed_number_is_an_error() {
        // Unique key so parallel tests never race on it
        env::set_var("WSS_TEST_MALFORMED", "thirty");
        let result: Result<u32, _> = parse_or("WSS_TEST_MALFORMED", 30);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        env::remove_var("WSS_TEST_MALFORMED");

        let result: Result<u32, _> = parse_or("WSS_TEST_UNSET", 7);
        assert_eq!(result.unwrap(), 7);
    }
}
