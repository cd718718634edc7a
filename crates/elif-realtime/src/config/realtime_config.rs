//! Realtime endpoint configuration
//!
//! Covers the enabled transports, the long-polling and WebSocket timeouts, the
//! heartbeat reaper and the duplex channel buffer sizes. Values come from
//! [`RealtimeConfig::default`], the generated [`RealtimeConfigBuilder`] or
//! `REALTIME_*` environment variables.

use super::defaults::RealtimeDefaults;
use crate::connection::HttpTransports;
use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn validation_failed<T: Into<String>>(message: T) -> Self {
        ConfigError::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Realtime endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct RealtimeConfig {
    /// Transports clients may negotiate and connect with
    #[builder(default = "HttpTransports::all()", getter)]
    pub transports: HttpTransports,

    /// How long a single long-polling request is held open
    #[builder(default = "Duration::from_millis(110_000)", getter)]
    pub long_poll_timeout: Duration,

    /// How long to wait for the client's close frame after the server closes a WebSocket
    #[builder(default = "Duration::from_millis(5_000)", getter)]
    pub websocket_close_timeout: Duration,

    /// Interval of the heartbeat scan
    #[builder(default = "Duration::from_millis(1_000)", getter)]
    pub heartbeat_interval: Duration,

    /// Idle time after which an inactive connection is reaped
    #[builder(default = "Duration::from_millis(5_000)", getter)]
    pub inactive_timeout: Duration,

    /// Grace period for closing every connection on shutdown
    #[builder(default = "Duration::from_millis(5_000)", getter)]
    pub shutdown_timeout: Duration,

    /// Time to wait for the owning server to acknowledge a remote group change
    #[builder(default = "Duration::from_millis(5_000)", getter)]
    pub group_ack_timeout: Duration,

    /// Messages buffered from the application before writers suspend
    #[builder(default = "64", getter)]
    pub application_max_buffer: usize,

    /// Messages buffered from the transport before writers suspend
    #[builder(default = "64", getter)]
    pub transport_max_buffer: usize,

    /// Reap idle connections; turned off while a debugger is attached
    #[builder(default = "true", getter)]
    pub reaping_enabled: bool,

    /// Prefix for every backplane topic
    #[builder(default = "\"elif\".to_string()", getter)]
    pub backplane_prefix: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            transports: HttpTransports::all(),
            long_poll_timeout: Duration::from_millis(RealtimeDefaults::LONG_POLL_TIMEOUT_MS),
            websocket_close_timeout: Duration::from_millis(
                RealtimeDefaults::WEBSOCKET_CLOSE_TIMEOUT_MS,
            ),
            heartbeat_interval: Duration::from_millis(RealtimeDefaults::HEARTBEAT_INTERVAL_MS),
            inactive_timeout: Duration::from_millis(RealtimeDefaults::INACTIVE_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(RealtimeDefaults::SHUTDOWN_TIMEOUT_MS),
            group_ack_timeout: Duration::from_millis(RealtimeDefaults::GROUP_ACK_TIMEOUT_MS),
            application_max_buffer: RealtimeDefaults::APPLICATION_MAX_BUFFER,
            transport_max_buffer: RealtimeDefaults::TRANSPORT_MAX_BUFFER,
            reaping_enabled: RealtimeDefaults::REAPING_ENABLED,
            backplane_prefix: RealtimeDefaults::BACKPLANE_PREFIX.to_string(),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from `REALTIME_*` environment variables.
    ///
    /// Durations are given in milliseconds, transports as a comma separated
    /// list of transport names.
    pub fn from_env() -> Result<Self, ConfigError> {
        let transports = match env::var("REALTIME_TRANSPORTS") {
            Ok(value) => value.parse::<HttpTransports>().map_err(|_| ConfigError::InvalidValue {
                field: "transports".to_string(),
                value: value.clone(),
                expected: "comma separated list of WebSockets, ServerSentEvents, LongPolling"
                    .to_string(),
            })?,
            Err(_) => HttpTransports::all(),
        };

        let config = RealtimeConfig {
            transports,
            long_poll_timeout: env_millis(
                "REALTIME_LONG_POLL_TIMEOUT_MS",
                "long_poll_timeout",
                RealtimeDefaults::LONG_POLL_TIMEOUT_MS,
            )?,
            websocket_close_timeout: env_millis(
                "REALTIME_WEBSOCKET_CLOSE_TIMEOUT_MS",
                "websocket_close_timeout",
                RealtimeDefaults::WEBSOCKET_CLOSE_TIMEOUT_MS,
            )?,
            heartbeat_interval: env_millis(
                "REALTIME_HEARTBEAT_INTERVAL_MS",
                "heartbeat_interval",
                RealtimeDefaults::HEARTBEAT_INTERVAL_MS,
            )?,
            inactive_timeout: env_millis(
                "REALTIME_INACTIVE_TIMEOUT_MS",
                "inactive_timeout",
                RealtimeDefaults::INACTIVE_TIMEOUT_MS,
            )?,
            shutdown_timeout: env_millis(
                "REALTIME_SHUTDOWN_TIMEOUT_MS",
                "shutdown_timeout",
                RealtimeDefaults::SHUTDOWN_TIMEOUT_MS,
            )?,
            group_ack_timeout: env_millis(
                "REALTIME_GROUP_ACK_TIMEOUT_MS",
                "group_ack_timeout",
                RealtimeDefaults::GROUP_ACK_TIMEOUT_MS,
            )?,
            application_max_buffer: env_parse(
                "REALTIME_APPLICATION_MAX_BUFFER",
                "application_max_buffer",
                RealtimeDefaults::APPLICATION_MAX_BUFFER,
                "number of messages",
            )?,
            transport_max_buffer: env_parse(
                "REALTIME_TRANSPORT_MAX_BUFFER",
                "transport_max_buffer",
                RealtimeDefaults::TRANSPORT_MAX_BUFFER,
                "number of messages",
            )?,
            reaping_enabled: env_parse(
                "REALTIME_REAPING_ENABLED",
                "reaping_enabled",
                RealtimeDefaults::REAPING_ENABLED,
                "true or false",
            )?,
            backplane_prefix: env::var("REALTIME_BACKPLANE_PREFIX")
                .unwrap_or_else(|_| RealtimeDefaults::BACKPLANE_PREFIX.to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transports.is_empty() {
            return Err(ConfigError::validation_failed(
                "At least one transport must be enabled",
            ));
        }

        let timeouts = [
            ("Long polling timeout", self.long_poll_timeout),
            ("WebSocket close timeout", self.websocket_close_timeout),
            ("Heartbeat interval", self.heartbeat_interval),
            ("Inactive timeout", self.inactive_timeout),
            ("Shutdown timeout", self.shutdown_timeout),
            ("Group acknowledgement timeout", self.group_ack_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::validation_failed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.application_max_buffer == 0 || self.transport_max_buffer == 0 {
            return Err(ConfigError::validation_failed(
                "Channel buffer sizes must be greater than 0",
            ));
        }

        if self.backplane_prefix.is_empty() {
            return Err(ConfigError::validation_failed(
                "Backplane prefix must not be empty",
            ));
        }

        Ok(())
    }
}

impl RealtimeConfigBuilder {
    /// Development configuration: short timeouts so stale connections go away quickly
    pub fn development() -> Self {
        RealtimeConfigBuilder::new()
            .long_poll_timeout(Duration::from_secs(30))
            .inactive_timeout(Duration::from_secs(5))
            .backplane_prefix("elif_dev".to_string())
    }

    /// Production configuration with conservative defaults
    pub fn production() -> Self {
        RealtimeConfigBuilder::new()
            .long_poll_timeout(Duration::from_secs(110))
            .inactive_timeout(Duration::from_secs(15))
            .shutdown_timeout(Duration::from_secs(30))
            .application_max_buffer(256)
            .transport_max_buffer(256)
    }

    /// Testing configuration with small buffers and fast timers
    pub fn testing() -> Self {
        RealtimeConfigBuilder::new()
            .long_poll_timeout(Duration::from_millis(500))
            .websocket_close_timeout(Duration::from_millis(200))
            .heartbeat_interval(Duration::from_millis(50))
            .inactive_timeout(Duration::from_millis(200))
            .shutdown_timeout(Duration::from_millis(500))
            .group_ack_timeout(Duration::from_millis(500))
            .application_max_buffer(8)
            .transport_max_buffer(8)
            .backplane_prefix("elif_test".to_string())
    }
}

fn env_millis(key: &str, field: &str, default: u64) -> Result<Duration, ConfigError> {
    env_parse(key, field, default, "number of milliseconds").map(Duration::from_millis)
}

fn env_parse<T: FromStr>(
    key: &str,
    field: &str,
    default: T,
    expected: &str,
) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            value,
            expected: expected.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
