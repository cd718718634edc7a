//! Structured logging setup for realtime servers

use crate::config::RealtimeConfig;
use serde_json::{json, Value};
use std::io;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level used when no filter is given (e.g. "info", "debug")
    pub level: String,
    /// JSON structured output instead of text
    pub json_format: bool,
    /// Multi-line human friendly output
    pub pretty_print: bool,
    /// Include file and line number
    pub include_location: bool,
    pub include_timestamp: bool,
    /// Fields logged once at startup
    pub global_fields: serde_json::Map<String, Value>,
    /// Filter directives such as "elif_realtime=debug,axum=info"
    pub env_filter: Option<String>,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            pretty_print: true,
            include_location: false,
            include_timestamp: true,
            global_fields: serde_json::Map::new(),
            env_filter: None,
            service_name: None,
            service_version: None,
        }
    }
}

impl LoggingConfig {
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            pretty_print: false,
            include_location: false,
            include_timestamp: true,
            global_fields: fields("production"),
            env_filter: Some("elif_realtime=info,tower=warn,axum=warn".to_string()),
            service_name: None,
            service_version: None,
        }
    }

    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            pretty_print: true,
            include_location: true,
            include_timestamp: true,
            global_fields: fields("development"),
            env_filter: Some("elif_realtime=debug,axum=debug".to_string()),
            service_name: None,
            service_version: None,
        }
    }

    /// Minimal output for test runs
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            json_format: false,
            pretty_print: false,
            include_location: false,
            include_timestamp: false,
            global_fields: fields("test"),
            env_filter: Some("elif_realtime=error".to_string()),
            service_name: None,
            service_version: None,
        }
    }

    pub fn with_global_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.global_fields.insert(key.into(), value.into());
        self
    }

    pub fn with_service(mut self, name: &str, version: &str) -> Self {
        self.service_name = Some(name.to_string());
        self.service_version = Some(version.to_string());
        self
    }

    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    fn filter_directives(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }

    fn output_layer(&self) -> BoxedLayer {
        let base = fmt::layer()
            .with_writer(io::stdout)
            .with_file(self.include_location)
            .with_line_number(self.include_location);

        match (self.json_format, self.pretty_print, self.include_timestamp) {
            (true, _, true) => Box::new(base.json()),
            (true, _, false) => Box::new(base.json().without_time()),
            (false, true, true) => Box::new(base.pretty()),
            (false, true, false) => Box::new(base.pretty().without_time()),
            (false, false, true) => Box::new(base),
            (false, false, false) => Box::new(base.without_time()),
        }
    }
}

fn fields(env: &str) -> serde_json::Map<String, Value> {
    let mut fields = serde_json::Map::new();
    fields.insert("env".to_string(), json!(env));
    fields
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directives()))?;

    tracing_subscriber::registry()
        .with(config.output_layer())
        .with(filter)
        .try_init()?;

    let mut init_msg = json!({
        "message": "Structured logging initialized",
        "level": config.level,
        "json_format": config.json_format,
    });
    if let Some(name) = &config.service_name {
        init_msg["service_name"] = json!(name);
    }
    if let Some(version) = &config.service_version {
        init_msg["service_version"] = json!(version);
    }
    for (key, value) in config.global_fields {
        init_msg[key] = value;
    }
    tracing::info!(target: "elif_realtime::logging", "{}", init_msg);

    Ok(())
}

/// Log the settings an endpoint is serving with
pub fn log_endpoint_info(path: &str, config: &RealtimeConfig) {
    let info = json!({
        "event": "realtime_endpoint_started",
        "path": path,
        "transports": config.get_transports(),
        "long_poll_timeout_ms": config.get_long_poll_timeout().as_millis() as u64,
        "inactive_timeout_ms": config.get_inactive_timeout().as_millis() as u64,
        "pid": std::process::id(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    tracing::info!(target: "elif_realtime::startup", "{}", info);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let production = LoggingConfig::production();
        assert!(production.json_format);
        assert_eq!(production.global_fields.get("env"), Some(&json!("production")));

        let development = LoggingConfig::development();
        assert!(development.pretty_print);
        assert!(development.include_location);

        let test = LoggingConfig::test();
        assert_eq!(test.filter_directives(), "elif_realtime=error");
    }

    #[test]
    fn test_builder_methods() {
        let config = LoggingConfig::default()
            .with_service("chat", "1.2.3")
            .with_global_field("region", "eu-west-1")
            .with_env_filter("elif_realtime=trace");

        assert_eq!(config.service_name.as_deref(), Some("chat"));
        assert_eq!(config.global_fields.get("region"), Some(&json!("eu-west-1")));
        assert_eq!(config.filter_directives(), "elif_realtime=trace");
    }

    #[test]
    fn test_level_is_fallback_filter() {
        let config = LoggingConfig::default();
        assert_eq!(config.filter_directives(), "info");
    }
}
