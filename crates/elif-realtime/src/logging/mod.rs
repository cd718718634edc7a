//! Logging setup

pub mod config;

pub use config::{init_logging, log_endpoint_info, LoggingConfig};
