pub mod defaults;
pub mod realtime_config;

pub use defaults::*;
pub use realtime_config::*;
