//! Default configuration values

pub struct RealtimeDefaults;

impl RealtimeDefaults {
    pub const LONG_POLL_TIMEOUT_MS: u64 = 110_000;
    pub const WEBSOCKET_CLOSE_TIMEOUT_MS: u64 = 5_000;
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;
    pub const INACTIVE_TIMEOUT_MS: u64 = 5_000;
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
    pub const GROUP_ACK_TIMEOUT_MS: u64 = 5_000;
    pub const APPLICATION_MAX_BUFFER: usize = 64;
    pub const TRANSPORT_MAX_BUFFER: usize = 64;
    pub const REAPING_ENABLED: bool = true;
    pub const BACKPLANE_PREFIX: &'static str = "elif";
}
