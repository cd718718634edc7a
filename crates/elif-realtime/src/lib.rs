//! # elif-realtime
//!
//! Realtime connection layer for the elif.rs framework.
//!
//! This crate provides:
//! - A connection registry with a heartbeat that reaps idle connections
//! - WebSocket, Server-Sent Events and long-polling transports behind one
//!   negotiate/connect/send/terminate endpoint
//! - Hub messaging with groups, users and client-result invocations
//! - Scale-out over a publish/subscribe backplane

pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod logging;
pub mod scaleout;
pub mod transport;

pub use config::{ConfigError, RealtimeConfig, RealtimeConfigBuilder, RealtimeDefaults};
pub use connection::{
    Connection, ConnectionContext, ConnectionHandler, ConnectionId, ConnectionRegistry,
    ConnectionStatus, HttpTransports, TransportType,
};
pub use error::{RealtimeError, RealtimeResult};
pub use hub::{
    CompletionMessage, DefaultHubLifetimeManager, HubEndpoint, HubInvocationHandler,
    HubLifetimeManager, HubLifetimeManagerExt, HubMessage, InvocationMessage,
};
pub use logging::{init_logging, LoggingConfig};
pub use scaleout::{Backplane, BackplaneHubLifetimeManager, MemoryBackplane};
pub use transport::{realtime_router, NegotiateResponse, TransportDispatcher};
