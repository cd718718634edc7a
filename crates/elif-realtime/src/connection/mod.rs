//! Logical connections: identity, duplex channels, lifecycle and the registry

#[allow(clippy::module_inception)]
pub mod connection;
pub mod handler;
pub mod pipe;
pub mod registry;
pub mod types;

pub use connection::{
    spawn_shared, Connection, ConnectionMetadata, ConnectionState, SharedTask, TaskFailure,
    TransportOutcome,
};
pub use handler::{
    start_application, ConnectionContext, ConnectionHandler, HeaderUserIdProvider, UserIdProvider,
};
pub use pipe::{DuplexChannel, DuplexSide, Pipe};
pub use registry::{ConnectionRegistry, RegistryEvent, RegistryStats};
pub use types::{ConnectionId, ConnectionStatus, HttpTransports, TransportType};
