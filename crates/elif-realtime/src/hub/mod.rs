//! Hub messaging: protocol, connection tracking and client-result correlation

pub mod client_results;
pub mod context;
pub mod default_manager;
pub mod endpoint;
pub mod lifetime_manager;
pub mod membership;
pub mod protocol;

pub use client_results::{ClientResultsManager, InvocationIdGenerator};
pub use context::{fan_out, HubConnectionContext};
pub use default_manager::DefaultHubLifetimeManager;
pub use endpoint::{HubEndpoint, HubInvocationHandler};
pub use lifetime_manager::{HubLifetimeManager, HubLifetimeManagerExt};
pub use membership::MembershipIndex;
pub use protocol::{decode, encode, CompletionMessage, HubMessage, InvocationMessage};
