//! Scale-out across servers: backplane contract, in-memory backplane and the
//! backplane-backed hub lifetime manager

pub mod backplane;
pub mod manager;
pub mod memory;
pub mod messages;
pub mod topics;

pub use backplane::{Backplane, BackplaneHandler, Subscription};
pub use manager::BackplaneHubLifetimeManager;
pub use memory::MemoryBackplane;
pub use topics::Topics;
