//! HTTP transports and request dispatch

pub mod dispatcher;
pub mod long_polling;
pub mod negotiate;
pub mod router;
pub mod sse;
pub mod websocket;

pub use dispatcher::TransportDispatcher;
pub use negotiate::NegotiateResponse;
pub use router::{realtime_router, ConnectionQuery};
