//! Network sources: transports, the per-endpoint connection handler and its retry policy.

pub mod handler;
pub mod reconnect;
pub mod transport;

pub use handler::{ConnectionHandler, HandlerConfig, HandlerStats, HandlerStatsSnapshot};
pub use reconnect::{ConnectionState, RetryPolicy};
pub use transport::{FrameRead, TcpTransport, Transport};
