//! Transport layer for device signaling
//!
//! This crate provides the TCP plumbing between the endpoint adapter and its
//! devices: a listener that accepts handset connections and a framed
//! connection type that speaks the line codec in both directions.

pub mod connection;
pub mod error;
pub mod listener;

pub use connection::LineConnection;
pub use error::{Error, Result};
pub use listener::LineListener;

/// Bind a device listener to the specified address
pub async fn bind(addr: std::net::SocketAddr) -> Result<LineListener> {
    LineListener::bind(addr).await
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{bind, Error, LineConnection, LineListener, Result};
    pub use rvoip_line_codec::{Inbound, LineMessage};
}
