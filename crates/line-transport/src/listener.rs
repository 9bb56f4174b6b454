//! Device listener

use std::fmt;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::connection::LineConnection;
use crate::error::Result;

/// Accepts device connections on one address
pub struct LineListener {
    inner: TcpListener,
    local: SocketAddr,
}

impl LineListener {
    /// Creates a new listener bound to the specified address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let local = inner.local_addr()?;
        info!("Device listener bound to {}", local);
        Ok(Self { inner, local })
    }

    /// Wait for the next device connection
    pub async fn accept(&self) -> Result<LineConnection> {
        let (stream, peer) = self.inner.accept().await?;
        debug!("Accepted device connection from {}", peer);
        LineConnection::new(stream)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl fmt::Debug for LineListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LineListener({})", self.local)
    }
}
