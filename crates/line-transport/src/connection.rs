//! Framed device connection

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use rvoip_line_codec::{Inbound, LineCodec, LineMessage};

use crate::error::{Error, Result};

/// One persistent connection to one device
///
/// Read state lives inside the framed reader, so a `recv` future dropped by
/// `select!` loses no bytes; the partial frame is kept for the next call.
pub struct LineConnection {
    framed: Framed<TcpStream, LineCodec>,
    peer: SocketAddr,
    local: SocketAddr,
}

impl LineConnection {
    /// Wrap an already established stream
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, LineCodec::new()),
            peer,
            local,
        })
    }

    /// Dial a companion process
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        debug!("Connecting to device endpoint {}", addr);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout(addr))??;
        Self::new(stream)
    }

    /// Next inbound frame
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<Inbound>> {
        match self.framed.next().await {
            Some(Ok(inbound)) => {
                if let Inbound::Message(ref msg) = inbound {
                    trace!("Received {} from {}", msg.id().name(), self.peer);
                }
                Ok(Some(inbound))
            }
            Some(Err(e)) => Err(Error::from_decode(e)),
            None => Ok(None),
        }
    }

    /// Next inbound frame, giving up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Inbound>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// Encode and flush one message
    pub async fn send(&mut self, message: LineMessage) -> Result<()> {
        trace!("Sending {} to {}", message.id().name(), self.peer);
        self.framed.send(message).await.map_err(Error::from_encode)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Flush pending output and close the write half
    pub async fn close(mut self) -> Result<()> {
        SinkExt::<LineMessage>::close(&mut self.framed)
            .await
            .map_err(Error::from_encode)?;
        debug!("Closed connection to {}", self.peer);
        Ok(())
    }
}

impl fmt::Debug for LineConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LineConnection({} -> {})", self.local, self.peer)
    }
}
