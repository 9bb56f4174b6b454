//! Media paths between the adapter and a device
//!
//! The adapter does not transcode. It moves raw frames of the negotiated
//! codec between the device's media address and the session runtime.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Largest datagram accepted from a device
const MAX_DATAGRAM: usize = 2048;

/// Comfort-noise payload returned when no audio is available
pub const CNG_PAYLOAD: [u8; 2] = [65, 0];

/// Negotiated codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecDescriptor {
    pub name: String,
    pub sample_rate: u32,
    pub frame_ms: u32,
}

impl Default for CodecDescriptor {
    fn default() -> Self {
        Self {
            name: "L16".to_string(),
            sample_rate: 8000,
            frame_ms: 20,
        }
    }
}

impl CodecDescriptor {
    pub fn new(name: impl Into<String>, sample_rate: u32, frame_ms: u32) -> Self {
        Self {
            name: name.into(),
            sample_rate,
            frame_ms,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_ms.max(1)))
    }

    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn is_linear(&self) -> bool {
        self.name.eq_ignore_ascii_case("L16")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Voice,
    /// Control frame standing in for silence
    ComfortNoise,
}

/// One frame of audio exchanged with the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub kind: FrameKind,
    pub sample_rate: u32,
}

impl Frame {
    pub fn voice(data: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            kind: FrameKind::Voice,
            sample_rate,
        }
    }

    pub fn comfort_noise(sample_rate: u32) -> Self {
        Self {
            data: Bytes::from_static(&CNG_PAYLOAD),
            kind: FrameKind::ComfortNoise,
            sample_rate,
        }
    }

    pub fn is_comfort_noise(&self) -> bool {
        self.kind == FrameKind::ComfortNoise
    }
}

/// Bidirectional raw media channel to one device
///
/// Both directions take `&self` so a reader blocked in `recv` never holds up
/// a writer.
#[async_trait]
pub trait MediaPath: Send + Sync {
    /// Next chunk of media from the device
    async fn recv(&self) -> io::Result<Bytes>;

    /// Send media to the device, returning the number of bytes written
    async fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Address the device should send media to
    fn local_addr(&self) -> SocketAddr;
}

/// Opens media paths once a device has negotiated its media address
#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn open(
        &self,
        bind: IpAddr,
        remote: SocketAddr,
        codec: &CodecDescriptor,
    ) -> io::Result<Arc<dyn MediaPath>>;
}

/// Raw frames over UDP
pub struct UdpMediaPath {
    socket: UdpSocket,
    remote: SocketAddr,
    local: SocketAddr,
}

impl UdpMediaPath {
    pub async fn bind(bind: IpAddr, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(bind, 0)).await?;
        let local = socket.local_addr()?;
        debug!("Media path {} <-> {}", local, remote);
        Ok(Self {
            socket,
            remote,
            local,
        })
    }
}

#[async_trait]
impl MediaPath for UdpMediaPath {
    async fn recv(&self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            if from.ip() == self.remote.ip() {
                buf.truncate(n);
                return Ok(Bytes::from(buf));
            }
            debug!("Dropping {} media bytes from unexpected peer {}", n, from);
        }
    }

    async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, self.remote).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpMediaConnector;

#[async_trait]
impl MediaConnector for UdpMediaConnector {
    async fn open(
        &self,
        bind: IpAddr,
        remote: SocketAddr,
        codec: &CodecDescriptor,
    ) -> io::Result<Arc<dyn MediaPath>> {
        debug!("Opening {} media path to {}", codec.name, remote);
        Ok(Arc::new(UdpMediaPath::bind(bind, remote).await?))
    }
}

/// In-process media path backed by channels
///
/// Created in pairs with a [`MemoryMediaPeer`] that plays the device side.
pub struct MemoryMediaPath {
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
    local: SocketAddr,
    /// Cap on bytes accepted per send, to exercise short writes
    write_limit: Option<usize>,
}

/// Device side of a [`MemoryMediaPath`]
pub struct MemoryMediaPeer {
    pub to_adapter: mpsc::Sender<Bytes>,
    pub from_adapter: mpsc::Receiver<Bytes>,
}

impl MemoryMediaPath {
    pub fn pair(local: SocketAddr) -> (Self, MemoryMediaPeer) {
        let (to_adapter, inbound) = mpsc::channel(64);
        let (outbound, from_adapter) = mpsc::channel(64);
        (
            Self {
                inbound: Mutex::new(inbound),
                outbound,
                local,
                write_limit: None,
            },
            MemoryMediaPeer {
                to_adapter,
                from_adapter,
            },
        )
    }

    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }
}

#[async_trait]
impl MediaPath for MemoryMediaPath {
    async fn recv(&self) -> io::Result<Bytes> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "media peer gone"))
    }

    async fn send(&self, data: &[u8]) -> io::Result<usize> {
        let n = self.write_limit.map_or(data.len(), |limit| data.len().min(limit));
        self.outbound
            .send(Bytes::copy_from_slice(&data[..n]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "media peer gone"))?;
        Ok(n)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_frame_geometry() {
        let codec = CodecDescriptor::default();
        assert_eq!(codec.frame_duration(), Duration::from_millis(20));
        assert_eq!(codec.samples_per_frame(), 160);
        assert!(codec.is_linear());
        assert!(!CodecDescriptor::new("PCMU", 8000, 20).is_linear());
    }

    #[tokio::test]
    async fn test_udp_path_exchanges_datagrams() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let path = UdpMediaPath::bind("127.0.0.1".parse().unwrap(), device.local_addr().unwrap())
            .await
            .unwrap();

        assert_eq!(path.send(&[1, 2, 3, 4]).await.unwrap(), 4);
        let mut buf = [0u8; 16];
        let (n, from) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);
        assert_eq!(from, path.local_addr());

        device.send_to(&[9, 9], path.local_addr()).await.unwrap();
        assert_eq!(path.recv().await.unwrap(), Bytes::from_static(&[9, 9]));
    }

    #[tokio::test]
    async fn test_memory_path_short_write() {
        let (path, mut peer) = MemoryMediaPath::pair("127.0.0.1:4000".parse().unwrap());
        let path = path.with_write_limit(2);
        assert_eq!(path.send(&[1, 2, 3]).await.unwrap(), 2);
        assert_eq!(peer.from_adapter.recv().await.unwrap(), Bytes::from_static(&[1, 2]));
    }
}
