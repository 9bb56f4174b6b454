//! Shared device listener
//!
//! Handset devices all connect to one listening address. Every accepted
//! connection is screened on its own task: the first frame must be a
//! registration naming a configured slot, and the connection is then handed
//! to that slot's signaling loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rvoip_line_codec::{Inbound, LineMessage};
use rvoip_line_transport::{LineConnection, LineListener};

use crate::registry::SlotId;
use crate::signaling::PendingConnection;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where screened connections go, by device id
pub type AttachRoutes = HashMap<SlotId, mpsc::Sender<PendingConnection>>;

pub struct Acceptor {
    listener: LineListener,
    routes: Arc<AttachRoutes>,
    registration_timeout: Duration,
    cancel: CancellationToken,
}

impl Acceptor {
    pub fn new(
        listener: LineListener,
        routes: AttachRoutes,
        registration_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listener,
            routes: Arc::new(routes),
            registration_timeout,
            cancel,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled
    pub async fn run(self) {
        info!("Accepting devices on {}", self.listener.local_addr());
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    let routes = Arc::clone(&self.routes);
                    let timeout = self.registration_timeout;
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = screen(conn, routes, timeout) => {}
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept device connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!("Device listener on {} stopped", self.listener.local_addr());
    }
}

/// Wait for the registration frame and route the connection by device id
async fn screen(mut conn: LineConnection, routes: Arc<AttachRoutes>, timeout: Duration) {
    let peer = conn.peer_addr();
    let first = match conn.recv_timeout(timeout).await {
        Ok(Some(first)) => first,
        Ok(None) => {
            debug!("{} closed before registering", peer);
            return;
        }
        Err(e) => {
            warn!("No registration from {}: {}", peer, e);
            return;
        }
    };

    match first {
        Inbound::Message(LineMessage::Register {
            device_id,
            device_name,
            capabilities,
        }) => {
            let Some(route) = routes.get(&device_id) else {
                warn!("Rejecting unknown device {} ({}) from {}", device_id, device_name, peer);
                reject(conn, format!("unknown device {}", device_id)).await;
                return;
            };
            debug!("Routing device {} from {}", device_id, peer);
            let pending = PendingConnection {
                conn,
                device_id,
                device_name,
                capabilities,
            };
            if let Err(mpsc::error::SendError(pending)) = route.send(pending).await {
                warn!("Interface for device {} is not running", device_id);
                reject(pending.conn, "interface not running".to_string()).await;
            }
        }
        Inbound::Message(other) => {
            warn!("Expected registration from {}, got {}", peer, other.id().name());
            reject(conn, "registration required".to_string()).await;
        }
        Inbound::Malformed(e) => {
            warn!("Malformed registration from {}: {}", peer, e);
            reject(conn, "malformed registration".to_string()).await;
        }
    }
}

async fn reject(mut conn: LineConnection, reason: String) {
    if let Err(e) = conn.send(LineMessage::RegisterReject { reason }).await {
        debug!("Could not reject {}: {}", conn.peer_addr(), e);
        return;
    }
    let _ = conn.close().await;
}
