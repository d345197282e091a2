//! Server-side TCP session.

use crate::error::{NetResult, NetworkError};
use crate::session::Session;
use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;

/// One accepted TCP (or TLS-over-TCP) peer.
///
/// The write half of the socket is owned by a writer task; `send` enqueues on
/// its channel so it never blocks callers. Dropping the session closes the
/// channel, which ends the writer task and with it the socket.
pub struct TcpSession {
    id: String,
    peer: SocketAddr,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl TcpSession {
    pub fn new(
        id: String,
        peer: SocketAddr,
        writer: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            writer,
            connected: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Session for TcpSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.writer.is_closed()
    }

    fn send(&self, data: Vec<u8>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::connection_closed(format!(
                "tcp_session:{}",
                self.id
            )));
        }
        self.writer.send(data).map_err(|_| {
            NetworkError::connection_closed(format!("tcp_session:{}", self.id))
        })
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn stop(&self) {
        self.close();
    }

    fn last_activity(&self) -> Option<Instant> {
        Some(*self.last_activity.lock())
    }

    fn update_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn has_activity_tracking(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
