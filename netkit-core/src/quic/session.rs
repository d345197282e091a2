//! Server-side QUIC session registered with the session manager.

use super::connection::{QuicConnection, QuicConnectionStats};
use crate::error::{NetResult, NetworkError};
use crate::session::Session;
use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// One connected QUIC peer, as seen by the session manager.
pub struct QuicSession {
    id: String,
    conn: Arc<QuicConnection>,
    peer: SocketAddr,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl QuicSession {
    pub fn new(id: String, conn: Arc<QuicConnection>, peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            conn,
            peer,
            connected: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sends on a specific stream of this session's connection.
    pub fn send_on_stream(&self, stream_id: u64, data: Vec<u8>, fin: bool) -> NetResult<()> {
        self.conn.send_on_stream(stream_id, data, fin)
    }

    pub fn alpn_protocol(&self) -> Option<String> {
        self.conn.alpn_protocol()
    }

    pub fn stats(&self) -> QuicConnectionStats {
        self.conn.stats()
    }

    /// Closes the underlying connection with an application error code.
    pub fn close_with_code(&self, error_code: u64, reason: &str) {
        self.connected.store(false, Ordering::Release);
        self.conn.close(error_code, reason);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

impl Session for QuicSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.conn.is_closed()
    }

    fn send(&self, data: Vec<u8>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::connection_closed(format!(
                "quic_session:{}",
                self.id
            )));
        }
        self.conn.send_default(data)
    }

    fn close(&self) {
        self.close_with_code(0, "closed by server");
    }

    fn stop(&self) {
        self.close_with_code(0, "server shutdown");
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
