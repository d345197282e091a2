//! Plain UDP server component with per-peer logical sessions.

use crate::callback::{
    CallbackSlot, ErrorCallback, SessionEventCallback, SessionReceiveCallback,
};
use crate::error::{NetResult, NetworkError};
use crate::lifecycle::Lifecycle;
use crate::session::{Session, SessionManager};
use dashmap::DashMap;
use netkit_config::SessionConfig;
use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECV_BUFFER_SIZE: usize = 65_536;

/// A logical UDP peer: no connection exists on the wire, but the server
/// tracks the endpoint as a session so admission and idle cleanup apply.
pub struct UdpSession {
    id: String,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl UdpSession {
    fn new(
        id: String,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            outbound,
            connected: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Session for UdpSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, data: Vec<u8>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::connection_closed(format!(
                "udp_session:{}",
                self.id
            )));
        }
        self.outbound.send((self.peer, data)).map_err(|_| {
            NetworkError::connection_closed(format!("udp_session:{}", self.id))
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

    // Datagram peers have no graceful stop; dropping state is enough.
    fn stop_on_clear(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct UdpServer {
    server_id: String,
    lifecycle: Lifecycle,
    sessions: Arc<SessionManager>,
    peers: Arc<DashMap<SocketAddr, String>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    receive_cb: Arc<CallbackSlot<SessionReceiveCallback>>,
    connection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    disconnection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl UdpServer {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self::with_session_config(server_id, SessionConfig::default())
    }

    pub fn with_session_config(
        server_id: impl Into<String>,
        session_config: SessionConfig,
    ) -> Self {
        let server_id = server_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("udp_server:{server_id}")),
            server_id,
            sessions: Arc::new(SessionManager::new(session_config)),
            peers: Arc::new(DashMap::new()),
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            receive_cb: Arc::new(CallbackSlot::new()),
            connection_cb: Arc::new(CallbackSlot::new()),
            disconnection_cb: Arc::new(CallbackSlot::new()),
            error_cb: Arc::new(CallbackSlot::new()),
        }
    }

    pub async fn start(self: &Arc<Self>, port: u16) -> NetResult<()> {
        if port == 0 {
            return Err(NetworkError::invalid_argument(
                self.lifecycle.name(),
                "port must not be zero",
            ));
        }
        self.lifecycle.begin_start_as_server()?;

        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(NetworkError::from_io(self.lifecycle.name(), "bind", e)
                    .with_details(format!("port={port}")));
            }
        };
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();

        let mut tasks = Vec::new();

        // Single writer task serializes socket sends.
        {
            let socket = Arc::clone(&socket);
            tasks.push(tokio::spawn(async move {
                while let Some((peer, data)) = outbound_rx.recv().await {
                    let _ = socket.send_to(&data, peer).await;
                }
            }));
        }

        // Receive/demux loop.
        {
            let server = Arc::clone(self);
            let socket = Arc::clone(&socket);
            let outbound_tx = outbound_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, from)) => {
                            server.handle_datagram(&buf[..len], from, &outbound_tx);
                        }
                        Err(e) => {
                            warn!(component = %server.lifecycle.name(), error = %e, "recv_from failed");
                            if let Some(cb) = server.error_cb.get() {
                                cb(NetworkError::from_io(
                                    server.lifecycle.name().to_string(),
                                    "receive",
                                    e,
                                ));
                            }
                        }
                    }
                }
            }));
        }

        // Idle cleanup sweeper.
        {
            let server = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(server.sessions.cleanup_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    server.sessions.cleanup_idle_sessions();
                    let stale: Vec<(SocketAddr, String)> = server
                        .peers
                        .iter()
                        .filter(|e| !server.sessions.get(e.value()).is_valid())
                        .map(|e| (*e.key(), e.value().clone()))
                        .collect();
                    for (addr, session_id) in stale {
                        if server.peers.remove(&addr).is_some() {
                            debug!(component = %server.lifecycle.name(), peer = %addr, "idle peer swept");
                            if let Some(cb) = server.disconnection_cb.get() {
                                cb(&session_id);
                            }
                        }
                    }
                }
            }));
        }

        *self.socket.lock() = Some(socket);
        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), port, "started");
        Ok(())
    }

    fn handle_datagram(
        self: &Arc<Self>,
        data: &[u8],
        from: SocketAddr,
        outbound: &mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    ) {
        let session_id = match self.peers.get(&from) {
            Some(entry) => entry.value().clone(),
            None => {
                let session_id = self.sessions.generate_id(&self.server_id);
                let session = UdpSession::new(session_id.clone(), from, outbound.clone());
                if self
                    .sessions
                    .add(session, Some(session_id.clone()))
                    .is_none()
                {
                    debug!(component = %self.lifecycle.name(), peer = %from, "admission denied, datagram dropped");
                    return;
                }
                self.peers.insert(from, session_id.clone());
                info!(component = %self.lifecycle.name(), peer = %from, session_id = %session_id, "peer admitted");
                if let Some(cb) = self.connection_cb.get() {
                    cb(&session_id);
                }
                session_id
            }
        };
        self.sessions.get(&session_id).update_activity();
        if let Some(cb) = self.receive_cb.get() {
            cb(&session_id, data.to_vec());
        }
    }

    pub async fn stop(&self) -> NetResult<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        self.sessions.clear_all();
        self.peers.clear();
        *self.socket.lock() = None;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.lifecycle.finish_stop();
        Ok(())
    }

    pub async fn wait_for_stop(&self) {
        self.lifecycle.wait_for_stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.active_count()
    }

    pub fn send_to_session(&self, session_id: &str, data: Vec<u8>) -> NetResult<()> {
        self.sessions.get(session_id).send(data)
    }

    pub fn broadcast(&self, data: &[u8]) -> usize {
        self.sessions.broadcast(data)
    }

    pub fn set_receive_callback(
        &self,
        callback: impl Fn(&str, Vec<u8>) + Send + Sync + 'static,
    ) {
        self.receive_cb.set(Arc::new(callback));
    }

    pub fn set_connection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.connection_cb.set(Arc::new(callback));
    }

    pub fn set_disconnection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.disconnection_cb.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
