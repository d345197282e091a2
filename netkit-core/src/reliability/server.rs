//! Reliable-UDP server component.
//!
//! One UDP socket serves every peer; datagrams are demultiplexed by source
//! endpoint onto per-peer [`ReliabilityEngine`] instances, and each peer is
//! surfaced as an activity-tracked session in the shared [`SessionManager`].

use super::engine::{ReliabilityEngine, ReliableUdpStats};
use super::ReliabilityMode;
use crate::callback::{
    CallbackSlot, ErrorCallback, SessionEventCallback, SessionReceiveCallback,
};
use crate::error::{NetResult, NetworkError};
use crate::lifecycle::Lifecycle;
use crate::session::{Session, SessionManager};
use dashmap::DashMap;
use netkit_config::{ReliabilityConfig, SessionConfig};
use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECV_BUFFER_SIZE: usize = 65_536;

/// A connected reliable-UDP peer registered with the session manager.
pub struct ReliableUdpSession {
    id: String,
    peer: SocketAddr,
    engine: Arc<ReliabilityEngine>,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl ReliableUdpSession {
    fn new(id: String, peer: SocketAddr, engine: Arc<ReliabilityEngine>) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            engine,
            connected: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> ReliableUdpStats {
        self.engine.stats()
    }
}

impl Session for ReliableUdpSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, data: Vec<u8>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::connection_closed(format!(
                "reliable_udp_session:{}",
                self.id
            )));
        }
        self.engine.send(data)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn stop(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.engine.send_fin();
        }
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

struct PeerEntry {
    session_id: String,
    engine: Arc<ReliabilityEngine>,
    session: Arc<ReliableUdpSession>,
}

/// Server endpoint for the reliability layer.
pub struct ReliableUdpServer {
    server_id: String,
    mode: ReliabilityMode,
    config: ReliabilityConfig,
    lifecycle: Lifecycle,
    sessions: Arc<SessionManager>,
    peers: Arc<DashMap<SocketAddr, PeerEntry>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    receive_cb: Arc<CallbackSlot<SessionReceiveCallback>>,
    connect_cb: Arc<CallbackSlot<SessionEventCallback>>,
    disconnect_cb: Arc<CallbackSlot<SessionEventCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl ReliableUdpServer {
    pub fn new(server_id: impl Into<String>, mode: ReliabilityMode) -> Self {
        Self::with_config(
            server_id,
            mode,
            ReliabilityConfig::default(),
            SessionConfig::default(),
        )
    }

    pub fn with_config(
        server_id: impl Into<String>,
        mode: ReliabilityMode,
        config: ReliabilityConfig,
        session_config: SessionConfig,
    ) -> Self {
        let server_id = server_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("reliable_udp_server:{server_id}")),
            server_id,
            mode,
            config,
            sessions: Arc::new(SessionManager::new(session_config)),
            peers: Arc::new(DashMap::new()),
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            receive_cb: Arc::new(CallbackSlot::new()),
            connect_cb: Arc::new(CallbackSlot::new()),
            disconnect_cb: Arc::new(CallbackSlot::new()),
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

        let mut tasks = Vec::new();

        // Receive loop: demux by source endpoint.
        {
            let server = Arc::clone(self);
            let socket = Arc::clone(&socket);
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, from)) => {
                            server.handle_datagram(&buf[..len], from, &socket);
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

        // Retransmission sweeper across all peers.
        if self.mode.is_reliable() {
            let peers = Arc::clone(&self.peers);
            let period = std::time::Duration::from_millis(self.config.retransmission_timeout_ms);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let now = Instant::now();
                    for entry in peers.iter() {
                        entry.engine.retransmit_due(now);
                    }
                }
            }));
        }

        // Idle-session cleanup sweeper.
        {
            let server = Arc::clone(self);
            let period = self.sessions.cleanup_interval();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    server.sessions.cleanup_idle_sessions();
                    server.sweep_retired_peers();
                }
            }));
        }

        *self.socket.lock() = Some(socket);
        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), port, mode = self.mode.as_str(), "started");
        Ok(())
    }

    fn handle_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr, socket: &Arc<UdpSocket>) {
        if !self.peers.contains_key(&from) && !self.admit_peer(from, socket) {
            return;
        }
        let Some(entry) = self.peers.get(&from) else {
            return;
        };
        entry.session.update_activity();
        let finished = entry.engine.handle_datagram(data);
        let session_id = entry.session_id.clone();
        drop(entry);
        if finished {
            self.retire_peer(from, &session_id);
        }
    }

    /// Creates engine, session, and outbound pump for a new peer; false when
    /// admission is denied (the manager counts the rejection).
    fn admit_peer(self: &Arc<Self>, from: SocketAddr, socket: &Arc<UdpSocket>) -> bool {
        let session_id = self.sessions.generate_id(&self.server_id);
        let (engine, mut per_peer_rx) = ReliabilityEngine::new(
            format!("{}:{from}", self.lifecycle.name()),
            self.mode,
            self.config.clone(),
            Arc::new(CallbackSlot::new()),
            self.error_cb.clone(),
        );
        let session = ReliableUdpSession::new(session_id.clone(), from, Arc::clone(&engine));
        if self
            .sessions
            .add(session.clone(), Some(session_id.clone()))
            .is_none()
        {
            debug!(component = %self.lifecycle.name(), peer = %from, "admission denied, datagram dropped");
            return false;
        }

        // Per-peer delivery forwards into the server-level callback with the
        // session id attached.
        {
            let receive_cb = self.receive_cb.clone();
            let session_id = session_id.clone();
            engine.receive_slot().set(Arc::new(move |data: Vec<u8>| {
                if let Some(cb) = receive_cb.get() {
                    cb(&session_id, data);
                }
            }));
        }

        // Outbound pump for this peer; ends when the engine is dropped.
        {
            let socket = Arc::clone(socket);
            tokio::spawn(async move {
                while let Some(packet) = per_peer_rx.recv().await {
                    if socket.send_to(&packet, from).await.is_err() {
                        break;
                    }
                }
            });
        }

        self.peers.insert(
            from,
            PeerEntry {
                session_id: session_id.clone(),
                engine,
                session,
            },
        );
        info!(component = %self.lifecycle.name(), peer = %from, session_id = %session_id, "peer admitted");
        if let Some(cb) = self.connect_cb.get() {
            cb(&session_id);
        }
        true
    }

    fn retire_peer(&self, from: SocketAddr, session_id: &str) {
        if self.peers.remove(&from).is_some() {
            self.sessions.remove(session_id);
            debug!(component = %self.lifecycle.name(), peer = %from, session_id, "peer retired");
            if let Some(cb) = self.disconnect_cb.get() {
                cb(session_id);
            }
        }
    }

    /// Drops peer state whose session was removed by idle cleanup.
    fn sweep_retired_peers(&self) {
        let stale: Vec<(SocketAddr, String)> = self
            .peers
            .iter()
            .filter(|e| !self.sessions.get(&e.session_id).is_valid())
            .map(|e| (*e.key(), e.session_id.clone()))
            .collect();
        for (addr, session_id) in stale {
            if self.peers.remove(&addr).is_some() {
                debug!(component = %self.lifecycle.name(), peer = %addr, "idle peer swept");
                if let Some(cb) = self.disconnect_cb.get() {
                    cb(&session_id);
                }
            }
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

    pub fn mode(&self) -> ReliabilityMode {
        self.mode
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.active_count()
    }

    /// Sends to one session by id.
    pub fn send_to_session(&self, session_id: &str, data: Vec<u8>) -> NetResult<()> {
        self.sessions.get(session_id).send(data)
    }

    /// Copies the payload to every connected session; returns attempts.
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
        self.connect_cb.set(Arc::new(callback));
    }

    pub fn set_disconnection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.disconnect_cb.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }
}

impl Drop for ReliableUdpServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
