//! QUIC server component.
//!
//! One UDP socket serves every connection. Ingress demultiplexes on the
//! destination connection id extracted without decryption; unknown CIDs are
//! only admitted through a well-formed Initial, optionally after a stateless
//! Retry round-trip. Each admitted connection is registered with the shared
//! session manager as a [`QuicSession`].

use super::cid::ConnectionId;
use super::connection::{ConnEvent, ConnectionParams, QuicConnection};
use super::packet::{
    extract_dcid, Header, LongPacketType, ParsedHeader, QUIC_VERSION_1, RetryPacket,
    VersionNegotiation,
};
use super::retry::{RetryTokenIssuer, DEFAULT_TOKEN_WINDOW};
use super::session::QuicSession;
use super::tls;
use super::{crypto, LOCAL_CID_LEN};
use crate::callback::{
    CallbackSlot, ErrorCallback, SessionEventCallback, SessionReceiveCallback,
    SessionStreamReceiveCallback,
};
use crate::error::{NetResult, NetworkError};
use crate::lifecycle::Lifecycle;
use crate::session::{Session, SessionManager};
use dashmap::DashMap;
use netkit_config::{QuicServerConfig, SessionConfig};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const RECV_BUFFER_SIZE: usize = 65_536;
const TIMER_PERIOD: Duration = Duration::from_millis(25);

struct ConnEntry {
    conn: Arc<QuicConnection>,
    session: Arc<QuicSession>,
    session_id: String,
    /// CIDs routing to this connection (initial DCID plus our issued CID)
    routes: Vec<ConnectionId>,
}

pub struct QuicServer {
    server_id: String,
    config: QuicServerConfig,
    lifecycle: Lifecycle,
    sessions: Arc<SessionManager>,
    connections: Arc<DashMap<ConnectionId, Arc<ConnEntry>>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    disconnection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    receive_cb: Arc<CallbackSlot<SessionReceiveCallback>>,
    stream_cb: Arc<CallbackSlot<SessionStreamReceiveCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl QuicServer {
    pub fn new(server_id: impl Into<String>, config: QuicServerConfig) -> Self {
        let server_id = server_id.into();
        let session_config = SessionConfig {
            max_sessions: config.max_connections,
            ..SessionConfig::default()
        };
        Self {
            lifecycle: Lifecycle::new(format!("quic_server:{server_id}")),
            server_id,
            config,
            sessions: Arc::new(SessionManager::new(session_config)),
            connections: Arc::new(DashMap::new()),
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            connection_cb: Arc::new(CallbackSlot::new()),
            disconnection_cb: Arc::new(CallbackSlot::new()),
            receive_cb: Arc::new(CallbackSlot::new()),
            stream_cb: Arc::new(CallbackSlot::new()),
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

        let tls_config = match tls::build_server_config(self.lifecycle.name(), &self.config) {
            Ok(config) => config,
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(e);
            }
        };
        let retry = self.config.enable_retry.then(|| {
            Arc::new(RetryTokenIssuer::new(
                &self.config.retry_key,
                DEFAULT_TOKEN_WINDOW,
            ))
        });

        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(NetworkError::from_io(self.lifecycle.name(), "bind", e)
                    .with_details(format!("port={port}")));
            }
        };

        let mut tasks = Vec::new();

        // Demux loop.
        {
            let server = Arc::clone(self);
            let socket = Arc::clone(&socket);
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, from)) => {
                            server
                                .dispatch_datagram(&buf[..len], from, &socket, &tls_config, &retry);
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

        // Idle cleanup sweeper: sessions past the idle timeout are stopped,
        // removed, and their routes dropped.
        {
            let server = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(server.sessions.cleanup_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    server.sessions.cleanup_idle_sessions();
                    server.sweep_dead_connections();
                }
            }));
        }

        *self.socket.lock() = Some(socket);
        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), port, "started");
        Ok(())
    }

    fn dispatch_datagram(
        self: &Arc<Self>,
        datagram: &[u8],
        from: SocketAddr,
        socket: &Arc<UdpSocket>,
        tls_config: &Arc<rustls::ServerConfig>,
        retry: &Option<Arc<RetryTokenIssuer>>,
    ) {
        // Header parse failure: drop silently, no reply of any kind.
        let Some(dcid) = extract_dcid(datagram, LOCAL_CID_LEN) else {
            return;
        };

        if let Some(entry) = self.connections.get(&dcid) {
            entry.session.update_activity();
            entry.conn.handle_datagram(datagram);
            return;
        }

        // Unknown CID: only a well-formed Initial may create state.
        let Some(parsed) = Header::parse(datagram, LOCAL_CID_LEN) else {
            return;
        };
        let ParsedHeader {
            header: Header::Long(long),
            ..
        } = parsed
        else {
            trace!(component = %self.lifecycle.name(), peer = %from, "non-initial for unknown cid dropped");
            return;
        };
        if long.version != QUIC_VERSION_1 {
            self.send_version_negotiation(&long.scid, &long.dcid, from, socket);
            return;
        }
        if long.packet_type != LongPacketType::Initial {
            return;
        }
        if !self.sessions.can_accept() {
            debug!(component = %self.lifecycle.name(), peer = %from, "admission denied, initial dropped");
            return;
        }

        // Address validation via stateless retry.
        let (odcid, retry_used) = match retry {
            Some(issuer) => {
                if long.token.is_empty() {
                    self.send_retry(issuer, &long.dcid, &long.scid, from, socket);
                    return;
                }
                match issuer.validate(from.ip(), &long.token) {
                    Some(odcid) => (odcid, true),
                    None => {
                        debug!(component = %self.lifecycle.name(), peer = %from, "invalid retry token, initial discarded");
                        return;
                    }
                }
            }
            None => (long.dcid, false),
        };

        self.admit_connection(
            datagram,
            from,
            socket,
            tls_config,
            long.dcid,
            long.scid,
            odcid,
            retry_used.then_some(long.dcid),
        );
    }

    fn send_retry(
        &self,
        issuer: &RetryTokenIssuer,
        packet_dcid: &ConnectionId,
        client_scid: &ConnectionId,
        from: SocketAddr,
        socket: &Arc<UdpSocket>,
    ) {
        let retry_scid = ConnectionId::random(LOCAL_CID_LEN);
        let token = issuer.mint(from.ip(), packet_dcid);
        let mut retry = RetryPacket {
            version: QUIC_VERSION_1,
            dcid: *client_scid,
            scid: retry_scid,
            token,
            integrity_tag: [0u8; 16],
        };
        let mut without_tag = Vec::new();
        retry.serialize(&mut without_tag);
        without_tag.truncate(without_tag.len() - 16);
        match crypto::retry_integrity_tag(packet_dcid, &without_tag) {
            Ok(tag) => retry.integrity_tag = tag,
            Err(e) => {
                warn!(component = %self.lifecycle.name(), error = %e, "retry tag computation failed");
                return;
            }
        }
        let mut wire = Vec::new();
        retry.serialize(&mut wire);
        trace!(component = %self.lifecycle.name(), peer = %from, "stateless retry sent");
        let _ = socket.try_send_to(&wire, from);
    }

    fn send_version_negotiation(
        &self,
        client_scid: &ConnectionId,
        packet_dcid: &ConnectionId,
        from: SocketAddr,
        socket: &Arc<UdpSocket>,
    ) {
        let vn = VersionNegotiation {
            dcid: *client_scid,
            scid: *packet_dcid,
            versions: vec![QUIC_VERSION_1],
        };
        let mut wire = Vec::new();
        vn.serialize(&mut wire);
        debug!(component = %self.lifecycle.name(), peer = %from, "version negotiation sent");
        let _ = socket.try_send_to(&wire, from);
    }

    #[allow(clippy::too_many_arguments)]
    fn admit_connection(
        self: &Arc<Self>,
        first_datagram: &[u8],
        from: SocketAddr,
        socket: &Arc<UdpSocket>,
        tls_config: &Arc<rustls::ServerConfig>,
        packet_dcid: ConnectionId,
        client_scid: ConnectionId,
        odcid: ConnectionId,
        retry_scid: Option<ConnectionId>,
    ) {
        let session_id = self.sessions.generate_id(&self.server_id);
        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let params = ConnectionParams {
            idle_timeout: Duration::from_millis(self.config.max_idle_timeout_ms),
            initial_max_data: self.config.initial_max_data,
            initial_max_stream_data: self.config.initial_max_stream_data,
            initial_max_streams_bidi: self.config.initial_max_streams_bidi,
            initial_max_streams_uni: self.config.initial_max_streams_uni,
        };
        let source = format!("{}:{session_id}", self.lifecycle.name());
        let (conn, local_cid) = match QuicConnection::new_server(
            source,
            tls_config.clone(),
            params,
            packet_dcid,
            client_scid,
            odcid,
            retry_scid,
            outbound_tx,
            event_tx,
        ) {
            Ok(created) => created,
            Err(e) => {
                warn!(component = %self.lifecycle.name(), error = %e, "connection setup failed");
                if let Some(cb) = self.error_cb.get() {
                    cb(e);
                }
                return;
            }
        };

        let session = QuicSession::new(session_id.clone(), Arc::clone(&conn), from);
        if self
            .sessions
            .add(session.clone(), Some(session_id.clone()))
            .is_none()
        {
            return;
        }

        let entry = Arc::new(ConnEntry {
            conn: Arc::clone(&conn),
            session: Arc::clone(&session),
            session_id: session_id.clone(),
            routes: vec![packet_dcid, local_cid],
        });
        self.connections.insert(packet_dcid, Arc::clone(&entry));
        self.connections.insert(local_cid, Arc::clone(&entry));
        info!(component = %self.lifecycle.name(), peer = %from, session_id = %session_id, "connection admitted");

        // Per-connection datagram pump.
        {
            let socket = Arc::clone(socket);
            tokio::spawn(async move {
                while let Some(datagram) = outbound_rx.recv().await {
                    if socket.send_to(&datagram, from).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Per-connection event dispatch.
        {
            let server = Arc::clone(self);
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    match event {
                        ConnEvent::HandshakeComplete { alpn } => {
                            debug!(session_id = %entry.session_id, alpn = ?alpn, "session handshake complete");
                            if let Some(cb) = server.connection_cb.get() {
                                cb(&entry.session_id);
                            }
                        }
                        ConnEvent::StreamData {
                            stream_id,
                            data,
                            fin,
                        } => {
                            entry.session.update_activity();
                            if stream_id == 0 {
                                if let Some(cb) = server.receive_cb.get() {
                                    cb(&entry.session_id, data.clone());
                                }
                            }
                            if let Some(cb) = server.stream_cb.get() {
                                cb(&entry.session_id, stream_id, data, fin);
                            }
                        }
                        ConnEvent::EarlyDataAccepted(_) => {}
                        ConnEvent::Closed { .. } => {
                            server.retire_connection(&entry);
                            break;
                        }
                    }
                }
            });
        }

        // Per-connection timer.
        {
            let server = Arc::clone(self);
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TIMER_PERIOD);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    entry.conn.on_timer(Instant::now());
                    if entry.conn.should_remove(Instant::now()) {
                        server.retire_connection(&entry);
                        break;
                    }
                }
            });
        }

        conn.handle_datagram(first_datagram);
    }

    /// Removes a connection's routes and session exactly once.
    fn retire_connection(&self, entry: &Arc<ConnEntry>) {
        let mut removed_any = false;
        for route in &entry.routes {
            if self.connections.remove(route).is_some() {
                removed_any = true;
            }
        }
        if removed_any {
            entry.session.mark_disconnected();
            self.sessions.remove(&entry.session_id);
            debug!(session_id = %entry.session_id, "connection retired");
            if let Some(cb) = self.disconnection_cb.get() {
                cb(&entry.session_id);
            }
        }
    }

    /// Drops routes whose session disappeared (idle cleanup) or whose drain
    /// period elapsed.
    fn sweep_dead_connections(&self) {
        let now = Instant::now();
        let stale: Vec<Arc<ConnEntry>> = self
            .connections
            .iter()
            .filter(|kv| {
                !self.sessions.get(&kv.value().session_id).is_valid()
                    || kv.value().conn.should_remove(now)
            })
            .map(|kv| Arc::clone(kv.value()))
            .collect();
        for entry in stale {
            self.retire_connection(&entry);
        }
    }

    pub async fn stop(&self) -> NetResult<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        self.disconnect_all(0).await;
        self.sessions.clear_all();
        self.connections.clear();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.socket.lock() = None;
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

    pub fn get_session(&self, session_id: &str) -> crate::session::SessionHandle {
        self.sessions.get(session_id)
    }

    /// Sends to one session's default stream.
    pub fn send_to_session(&self, session_id: &str, data: Vec<u8>) -> NetResult<()> {
        self.sessions.get(session_id).send(data)
    }

    /// Sends on a specific stream of one session.
    pub fn send_on_stream(
        &self,
        session_id: &str,
        stream_id: u64,
        data: Vec<u8>,
        fin: bool,
    ) -> NetResult<()> {
        let handle = self.sessions.get(session_id);
        match handle.downcast_ref::<QuicSession>() {
            Some(session) => session.send_on_stream(stream_id, data, fin),
            None => Err(NetworkError::connection_closed(self.lifecycle.name())),
        }
    }

    /// Copies the payload to every connected session; returns attempts.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        self.sessions.broadcast(data)
    }

    /// Sends to an explicit set of sessions; returns attempts.
    pub fn multicast(&self, session_ids: &[String], data: &[u8]) -> usize {
        let mut delivered = 0;
        for session_id in session_ids {
            let handle = self.sessions.get(session_id);
            if handle.is_connected() && handle.send(data.to_vec()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Closes one session with an application error code.
    pub async fn disconnect_session(&self, session_id: &str, error_code: u64) -> bool {
        let handle = self.sessions.get(session_id);
        match handle.downcast_ref::<QuicSession>() {
            Some(session) => {
                session.close_with_code(error_code, "disconnected by server");
                true
            }
            None => false,
        }
    }

    /// Closes every session with the given error code.
    pub async fn disconnect_all(&self, error_code: u64) {
        let ids = self.sessions.session_ids();
        for session_id in ids {
            self.disconnect_session(&session_id, error_code).await;
        }
    }

    pub fn set_connection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.connection_cb.set(Arc::new(callback));
    }

    pub fn set_disconnection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.disconnection_cb.set(Arc::new(callback));
    }

    pub fn set_receive_callback(
        &self,
        callback: impl Fn(&str, Vec<u8>) + Send + Sync + 'static,
    ) {
        self.receive_cb.set(Arc::new(callback));
    }

    pub fn set_stream_receive_callback(
        &self,
        callback: impl Fn(&str, u64, Vec<u8>, bool) + Send + Sync + 'static,
    ) {
        self.stream_cb.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }
}

impl Drop for QuicServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
