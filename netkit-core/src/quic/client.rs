//! QUIC client component.

use super::connection::{ConnEvent, ConnectionParams, QuicConnection, QuicConnectionStats};
use super::packet::extract_dcid;
use super::tls::{self, ObservingSessionStore};
use super::LOCAL_CID_LEN;
use crate::callback::{
    CallbackSlot, ConnectedCallback, DisconnectedCallback, EarlyDataAcceptedCallback,
    EarlyDataCallback, ErrorCallback, ReceiveCallback, SessionTicketCallback,
    StreamReceiveCallback,
};
use crate::error::{ErrorCode, NetResult, NetworkError};
use crate::lifecycle::{Canceller, Lifecycle};
use netkit_config::QuicClientConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const RECV_BUFFER_SIZE: usize = 65_536;
const TIMER_PERIOD: Duration = Duration::from_millis(25);

/// QUIC client: one connection, multiplexed streams, optional 0-RTT.
///
/// `start` initiates the handshake and returns; completion is observable via
/// `is_handshake_complete()` and the connected callback. The default receive
/// callback sees stream 0; per-stream traffic arrives on the stream receive
/// callback.
pub struct QuicClient {
    client_id: String,
    config: QuicClientConfig,
    lifecycle: Lifecycle,
    canceller: Canceller,
    connection: Mutex<Option<Arc<QuicConnection>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    resumption: Arc<ObservingSessionStore>,
    receive_cb: Arc<CallbackSlot<ReceiveCallback>>,
    stream_cb: Arc<CallbackSlot<StreamReceiveCallback>>,
    connected_cb: Arc<CallbackSlot<ConnectedCallback>>,
    disconnected_cb: Arc<CallbackSlot<DisconnectedCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
    early_data_cb: Arc<CallbackSlot<EarlyDataCallback>>,
    early_data_accepted_cb: Arc<CallbackSlot<EarlyDataAcceptedCallback>>,
    session_ticket_cb: Arc<CallbackSlot<SessionTicketCallback>>,
}

impl QuicClient {
    pub fn new(client_id: impl Into<String>, config: QuicClientConfig) -> Self {
        let client_id = client_id.into();
        let session_ticket_cb: Arc<CallbackSlot<SessionTicketCallback>> =
            Arc::new(CallbackSlot::new());
        // The resumption store outlives individual starts so reconnects can
        // resume and attempt 0-RTT.
        let resumption =
            ObservingSessionStore::new(session_ticket_cb.clone(), config.max_early_data_size);
        Self {
            lifecycle: Lifecycle::new(format!("quic_client:{client_id}")),
            canceller: Canceller::new(),
            client_id,
            config,
            connection: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            resumption,
            receive_cb: Arc::new(CallbackSlot::new()),
            stream_cb: Arc::new(CallbackSlot::new()),
            connected_cb: Arc::new(CallbackSlot::new()),
            disconnected_cb: Arc::new(CallbackSlot::new()),
            error_cb: Arc::new(CallbackSlot::new()),
            early_data_cb: Arc::new(CallbackSlot::new()),
            early_data_accepted_cb: Arc::new(CallbackSlot::new()),
            session_ticket_cb,
        }
    }

    /// Resolves the host, binds a UDP socket, and launches the handshake.
    pub async fn start(&self, host: &str, port: u16) -> NetResult<()> {
        if host.is_empty() {
            return Err(NetworkError::invalid_argument(
                self.lifecycle.name(),
                "host must not be empty",
            ));
        }
        if port == 0 {
            return Err(NetworkError::invalid_argument(
                self.lifecycle.name(),
                "port must not be zero",
            ));
        }
        self.lifecycle.begin_start()?;
        self.canceller.arm();

        let setup = async {
            let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
                NetworkError::from_io(self.lifecycle.name(), "resolve", e)
                    .with_details(format!("host={host} port={port}"))
            })?;
            let addr = addrs.next().ok_or_else(|| {
                NetworkError::new(
                    ErrorCode::NotFound,
                    self.lifecycle.name(),
                    format!("no addresses for {host}"),
                )
            })?;
            let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(bind_addr)
                .await
                .map_err(|e| NetworkError::from_io(self.lifecycle.name(), "bind", e))?;
            socket
                .connect(addr)
                .await
                .map_err(|e| NetworkError::from_io(self.lifecycle.name(), "connect", e))?;
            Ok::<_, NetworkError>(socket)
        };
        let socket = tokio::select! {
            result = setup => match result {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    self.lifecycle.abort_start();
                    return Err(e);
                }
            },
            _ = self.canceller.cancelled() => {
                self.lifecycle.abort_start();
                return Err(NetworkError::cancelled(self.lifecycle.name()));
            }
        };

        let server_name: rustls::pki_types::ServerName<'static> =
            match host.to_string().try_into() {
                Ok(name) => name,
                Err(_) => {
                    self.lifecycle.abort_start();
                    return Err(NetworkError::invalid_argument(
                        self.lifecycle.name(),
                        format!("{host} is not a valid TLS server name"),
                    ));
                }
            };
        let tls_config =
            match tls::build_client_config(self.lifecycle.name(), &self.config, self.resumption.clone()) {
                Ok(config) => config,
                Err(e) => {
                    self.lifecycle.abort_start();
                    return Err(e);
                }
            };

        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let params = ConnectionParams {
            idle_timeout: Duration::from_millis(self.config.max_idle_timeout_ms),
            initial_max_data: self.config.initial_max_data,
            initial_max_stream_data: self.config.initial_max_stream_data,
            initial_max_streams_bidi: self.config.initial_max_streams_bidi,
            initial_max_streams_uni: self.config.initial_max_streams_uni,
        };
        let (conn, local_cid) = match QuicConnection::new_client(
            self.lifecycle.name(),
            tls_config,
            server_name,
            params,
            outbound_tx,
            event_tx,
        ) {
            Ok(created) => created,
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(e);
            }
        };

        // 0-RTT: only attempted when configured and rustls resumed a session
        // that permits early data.
        if self.config.enable_early_data
            && self.config.session_ticket.is_some()
            && conn.zero_rtt_available()
        {
            if let Some(cb) = self.early_data_cb.get() {
                let payload = cb();
                if !payload.is_empty() {
                    debug!(component = %self.lifecycle.name(), len = payload.len(), "sending 0-RTT data");
                    if let Err(e) = conn.send_early_data(payload) {
                        warn!(component = %self.lifecycle.name(), error = %e, "0-RTT send failed");
                    }
                }
            }
        }

        let mut tasks = Vec::new();

        // Datagram pump onto the wire.
        {
            let socket = Arc::clone(&socket);
            let error_cb = self.error_cb.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(datagram) = outbound_rx.recv().await {
                    if let Err(e) = socket.send(&datagram).await {
                        if let Some(cb) = error_cb.get() {
                            cb(NetworkError::from_io(name.clone(), "send", e));
                        }
                        break;
                    }
                }
            }));
        }

        // Ingress: only datagrams addressed to our CID reach the engine.
        {
            let socket = Arc::clone(&socket);
            let conn = Arc::clone(&conn);
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(len) => {
                            let datagram = &buf[..len];
                            match extract_dcid(datagram, LOCAL_CID_LEN) {
                                Some(dcid) if dcid == local_cid => conn.handle_datagram(datagram),
                                _ => {
                                    trace!(component = %name, "datagram for unknown cid dropped")
                                }
                            }
                        }
                        Err(e) => {
                            trace!(component = %name, error = %e, "udp receive ended");
                            break;
                        }
                    }
                }
            }));
        }

        // Timer driver.
        {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TIMER_PERIOD);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    conn.on_timer(std::time::Instant::now());
                }
            }));
        }

        // Event dispatcher.
        {
            let receive_cb = self.receive_cb.clone();
            let stream_cb = self.stream_cb.clone();
            let connected_cb = self.connected_cb.clone();
            let disconnected_cb = self.disconnected_cb.clone();
            let early_accepted_cb = self.early_data_accepted_cb.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    match event {
                        ConnEvent::HandshakeComplete { alpn } => {
                            info!(component = %name, alpn = ?alpn, "connected");
                            if let Some(cb) = connected_cb.get() {
                                cb();
                            }
                        }
                        ConnEvent::StreamData {
                            stream_id,
                            data,
                            fin,
                        } => {
                            if stream_id == 0 {
                                if let Some(cb) = receive_cb.get() {
                                    cb(data.clone());
                                }
                            }
                            if let Some(cb) = stream_cb.get() {
                                cb(stream_id, data, fin);
                            }
                        }
                        ConnEvent::EarlyDataAccepted(accepted) => {
                            if let Some(cb) = early_accepted_cb.get() {
                                cb(accepted);
                            }
                        }
                        ConnEvent::Closed {
                            error_code, reason, ..
                        } => {
                            debug!(component = %name, error_code, reason = %reason, "disconnected");
                            if let Some(cb) = disconnected_cb.get() {
                                cb();
                            }
                        }
                    }
                }
            }));
        }

        *self.connection.lock() = Some(conn);
        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), host, port, "started");
        Ok(())
    }

    /// Stops the client; a pending resolve/connect is cancelled, an
    /// established connection is closed with a drain.
    pub async fn stop(&self) -> NetResult<()> {
        self.canceller.cancel();
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        if let Some(conn) = self.connection.lock().take() {
            conn.close(0, "client shutdown");
        }
        // Give the pump a moment to put the CONNECTION_CLOSE on the wire.
        tokio::time::sleep(Duration::from_millis(20)).await;
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

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.is_established())
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_running() && self.is_handshake_complete()
    }

    /// Negotiated ALPN protocol, once the handshake completed.
    pub fn alpn_protocol(&self) -> Option<String> {
        self.connection.lock().as_ref().and_then(|c| c.alpn_protocol())
    }

    fn with_connection<R>(
        &self,
        f: impl FnOnce(&Arc<QuicConnection>) -> NetResult<R>,
    ) -> NetResult<R> {
        let guard = self.connection.lock();
        match guard.as_ref() {
            Some(conn) if self.lifecycle.is_running() => f(conn),
            _ => Err(NetworkError::connection_closed(self.lifecycle.name())),
        }
    }

    /// Sends on the default stream.
    pub fn send_packet(&self, data: Vec<u8>) -> NetResult<()> {
        self.with_connection(|conn| conn.send_default(data))
    }

    /// Sends on a specific stream; FIN half-closes the local side.
    pub fn send_on_stream(&self, stream_id: u64, data: Vec<u8>, fin: bool) -> NetResult<()> {
        self.with_connection(|conn| conn.send_on_stream(stream_id, data, fin))
    }

    /// Opens a new bidirectional stream; `stream_limit` past the peer's cap.
    pub fn create_stream(&self) -> NetResult<u64> {
        self.with_connection(|conn| conn.create_stream())
    }

    pub fn create_unidirectional_stream(&self) -> NetResult<u64> {
        self.with_connection(|conn| conn.create_unidirectional_stream())
    }

    pub fn close_stream(&self, stream_id: u64) -> NetResult<()> {
        self.with_connection(|conn| conn.close_stream(stream_id))
    }

    pub fn stats(&self) -> QuicConnectionStats {
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default()
    }

    pub fn set_receive_callback(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.receive_cb.set(Arc::new(callback));
    }

    pub fn set_stream_receive_callback(
        &self,
        callback: impl Fn(u64, Vec<u8>, bool) + Send + Sync + 'static,
    ) {
        self.stream_cb.set(Arc::new(callback));
    }

    pub fn set_connected_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.connected_cb.set(Arc::new(callback));
    }

    pub fn set_disconnected_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.disconnected_cb.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }

    pub fn set_early_data_callback(&self, callback: impl Fn() -> Vec<u8> + Send + Sync + 'static) {
        self.early_data_cb.set(Arc::new(callback));
    }

    pub fn set_early_data_accepted_callback(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) {
        self.early_data_accepted_cb.set(Arc::new(callback));
    }

    pub fn set_session_ticket_callback(
        &self,
        callback: impl Fn(Vec<u8>, u32, u32) + Send + Sync + 'static,
    ) {
        self.session_ticket_cb.set(Arc::new(callback));
    }
}

impl Drop for QuicClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_validates_arguments() {
        let client = QuicClient::new("t", QuicClientConfig::default());
        let err = client.start("", 443).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        let err = client.start("localhost", 0).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn send_before_start_is_connection_closed() {
        let client = QuicClient::new("t", QuicClientConfig::default());
        let err = client.send_packet(b"early".to_vec()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
        let err = client.create_stream().unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }

    #[tokio::test]
    async fn stop_without_start_is_ok() {
        let client = QuicClient::new("t", QuicClientConfig::default());
        client.stop().await.unwrap();
        client.wait_for_stop().await;
    }
}
