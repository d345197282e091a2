//! TCP server component, plain or TLS.

use super::session::TcpSession;
use crate::callback::{
    CallbackSlot, ErrorCallback, SessionEventCallback, SessionReceiveCallback,
};
use crate::error::{NetResult, NetworkError};
use crate::lifecycle::Lifecycle;
use crate::pem;
use crate::session::{Session, SessionManager};
use netkit_config::SessionConfig;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 32_768;

/// Certificate material for a TLS listener.
#[derive(Debug, Clone)]
pub struct TlsServerOptions {
    pub cert_file: String,
    pub key_file: String,
}

/// Accepting server for plain or TLS byte streams.
pub struct TcpServer {
    server_id: String,
    lifecycle: Lifecycle,
    tls: Option<TlsServerOptions>,
    sessions: Arc<SessionManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    disconnection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    receive_cb: Arc<CallbackSlot<SessionReceiveCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl TcpServer {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self::build(server_id, None, SessionConfig::default())
    }

    /// TLS listener; the handshake happens before the session is admitted.
    pub fn with_tls(server_id: impl Into<String>, tls: TlsServerOptions) -> Self {
        Self::build(server_id, Some(tls), SessionConfig::default())
    }

    pub fn with_session_config(
        server_id: impl Into<String>,
        tls: Option<TlsServerOptions>,
        session_config: SessionConfig,
    ) -> Self {
        Self::build(server_id, tls, session_config)
    }

    fn build(
        server_id: impl Into<String>,
        tls: Option<TlsServerOptions>,
        session_config: SessionConfig,
    ) -> Self {
        let server_id = server_id.into();
        let kind = if tls.is_some() { "tls_tcp_server" } else { "tcp_server" };
        Self {
            lifecycle: Lifecycle::new(format!("{kind}:{server_id}")),
            server_id,
            tls,
            sessions: Arc::new(SessionManager::new(session_config)),
            tasks: Mutex::new(Vec::new()),
            connection_cb: Arc::new(CallbackSlot::new()),
            disconnection_cb: Arc::new(CallbackSlot::new()),
            receive_cb: Arc::new(CallbackSlot::new()),
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

        let acceptor = match &self.tls {
            Some(options) => match self.build_acceptor(options) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    self.lifecycle.abort_start();
                    return Err(e);
                }
            },
            None => None,
        };

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(NetworkError::from_io(self.lifecycle.name(), "bind", e)
                    .with_details(format!("port={port}")));
            }
        };

        let mut tasks = Vec::new();

        // Accept loop.
        {
            let server = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((socket, peer)) => {
                            let server = Arc::clone(&server);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                server.handle_accept(socket, peer, acceptor).await;
                            });
                        }
                        Err(e) => {
                            error!(component = %server.lifecycle.name(), error = %e, "accept failed");
                            if let Some(cb) = server.error_cb.get() {
                                cb(NetworkError::from_io(
                                    server.lifecycle.name().to_string(),
                                    "accept",
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
            let sessions = Arc::clone(&self.sessions);
            let period = self.sessions.cleanup_interval();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    sessions.cleanup_idle_sessions();
                }
            }));
        }

        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), port, "started");
        Ok(())
    }

    fn build_acceptor(&self, options: &TlsServerOptions) -> NetResult<TlsAcceptor> {
        let certs = pem::load_certs(self.lifecycle.name(), &options.cert_file)?;
        let key = pem::load_key(self.lifecycle.name(), &options.key_file)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| {
                NetworkError::invalid_argument(
                    self.lifecycle.name(),
                    format!("server certificate rejected: {e}"),
                )
            })?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    async fn handle_accept(
        self: Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) {
        match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(stream) => self.run_session(stream, peer).await,
                Err(e) => {
                    debug!(component = %self.lifecycle.name(), peer = %peer, error = %e, "TLS accept failed");
                }
            },
            None => self.run_session(socket, peer).await,
        }
    }

    /// Admits the peer and runs its read loop until EOF or error.
    async fn run_session<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (writer_tx, mut writer_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

        let session_id = self.sessions.generate_id(&self.server_id);
        let session = TcpSession::new(session_id.clone(), peer, writer_tx);
        if self
            .sessions
            .add(session.clone(), Some(session_id.clone()))
            .is_none()
        {
            warn!(component = %self.lifecycle.name(), peer = %peer, "admission denied, connection dropped");
            return;
        }
        info!(component = %self.lifecycle.name(), peer = %peer, session_id = %session_id, "connection accepted");
        if let Some(cb) = self.connection_cb.get() {
            cb(&session_id);
        }

        // Writer task: serializes all sends onto the socket.
        let writer_task = tokio::spawn(async move {
            while let Some(data) = writer_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(len) => {
                    session.update_activity();
                    if let Some(cb) = self.receive_cb.get() {
                        cb(&session_id, buf[..len].to_vec());
                    }
                }
                Err(e) => {
                    debug!(component = %self.lifecycle.name(), session_id = %session_id, error = %e, "read failed");
                    if let Some(cb) = self.error_cb.get() {
                        cb(NetworkError::from_io(
                            self.lifecycle.name().to_string(),
                            "receive",
                            e,
                        ));
                    }
                    break;
                }
            }
        }

        session.close();
        writer_task.abort();
        self.sessions.remove(&session_id);
        debug!(component = %self.lifecycle.name(), session_id = %session_id, "connection closed");
        if let Some(cb) = self.disconnection_cb.get() {
            cb(&session_id);
        }
    }

    pub async fn stop(&self) -> NetResult<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        self.sessions.clear_all();
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

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
