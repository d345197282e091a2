//! WebSocket server component.

use crate::callback::{
    CallbackSlot, ErrorCallback, SessionEventCallback, SessionReceiveCallback,
};
use crate::error::{NetResult, NetworkError};
use crate::lifecycle::Lifecycle;
use crate::session::{Session, SessionManager};
use futures::{SinkExt, StreamExt};
use netkit_config::SessionConfig;
use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Server session text callback: `(session_id, text)`.
pub type SessionTextCallback = dyn Fn(&str, String) + Send + Sync;

/// One connected WebSocket peer.
pub struct WsSession {
    id: String,
    peer: SocketAddr,
    writer: mpsc::UnboundedSender<Message>,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl WsSession {
    fn new(id: String, peer: SocketAddr, writer: mpsc::UnboundedSender<Message>) -> Arc<Self> {
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

    pub fn send_text(&self, text: impl Into<String>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::connection_closed(format!(
                "ws_session:{}",
                self.id
            )));
        }
        self.writer
            .send(Message::Text(text.into().into()))
            .map_err(|_| NetworkError::connection_closed(format!("ws_session:{}", self.id)))
    }
}

impl Session for WsSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.writer.is_closed()
    }

    fn send(&self, data: Vec<u8>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::connection_closed(format!(
                "ws_session:{}",
                self.id
            )));
        }
        self.writer
            .send(Message::Binary(data.into()))
            .map_err(|_| NetworkError::connection_closed(format!("ws_session:{}", self.id)))
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.writer.send(Message::Close(None));
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

pub struct WsServer {
    server_id: String,
    lifecycle: Lifecycle,
    sessions: Arc<SessionManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    disconnection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    binary_cb: Arc<CallbackSlot<SessionReceiveCallback>>,
    text_cb: Arc<CallbackSlot<SessionTextCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl WsServer {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self::with_session_config(server_id, SessionConfig::default())
    }

    pub fn with_session_config(
        server_id: impl Into<String>,
        session_config: SessionConfig,
    ) -> Self {
        let server_id = server_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("ws_server:{server_id}")),
            server_id,
            sessions: Arc::new(SessionManager::new(session_config)),
            tasks: Mutex::new(Vec::new()),
            connection_cb: Arc::new(CallbackSlot::new()),
            disconnection_cb: Arc::new(CallbackSlot::new()),
            binary_cb: Arc::new(CallbackSlot::new()),
            text_cb: Arc::new(CallbackSlot::new()),
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

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(NetworkError::from_io(self.lifecycle.name(), "bind", e)
                    .with_details(format!("port={port}")));
            }
        };

        let mut tasks = Vec::new();
        {
            let server = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((socket, peer)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                server.handle_accept(socket, peer).await;
                            });
                        }
                        Err(e) => {
                            warn!(component = %server.lifecycle.name(), error = %e, "accept failed");
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

    async fn handle_accept(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let stream = match accept_async(socket).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(component = %self.lifecycle.name(), peer = %peer, error = %e, "handshake failed");
                return;
            }
        };
        let (mut sink, mut source) = stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

        let session_id = self.sessions.generate_id(&self.server_id);
        let session = WsSession::new(session_id.clone(), peer, writer_tx.clone());
        if self
            .sessions
            .add(session.clone(), Some(session_id.clone()))
            .is_none()
        {
            warn!(component = %self.lifecycle.name(), peer = %peer, "admission denied, closing");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
        info!(component = %self.lifecycle.name(), peer = %peer, session_id = %session_id, "websocket accepted");
        if let Some(cb) = self.connection_cb.get() {
            cb(&session_id);
        }

        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    session.update_activity();
                    if let Some(cb) = self.binary_cb.get() {
                        cb(&session_id, data.to_vec());
                    }
                }
                Ok(Message::Text(text)) => {
                    session.update_activity();
                    if let Some(cb) = self.text_cb.get() {
                        cb(&session_id, text.to_string());
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = writer_tx.send(Message::Pong(payload));
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(component = %self.lifecycle.name(), session_id = %session_id, error = %e, "receive failed");
                    break;
                }
            }
        }

        session.close();
        writer_task.abort();
        self.sessions.remove(&session_id);
        debug!(component = %self.lifecycle.name(), session_id = %session_id, "websocket closed");
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

    pub fn send_text_to_session(&self, session_id: &str, text: &str) -> NetResult<()> {
        let handle = self.sessions.get(session_id);
        match handle.downcast_ref::<WsSession>() {
            Some(session) => session.send_text(text),
            None => Err(NetworkError::connection_closed(self.lifecycle.name())),
        }
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

    pub fn set_binary_callback(
        &self,
        callback: impl Fn(&str, Vec<u8>) + Send + Sync + 'static,
    ) {
        self.binary_cb.set(Arc::new(callback));
    }

    /// Same slot as `set_binary_callback`; name matches the other servers.
    pub fn set_receive_callback(
        &self,
        callback: impl Fn(&str, Vec<u8>) + Send + Sync + 'static,
    ) {
        self.binary_cb.set(Arc::new(callback));
    }

    pub fn set_text_callback(&self, callback: impl Fn(&str, String) + Send + Sync + 'static) {
        self.text_cb.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
