//! HTTP/2 server component over h2 (prior-knowledge cleartext).

use crate::callback::{CallbackSlot, ErrorCallback, SessionEventCallback};
use crate::error::{NetResult, NetworkError};
use crate::http1::{HttpRequest, HttpResponse, RequestHandler};
use crate::lifecycle::Lifecycle;
use crate::session::{Session, SessionManager};
use bytes::Bytes;
use netkit_config::SessionConfig;
use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One HTTP/2 connection tracked as a session; all of its multiplexed
/// streams share the session id.
pub struct Http2Session {
    id: String,
    peer: SocketAddr,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Http2Session {
    fn new(id: String, peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            connected: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Session for Http2Session {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, _data: Vec<u8>) -> NetResult<()> {
        Err(NetworkError::invalid_argument(
            format!("http2_session:{}", self.id),
            "HTTP/2 sessions respond through the request handler",
        ))
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

pub struct Http2Server {
    server_id: String,
    lifecycle: Lifecycle,
    sessions: Arc<SessionManager>,
    handler: Arc<CallbackSlot<RequestHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    disconnection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl Http2Server {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self::with_session_config(server_id, SessionConfig::default())
    }

    pub fn with_session_config(
        server_id: impl Into<String>,
        session_config: SessionConfig,
    ) -> Self {
        let server_id = server_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("http2_server:{server_id}")),
            server_id,
            sessions: Arc::new(SessionManager::new(session_config)),
            handler: Arc::new(CallbackSlot::new()),
            tasks: Mutex::new(Vec::new()),
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
                                server.serve_connection(socket, peer).await;
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

    async fn serve_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let mut connection = match h2::server::handshake(socket).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(component = %self.lifecycle.name(), peer = %peer, error = %e, "handshake failed");
                return;
            }
        };

        let session_id = self.sessions.generate_id(&self.server_id);
        let session = Http2Session::new(session_id.clone(), peer);
        if self
            .sessions
            .add(session.clone(), Some(session_id.clone()))
            .is_none()
        {
            debug!(component = %self.lifecycle.name(), peer = %peer, "admission denied, connection dropped");
            return;
        }
        if let Some(cb) = self.connection_cb.get() {
            cb(&session_id);
        }

        while let Some(result) = connection.accept().await {
            let (request, respond) = match result {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(component = %self.lifecycle.name(), session_id = %session_id, error = %e, "stream accept failed");
                    break;
                }
            };
            session.update_activity();
            let handler = self.handler.clone();
            let name = self.lifecycle.name().to_string();
            tokio::spawn(async move {
                if let Err(e) = handle_stream(request, respond, handler).await {
                    debug!(component = %name, error = %e, "stream handling failed");
                }
            });
        }

        session.close();
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

    pub fn set_request_handler(
        &self,
        handler: impl Fn(HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.handler.set(Arc::new(handler));
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

async fn handle_stream(
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    handler: Arc<CallbackSlot<RequestHandler>>,
) -> Result<(), h2::Error> {
    let (parts, mut recv) = request.into_parts();
    let mut body = Vec::new();
    while let Some(chunk) = recv.data().await {
        let chunk = chunk?;
        body.extend_from_slice(&chunk);
        let _ = recv.flow_control().release_capacity(chunk.len());
    }

    let materialized = HttpRequest {
        method: parts.method.to_string(),
        path: parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body,
    };
    let answer = match handler.get() {
        Some(handler) => handler(materialized),
        None => HttpResponse::status(404),
    };

    let mut builder = http::Response::builder().status(answer.status);
    for (name, value) in &answer.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let response = builder.body(()).unwrap_or_else(|_| {
        let mut fallback = http::Response::new(());
        *fallback.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    });
    let end_of_stream = answer.body.is_empty();
    let mut send = respond.send_response(response, end_of_stream)?;
    if !end_of_stream {
        send.send_data(Bytes::from(answer.body), true)?;
    }
    Ok(())
}

impl Drop for Http2Server {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
