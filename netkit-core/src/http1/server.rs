//! HTTP/1.1 server component.

use super::{HttpRequest, HttpResponse, RequestHandler};
use crate::callback::{CallbackSlot, ErrorCallback, SessionEventCallback};
use crate::error::{NetResult, NetworkError};
use crate::lifecycle::Lifecycle;
use crate::session::{Session, SessionManager};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use netkit_config::SessionConfig;
use parking_lot::Mutex;
use std::any::Any;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Synthetic session wrapping one HTTP connection. The id stays stable for
/// every keep-alive request on the connection.
pub struct HttpSession {
    id: String,
    peer: SocketAddr,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl HttpSession {
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

impl Session for HttpSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    // Responses travel through the request handler, not a session send path.
    fn send(&self, _data: Vec<u8>) -> NetResult<()> {
        Err(NetworkError::invalid_argument(
            format!("http_session:{}", self.id),
            "HTTP sessions respond through the request handler",
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

pub struct HttpServer {
    server_id: String,
    lifecycle: Lifecycle,
    sessions: Arc<SessionManager>,
    handler: Arc<CallbackSlot<RequestHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    disconnection_cb: Arc<CallbackSlot<SessionEventCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl HttpServer {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self::with_session_config(server_id, SessionConfig::default())
    }

    pub fn with_session_config(
        server_id: impl Into<String>,
        session_config: SessionConfig,
    ) -> Self {
        let server_id = server_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("http_server:{server_id}")),
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
        let session_id = self.sessions.generate_id(&self.server_id);
        let session = HttpSession::new(session_id.clone(), peer);
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

        let handler = self.handler.clone();
        let request_session = session.clone();
        let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
            let handler = handler.clone();
            let session = request_session.clone();
            async move {
                session.update_activity();
                let (parts, body) = request.into_parts();
                let body = body
                    .collect()
                    .await
                    .map(|collected| collected.to_bytes().to_vec())
                    .unwrap_or_default();
                let request = HttpRequest {
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
                let response = match handler.get() {
                    Some(handler) => handler(request),
                    None => HttpResponse::status(404),
                };
                let mut builder = hyper::Response::builder().status(response.status);
                for (name, value) in &response.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let response = builder
                    .body(Full::new(Bytes::from(response.body)))
                    .unwrap_or_else(|_| {
                        hyper::Response::new(Full::new(Bytes::from_static(b"")))
                    });
                Ok::<_, Infallible>(response)
            }
        });

        let io = TokioIo::new(socket);
        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .await
        {
            debug!(component = %self.lifecycle.name(), session_id = %session_id, error = %e, "connection ended");
        }

        session.close();
        self.sessions.remove(&session_id);
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

    /// Installs the request handler invoked for every request.
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

impl Drop for HttpServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
