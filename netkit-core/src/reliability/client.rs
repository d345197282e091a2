//! Reliable-UDP client component.

use super::engine::{ReliabilityEngine, ReliableUdpStats};
use super::ReliabilityMode;
use crate::callback::{CallbackSlot, ErrorCallback, ReceiveCallback};
use crate::error::{ErrorCode, NetResult, NetworkError};
use crate::lifecycle::{Canceller, Lifecycle};
use netkit_config::ReliabilityConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const RECV_BUFFER_SIZE: usize = 65_536;

/// UDP client with a pluggable delivery mode.
///
/// Wraps a connected UDP socket with the [`ReliabilityEngine`]: payloads are
/// framed with the 12-byte reliability header, reliable modes get ACKs and a
/// timer-driven retransmission task, and inbound datagrams are delivered per
/// the mode's ordering rules via the receive callback.
pub struct ReliableUdpClient {
    client_id: String,
    mode: ReliabilityMode,
    config: ReliabilityConfig,
    lifecycle: Lifecycle,
    canceller: Canceller,
    receive_cb: Arc<CallbackSlot<ReceiveCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
    engine: Mutex<Option<Arc<ReliabilityEngine>>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableUdpClient {
    pub fn new(client_id: impl Into<String>, mode: ReliabilityMode) -> Self {
        Self::with_config(client_id, mode, ReliabilityConfig::default())
    }

    pub fn with_config(
        client_id: impl Into<String>,
        mode: ReliabilityMode,
        config: ReliabilityConfig,
    ) -> Self {
        let client_id = client_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("reliable_udp_client:{client_id}")),
            canceller: Canceller::new(),
            client_id,
            mode,
            config,
            receive_cb: Arc::new(CallbackSlot::new()),
            error_cb: Arc::new(CallbackSlot::new()),
            engine: Mutex::new(None),
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds an ephemeral local port and connects the socket to the peer.
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

        let connect = async {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| NetworkError::from_io(self.lifecycle.name(), "bind", e))?;
            socket
                .connect((host, port))
                .await
                .map_err(|e| NetworkError::from_io(self.lifecycle.name(), "connect", e))?;
            Ok::<_, NetworkError>(socket)
        };
        let socket = tokio::select! {
            result = connect => match result {
                Ok(socket) => socket,
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

        let socket = Arc::new(socket);
        let (engine, mut outbound) = ReliabilityEngine::new(
            self.lifecycle.name(),
            self.mode,
            self.config.clone(),
            self.receive_cb.clone(),
            self.error_cb.clone(),
        );

        let mut tasks = Vec::new();

        // Outbound pump: engine datagrams onto the wire.
        {
            let socket = Arc::clone(&socket);
            let error_cb = self.error_cb.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(packet) = outbound.recv().await {
                    if let Err(e) = socket.send(&packet).await {
                        error!(component = %name, error = %e, "udp send failed");
                        if let Some(cb) = error_cb.get() {
                            cb(NetworkError::from_io(name.clone(), "send", e));
                        }
                        break;
                    }
                }
            }));
        }

        // Inbound pump: wire datagrams into the engine.
        {
            let socket = Arc::clone(&socket);
            let engine = Arc::clone(&engine);
            let error_cb = self.error_cb.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(len) => {
                            engine.handle_datagram(&buf[..len]);
                        }
                        Err(e) => {
                            error!(component = %name, error = %e, "udp receive failed");
                            if let Some(cb) = error_cb.get() {
                                cb(NetworkError::from_io(name.clone(), "receive", e));
                            }
                            break;
                        }
                    }
                }
            }));
        }

        // Retransmission sweeper for reliable modes.
        if self.mode.is_reliable() {
            let engine = Arc::clone(&engine);
            let period = Duration::from_millis(self.config.retransmission_timeout_ms);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    engine.retransmit_due(Instant::now());
                }
            }));
        }

        *self.engine.lock() = Some(engine);
        *self.socket.lock() = Some(socket);
        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), host, port, mode = self.mode.as_str(), "started");
        Ok(())
    }

    /// Sends an application payload per the configured delivery mode.
    pub fn send_packet(&self, data: Vec<u8>) -> NetResult<()> {
        let engine = self.engine.lock().clone();
        match engine {
            Some(engine) if self.lifecycle.is_running() => engine.send(data),
            _ => Err(NetworkError::connection_closed(self.lifecycle.name())),
        }
    }

    /// Stops the client. Idempotent; a pending connect is cancelled.
    pub async fn stop(&self) -> NetResult<()> {
        self.canceller.cancel();
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }

        // Best-effort FIN so the server retires the peer promptly.
        if let (Some(engine), Some(socket)) =
            (self.engine.lock().take(), self.socket.lock().take())
        {
            engine.send_fin();
            let fin = super::build_packet(super::PacketHeader::control(super::FLAG_FIN), &[]);
            let _ = socket.try_send(&fin);
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.lifecycle.finish_stop();
        debug!(component = %self.lifecycle.name(), "stopped");
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

    pub fn mode(&self) -> ReliabilityMode {
        self.mode
    }

    pub fn stats(&self) -> ReliableUdpStats {
        self.engine
            .lock()
            .as_ref()
            .map(|e| e.stats())
            .unwrap_or_default()
    }

    pub fn set_receive_callback(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.receive_cb.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }
}

impl Drop for ReliableUdpClient {
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
    async fn start_rejects_bad_arguments() {
        let client = ReliableUdpClient::new("t", ReliabilityMode::ReliableOrdered);
        let err = client.start("", 9000).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        let err = client.start("127.0.0.1", 0).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn double_start_reports_already_exists() {
        let client = ReliableUdpClient::new("t", ReliabilityMode::Unreliable);
        client.start("127.0.0.1", 49999).await.unwrap();
        let err = client.start("127.0.0.1", 49999).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_unblocks_waiters() {
        let client = Arc::new(ReliableUdpClient::new("t", ReliabilityMode::ReliableOrdered));
        client.start("127.0.0.1", 49998).await.unwrap();
        assert!(client.is_running());

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.wait_for_stop().await })
        };
        client.stop().await.unwrap();
        client.stop().await.unwrap();
        waiter.await.unwrap();
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn send_after_stop_is_connection_closed() {
        let client = ReliableUdpClient::new("t", ReliabilityMode::ReliableOrdered);
        client.start("127.0.0.1", 49997).await.unwrap();
        client.stop().await.unwrap();
        let err = client.send_packet(b"late".to_vec()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }
}
