//! Plain UDP client component.

use crate::callback::{CallbackSlot, ErrorCallback, ReceiveCallback};
use crate::error::{ErrorCode, NetResult, NetworkError};
use crate::lifecycle::{Canceller, Lifecycle};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const RECV_BUFFER_SIZE: usize = 65_536;

/// Connected-socket UDP client; datagrams in, datagrams out.
pub struct UdpClient {
    client_id: String,
    lifecycle: Lifecycle,
    canceller: Canceller,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    receive_cb: Arc<CallbackSlot<ReceiveCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl UdpClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("udp_client:{client_id}")),
            canceller: Canceller::new(),
            client_id,
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            receive_cb: Arc::new(CallbackSlot::new()),
            error_cb: Arc::new(CallbackSlot::new()),
        }
    }

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

        let mut tasks = Vec::new();
        {
            let socket = Arc::clone(&socket);
            let receive_cb = self.receive_cb.clone();
            let error_cb = self.error_cb.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(len) => {
                            if let Some(cb) = receive_cb.get() {
                                cb(buf[..len].to_vec());
                            }
                        }
                        Err(e) => {
                            debug!(component = %name, error = %e, "receive ended");
                            if let Some(cb) = error_cb.get() {
                                cb(NetworkError::from_io(name.clone(), "receive", e));
                            }
                            break;
                        }
                    }
                }
            }));
        }

        *self.socket.lock() = Some(socket);
        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), host, port, "started");
        Ok(())
    }

    /// Fire-and-forget datagram send.
    pub async fn send_packet(&self, data: Vec<u8>) -> NetResult<()> {
        let socket = self.socket.lock().clone();
        match socket {
            Some(socket) if self.lifecycle.is_running() => socket
                .send(&data)
                .await
                .map(|_| ())
                .map_err(|e| {
                    NetworkError::from_io(self.lifecycle.name(), "send", e)
                        .with_details(format!("len={}", data.len()))
                }),
            _ => Err(NetworkError::connection_closed(self.lifecycle.name())),
        }
    }

    pub async fn stop(&self) -> NetResult<()> {
        self.canceller.cancel();
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
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

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_receive_callback(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.receive_cb.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }
}

impl Drop for UdpClient {
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
    async fn argument_validation() {
        let client = UdpClient::new("t");
        assert_eq!(
            client.start("", 9000).await.unwrap_err().code,
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            client.start("127.0.0.1", 0).await.unwrap_err().code,
            ErrorCode::InvalidArgument
        );
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let client = UdpClient::new("t");
        client.start("127.0.0.1", 49900).await.unwrap();
        assert!(client.is_running());
        assert_eq!(
            client.start("127.0.0.1", 49900).await.unwrap_err().code,
            ErrorCode::AlreadyExists
        );
        client.stop().await.unwrap();
        client.stop().await.unwrap();
        assert!(!client.is_running());
        // Restart from stopped works.
        client.start("127.0.0.1", 49901).await.unwrap();
        client.stop().await.unwrap();
    }
}
