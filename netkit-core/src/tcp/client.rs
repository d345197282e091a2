//! TCP client component, plain or TLS.

use crate::callback::{
    CallbackSlot, ConnectedCallback, DisconnectedCallback, ErrorCallback, ReceiveCallback,
};
use crate::error::{ErrorCode, NetResult, NetworkError};
use crate::lifecycle::{Canceller, Lifecycle};
use crate::pem;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

const READ_BUFFER_SIZE: usize = 32_768;

/// TLS options for an outbound connection.
#[derive(Debug, Clone, Default)]
pub struct TlsClientOptions {
    /// CA bundle for server verification; `None` leaves the root store empty
    pub ca_cert_file: Option<String>,
    /// Overrides the SNI/verification name (defaults to the connect host)
    pub server_name: Option<String>,
}

/// Byte-stream client following the shared lifecycle contract.
///
/// `stop` cancels a pending resolve/connect; the receive callback observes
/// raw segments as they arrive, with no framing imposed.
pub struct TcpClient {
    client_id: String,
    lifecycle: Lifecycle,
    canceller: Canceller,
    tls: Option<TlsClientOptions>,
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    receive_cb: Arc<CallbackSlot<ReceiveCallback>>,
    connected_cb: Arc<CallbackSlot<ConnectedCallback>>,
    disconnected_cb: Arc<CallbackSlot<DisconnectedCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl TcpClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::build(client_id, None)
    }

    pub fn with_tls(client_id: impl Into<String>, tls: TlsClientOptions) -> Self {
        Self::build(client_id, Some(tls))
    }

    fn build(client_id: impl Into<String>, tls: Option<TlsClientOptions>) -> Self {
        let client_id = client_id.into();
        let kind = if tls.is_some() { "tls_tcp_client" } else { "tcp_client" };
        Self {
            lifecycle: Lifecycle::new(format!("{kind}:{client_id}")),
            canceller: Canceller::new(),
            client_id,
            tls,
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            receive_cb: Arc::new(CallbackSlot::new()),
            connected_cb: Arc::new(CallbackSlot::new()),
            disconnected_cb: Arc::new(CallbackSlot::new()),
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

        let connect = TcpStream::connect((host, port));
        let socket = tokio::select! {
            result = connect => match result {
                Ok(socket) => socket,
                Err(e) => {
                    self.lifecycle.abort_start();
                    return Err(NetworkError::from_io(self.lifecycle.name(), "connect", e)
                        .with_details(format!("host={host} port={port}")));
                }
            },
            _ = self.canceller.cancelled() => {
                self.lifecycle.abort_start();
                return Err(NetworkError::cancelled(self.lifecycle.name()));
            }
        };

        match &self.tls {
            Some(options) => {
                let connector = match self.build_connector(options) {
                    Ok(connector) => connector,
                    Err(e) => {
                        self.lifecycle.abort_start();
                        return Err(e);
                    }
                };
                let name = options.server_name.clone().unwrap_or_else(|| host.to_string());
                let server_name: rustls::pki_types::ServerName<'static> =
                    match name.clone().try_into() {
                        Ok(server_name) => server_name,
                        Err(_) => {
                            self.lifecycle.abort_start();
                            return Err(NetworkError::invalid_argument(
                                self.lifecycle.name(),
                                format!("{name} is not a valid TLS server name"),
                            ));
                        }
                    };
                let handshake = connector.connect(server_name, socket);
                let stream = tokio::select! {
                    result = handshake => match result {
                        Ok(stream) => stream,
                        Err(e) => {
                            self.lifecycle.abort_start();
                            return Err(NetworkError::new(
                                ErrorCode::HandshakeFailed,
                                self.lifecycle.name(),
                                format!("TLS handshake failed: {e}"),
                            ));
                        }
                    },
                    _ = self.canceller.cancelled() => {
                        self.lifecycle.abort_start();
                        return Err(NetworkError::cancelled(self.lifecycle.name()));
                    }
                };
                self.launch(stream);
            }
            None => self.launch(socket),
        }

        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), host, port, "connected");
        if let Some(cb) = self.connected_cb.get() {
            cb();
        }
        Ok(())
    }

    fn build_connector(&self, options: &TlsClientOptions) -> NetResult<TlsConnector> {
        let roots = match &options.ca_cert_file {
            Some(path) => pem::root_store(self.lifecycle.name(), path)?,
            None => rustls::RootCertStore::empty(),
        };
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// Spawns the reader and writer tasks over the established stream.
    fn launch<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut tasks = Vec::new();

        {
            let error_cb = self.error_cb.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(data) = writer_rx.recv().await {
                    if let Err(e) = writer.write_all(&data).await {
                        if let Some(cb) = error_cb.get() {
                            cb(NetworkError::from_io(name.clone(), "send", e));
                        }
                        break;
                    }
                }
                let _ = writer.shutdown().await;
            }));
        }

        {
            let receive_cb = self.receive_cb.clone();
            let disconnected_cb = self.disconnected_cb.clone();
            let error_cb = self.error_cb.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(len) => {
                            if let Some(cb) = receive_cb.get() {
                                cb(buf[..len].to_vec());
                            }
                        }
                        Err(e) => {
                            if let Some(cb) = error_cb.get() {
                                cb(NetworkError::from_io(name.clone(), "receive", e));
                            }
                            break;
                        }
                    }
                }
                debug!(component = %name, "stream ended");
                if let Some(cb) = disconnected_cb.get() {
                    cb();
                }
            }));
        }

        *self.writer.lock() = Some(writer_tx);
        *self.tasks.lock() = tasks;
    }

    /// Enqueues bytes on the socket's writer task.
    pub fn send_packet(&self, data: Vec<u8>) -> NetResult<()> {
        let writer = self.writer.lock().clone();
        match writer {
            Some(writer) if self.lifecycle.is_running() => writer.send(data).map_err(|_| {
                NetworkError::new(
                    ErrorCode::SendFailed,
                    self.lifecycle.name(),
                    "writer task is gone",
                )
            }),
            _ => Err(NetworkError::connection_closed(self.lifecycle.name())),
        }
    }

    pub async fn stop(&self) -> NetResult<()> {
        self.canceller.cancel();
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        *self.writer.lock() = None;
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

    pub fn set_connected_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.connected_cb.set(Arc::new(callback));
    }

    pub fn set_disconnected_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.disconnected_cb.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(NetworkError) + Send + Sync + 'static) {
        self.error_cb.set(Arc::new(callback));
    }
}

impl Drop for TcpClient {
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
    async fn rejects_invalid_arguments() {
        let client = TcpClient::new("t");
        assert_eq!(
            client.start("", 80).await.unwrap_err().code,
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            client.start("localhost", 0).await.unwrap_err().code,
            ErrorCode::InvalidArgument
        );
    }

    #[tokio::test]
    async fn connect_refused_maps_to_taxonomy() {
        let client = TcpClient::new("t");
        // Nothing listens on this port.
        let err = client.start("127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(
            err.code,
            ErrorCode::ConnectionRefused | ErrorCode::IoError | ErrorCode::PermissionDenied
        ));
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn send_before_start_fails_closed() {
        let client = TcpClient::new("t");
        let err = client.send_packet(b"x".to_vec()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }
}
