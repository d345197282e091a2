//! HTTP/2 client component over h2 (prior-knowledge cleartext).

use crate::error::{ErrorCode, NetResult, NetworkError};
use crate::http1::HttpResponse;
use crate::lifecycle::{Canceller, Lifecycle};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Multiplexing HTTP/2 client; one connection carries every request.
pub struct Http2Client {
    client_id: String,
    lifecycle: Lifecycle,
    canceller: Canceller,
    sender: tokio::sync::Mutex<Option<h2::client::SendRequest<Bytes>>>,
    authority: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Http2Client {
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("http2_client:{client_id}")),
            canceller: Canceller::new(),
            client_id,
            sender: tokio::sync::Mutex::new(None),
            authority: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
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

        let connect = async {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| NetworkError::from_io(self.lifecycle.name(), "connect", e))?;
            h2::client::handshake(stream).await.map_err(|e| {
                NetworkError::new(
                    ErrorCode::HandshakeFailed,
                    self.lifecycle.name(),
                    format!("HTTP/2 handshake failed: {e}"),
                )
            })
        };
        let (sender, connection) = tokio::select! {
            result = connect => match result {
                Ok(pair) => pair,
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
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(component = %name, error = %e, "connection task ended");
                }
            }));
        }

        *self.sender.lock().await = Some(sender);
        *self.authority.lock() = Some(format!("{host}:{port}"));
        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), host, port, "connected");
        Ok(())
    }

    /// Issues one request on the multiplexed connection.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Vec<u8>,
    ) -> NetResult<HttpResponse> {
        let authority = self
            .authority
            .lock()
            .clone()
            .ok_or_else(|| self.lifecycle.not_running_error())?;
        let mut guard = self.sender.lock().await;
        let sender = guard
            .as_mut()
            .ok_or_else(|| self.lifecycle.not_running_error())?;
        let mut ready = sender.clone().ready().await.map_err(|e| {
            NetworkError::new(
                ErrorCode::SendFailed,
                self.lifecycle.name(),
                format!("connection not ready: {e}"),
            )
        })?;
        drop(guard);

        let request = http::Request::builder()
            .method(method.as_bytes())
            .uri(format!("http://{authority}{path}"))
            .body(())
            .map_err(|e| {
                NetworkError::invalid_argument(
                    self.lifecycle.name(),
                    format!("malformed request: {e}"),
                )
            })?;
        let end_of_stream = body.is_empty();
        let (response, mut send_stream) = ready.send_request(request, end_of_stream).map_err(|e| {
            NetworkError::new(
                ErrorCode::SendFailed,
                self.lifecycle.name(),
                format!("request failed: {e}"),
            )
        })?;
        if !end_of_stream {
            send_stream.send_data(Bytes::from(body), true).map_err(|e| {
                NetworkError::new(
                    ErrorCode::SendFailed,
                    self.lifecycle.name(),
                    format!("body send failed: {e}"),
                )
            })?;
        }

        let response = response.await.map_err(|e| {
            NetworkError::new(
                ErrorCode::ReceiveFailed,
                self.lifecycle.name(),
                format!("response failed: {e}"),
            )
        })?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut recv = response.into_body();
        let mut body = Vec::new();
        while let Some(chunk) = recv.data().await {
            let chunk = chunk.map_err(|e| {
                NetworkError::new(
                    ErrorCode::ReceiveFailed,
                    self.lifecycle.name(),
                    format!("body receive failed: {e}"),
                )
            })?;
            body.extend_from_slice(&chunk);
            let _ = recv.flow_control().release_capacity(chunk.len());
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    pub async fn get(&self, path: &str) -> NetResult<HttpResponse> {
        self.request("GET", path, Vec::new()).await
    }

    pub async fn stop(&self) -> NetResult<()> {
        self.canceller.cancel();
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        *self.sender.lock().await = None;
        *self.authority.lock() = None;
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
}

impl Drop for Http2Client {
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
        let client = Http2Client::new("t");
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
    async fn request_before_start_is_rejected() {
        let client = Http2Client::new("t");
        let err = client.get("/").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotInitialized);
    }
}
