//! HTTP/1.1 client component.

use super::HttpResponse;
use crate::error::{ErrorCode, NetResult, NetworkError};
use crate::lifecycle::{Canceller, Lifecycle};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Request/response HTTP/1.1 client.
///
/// `start` records the target and verifies it is reachable; each `request`
/// runs on its own connection, which keeps the client free of pooling state.
pub struct HttpClient {
    client_id: String,
    lifecycle: Lifecycle,
    canceller: Canceller,
    target: Mutex<Option<(String, u16)>>,
}

impl HttpClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("http_client:{client_id}")),
            canceller: Canceller::new(),
            client_id,
            target: Mutex::new(None),
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

        // Probe connectivity so start surfaces unreachable targets.
        let probe = TcpStream::connect((host, port));
        tokio::select! {
            result = probe => {
                if let Err(e) = result {
                    self.lifecycle.abort_start();
                    return Err(NetworkError::from_io(self.lifecycle.name(), "connect", e)
                        .with_details(format!("host={host} port={port}")));
                }
            }
            _ = self.canceller.cancelled() => {
                self.lifecycle.abort_start();
                return Err(NetworkError::cancelled(self.lifecycle.name()));
            }
        }

        *self.target.lock() = Some((host.to_string(), port));
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), host, port, "started");
        Ok(())
    }

    /// Issues one request against the started target.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> NetResult<HttpResponse> {
        let Some((host, port)) = self.target.lock().clone() else {
            return Err(self.lifecycle.not_running_error());
        };
        if !self.lifecycle.is_running() {
            return Err(self.lifecycle.not_running_error());
        }

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| NetworkError::from_io(self.lifecycle.name(), "connect", e))?;
        let io = TokioIo::new(stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| {
                NetworkError::new(
                    ErrorCode::ConnectionFailed,
                    self.lifecycle.name(),
                    format!("HTTP handshake failed: {e}"),
                )
            })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "http connection task ended");
            }
        });

        let mut builder = http::Request::builder()
            .method(method.as_bytes())
            .uri(path)
            .header(http::header::HOST, format!("{host}:{port}"));
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| {
                NetworkError::invalid_argument(
                    self.lifecycle.name(),
                    format!("malformed request: {e}"),
                )
            })?;

        let response = sender.send_request(request).await.map_err(|e| {
            NetworkError::new(
                ErrorCode::SendFailed,
                self.lifecycle.name(),
                format!("request failed: {e}"),
            )
        })?;

        let status = response.status().as_u16();
        let response_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                NetworkError::new(
                    ErrorCode::ReceiveFailed,
                    self.lifecycle.name(),
                    format!("response body failed: {e}"),
                )
            })?
            .to_bytes()
            .to_vec();

        Ok(HttpResponse {
            status,
            headers: response_headers,
            body,
        })
    }

    pub async fn get(&self, path: &str) -> NetResult<HttpResponse> {
        self.request("GET", path, &[], Vec::new()).await
    }

    pub async fn post(&self, path: &str, body: Vec<u8>) -> NetResult<HttpResponse> {
        self.request("POST", path, &[], body).await
    }

    pub async fn stop(&self) -> NetResult<()> {
        self.canceller.cancel();
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        *self.target.lock() = None;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn argument_validation() {
        let client = HttpClient::new("t");
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
        let client = HttpClient::new("t");
        let err = client.get("/").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotInitialized);
    }
}
