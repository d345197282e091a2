//! WebSocket client component.

use crate::callback::{
    CallbackSlot, ConnectedCallback, DisconnectedCallback, ErrorCallback, ReceiveCallback,
};
use crate::error::{ErrorCode, NetResult, NetworkError};
use crate::lifecycle::{Canceller, Lifecycle};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// Text callback: complete text messages.
pub type TextCallback = dyn Fn(String) + Send + Sync;

pub struct WsClient {
    client_id: String,
    lifecycle: Lifecycle,
    canceller: Canceller,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    binary_cb: Arc<CallbackSlot<ReceiveCallback>>,
    text_cb: Arc<CallbackSlot<TextCallback>>,
    connected_cb: Arc<CallbackSlot<ConnectedCallback>>,
    disconnected_cb: Arc<CallbackSlot<DisconnectedCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
}

impl WsClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("ws_client:{client_id}")),
            canceller: Canceller::new(),
            client_id,
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            binary_cb: Arc::new(CallbackSlot::new()),
            text_cb: Arc::new(CallbackSlot::new()),
            connected_cb: Arc::new(CallbackSlot::new()),
            disconnected_cb: Arc::new(CallbackSlot::new()),
            error_cb: Arc::new(CallbackSlot::new()),
        }
    }

    /// Connects to `ws://host:port/path`; the handshake is part of start.
    pub async fn start(&self, host: &str, port: u16) -> NetResult<()> {
        self.start_with_path(host, port, "/").await
    }

    pub async fn start_with_path(&self, host: &str, port: u16, path: &str) -> NetResult<()> {
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

        let url = format!("ws://{host}:{port}{path}");
        let stream = tokio::select! {
            result = connect_async(url.as_str()) => match result {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    self.lifecycle.abort_start();
                    return Err(NetworkError::new(
                        ErrorCode::ConnectionFailed,
                        self.lifecycle.name(),
                        format!("websocket connect failed: {e}"),
                    )
                    .with_details(format!("url={url}")));
                }
            },
            _ = self.canceller.cancelled() => {
                self.lifecycle.abort_start();
                return Err(NetworkError::cancelled(self.lifecycle.name()));
            }
        };

        let (mut sink, mut source) = stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        let mut tasks = Vec::new();

        {
            let error_cb = self.error_cb.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(message) = writer_rx.recv().await {
                    if let Err(e) = sink.send(message).await {
                        if let Some(cb) = error_cb.get() {
                            cb(NetworkError::new(
                                ErrorCode::SendFailed,
                                name.clone(),
                                format!("websocket send failed: {e}"),
                            ));
                        }
                        break;
                    }
                }
                let _ = sink.close().await;
            }));
        }

        {
            let binary_cb = self.binary_cb.clone();
            let text_cb = self.text_cb.clone();
            let disconnected_cb = self.disconnected_cb.clone();
            let error_cb = self.error_cb.clone();
            let writer = writer_tx.clone();
            let name = self.lifecycle.name().to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    match message {
                        Ok(Message::Binary(data)) => {
                            if let Some(cb) = binary_cb.get() {
                                cb(data.to_vec());
                            }
                        }
                        Ok(Message::Text(text)) => {
                            if let Some(cb) = text_cb.get() {
                                cb(text.to_string());
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = writer.send(Message::Pong(payload));
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            if let Some(cb) = error_cb.get() {
                                cb(NetworkError::new(
                                    ErrorCode::ReceiveFailed,
                                    name.clone(),
                                    format!("websocket receive failed: {e}"),
                                ));
                            }
                            break;
                        }
                    }
                }
                debug!(component = %name, "websocket stream ended");
                if let Some(cb) = disconnected_cb.get() {
                    cb();
                }
            }));
        }

        *self.writer.lock() = Some(writer_tx);
        *self.tasks.lock() = tasks;
        self.lifecycle.finish_start();
        info!(component = %self.lifecycle.name(), url = %url, "connected");
        if let Some(cb) = self.connected_cb.get() {
            cb();
        }
        Ok(())
    }

    fn enqueue(&self, message: Message) -> NetResult<()> {
        let writer = self.writer.lock().clone();
        match writer {
            Some(writer) if self.lifecycle.is_running() => writer.send(message).map_err(|_| {
                NetworkError::new(
                    ErrorCode::SendFailed,
                    self.lifecycle.name(),
                    "writer task is gone",
                )
            }),
            _ => Err(NetworkError::connection_closed(self.lifecycle.name())),
        }
    }

    pub fn send_binary(&self, data: Vec<u8>) -> NetResult<()> {
        self.enqueue(Message::Binary(data.into()))
    }

    /// Alias kept for symmetry with the other clients.
    pub fn send_packet(&self, data: Vec<u8>) -> NetResult<()> {
        self.send_binary(data)
    }

    pub fn send_text(&self, text: impl Into<String>) -> NetResult<()> {
        self.enqueue(Message::Text(text.into().into()))
    }

    pub async fn stop(&self) -> NetResult<()> {
        self.canceller.cancel();
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.send(Message::Close(None));
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
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

    pub fn set_binary_callback(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.binary_cb.set(Arc::new(callback));
    }

    /// Same slot as `set_binary_callback`; name matches the other clients.
    pub fn set_receive_callback(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.binary_cb.set(Arc::new(callback));
    }

    pub fn set_text_callback(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.text_cb.set(Arc::new(callback));
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

impl Drop for WsClient {
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
        let client = WsClient::new("t");
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
    async fn send_before_start_fails_closed() {
        let client = WsClient::new("t");
        assert_eq!(
            client.send_binary(vec![1]).unwrap_err().code,
            ErrorCode::ConnectionClosed
        );
        assert_eq!(
            client.send_text("hi").unwrap_err().code,
            ErrorCode::ConnectionClosed
        );
    }
}
