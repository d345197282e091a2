//! WebSocket (RFC 6455) client and server over tokio-tungstenite.
//!
//! Framing is the library's concern; the application sees reassembled text
//! and binary messages. Server peers are sessions in the shared manager.

mod client;
mod server;

pub use client::WsClient;
pub use server::{WsServer, WsSession};
