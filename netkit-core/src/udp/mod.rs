//! Plain UDP client and server.
//!
//! Datagrams are opaque. The server tracks per-peer logical sessions keyed by
//! source endpoint, surfaced through the shared session manager, so admission
//! control and idle cleanup behave exactly like the stream transports.

mod client;
mod server;

pub use client::UdpClient;
pub use server::{UdpServer, UdpSession};
