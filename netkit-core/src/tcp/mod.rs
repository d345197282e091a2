//! TCP client and server, plain and TLS.
//!
//! The byte stream is opaque; no framing is imposed. Server-side peers are
//! [`TcpSession`]s registered with the shared session manager; client and
//! server both follow the lifecycle contract, including cancellable pending
//! connects.

mod client;
mod server;
mod session;

pub use client::{TcpClient, TlsClientOptions};
pub use server::{TcpServer, TlsServerOptions};
pub use session::TcpSession;
