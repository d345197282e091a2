//! netkit-core: unified multi-protocol network I/O.
//!
//! Clients and servers for TCP (plain and TLS), UDP (plain and
//! reliability-augmented), WebSocket, HTTP/1.1, HTTP/2, and QUIC, built on a
//! shared foundation:
//!
//! - [`error`]: the structured `{code, message, source, details}` taxonomy
//!   every fallible operation returns.
//! - [`lifecycle`]: the `initial → starting → running → stopping → stopped`
//!   machine with idempotent stop and a waitable stop future, composed into
//!   every component.
//! - [`callback`]: lock-protected callback slots invoked after copying the
//!   callable out of the lock.
//! - [`session`]: the type-erased session registry with admission control,
//!   backpressure, broadcast, and idle cleanup shared by all servers.
//! - [`runtime`]: a worker pool for embedding into synchronous programs;
//!   inside tokio the components schedule themselves.
//!
//! The QUIC connection core and the reliable-UDP layer live behind the
//! `experimental` feature (on by default).
//!
//! # Example
//!
//! ```no_run
//! use netkit_core::tcp::{TcpClient, TcpServer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), netkit_core::error::NetworkError> {
//! let server = Arc::new(TcpServer::new("echo"));
//! {
//!     let replies = Arc::clone(&server);
//!     server.set_receive_callback(move |session_id, data| {
//!         let _ = replies.send_to_session(session_id, data);
//!     });
//! }
//! server.start(41001).await?;
//!
//! let client = TcpClient::new("probe");
//! client.start("127.0.0.1", 41001).await?;
//! client.send_packet(b"ping".to_vec())?;
//! client.stop().await?;
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod error;
pub mod http1;
pub mod http2;
pub mod lifecycle;
mod pem;
#[cfg(feature = "experimental")]
pub mod quic;
#[cfg(feature = "experimental")]
pub mod reliability;
pub mod runtime;
pub mod session;
pub mod tcp;
pub mod udp;
pub mod ws;

pub use error::{ErrorCode, NetResult, NetworkError};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use session::{Session, SessionHandle, SessionManager};

// Re-export the configuration crate so downstream users need one dependency.
pub use netkit_config as config;
