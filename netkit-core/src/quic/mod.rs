//! QUIC (RFC 9000) client, server, and connection core.
//!
//! The wire stack is layered bottom-up: varint and header codecs
//! ([`varint`], [`packet`]), connection ids ([`cid`]), frames ([`frame`]),
//! transport parameters ([`transport_params`]), packet protection over the
//! rustls QUIC key schedule ([`crypto`]), DPLPMTUD ([`pmtud`]), stream
//! multiplexing ([`stream`]), retry tokens ([`retry`]), and the connection
//! engine ([`connection`]) that the [`client`] and [`server`] components
//! drive from their UDP sockets.

pub mod cid;
pub mod client;
pub mod connection;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod pmtud;
pub mod retry;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;
pub mod transport_params;
pub mod varint;

pub use cid::{CidStore, ConnectionId};
pub use client::QuicClient;
pub use connection::{QuicConnection, QuicConnectionStats};
pub use pmtud::{PmtudConfig, PmtudController, PmtudState};
pub use server::QuicServer;
pub use session::QuicSession;

/// CID length this endpoint uses for the ids it issues.
pub const LOCAL_CID_LEN: usize = 8;
