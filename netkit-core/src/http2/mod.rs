//! HTTP/2: frame codec plus h2-based client and server components.
//!
//! The [`frame`] module is the wire-level codec for the ten frame types the
//! core recognizes; the transport components delegate connection management,
//! HPACK, and flow control to `h2` while reusing the shared lifecycle and
//! session scaffolding.

mod client;
pub mod frame;
mod server;

pub use client::Http2Client;
pub use frame::{FrameHeader, FrameType, Http2ErrorCode, Http2Frame, SettingId};
pub use server::{Http2Server, Http2Session};
