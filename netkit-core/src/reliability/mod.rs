//! Reliability layer over UDP.
//!
//! Adds four delivery modes on a datagram substrate: fire-and-forget,
//! reliable-ordered, reliable-unordered, and sequenced (newest-wins). Every
//! datagram carries a fixed 12-byte header in network byte order:
//!
//! ```text
//! 0        4        8       10       12
//! +--------+--------+--------+--------+
//! |  seq   |  ack   | flags  | length |  then `length` payload bytes
//! +--------+--------+--------+--------+
//! ```
//!
//! Reliable modes track unacknowledged packets in a pending map bounded by a
//! static congestion window, retransmit on a timer, and estimate RTT from
//! acknowledgments. Ordered mode additionally holds out-of-order arrivals in a
//! bounded reorder buffer until the contiguous prefix advances.

mod client;
mod engine;
mod server;

pub use client::ReliableUdpClient;
pub use engine::{ReliabilityEngine, ReliableUdpStats};
pub use server::ReliableUdpServer;

/// Delivery guarantees for a reliable-UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityMode {
    /// Fire once; deliver on arrival.
    Unreliable,
    /// ACK + retransmit; deliver strictly in sending order.
    ReliableOrdered,
    /// ACK + retransmit; deliver in arrival order.
    ReliableUnordered,
    /// No ACK; drop anything older than the newest delivered sequence.
    Sequenced,
}

impl ReliabilityMode {
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            ReliabilityMode::ReliableOrdered | ReliabilityMode::ReliableUnordered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReliabilityMode::Unreliable => "unreliable",
            ReliabilityMode::ReliableOrdered => "reliable_ordered",
            ReliabilityMode::ReliableUnordered => "reliable_unordered",
            ReliabilityMode::Sequenced => "sequenced",
        }
    }
}

/// Acknowledgment packet.
pub const FLAG_ACK: u16 = 0x0001;
/// Payload-bearing packet.
pub const FLAG_DATA: u16 = 0x0002;
/// Peer session open.
pub const FLAG_SYN: u16 = 0x0004;
/// Peer session close.
pub const FLAG_FIN: u16 = 0x0008;

pub const HEADER_LEN: usize = 12;

/// Fixed per-datagram header, network byte order on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub ack: u32,
    pub flags: u16,
    pub data_length: u16,
}

impl PacketHeader {
    pub fn data(sequence: u32, data_length: u16) -> Self {
        Self {
            sequence,
            ack: 0,
            flags: FLAG_DATA,
            data_length,
        }
    }

    pub fn ack(sequence: u32) -> Self {
        Self {
            sequence: 0,
            ack: sequence,
            flags: FLAG_ACK,
            data_length: 0,
        }
    }

    pub fn control(flags: u16) -> Self {
        Self {
            sequence: 0,
            ack: 0,
            flags,
            data_length: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.ack.to_be_bytes());
        buf[8..10].copy_from_slice(&self.flags.to_be_bytes());
        buf[10..12].copy_from_slice(&self.data_length.to_be_bytes());
        buf
    }

    /// Decodes the leading header; `None` when the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            sequence: u32::from_be_bytes(buf[0..4].try_into().ok()?),
            ack: u32::from_be_bytes(buf[4..8].try_into().ok()?),
            flags: u16::from_be_bytes(buf[8..10].try_into().ok()?),
            data_length: u16::from_be_bytes(buf[10..12].try_into().ok()?),
        })
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Builds a wire datagram from header + payload.
pub(crate) fn build_packet(header: PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&header.encode());
    packet.extend_from_slice(payload);
    packet
}
