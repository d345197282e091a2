//! Connection identifiers and the per-endpoint CID store.

use crate::error::{NetResult, NetworkError};
use rand::RngCore;
use std::collections::HashSet;
use std::fmt;

/// Maximum CID length permitted by QUIC v1.
pub const MAX_CID_LEN: usize = 20;

/// An opaque connection identifier, 0–20 bytes, immutable after allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    /// Wraps raw bytes; `invalid_argument` beyond 20 bytes.
    pub fn new(bytes: &[u8]) -> NetResult<Self> {
        if bytes.len() > MAX_CID_LEN {
            return Err(NetworkError::invalid_argument(
                "connection_id",
                format!("cid of {} bytes exceeds the 20-byte limit", bytes.len()),
            ));
        }
        let mut buf = [0u8; MAX_CID_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            len: bytes.len() as u8,
            bytes: buf,
        })
    }

    /// The zero-length CID.
    pub fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0u8; MAX_CID_LEN],
        }
    }

    /// A fresh random CID of `len` bytes (clamped to the limit).
    pub fn random(len: usize) -> Self {
        let len = len.min(MAX_CID_LEN);
        let mut bytes = [0u8; MAX_CID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid({self})")
    }
}

/// Allocation, lookup, and retirement of an endpoint's local CIDs.
///
/// Retired CIDs stay remembered so packets already in flight when the peer
/// retired the id can still be attributed to the connection instead of being
/// treated as unknown.
pub struct CidStore {
    cid_len: usize,
    active: Vec<(u64, ConnectionId)>,
    retired: HashSet<ConnectionId>,
    next_seq: u64,
}

impl CidStore {
    pub fn new(cid_len: usize) -> Self {
        Self {
            cid_len: cid_len.min(MAX_CID_LEN),
            active: Vec::new(),
            retired: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Allocates a fresh CID with its sequence number.
    pub fn issue(&mut self) -> (u64, ConnectionId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let cid = ConnectionId::random(self.cid_len);
        self.active.push((seq, cid));
        (seq, cid)
    }

    /// Registers an externally chosen CID (e.g. the handshake-time one).
    pub fn adopt(&mut self, cid: ConnectionId) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.active.push((seq, cid));
        seq
    }

    /// Marks the CID with `seq` unusable; keeps it remembered.
    pub fn retire(&mut self, seq: u64) -> bool {
        if let Some(pos) = self.active.iter().position(|(s, _)| *s == seq) {
            let (_, cid) = self.active.remove(pos);
            self.retired.insert(cid);
            true
        } else {
            false
        }
    }

    pub fn is_active(&self, cid: &ConnectionId) -> bool {
        self.active.iter().any(|(_, c)| c == cid)
    }

    pub fn was_retired(&self, cid: &ConnectionId) -> bool {
        self.retired.contains(cid)
    }

    /// True when the CID is active or merely retired (in-flight arrivals).
    pub fn recognizes(&self, cid: &ConnectionId) -> bool {
        self.is_active(cid) || self.was_retired(cid)
    }

    pub fn active_cids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.active.iter().map(|(_, c)| c)
    }

    pub fn cid_len(&self) -> usize {
        self.cid_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_bounds() {
        assert!(ConnectionId::new(&[0u8; 21]).is_err());
        let cid = ConnectionId::new(&[0u8; 20]).unwrap();
        assert_eq!(cid.len(), 20);
        let empty = ConnectionId::new(&[]).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty, ConnectionId::empty());
    }

    #[test]
    fn display_is_hex() {
        let cid = ConnectionId::new(&[0xde, 0xad, 0x01]).unwrap();
        assert_eq!(cid.to_string(), "dead01");
    }

    #[test]
    fn random_cids_differ() {
        let a = ConnectionId::random(8);
        let b = ConnectionId::random(8);
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn retirement_keeps_memory() {
        let mut store = CidStore::new(8);
        let (seq, cid) = store.issue();
        assert!(store.is_active(&cid));
        assert!(store.retire(seq));
        assert!(!store.is_active(&cid));
        assert!(store.was_retired(&cid));
        assert!(store.recognizes(&cid));
        // Retiring twice fails quietly.
        assert!(!store.retire(seq));
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut store = CidStore::new(8);
        let (s0, _) = store.issue();
        let (s1, _) = store.issue();
        let s2 = store.adopt(ConnectionId::random(8));
        assert_eq!((s0, s1, s2), (0, 1, 2));
    }
}
