//! Per-connection stream multiplexing: send/receive buffering, flow-control
//! windows, FIN handling, and stream-id allocation.
//!
//! Stream ids encode initiator and direction in their two low bits
//! (RFC 9000 §2.1). Receive buffers hold out-of-order segments until the
//! contiguous prefix advances; only that prefix is ever delivered, so byte
//! order within a stream is preserved end-to-end.

use crate::error::{ErrorCode, NetResult, NetworkError};
use std::collections::{BTreeMap, VecDeque};

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Bidirectional,
    Unidirectional,
}

/// Which endpoint opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInitiator {
    Local,
    Peer,
}

/// RFC 9000 §3 stream states, collapsed to the send/receive union the
/// application observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

pub fn direction_of(stream_id: u64) -> StreamDirection {
    if stream_id & 0x2 == 0 {
        StreamDirection::Bidirectional
    } else {
        StreamDirection::Unidirectional
    }
}

pub fn initiator_of(stream_id: u64, is_server: bool) -> StreamInitiator {
    let server_initiated = stream_id & 0x1 == 1;
    if server_initiated == is_server {
        StreamInitiator::Local
    } else {
        StreamInitiator::Peer
    }
}

/// A queued outbound chunk with its stream offset.
#[derive(Debug)]
struct SendChunk {
    offset: u64,
    data: Vec<u8>,
    fin: bool,
}

/// One multiplexed stream.
pub struct Stream {
    id: u64,
    state: StreamState,
    // Send side
    pending: VecDeque<SendChunk>,
    write_offset: u64,
    /// Peer-granted credit (absolute offset limit)
    send_window: u64,
    fin_sent: bool,
    // Receive side
    segments: BTreeMap<u64, Vec<u8>>,
    read_offset: u64,
    /// Credit we granted the peer (absolute offset limit)
    recv_window: u64,
    recv_window_size: u64,
    fin_offset: Option<u64>,
    fin_delivered: bool,
}

impl Stream {
    pub fn new(id: u64, send_window: u64, recv_window: u64) -> Self {
        Self {
            id,
            state: StreamState::Open,
            pending: VecDeque::new(),
            write_offset: 0,
            send_window,
            fin_sent: false,
            segments: BTreeMap::new(),
            read_offset: 0,
            recv_window,
            recv_window_size: recv_window,
            fin_offset: None,
            fin_delivered: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    // ------------------------------------------------------------------
    // Send side
    // ------------------------------------------------------------------

    /// Queues bytes for transmission; FIN half-closes the send side once the
    /// chunk drains.
    pub fn write(&mut self, data: Vec<u8>, fin: bool) -> NetResult<()> {
        if matches!(
            self.state,
            StreamState::HalfClosedLocal | StreamState::Closed
        ) || self.fin_sent
            || self.pending.back().is_some_and(|c| c.fin)
        {
            return Err(NetworkError::new(
                ErrorCode::ConnectionClosed,
                format!("stream:{}", self.id),
                "send side already closed",
            ));
        }
        let offset = self.write_offset;
        self.write_offset += data.len() as u64;
        self.pending.push_back(SendChunk { offset, data, fin });
        Ok(())
    }

    /// Pulls the next sendable chunk, bounded by `max_len` and the peer's
    /// flow-control credit. Empty chunks are only emitted to carry FIN.
    pub fn next_chunk(&mut self, max_len: usize) -> Option<(u64, Vec<u8>, bool)> {
        let chunk = self.pending.front_mut()?;
        let window_room = self.send_window.saturating_sub(chunk.offset) as usize;
        if chunk.data.is_empty() {
            // FIN-only chunk.
            let chunk = self.pending.pop_front()?;
            if chunk.fin {
                self.on_fin_sent();
            }
            return Some((chunk.offset, chunk.data, chunk.fin));
        }
        let take = chunk.data.len().min(max_len).min(window_room);
        if take == 0 {
            return None;
        }
        let offset = chunk.offset;
        if take == chunk.data.len() {
            let chunk = self.pending.pop_front()?;
            if chunk.fin {
                self.on_fin_sent();
            }
            Some((offset, chunk.data, chunk.fin))
        } else {
            let data: Vec<u8> = chunk.data.drain(..take).collect();
            chunk.offset += take as u64;
            Some((offset, data, false))
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// True when the peer's credit currently blocks this stream.
    pub fn is_send_blocked(&self) -> bool {
        self.pending
            .front()
            .is_some_and(|c| !c.data.is_empty() && c.offset >= self.send_window)
    }

    /// MAX_STREAM_DATA from the peer; credit never shrinks.
    pub fn grant_send_window(&mut self, max: u64) {
        self.send_window = self.send_window.max(max);
    }

    pub fn send_window(&self) -> u64 {
        self.send_window
    }

    fn on_fin_sent(&mut self) {
        self.fin_sent = true;
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    // ------------------------------------------------------------------
    // Receive side
    // ------------------------------------------------------------------

    /// Inserts a received segment. Returns `invalid_argument`-class errors as
    /// flow-control or final-size violations the connection escalates.
    pub fn receive(&mut self, offset: u64, data: &[u8], fin: bool) -> NetResult<()> {
        let end = offset + data.len() as u64;
        if end > self.recv_window {
            return Err(NetworkError::new(
                ErrorCode::NetworkError,
                format!("stream:{}", self.id),
                "stream flow-control limit violated",
            ));
        }
        if fin {
            match self.fin_offset {
                Some(existing) if existing != end => {
                    return Err(NetworkError::new(
                        ErrorCode::NetworkError,
                        format!("stream:{}", self.id),
                        "final size changed",
                    ));
                }
                _ => self.fin_offset = Some(end),
            }
        }
        if let Some(final_size) = self.fin_offset {
            if end > final_size {
                return Err(NetworkError::new(
                    ErrorCode::NetworkError,
                    format!("stream:{}", self.id),
                    "data beyond final size",
                ));
            }
        }
        // Drop already-delivered prefixes; keep the new tail.
        if end <= self.read_offset {
            return Ok(());
        }
        let (offset, data) = if offset < self.read_offset {
            let skip = (self.read_offset - offset) as usize;
            (self.read_offset, &data[skip..])
        } else {
            (offset, data)
        };
        self.segments.entry(offset).or_insert_with(|| data.to_vec());
        Ok(())
    }

    /// Drains the contiguous prefix. Returns the bytes plus whether FIN was
    /// just reached; FIN is reported exactly once, after the last byte.
    pub fn drain(&mut self) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        while let Some((&offset, _)) = self.segments.first_key_value() {
            if offset > self.read_offset {
                break;
            }
            let Some((offset, data)) = self.segments.pop_first() else {
                break;
            };
            let skip = (self.read_offset - offset) as usize;
            if skip < data.len() {
                out.extend_from_slice(&data[skip..]);
                self.read_offset = offset + data.len() as u64;
            }
        }
        let fin = !self.fin_delivered
            && self.fin_offset == Some(self.read_offset)
            && self.segments.is_empty();
        if fin {
            self.fin_delivered = true;
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedRemote,
                StreamState::HalfClosedLocal => StreamState::Closed,
                other => other,
            };
        }
        (out, fin)
    }

    /// Replenishes the peer's receive credit once half the window is
    /// consumed; returns the new absolute limit to advertise.
    pub fn take_window_update(&mut self) -> Option<u64> {
        let remaining = self.recv_window.saturating_sub(self.read_offset);
        if remaining * 2 < self.recv_window_size && self.fin_offset.is_none() {
            self.recv_window = self.read_offset + self.recv_window_size;
            Some(self.recv_window)
        } else {
            None
        }
    }

    /// RESET_STREAM in either direction tears the stream down.
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
        self.pending.clear();
        self.segments.clear();
    }
}

/// All streams of one connection plus id allocation state.
pub struct StreamMap {
    is_server: bool,
    streams: BTreeMap<u64, Stream>,
    next_bidi_index: u64,
    next_uni_index: u64,
    /// Peer-imposed caps on streams we may open
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,
    /// Our caps on peer-opened streams
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,
    /// Initial per-stream windows
    initial_send_window: u64,
    initial_recv_window: u64,
}

impl StreamMap {
    pub fn new(
        is_server: bool,
        local_max_streams_bidi: u64,
        local_max_streams_uni: u64,
        initial_recv_window: u64,
    ) -> Self {
        Self {
            is_server,
            streams: BTreeMap::new(),
            next_bidi_index: 0,
            next_uni_index: 0,
            // Until the peer's transport parameters arrive, nothing may open.
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            local_max_streams_bidi,
            local_max_streams_uni,
            initial_send_window: 0,
            initial_recv_window,
        }
    }

    /// Applies the peer's transport parameters.
    pub fn apply_peer_limits(
        &mut self,
        max_streams_bidi: u64,
        max_streams_uni: u64,
        initial_send_window: u64,
    ) {
        self.peer_max_streams_bidi = self.peer_max_streams_bidi.max(max_streams_bidi);
        self.peer_max_streams_uni = self.peer_max_streams_uni.max(max_streams_uni);
        self.initial_send_window = initial_send_window;
        // The handshake-time default stream picks the window up retroactively.
        for stream in self.streams.values_mut() {
            stream.grant_send_window(initial_send_window);
        }
    }

    /// MAX_STREAMS from the peer.
    pub fn grant_streams(&mut self, bidi: bool, max: u64) {
        if bidi {
            self.peer_max_streams_bidi = self.peer_max_streams_bidi.max(max);
        } else {
            self.peer_max_streams_uni = self.peer_max_streams_uni.max(max);
        }
    }

    fn local_type_bits(&self, direction: StreamDirection) -> u64 {
        let mut bits = if self.is_server { 0x1 } else { 0x0 };
        if direction == StreamDirection::Unidirectional {
            bits |= 0x2;
        }
        bits
    }

    /// Allocates the next locally initiated stream id; `stream_limit` once
    /// the peer's cap is reached.
    pub fn open(&mut self, direction: StreamDirection) -> NetResult<u64> {
        let type_bits = self.local_type_bits(direction);
        let (index, limit) = match direction {
            StreamDirection::Bidirectional => (&mut self.next_bidi_index, self.peer_max_streams_bidi),
            StreamDirection::Unidirectional => (&mut self.next_uni_index, self.peer_max_streams_uni),
        };
        if *index >= limit {
            return Err(NetworkError::new(
                ErrorCode::StreamLimit,
                "quic_streams",
                format!(
                    "peer allows {limit} {} streams",
                    match direction {
                        StreamDirection::Bidirectional => "bidirectional",
                        StreamDirection::Unidirectional => "unidirectional",
                    }
                ),
            ));
        }
        let id = (*index << 2) | type_bits;
        *index += 1;
        self.streams.insert(
            id,
            Stream::new(id, self.initial_send_window, self.initial_recv_window),
        );
        Ok(id)
    }

    /// Looks the stream up, creating peer-initiated streams on first contact.
    /// Peer streams beyond our advertised cap are a stream-limit violation.
    pub fn get_or_create(&mut self, id: u64) -> NetResult<&mut Stream> {
        let peer_initiated = initiator_of(id, self.is_server) == StreamInitiator::Peer;
        let limit = match direction_of(id) {
            StreamDirection::Bidirectional => self.local_max_streams_bidi,
            StreamDirection::Unidirectional => self.local_max_streams_uni,
        };
        if !peer_initiated {
            // Implicit local opens (e.g. the default stream) claim their
            // index so explicit opens never collide.
            let next = (id >> 2) + 1;
            match direction_of(id) {
                StreamDirection::Bidirectional => {
                    self.next_bidi_index = self.next_bidi_index.max(next)
                }
                StreamDirection::Unidirectional => {
                    self.next_uni_index = self.next_uni_index.max(next)
                }
            }
        }
        let (send_window, recv_window) = (self.initial_send_window, self.initial_recv_window);
        match self.streams.entry(id) {
            std::collections::btree_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::btree_map::Entry::Vacant(entry) => {
                if peer_initiated && (id >> 2) >= limit {
                    return Err(NetworkError::new(
                        ErrorCode::StreamLimit,
                        "quic_streams",
                        format!("peer exceeded the advertised cap of {limit} streams"),
                    ));
                }
                Ok(entry.insert(Stream::new(id, send_window, recv_window)))
            }
        }
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Drops fully closed streams.
    pub fn reap_closed(&mut self) {
        self.streams.retain(|_, s| !s.is_closed());
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_bit_layout() {
        assert_eq!(direction_of(0), StreamDirection::Bidirectional);
        assert_eq!(direction_of(2), StreamDirection::Unidirectional);
        // Client-initiated bidi stream 0: local for the client, peer for the server.
        assert_eq!(initiator_of(0, false), StreamInitiator::Local);
        assert_eq!(initiator_of(0, true), StreamInitiator::Peer);
        assert_eq!(initiator_of(1, true), StreamInitiator::Local);
        assert_eq!(initiator_of(3, true), StreamInitiator::Local);
    }

    #[test]
    fn client_ids_step_by_four() {
        let mut map = StreamMap::new(false, 100, 100, 65_536);
        map.apply_peer_limits(3, 1, 65_536);
        assert_eq!(map.open(StreamDirection::Bidirectional).unwrap(), 0);
        assert_eq!(map.open(StreamDirection::Bidirectional).unwrap(), 4);
        assert_eq!(map.open(StreamDirection::Unidirectional).unwrap(), 2);
    }

    #[test]
    fn server_ids_have_low_bit_set() {
        let mut map = StreamMap::new(true, 100, 100, 65_536);
        map.apply_peer_limits(2, 2, 65_536);
        assert_eq!(map.open(StreamDirection::Bidirectional).unwrap(), 1);
        assert_eq!(map.open(StreamDirection::Unidirectional).unwrap(), 3);
    }

    #[test]
    fn stream_limit_enforced() {
        let mut map = StreamMap::new(false, 100, 100, 65_536);
        map.apply_peer_limits(2, 0, 65_536);
        map.open(StreamDirection::Bidirectional).unwrap();
        map.open(StreamDirection::Bidirectional).unwrap();
        let err = map.open(StreamDirection::Bidirectional).unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamLimit);
        let err = map.open(StreamDirection::Unidirectional).unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamLimit);
        // MAX_STREAMS lifts the cap.
        map.grant_streams(true, 3);
        assert!(map.open(StreamDirection::Bidirectional).is_ok());
    }

    #[test]
    fn peer_streams_created_on_first_contact() {
        let mut map = StreamMap::new(true, 1, 0, 65_536);
        // Client bidi stream 0 is admissible under the cap of 1.
        assert!(map.get_or_create(0).is_ok());
        // Client bidi stream 4 (index 1) exceeds the cap.
        let err = map.get_or_create(4).unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamLimit);
    }

    #[test]
    fn out_of_order_segments_drain_in_order() {
        let mut stream = Stream::new(0, 1000, 1000);
        stream.receive(3, b"def", false).unwrap();
        let (bytes, fin) = stream.drain();
        assert!(bytes.is_empty());
        assert!(!fin);

        stream.receive(0, b"abc", false).unwrap();
        let (bytes, fin) = stream.drain();
        assert_eq!(bytes, b"abcdef");
        assert!(!fin);
    }

    #[test]
    fn fin_reported_once_after_last_byte() {
        let mut stream = Stream::new(0, 1000, 1000);
        stream.receive(0, b"ab", false).unwrap();
        stream.receive(2, b"cd", true).unwrap();
        let (bytes, fin) = stream.drain();
        assert_eq!(bytes, b"abcd");
        assert!(fin);
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);

        let (bytes, fin) = stream.drain();
        assert!(bytes.is_empty());
        assert!(!fin, "FIN must be observed exactly once");
    }

    #[test]
    fn fin_with_gap_waits_for_hole() {
        let mut stream = Stream::new(0, 1000, 1000);
        stream.receive(2, b"cd", true).unwrap();
        let (bytes, fin) = stream.drain();
        assert!(bytes.is_empty());
        assert!(!fin);
        stream.receive(0, b"ab", false).unwrap();
        let (bytes, fin) = stream.drain();
        assert_eq!(bytes, b"abcd");
        assert!(fin);
    }

    #[test]
    fn duplicate_and_overlapping_segments() {
        let mut stream = Stream::new(0, 1000, 1000);
        stream.receive(0, b"abcd", false).unwrap();
        assert_eq!(stream.drain().0, b"abcd");
        // Full duplicate: ignored.
        stream.receive(0, b"abcd", false).unwrap();
        assert!(stream.drain().0.is_empty());
        // Overlap: only the new tail is delivered.
        stream.receive(2, b"cdef", false).unwrap();
        assert_eq!(stream.drain().0, b"ef");
    }

    #[test]
    fn flow_control_violation_detected() {
        let mut stream = Stream::new(0, 1000, 4);
        assert!(stream.receive(0, b"abcd", false).is_ok());
        assert!(stream.receive(4, b"e", false).is_err());
    }

    #[test]
    fn final_size_must_be_stable() {
        let mut stream = Stream::new(0, 1000, 1000);
        stream.receive(0, b"ab", true).unwrap();
        assert!(stream.receive(0, b"abc", true).is_err());
        assert!(stream.receive(5, b"xy", false).is_err());
    }

    #[test]
    fn send_respects_peer_window() {
        let mut stream = Stream::new(0, 4, 1000);
        stream.write(b"abcdef".to_vec(), false).unwrap();
        let (offset, data, fin) = stream.next_chunk(100).unwrap();
        assert_eq!((offset, data.as_slice(), fin), (0, &b"abcd"[..], false));
        // Window exhausted.
        assert!(stream.next_chunk(100).is_none());
        assert!(stream.is_send_blocked());
        stream.grant_send_window(6);
        let (offset, data, _) = stream.next_chunk(100).unwrap();
        assert_eq!((offset, data.as_slice()), (4, &b"ef"[..]));
    }

    #[test]
    fn fin_half_closes_send_side() {
        let mut stream = Stream::new(0, 1000, 1000);
        stream.write(b"xy".to_vec(), true).unwrap();
        let (_, _, fin) = stream.next_chunk(100).unwrap();
        assert!(fin);
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(stream.write(b"more".to_vec(), false).is_err());

        // Receiving FIN afterwards fully closes.
        stream.receive(0, b"", true).unwrap();
        let (_, fin) = stream.drain();
        assert!(fin);
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn window_update_after_half_consumed() {
        let mut stream = Stream::new(0, 1000, 8);
        assert!(stream.take_window_update().is_none());
        stream.receive(0, b"abcdef", false).unwrap();
        stream.drain();
        let update = stream.take_window_update().unwrap();
        assert_eq!(update, 6 + 8);
    }
}
