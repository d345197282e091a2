//! Mode-aware send/receive engine shared by the reliable-UDP client and the
//! server's per-peer state.
//!
//! The engine is transport-agnostic: outbound datagrams are emitted on an
//! unbounded channel drained by the owning component's socket task, and
//! inbound datagrams are fed in via [`ReliabilityEngine::handle_datagram`].
//! That keeps every delivery-mode rule testable without sockets.

use super::{FLAG_ACK, FLAG_DATA, FLAG_FIN, PacketHeader, ReliabilityMode, build_packet};
use crate::callback::{CallbackSlot, ErrorCallback, ReceiveCallback};
use crate::error::{ErrorCode, NetResult, NetworkError};
use netkit_config::ReliabilityConfig;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Counters exposed by `stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReliableUdpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_retransmitted: u64,
    pub packets_dropped: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub average_rtt_ms: f64,
}

struct PendingPacket {
    data: Vec<u8>,
    first_send: Instant,
    last_send: Instant,
    retransmit_count: usize,
}

struct EngineInner {
    expected_sequence: u32,
    pending: BTreeMap<u32, PendingPacket>,
    reorder: BTreeMap<u32, Vec<u8>>,
    smoothed_rtt_ms: f64,
}

pub struct ReliabilityEngine {
    source: String,
    mode: ReliabilityMode,
    config: ReliabilityConfig,
    next_sequence: AtomicU32,
    inner: Mutex<EngineInner>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    receive_cb: Arc<CallbackSlot<ReceiveCallback>>,
    error_cb: Arc<CallbackSlot<ErrorCallback>>,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_retransmitted: AtomicU64,
    packets_dropped: AtomicU64,
    acks_sent: AtomicU64,
    acks_received: AtomicU64,
}

impl ReliabilityEngine {
    /// Creates an engine; the returned receiver yields wire datagrams the
    /// owning component must put on the socket.
    pub fn new(
        source: impl Into<String>,
        mode: ReliabilityMode,
        config: ReliabilityConfig,
        receive_cb: Arc<CallbackSlot<ReceiveCallback>>,
        error_cb: Arc<CallbackSlot<ErrorCallback>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            source: source.into(),
            mode,
            config,
            next_sequence: AtomicU32::new(1),
            inner: Mutex::new(EngineInner {
                expected_sequence: 1,
                pending: BTreeMap::new(),
                reorder: BTreeMap::new(),
                smoothed_rtt_ms: 0.0,
            }),
            outbound,
            receive_cb,
            error_cb,
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_retransmitted: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
        });
        (engine, rx)
    }

    pub fn mode(&self) -> ReliabilityMode {
        self.mode
    }

    /// The application-delivery slot, for owners that bind context (e.g. a
    /// session id) into the delivery path after construction.
    pub fn receive_slot(&self) -> Arc<CallbackSlot<ReceiveCallback>> {
        self.receive_cb.clone()
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Frames and emits an application payload per the configured mode.
    pub fn send(&self, payload: Vec<u8>) -> NetResult<()> {
        if payload.len() > u16::MAX as usize {
            return Err(NetworkError::invalid_argument(
                self.source.clone(),
                format!("payload of {} bytes exceeds datagram limit", payload.len()),
            ));
        }
        match self.mode {
            ReliabilityMode::Unreliable => {
                let header = PacketHeader::data(0, payload.len() as u16);
                self.emit(build_packet(header, &payload))?;
            }
            ReliabilityMode::ReliableOrdered | ReliabilityMode::ReliableUnordered => {
                let mut inner = self.inner.lock();
                if inner.pending.len() >= self.config.congestion_window {
                    return Err(NetworkError::new(
                        ErrorCode::InternalError,
                        self.source.clone(),
                        "congestion window full",
                    )
                    .with_details(format!("window={}", self.config.congestion_window)));
                }
                let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                let header = PacketHeader::data(seq, payload.len() as u16);
                let packet = build_packet(header, &payload);
                let now = Instant::now();
                inner.pending.insert(
                    seq,
                    PendingPacket {
                        data: packet.clone(),
                        first_send: now,
                        last_send: now,
                        retransmit_count: 0,
                    },
                );
                drop(inner);
                self.emit(packet)?;
            }
            ReliabilityMode::Sequenced => {
                let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                let header = PacketHeader::data(seq, payload.len() as u16);
                self.emit(build_packet(header, &payload))?;
            }
        }
        Ok(())
    }

    /// Emits a header-only FIN so the peer can retire this endpoint's session.
    pub fn send_fin(&self) {
        let _ = self.emit(build_packet(PacketHeader::control(FLAG_FIN), &[]));
    }

    fn emit(&self, packet: Vec<u8>) -> NetResult<()> {
        self.outbound.send(packet).map_err(|_| {
            NetworkError::new(
                ErrorCode::SendFailed,
                self.source.clone(),
                "outbound channel closed",
            )
        })?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Processes one inbound wire datagram. Returns `true` when the datagram
    /// carried FIN, signaling the owner to retire the peer.
    pub fn handle_datagram(&self, data: &[u8]) -> bool {
        let Some(header) = PacketHeader::decode(data) else {
            warn!(source = %self.source, len = data.len(), "datagram shorter than header, ignored");
            return false;
        };

        if header.has(FLAG_ACK) {
            self.handle_ack(header.ack);
            return false;
        }

        if header.has(FLAG_DATA) {
            if self.mode.is_reliable() {
                self.send_ack(header.sequence);
            }
            let payload = data[super::HEADER_LEN..].to_vec();
            self.packets_received.fetch_add(1, Ordering::Relaxed);
            match self.mode {
                ReliabilityMode::Unreliable | ReliabilityMode::ReliableUnordered => {
                    self.deliver(payload);
                }
                ReliabilityMode::ReliableOrdered => self.handle_ordered(header.sequence, payload),
                ReliabilityMode::Sequenced => self.handle_sequenced(header.sequence, payload),
            }
        }

        header.has(FLAG_FIN)
    }

    fn handle_ack(&self, sequence: u32) {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.pending.remove(&sequence) {
            let rtt_ms = pending.first_send.elapsed().as_secs_f64() * 1000.0;
            if inner.smoothed_rtt_ms == 0.0 {
                inner.smoothed_rtt_ms = rtt_ms;
            } else {
                inner.smoothed_rtt_ms = 0.875 * inner.smoothed_rtt_ms + 0.125 * rtt_ms;
            }
            self.acks_received.fetch_add(1, Ordering::Relaxed);
            trace!(source = %self.source, sequence, rtt_ms, "ack received");
        }
    }

    fn send_ack(&self, sequence: u32) {
        if self
            .outbound
            .send(build_packet(PacketHeader::ack(sequence), &[]))
            .is_ok()
        {
            self.acks_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn handle_ordered(&self, sequence: u32, payload: Vec<u8>) {
        let ready: Vec<Vec<u8>> = {
            let mut inner = self.inner.lock();
            if sequence == inner.expected_sequence {
                let mut ready = vec![payload];
                inner.expected_sequence = inner.expected_sequence.wrapping_add(1);
                // Drain everything that just became contiguous.
                loop {
                    let next = inner.expected_sequence;
                    match inner.reorder.remove(&next) {
                        Some(buffered) => {
                            ready.push(buffered);
                            inner.expected_sequence = inner.expected_sequence.wrapping_add(1);
                        }
                        None => break,
                    }
                }
                ready
            } else if sequence > inner.expected_sequence {
                if inner.reorder.len() >= self.config.reorder_buffer_limit {
                    // Bounded buffer: shedding the newest arrival keeps the
                    // hole-filling packet admissible.
                    self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(source = %self.source, sequence, "reorder buffer full, packet shed");
                } else {
                    inner.reorder.entry(sequence).or_insert(payload);
                    trace!(source = %self.source, sequence, expected = inner.expected_sequence,
                        "buffered out-of-order packet");
                }
                Vec::new()
            } else {
                trace!(source = %self.source, sequence, "duplicate packet ignored");
                Vec::new()
            }
        };
        for payload in ready {
            self.deliver(payload);
        }
    }

    fn handle_sequenced(&self, sequence: u32, payload: Vec<u8>) {
        let deliver = {
            let mut inner = self.inner.lock();
            if sequence >= inner.expected_sequence {
                inner.expected_sequence = sequence.wrapping_add(1);
                true
            } else {
                false
            }
        };
        if deliver {
            self.deliver(payload);
        } else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(source = %self.source, sequence, "stale sequenced packet dropped");
        }
    }

    fn deliver(&self, payload: Vec<u8>) {
        if let Some(cb) = self.receive_cb.get() {
            cb(payload);
        }
    }

    // ------------------------------------------------------------------
    // Timer path
    // ------------------------------------------------------------------

    /// Re-sends every pending packet older than the retransmission timeout;
    /// drops packets that exhausted `max_retries` and reports them on the
    /// error callback.
    pub fn retransmit_due(&self, now: Instant) {
        let timeout = Duration::from_millis(self.config.retransmission_timeout_ms);
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut inner = self.inner.lock();
            let due: Vec<u32> = inner
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.last_send) >= timeout)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in due {
                let Some(pending) = inner.pending.get_mut(&seq) else {
                    continue;
                };
                if pending.retransmit_count >= self.config.max_retries {
                    inner.pending.remove(&seq);
                    exhausted.push(seq);
                } else {
                    pending.retransmit_count += 1;
                    pending.last_send = now;
                    resend.push((seq, pending.data.clone()));
                }
            }
        }

        for (seq, packet) in resend {
            trace!(source = %self.source, sequence = seq, "retransmitting");
            if self.outbound.send(packet).is_ok() {
                self.packets_retransmitted.fetch_add(1, Ordering::Relaxed);
            }
        }
        for seq in exhausted {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(source = %self.source, sequence = seq, "packet dropped after max retries");
            if let Some(cb) = self.error_cb.get() {
                cb(NetworkError::new(
                    ErrorCode::NetworkError,
                    self.source.clone(),
                    format!("packet {seq} dropped after {} retries", self.config.max_retries),
                ));
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn stats(&self) -> ReliableUdpStats {
        ReliableUdpStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_retransmitted: self.packets_retransmitted.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            average_rtt_ms: self.inner.lock().smoothed_rtt_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Harness {
        engine: Arc<ReliabilityEngine>,
        outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        delivered: Arc<StdMutex<Vec<Vec<u8>>>>,
        errors: Arc<StdMutex<Vec<NetworkError>>>,
    }

    fn harness(mode: ReliabilityMode, config: ReliabilityConfig) -> Harness {
        let receive_cb = Arc::new(CallbackSlot::new());
        let error_cb = Arc::new(CallbackSlot::new());
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let errors = Arc::new(StdMutex::new(Vec::new()));
        {
            let delivered = delivered.clone();
            receive_cb.set(Arc::new(move |data: Vec<u8>| {
                delivered.lock().unwrap().push(data);
            }));
        }
        {
            let errors = errors.clone();
            error_cb.set(Arc::new(move |e: NetworkError| {
                errors.lock().unwrap().push(e);
            }));
        }
        let (engine, outbound) = ReliabilityEngine::new("test", mode, config, receive_cb, error_cb);
        Harness {
            engine,
            outbound,
            delivered,
            errors,
        }
    }

    fn data_packet(seq: u32, payload: &[u8]) -> Vec<u8> {
        build_packet(PacketHeader::data(seq, payload.len() as u16), payload)
    }

    fn drain(outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(p) = outbound.try_recv() {
            out.push(p);
        }
        out
    }

    #[test]
    fn ordered_reorder_is_transparent() {
        // Arrivals 1, 3, 2, 4 deliver as 1, 2, 3, 4; each data packet is acked.
        let mut h = harness(ReliabilityMode::ReliableOrdered, ReliabilityConfig::default());
        for seq in [1u32, 3, 2, 4] {
            h.engine.handle_datagram(&data_packet(seq, &[seq as u8]));
        }
        let delivered = h.delivered.lock().unwrap().clone();
        assert_eq!(delivered, vec![vec![1], vec![2], vec![3], vec![4]]);
        assert_eq!(h.engine.stats().acks_sent, 4);
        let acks = drain(&mut h.outbound);
        assert_eq!(acks.len(), 4);
        assert!(PacketHeader::decode(&acks[0]).unwrap().has(FLAG_ACK));
    }

    #[test]
    fn hole_blocks_until_filled_then_single_flush() {
        let h = harness(ReliabilityMode::ReliableOrdered, ReliabilityConfig::default());
        h.engine.handle_datagram(&data_packet(1, b"a"));
        h.engine.handle_datagram(&data_packet(3, b"c"));
        h.engine.handle_datagram(&data_packet(4, b"d"));
        assert_eq!(h.delivered.lock().unwrap().len(), 1);
        h.engine.handle_datagram(&data_packet(2, b"b"));
        let delivered = h.delivered.lock().unwrap().clone();
        assert_eq!(
            delivered,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn duplicates_are_ignored_but_reacked() {
        let h = harness(ReliabilityMode::ReliableOrdered, ReliabilityConfig::default());
        h.engine.handle_datagram(&data_packet(1, b"x"));
        h.engine.handle_datagram(&data_packet(1, b"x"));
        assert_eq!(h.delivered.lock().unwrap().len(), 1);
        // Duplicate still acked so the sender stops retransmitting.
        assert_eq!(h.engine.stats().acks_sent, 2);
    }

    #[test]
    fn ack_clears_pending_and_records_rtt() {
        let mut h = harness(ReliabilityMode::ReliableOrdered, ReliabilityConfig::default());
        h.engine.send(b"payload".to_vec()).unwrap();
        assert_eq!(h.engine.pending_len(), 1);
        let sent = drain(&mut h.outbound);
        let seq = PacketHeader::decode(&sent[0]).unwrap().sequence;

        h.engine
            .handle_datagram(&build_packet(PacketHeader::ack(seq), &[]));
        assert_eq!(h.engine.pending_len(), 0);
        let stats = h.engine.stats();
        assert_eq!(stats.acks_received, 1);
        assert!(stats.average_rtt_ms >= 0.0);
    }

    #[test]
    fn congestion_window_bounds_pending() {
        let config = ReliabilityConfig {
            congestion_window: 2,
            ..ReliabilityConfig::default()
        };
        let h = harness(ReliabilityMode::ReliableOrdered, config);
        h.engine.send(vec![1]).unwrap();
        h.engine.send(vec![2]).unwrap();
        let err = h.engine.send(vec![3]).unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert!(err.message.contains("congestion window"));
    }

    #[test]
    fn retransmit_then_drop_after_max_retries() {
        let config = ReliabilityConfig {
            max_retries: 2,
            retransmission_timeout_ms: 10,
            ..ReliabilityConfig::default()
        };
        let mut h = harness(ReliabilityMode::ReliableOrdered, config);
        h.engine.send(b"lost".to_vec()).unwrap();
        drain(&mut h.outbound);

        let late = Instant::now() + Duration::from_millis(20);
        h.engine.retransmit_due(late);
        h.engine.retransmit_due(late + Duration::from_millis(20));
        assert_eq!(h.engine.stats().packets_retransmitted, 2);
        assert_eq!(h.engine.pending_len(), 1);

        // Third expiry exhausts the retry budget.
        h.engine.retransmit_due(late + Duration::from_millis(40));
        assert_eq!(h.engine.pending_len(), 0);
        assert_eq!(h.engine.stats().packets_dropped, 1);
        let errors = h.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::NetworkError);
    }

    #[test]
    fn fresh_packets_are_not_retransmitted() {
        let h = harness(ReliabilityMode::ReliableOrdered, ReliabilityConfig::default());
        h.engine.send(b"fresh".to_vec()).unwrap();
        h.engine.retransmit_due(Instant::now());
        assert_eq!(h.engine.stats().packets_retransmitted, 0);
        assert_eq!(h.engine.pending_len(), 1);
    }

    #[test]
    fn unordered_delivers_on_arrival() {
        let h = harness(
            ReliabilityMode::ReliableUnordered,
            ReliabilityConfig::default(),
        );
        h.engine.handle_datagram(&data_packet(2, b"b"));
        h.engine.handle_datagram(&data_packet(1, b"a"));
        let delivered = h.delivered.lock().unwrap().clone();
        assert_eq!(delivered, vec![b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(h.engine.stats().acks_sent, 2);
    }

    #[test]
    fn sequenced_drops_stale_and_never_acks() {
        let h = harness(ReliabilityMode::Sequenced, ReliabilityConfig::default());
        h.engine.handle_datagram(&data_packet(5, b"new"));
        h.engine.handle_datagram(&data_packet(3, b"old"));
        h.engine.handle_datagram(&data_packet(6, b"newer"));
        let delivered = h.delivered.lock().unwrap().clone();
        assert_eq!(delivered, vec![b"new".to_vec(), b"newer".to_vec()]);
        let stats = h.engine.stats();
        assert_eq!(stats.acks_sent, 0);
        assert_eq!(stats.packets_dropped, 1);
    }

    #[test]
    fn unreliable_has_no_tracking() {
        let mut h = harness(ReliabilityMode::Unreliable, ReliabilityConfig::default());
        h.engine.send(b"fire".to_vec()).unwrap();
        assert_eq!(h.engine.pending_len(), 0);
        let sent = drain(&mut h.outbound);
        assert_eq!(PacketHeader::decode(&sent[0]).unwrap().sequence, 0);
        h.engine.handle_datagram(&data_packet(9, b"any"));
        assert_eq!(h.delivered.lock().unwrap().len(), 1);
        assert_eq!(h.engine.stats().acks_sent, 0);
    }

    #[test]
    fn reorder_buffer_is_bounded() {
        let config = ReliabilityConfig {
            reorder_buffer_limit: 2,
            ..ReliabilityConfig::default()
        };
        let h = harness(ReliabilityMode::ReliableOrdered, config);
        // Sequences 3..=5 while 1 is missing: the third out-of-order arrival
        // is shed.
        h.engine.handle_datagram(&data_packet(3, b"c"));
        h.engine.handle_datagram(&data_packet(4, b"d"));
        h.engine.handle_datagram(&data_packet(5, b"e"));
        assert_eq!(h.engine.stats().packets_dropped, 1);
        // The hole-filler still flushes what was kept.
        h.engine.handle_datagram(&data_packet(1, b"a"));
        h.engine.handle_datagram(&data_packet(2, b"b"));
        let delivered = h.delivered.lock().unwrap().clone();
        assert_eq!(
            delivered,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn oversized_payload_rejected() {
        let h = harness(ReliabilityMode::Unreliable, ReliabilityConfig::default());
        let err = h.engine.send(vec![0u8; u16::MAX as usize + 1]).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn fin_signals_peer_retirement() {
        let h = harness(ReliabilityMode::ReliableOrdered, ReliabilityConfig::default());
        assert!(!h.engine.handle_datagram(&data_packet(1, b"a")));
        let fin = build_packet(PacketHeader::control(FLAG_FIN), &[]);
        assert!(h.engine.handle_datagram(&fin));
    }
}
