//! The per-peer QUIC connection engine.
//!
//! Owns packet spaces, stream multiplexing, flow control, loss recovery, path
//! MTU discovery, and the rustls handshake. The engine is sans-socket: sealed
//! datagrams go out on an unbounded channel the owning component pumps onto
//! its UDP socket, and application-visible happenings go out as
//! [`ConnEvent`]s the component turns into callbacks. Every entry point locks
//! the single connection mutex, mutates, flushes, and releases before any
//! user code runs.

use super::cid::ConnectionId;
use super::crypto::{self, PN_LEN};
use super::frame::{self, Frame};
use super::packet::{
    Header, LongHeader, LongPacketType, ParsedHeader, QUIC_VERSION_1, RetryPacket, ShortHeader,
};
use super::pmtud::{PmtudConfig, PmtudController};
use super::stream::{StreamDirection, StreamMap};
use super::transport_params::TransportParams;
use crate::error::{ErrorCode, NetResult, NetworkError};
use parking_lot::Mutex;
use rustls::Side;
use rustls::quic::{DirectionalKeys, Keys, Version};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Application-visible connection happenings, dispatched outside the lock.
#[derive(Debug)]
pub enum ConnEvent {
    HandshakeComplete { alpn: Option<String> },
    StreamData { stream_id: u64, data: Vec<u8>, fin: bool },
    EarlyDataAccepted(bool),
    Closed { error_code: u64, reason: String, by_peer: bool },
}

/// Atomically maintained connection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuicConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub smoothed_rtt: Duration,
    pub min_rtt: Duration,
    pub cwnd: usize,
}

/// Engine-level tunables derived from the public QUIC configs.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub idle_timeout: Duration,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Initial = 0,
    Handshake = 1,
    App = 2,
}

const SPACES: [Space; 3] = [Space::Initial, Space::Handshake, Space::App];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Handshaking,
    Established,
    Draining { by_peer: bool },
    Closed,
}

struct SentPacket {
    frames: Vec<Frame>,
    size: usize,
    time: Instant,
    ack_eliciting: bool,
    probe_size: Option<usize>,
}

#[derive(Default)]
struct CryptoAssembler {
    segments: BTreeMap<u64, Vec<u8>>,
    offset: u64,
}

impl CryptoAssembler {
    fn insert(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        if end <= self.offset {
            return;
        }
        let (offset, data) = if offset < self.offset {
            let skip = (self.offset - offset) as usize;
            (self.offset, &data[skip..])
        } else {
            (offset, data)
        };
        self.segments.entry(offset).or_insert_with(|| data.to_vec());
    }

    fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((&offset, _)) = self.segments.first_key_value() {
            if offset > self.offset {
                break;
            }
            let Some((offset, data)) = self.segments.pop_first() else {
                break;
            };
            let skip = (self.offset - offset) as usize;
            if skip < data.len() {
                out.extend_from_slice(&data[skip..]);
                self.offset = offset + data.len() as u64;
            }
        }
        out
    }
}

#[derive(Default)]
struct PacketSpace {
    next_pn: u64,
    largest_recv: Option<u64>,
    /// Ascending, disjoint (lo, hi) received ranges; capped
    recv_ranges: Vec<(u64, u64)>,
    ack_pending: bool,
    sent: BTreeMap<u64, SentPacket>,
    lost_frames: Vec<Frame>,
    crypto_out: Vec<u8>,
    crypto_out_offset: u64,
    crypto_recv: CryptoAssembler,
}

impl PacketSpace {
    /// Records a received packet number; false for duplicates.
    fn note_received(&mut self, pn: u64) -> bool {
        if self
            .recv_ranges
            .iter()
            .any(|&(lo, hi)| pn >= lo && pn <= hi)
        {
            return false;
        }
        self.recv_ranges.push((pn, pn));
        self.recv_ranges.sort_unstable();
        // Merge adjacent ranges.
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.recv_ranges.len());
        for &(lo, hi) in &self.recv_ranges {
            match merged.last_mut() {
                Some(last) if lo <= last.1 + 1 => last.1 = last.1.max(hi),
                _ => merged.push((lo, hi)),
            }
        }
        if merged.len() > 32 {
            let excess = merged.len() - 32;
            merged.drain(..excess);
        }
        self.recv_ranges = merged;
        self.largest_recv = Some(self.largest_recv.map_or(pn, |l| l.max(pn)));
        true
    }

    fn ack_frame(&self) -> Option<Frame> {
        let desc: Vec<(u64, u64)> = self.recv_ranges.iter().rev().copied().collect();
        Frame::ack_from_ranges(0, &desc)
    }
}

const MIN_MTU: usize = 1200;
const INITIAL_CWND: usize = 12_000;
const MAX_CWND: usize = 1 << 20;
const MIN_CWND: usize = 2 * MIN_MTU;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(600);
const STREAM_FRAME_OVERHEAD: usize = 24;

struct ConnInner {
    side: Side,
    source: String,
    state: ConnState,
    tls: rustls::quic::Connection,
    local_cid: ConnectionId,
    remote_cid: ConnectionId,
    odcid: ConnectionId,
    token: Vec<u8>,
    retry_received: bool,
    initial_keys: Option<Keys>,
    hs_keys: Option<Keys>,
    app_keys: Option<Keys>,
    early_data_attempted: bool,
    early_data_reported: bool,
    crypto_space: Space,
    spaces: [PacketSpace; 3],
    streams: StreamMap,
    // Connection-level flow control
    max_data_remote: u64,
    data_sent: u64,
    max_data_local: u64,
    data_recvd: u64,
    local_window: u64,
    pending_frames: Vec<Frame>,
    // Loss and congestion
    srtt: Option<Duration>,
    min_rtt: Option<Duration>,
    cwnd: usize,
    bytes_in_flight: usize,
    pmtud: PmtudController,
    idle_timeout: Duration,
    last_activity: Instant,
    drain_until: Option<Instant>,
    handshake_done_queued: bool,
    handshake_done_received: bool,
    handshake_event_emitted: bool,
    close_event_emitted: bool,
    // Statistics
    bytes_sent: u64,
    bytes_received: u64,
    packets_sent: u64,
    packets_received: u64,
    packets_lost: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::UnboundedSender<ConnEvent>,
}

/// One QUIC connection to one peer.
pub struct QuicConnection {
    inner: Mutex<ConnInner>,
}

impl QuicConnection {
    /// Client-side connection; emits the first flight immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn new_client(
        source: impl Into<String>,
        tls_config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
        params: ConnectionParams,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> NetResult<(Arc<Self>, ConnectionId)> {
        let source = source.into();
        let local_cid = ConnectionId::random(8);
        let remote_cid = ConnectionId::random(8);

        let mut tp = TransportParams {
            max_idle_timeout_ms: params.idle_timeout.as_millis() as u64,
            initial_max_data: params.initial_max_data,
            initial_max_stream_data_bidi_local: params.initial_max_stream_data,
            initial_max_stream_data_bidi_remote: params.initial_max_stream_data,
            initial_max_stream_data_uni: params.initial_max_stream_data,
            initial_max_streams_bidi: params.initial_max_streams_bidi,
            initial_max_streams_uni: params.initial_max_streams_uni,
            ..TransportParams::default()
        };
        tp.initial_source_connection_id = Some(local_cid);

        let tls = rustls::quic::ClientConnection::new(
            tls_config,
            Version::V1,
            server_name,
            tp.encode(),
        )
        .map_err(|e| {
            NetworkError::new(
                ErrorCode::HandshakeFailed,
                source.clone(),
                format!("TLS client setup failed: {e}"),
            )
        })?;

        let initial_keys = crypto::initial_keys(&remote_cid, Side::Client)?;
        let inner = ConnInner::new(
            Side::Client,
            source,
            rustls::quic::Connection::Client(tls),
            local_cid,
            remote_cid,
            remote_cid,
            initial_keys,
            params,
            outbound,
            events,
        );
        let conn = Arc::new(Self {
            inner: Mutex::new(inner),
        });
        {
            let mut inner = conn.inner.lock();
            inner.pump_tls();
            inner.flush(Instant::now());
        }
        Ok((conn, local_cid))
    }

    /// Server-side connection for a validated Initial packet.
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        source: impl Into<String>,
        tls_config: Arc<rustls::ServerConfig>,
        params: ConnectionParams,
        packet_dcid: ConnectionId,
        client_scid: ConnectionId,
        odcid: ConnectionId,
        retry_scid: Option<ConnectionId>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> NetResult<(Arc<Self>, ConnectionId)> {
        let source = source.into();
        let local_cid = ConnectionId::random(8);

        let mut tp = TransportParams {
            max_idle_timeout_ms: params.idle_timeout.as_millis() as u64,
            initial_max_data: params.initial_max_data,
            initial_max_stream_data_bidi_local: params.initial_max_stream_data,
            initial_max_stream_data_bidi_remote: params.initial_max_stream_data,
            initial_max_stream_data_uni: params.initial_max_stream_data,
            initial_max_streams_bidi: params.initial_max_streams_bidi,
            initial_max_streams_uni: params.initial_max_streams_uni,
            ..TransportParams::default()
        };
        tp.initial_source_connection_id = Some(local_cid);
        tp.original_destination_connection_id = Some(odcid);
        tp.retry_source_connection_id = retry_scid;

        let tls = rustls::quic::ServerConnection::new(tls_config, Version::V1, tp.encode())
            .map_err(|e| {
                NetworkError::new(
                    ErrorCode::HandshakeFailed,
                    source.clone(),
                    format!("TLS server setup failed: {e}"),
                )
            })?;

        // Initial keys derive from the DCID of the client's first Initial.
        let initial_keys = crypto::initial_keys(&packet_dcid, Side::Server)?;
        let inner = ConnInner::new(
            Side::Server,
            source,
            rustls::quic::Connection::Server(tls),
            local_cid,
            client_scid,
            odcid,
            initial_keys,
            params,
            outbound,
            events,
        );
        let conn = Arc::new(Self {
            inner: Mutex::new(inner),
        });
        Ok((conn, local_cid))
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    /// Feeds one raw UDP datagram into the engine.
    pub fn handle_datagram(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.handle_datagram(data);
        inner.flush(Instant::now());
    }

    /// Drives timers: loss detection, idle timeout, PMTUD, drain expiry.
    pub fn on_timer(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.on_timer(now);
        inner.flush(now);
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    /// Sends on the default stream (stream id 0).
    pub fn send_default(&self, data: Vec<u8>) -> NetResult<()> {
        self.send_on_stream(0, data, false)
    }

    pub fn send_on_stream(&self, stream_id: u64, data: Vec<u8>, fin: bool) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ConnState::Draining { .. } | ConnState::Closed) {
            return Err(NetworkError::connection_closed(inner.source.clone()));
        }
        inner.streams.get_or_create(stream_id)?.write(data, fin)?;
        inner.flush(Instant::now());
        Ok(())
    }

    pub fn create_stream(&self) -> NetResult<u64> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ConnState::Draining { .. } | ConnState::Closed) {
            return Err(NetworkError::connection_closed(inner.source.clone()));
        }
        inner.streams.open(StreamDirection::Bidirectional)
    }

    pub fn create_unidirectional_stream(&self) -> NetResult<u64> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ConnState::Draining { .. } | ConnState::Closed) {
            return Err(NetworkError::connection_closed(inner.source.clone()));
        }
        inner.streams.open(StreamDirection::Unidirectional)
    }

    /// Sends FIN on the stream's send side and lets the state machine run
    /// toward closed.
    pub fn close_stream(&self, stream_id: u64) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.get_mut(stream_id) {
            let _ = stream.write(Vec::new(), true);
        }
        inner.flush(Instant::now());
        Ok(())
    }

    /// Initiates connection close; the connection drains before removal.
    pub fn close(&self, error_code: u64, reason: &str) {
        let mut inner = self.inner.lock();
        inner.local_close(error_code, reason);
    }

    /// Pre-handshake 0-RTT application data, sendable only while rustls has
    /// yielded early-data keys.
    pub fn send_early_data(&self, data: Vec<u8>) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if !inner.zero_rtt_available() {
            return Err(NetworkError::new(
                ErrorCode::NotInitialized,
                inner.source.clone(),
                "0-RTT keys are not available",
            ));
        }
        inner.early_data_attempted = true;
        // Provisional credit standing in for the remembered transport
        // parameters of the resumed session; the server's real values take
        // over at handshake completion.
        let provisional = data.len() as u64;
        inner.max_data_remote = inner.max_data_remote.max(provisional);
        inner.streams.apply_peer_limits(1, 0, provisional);
        inner.streams.get_or_create(0)?.write(data, false)?;
        inner.flush(Instant::now());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_established(&self) -> bool {
        self.inner.lock().state == ConnState::Established
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.inner.lock().state,
            ConnState::Draining { .. } | ConnState::Closed
        )
    }

    /// True once the drain period has fully elapsed and the owner should
    /// remove the connection from its table.
    pub fn should_remove(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            ConnState::Closed => true,
            ConnState::Draining { .. } => inner.drain_until.is_some_and(|until| now >= until),
            _ => false,
        }
    }

    pub fn alpn_protocol(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .tls
            .alpn_protocol()
            .map(|alpn| String::from_utf8_lossy(alpn).into_owned())
    }

    pub fn zero_rtt_available(&self) -> bool {
        self.inner.lock().zero_rtt_available()
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.inner.lock().local_cid
    }

    pub fn remote_cid(&self) -> ConnectionId {
        self.inner.lock().remote_cid
    }

    pub fn stats(&self) -> QuicConnectionStats {
        let inner = self.inner.lock();
        QuicConnectionStats {
            bytes_sent: inner.bytes_sent,
            bytes_received: inner.bytes_received,
            packets_sent: inner.packets_sent,
            packets_received: inner.packets_received,
            packets_lost: inner.packets_lost,
            smoothed_rtt: inner.srtt.unwrap_or_default(),
            min_rtt: inner.min_rtt.unwrap_or_default(),
            cwnd: inner.cwnd,
        }
    }
}

impl ConnInner {
    #[allow(clippy::too_many_arguments)]
    fn new(
        side: Side,
        source: String,
        tls: rustls::quic::Connection,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        odcid: ConnectionId,
        initial_keys: Keys,
        params: ConnectionParams,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Self {
        let mut pmtud = PmtudController::new(PmtudConfig::default());
        pmtud.enable();
        Self {
            side,
            source,
            state: ConnState::Handshaking,
            tls,
            local_cid,
            remote_cid,
            odcid,
            token: Vec::new(),
            retry_received: false,
            initial_keys: Some(initial_keys),
            hs_keys: None,
            app_keys: None,
            early_data_attempted: false,
            early_data_reported: false,
            crypto_space: Space::Initial,
            spaces: [
                PacketSpace::default(),
                PacketSpace::default(),
                PacketSpace::default(),
            ],
            streams: StreamMap::new(
                side == Side::Server,
                params.initial_max_streams_bidi,
                params.initial_max_streams_uni,
                params.initial_max_stream_data,
            ),
            max_data_remote: 0,
            data_sent: 0,
            max_data_local: params.initial_max_data,
            data_recvd: 0,
            local_window: params.initial_max_data,
            pending_frames: Vec::new(),
            srtt: None,
            min_rtt: None,
            cwnd: INITIAL_CWND,
            bytes_in_flight: 0,
            pmtud,
            idle_timeout: params.idle_timeout,
            last_activity: Instant::now(),
            drain_until: None,
            handshake_done_queued: false,
            handshake_done_received: false,
            handshake_event_emitted: false,
            close_event_emitted: false,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            outbound,
            events,
        }
    }

    fn space(&mut self, space: Space) -> &mut PacketSpace {
        &mut self.spaces[space as usize]
    }

    fn zero_rtt_available(&self) -> bool {
        self.side == Side::Client
            && self.state == ConnState::Handshaking
            && self.tls.zero_rtt_keys().is_some()
    }

    fn emit(&mut self, event: ConnEvent) {
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // TLS pump
    // ------------------------------------------------------------------

    /// Drains handshake bytes out of rustls into per-space CRYPTO buffers and
    /// applies key changes.
    fn pump_tls(&mut self) {
        loop {
            let mut buf = Vec::new();
            let key_change = self.tls.write_hs(&mut buf);
            if !buf.is_empty() {
                let space = self.crypto_space;
                self.space(space).crypto_out.extend_from_slice(&buf);
            }
            match key_change {
                Some(rustls::quic::KeyChange::Handshake { keys }) => {
                    self.hs_keys = Some(keys);
                    self.crypto_space = Space::Handshake;
                }
                Some(rustls::quic::KeyChange::OneRtt { keys, next: _next }) => {
                    self.app_keys = Some(keys);
                    self.crypto_space = Space::App;
                }
                None => {
                    if buf.is_empty() {
                        break;
                    }
                }
            }
        }

        if self.state == ConnState::Handshaking
            && !self.tls.is_handshaking()
            && self.app_keys.is_some()
        {
            self.on_established();
        }
    }

    fn on_established(&mut self) {
        self.state = ConnState::Established;
        if let Some(params) = self
            .tls
            .quic_transport_parameters()
            .and_then(TransportParams::parse)
        {
            self.max_data_remote = self.max_data_remote.max(params.initial_max_data);
            self.streams.apply_peer_limits(
                params.initial_max_streams_bidi,
                params.initial_max_streams_uni,
                // Peer's per-stream credit for streams we write to.
                params
                    .initial_max_stream_data_bidi_remote
                    .max(params.initial_max_stream_data_bidi_local),
            );
            if params.max_idle_timeout_ms > 0 {
                let peer_idle = Duration::from_millis(params.max_idle_timeout_ms);
                self.idle_timeout = self.idle_timeout.min(peer_idle);
            }
        }
        if self.side == Side::Server {
            self.handshake_done_queued = true;
        }
        // Initial keys are done with as soon as the handshake confirms.
        self.initial_keys = None;
        self.spaces[Space::Initial as usize].sent.clear();
        if self.side == Side::Server {
            self.hs_keys = None;
            self.spaces[Space::Handshake as usize].sent.clear();
        }

        if !self.handshake_event_emitted {
            self.handshake_event_emitted = true;
            let alpn = self
                .tls
                .alpn_protocol()
                .map(|a| String::from_utf8_lossy(a).into_owned());
            debug!(component = %self.source, alpn = ?alpn, "handshake complete");
            self.emit(ConnEvent::HandshakeComplete { alpn });
        }

        if self.early_data_attempted && !self.early_data_reported {
            self.early_data_reported = true;
            let accepted = match &self.tls {
                rustls::quic::Connection::Client(client) => client.is_early_data_accepted(),
                rustls::quic::Connection::Server(_) => true,
            };
            self.emit(ConnEvent::EarlyDataAccepted(accepted));
        }
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    fn handle_datagram(&mut self, data: &[u8]) {
        if self.state == ConnState::Closed {
            return;
        }
        if let ConnState::Draining { .. } = self.state {
            // Only CONNECTION_CLOSE leaves a draining endpoint.
            self.queue_close_frame();
            return;
        }
        self.bytes_received += data.len() as u64;
        self.last_activity = Instant::now();

        let mut offset = 0;
        while offset < data.len() {
            let slice = &data[offset..];
            let Some(parsed) = Header::parse(slice, self.local_cid.len()) else {
                // Unparseable header: drop the rest of the datagram silently.
                return;
            };
            match parsed {
                ParsedHeader {
                    header: Header::VersionNegotiation(_),
                    ..
                } => {
                    if self.side == Side::Client && self.state == ConnState::Handshaking {
                        warn!(component = %self.source, "server offered no common version");
                        self.close_event_emitted = true;
                        self.state = ConnState::Closed;
                        self.emit(ConnEvent::Closed {
                            error_code: 0,
                            reason: "version negotiation: no common version".into(),
                            by_peer: true,
                        });
                    }
                    return;
                }
                ParsedHeader {
                    header: Header::Retry(retry),
                    ..
                } => {
                    // Integrity covers the bytes as received, not a
                    // re-serialization.
                    self.handle_retry(retry, slice);
                    return;
                }
                ParsedHeader {
                    header: Header::Long(long),
                    pn_offset,
                } => {
                    let packet_len = pn_offset + long.length as usize;
                    let packet = &slice[..packet_len];
                    self.process_packet(&long.space(), packet, pn_offset, Some(&long));
                    offset += packet_len;
                }
                ParsedHeader {
                    header: Header::Short(_),
                    pn_offset,
                } => {
                    // A short-header packet runs to the end of the datagram.
                    self.process_packet(&Space::App, slice, pn_offset, None);
                    return;
                }
            }
        }
    }

    fn handle_retry(&mut self, retry: RetryPacket, raw: &[u8]) {
        if self.side != Side::Client || self.retry_received || self.state != ConnState::Handshaking
        {
            return;
        }
        let without_tag = &raw[..raw.len() - 16];
        if !crypto::verify_retry_integrity(&self.odcid, without_tag, &retry.integrity_tag) {
            warn!(component = %self.source, "retry integrity check failed, dropping");
            return;
        }
        if retry.token.is_empty() {
            return;
        }
        debug!(component = %self.source, "retry received, revalidating address");
        self.retry_received = true;
        self.token = retry.token.clone();
        self.remote_cid = retry.scid;
        match crypto::initial_keys(&retry.scid, Side::Client) {
            Ok(keys) => self.initial_keys = Some(keys),
            Err(e) => {
                warn!(component = %self.source, error = %e, "initial rekey failed");
                return;
            }
        }
        // Everything sent so far is void; requeue it under the new keys.
        let sent: Vec<u64> = self.spaces[Space::Initial as usize]
            .sent
            .keys()
            .copied()
            .collect();
        for pn in sent {
            if let Some(packet) = self.spaces[Space::Initial as usize].sent.remove(&pn) {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
                for frame in packet.frames {
                    if matches!(frame, Frame::Crypto { .. }) {
                        self.spaces[Space::Initial as usize].lost_frames.push(frame);
                    }
                }
            }
        }
    }

    fn keys_for(&self, space: Space, long_type: Option<LongPacketType>) -> Option<&DirectionalKeys> {
        match (space, long_type) {
            (Space::Initial, _) => self.initial_keys.as_ref().map(|k| &k.remote),
            (Space::Handshake, _) => self.hs_keys.as_ref().map(|k| &k.remote),
            (Space::App, Some(LongPacketType::ZeroRtt)) => self.tls.zero_rtt_keys(),
            (Space::App, _) => self.app_keys.as_ref().map(|k| &k.remote),
        }
    }

    fn process_packet(
        &mut self,
        space: &Space,
        packet: &[u8],
        pn_offset: usize,
        long: Option<&LongHeader>,
    ) {
        if matches!(self.state, ConnState::Draining { .. } | ConnState::Closed) {
            return;
        }
        let space = *space;
        let long_type = long.map(|h| h.packet_type);
        let largest = self.space(space).largest_recv;
        let opened = {
            let Some(keys) = self.keys_for(space, long_type) else {
                trace!(component = %self.source, space = ?space, "no keys yet, packet dropped");
                return;
            };
            match crypto::open_packet(keys, packet, pn_offset, largest) {
                Ok(opened) => opened,
                Err(e) => {
                    trace!(component = %self.source, error = %e, "undecryptable packet dropped");
                    return;
                }
            }
        };

        if !self.space(space).note_received(opened.pn) {
            return; // duplicate
        }
        self.packets_received += 1;

        let Some(frames) = frame::parse_frames(&opened.plaintext) else {
            self.local_close(0x0a, "malformed frame payload");
            return;
        };
        let mut ack_eliciting = false;
        for parsed_frame in frames {
            ack_eliciting |= parsed_frame.is_ack_eliciting();
            self.process_frame(space, parsed_frame);
            if matches!(self.state, ConnState::Draining { .. } | ConnState::Closed) {
                return;
            }
        }
        if ack_eliciting {
            self.space(space).ack_pending = true;
        }
    }

    fn process_frame(&mut self, space: Space, f: Frame) {
        match f {
            Frame::Padding(_) | Frame::Ping => {}
            Frame::Ack { .. } => {
                let ranges = f.acked_packet_numbers();
                self.on_ack(space, &ranges);
            }
            Frame::Crypto { offset, data } => {
                self.space(space).crypto_recv.insert(offset, &data);
                loop {
                    let chunk = self.space(space).crypto_recv.drain();
                    if chunk.is_empty() {
                        break;
                    }
                    if let Err(e) = self.tls.read_hs(&chunk) {
                        let code = self
                            .tls
                            .alert()
                            .map(|a| 0x100 + u64::from(u8::from(a)))
                            .unwrap_or(0x0a);
                        warn!(component = %self.source, error = %e, "TLS handshake failure");
                        self.local_close(code, &format!("TLS failure: {e}"));
                        return;
                    }
                }
                self.pump_tls();
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                self.on_stream_frame(stream_id, offset, data, fin);
            }
            Frame::MaxData(max) => {
                self.max_data_remote = self.max_data_remote.max(max);
            }
            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.grant_send_window(max);
                }
            }
            Frame::MaxStreams { bidi, max } => self.streams.grant_streams(bidi, max),
            Frame::DataBlocked(_) | Frame::StreamDataBlocked { .. } | Frame::StreamsBlocked { .. } => {
                trace!(component = %self.source, "peer reports blocked");
            }
            Frame::NewConnectionId { .. } | Frame::RetireConnectionId { .. } | Frame::NewToken { .. } => {
                // Parsed for conformance; this engine pins one CID per peer.
            }
            Frame::PathChallenge(data) => {
                self.pending_frames.push(Frame::PathResponse(data));
            }
            Frame::PathResponse(_) => {}
            Frame::ResetStream { stream_id, .. } | Frame::StopSending { stream_id, .. } => {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.reset();
                }
            }
            Frame::ConnectionClose {
                error_code, reason, ..
            } => {
                let reason = String::from_utf8_lossy(&reason).into_owned();
                debug!(component = %self.source, error_code, reason = %reason, "peer closed connection");
                self.state = ConnState::Draining { by_peer: true };
                self.drain_until = Some(Instant::now() + DRAIN_TIMEOUT);
                if !self.close_event_emitted {
                    self.close_event_emitted = true;
                    self.emit(ConnEvent::Closed {
                        error_code,
                        reason,
                        by_peer: true,
                    });
                }
            }
            Frame::HandshakeDone => {
                self.handshake_done_received = true;
                self.hs_keys = None;
                self.spaces[Space::Handshake as usize].sent.clear();
            }
        }
    }

    fn on_stream_frame(&mut self, stream_id: u64, offset: u64, data: Vec<u8>, fin: bool) {
        self.data_recvd += data.len() as u64;
        if self.data_recvd > self.max_data_local {
            self.local_close(0x03, "connection flow-control limit violated");
            return;
        }
        let result = match self.streams.get_or_create(stream_id) {
            Ok(stream) => stream.receive(offset, &data, fin),
            Err(e) => {
                let code = if e.code == ErrorCode::StreamLimit { 0x04 } else { 0x0a };
                self.local_close(code, &e.message);
                return;
            }
        };
        if let Err(e) = result {
            self.local_close(0x03, &e.message);
            return;
        }
        let (bytes, fin_now, window_update) = {
            let Some(stream) = self.streams.get_mut(stream_id) else {
                return;
            };
            let (bytes, fin_now) = stream.drain();
            (bytes, fin_now, stream.take_window_update())
        };
        if let Some(new_limit) = window_update {
            self.pending_frames.push(Frame::MaxStreamData {
                stream_id,
                max: new_limit,
            });
        }
        // Replenish connection-level credit at the half-window mark.
        if self.max_data_local - self.data_recvd < self.local_window / 2 {
            self.max_data_local = self.data_recvd + self.local_window;
            self.pending_frames.push(Frame::MaxData(self.max_data_local));
        }
        if !bytes.is_empty() || fin_now {
            self.emit(ConnEvent::StreamData {
                stream_id,
                data: bytes,
                fin: fin_now,
            });
        }
        self.streams.reap_closed();
    }

    fn on_ack(&mut self, space: Space, ranges: &[(u64, u64)]) {
        let now = Instant::now();
        let largest_in_frame = ranges.first().map(|&(_, hi)| hi);
        for &(lo, hi) in ranges {
            for pn in lo..=hi {
                let Some(sent) = self.space(space).sent.remove(&pn) else {
                    continue;
                };
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(sent.size);
                self.cwnd = (self.cwnd + sent.size).min(MAX_CWND);
                if let Some(size) = sent.probe_size {
                    self.pmtud.on_probe_acked(size);
                }
                if Some(pn) == largest_in_frame && sent.ack_eliciting {
                    let rtt = now.duration_since(sent.time);
                    self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| m.min(rtt)));
                    self.srtt = Some(match self.srtt {
                        None => rtt,
                        Some(srtt) => {
                            (srtt.mul_f64(0.875)).saturating_add(rtt.mul_f64(0.125))
                        }
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn loss_timeout(&self) -> Duration {
        self.srtt
            .map(|srtt| srtt * 2 + Duration::from_millis(100))
            .unwrap_or(Duration::from_millis(300))
            .max(Duration::from_millis(200))
    }

    fn on_timer(&mut self, now: Instant) {
        match self.state {
            ConnState::Closed => return,
            ConnState::Draining { .. } => {
                if self.drain_until.is_some_and(|until| now >= until) {
                    self.state = ConnState::Closed;
                }
                return;
            }
            _ => {}
        }

        // Idle timeout: silent removal, no CONNECTION_CLOSE on the wire.
        if now.duration_since(self.last_activity) > self.idle_timeout {
            debug!(component = %self.source, "idle timeout");
            self.state = ConnState::Closed;
            if !self.close_event_emitted {
                self.close_event_emitted = true;
                self.emit(ConnEvent::Closed {
                    error_code: 0,
                    reason: "idle timeout".into(),
                    by_peer: false,
                });
            }
            return;
        }

        self.detect_loss(now);

        // PMTUD probing runs only on an established path.
        if self.state == ConnState::Established {
            self.pmtud.on_timeout(now);
            if self.pmtud.should_probe(now) {
                let size = self.pmtud.probe_size().unwrap_or(self.pmtud.min_mtu());
                self.send_pmtud_probe(size, now);
            }
        }
    }

    fn detect_loss(&mut self, now: Instant) {
        let timeout = self.loss_timeout();
        let mut any_lost = false;
        for space in SPACES {
            let due: Vec<u64> = self.spaces[space as usize]
                .sent
                .iter()
                .filter(|(_, p)| now.duration_since(p.time) >= timeout)
                .map(|(pn, _)| *pn)
                .collect();
            for pn in due {
                let Some(packet) = self.spaces[space as usize].sent.remove(&pn) else {
                    continue;
                };
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
                if let Some(size) = packet.probe_size {
                    // Probe loss informs PMTUD, nothing is retransmitted.
                    self.pmtud.on_probe_lost(size);
                    continue;
                }
                if packet.ack_eliciting {
                    self.packets_lost += 1;
                    any_lost = true;
                }
                trace!(component = %self.source, pn, space = ?space, "packet declared lost");
                for f in packet.frames {
                    match f {
                        Frame::Crypto { .. }
                        | Frame::Stream { .. }
                        | Frame::MaxData(_)
                        | Frame::MaxStreamData { .. }
                        | Frame::MaxStreams { .. }
                        | Frame::HandshakeDone
                        | Frame::ConnectionClose { .. } => {
                            self.spaces[space as usize].lost_frames.push(f)
                        }
                        _ => {}
                    }
                }
            }
        }
        if any_lost {
            self.cwnd = (self.cwnd / 2).max(MIN_CWND);
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    fn local_close(&mut self, error_code: u64, reason: &str) {
        if matches!(self.state, ConnState::Draining { .. } | ConnState::Closed) {
            return;
        }
        debug!(component = %self.source, error_code, reason, "closing connection");
        self.state = ConnState::Draining { by_peer: false };
        self.drain_until = Some(Instant::now() + DRAIN_TIMEOUT);
        self.queue_close_frame_with(error_code, reason);
        if !self.close_event_emitted {
            self.close_event_emitted = true;
            self.emit(ConnEvent::Closed {
                error_code,
                reason: reason.to_string(),
                by_peer: false,
            });
        }
    }

    fn queue_close_frame(&mut self) {
        self.queue_close_frame_with(0, "");
    }

    fn queue_close_frame_with(&mut self, error_code: u64, reason: &str) {
        let close = Frame::ConnectionClose {
            error_code,
            frame_type: None,
            reason: reason.as_bytes().to_vec(),
        };
        let space = if self.app_keys.is_some() {
            Space::App
        } else if self.hs_keys.is_some() {
            Space::Handshake
        } else {
            Space::Initial
        };
        let mtu = self.datagram_budget(space);
        if let Some(packet) = self.build_packet(space, vec![close], mtu, None) {
            self.send_datagram(packet);
        }
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    fn datagram_budget(&self, space: Space) -> usize {
        match space {
            Space::App if self.state == ConnState::Established => self.pmtud.current_mtu(),
            _ => MIN_MTU,
        }
    }

    fn send_keys_for(&self, space: Space) -> Option<&DirectionalKeys> {
        match space {
            Space::Initial => self.initial_keys.as_ref().map(|k| &k.local),
            Space::Handshake => self.hs_keys.as_ref().map(|k| &k.local),
            Space::App => {
                if let Some(keys) = self.app_keys.as_ref() {
                    Some(&keys.local)
                } else if self.side == Side::Client {
                    self.tls.zero_rtt_keys()
                } else {
                    None
                }
            }
        }
    }

    /// Per-packet overhead: header, packet number, AEAD tag.
    fn packet_overhead(&self, space: Space) -> usize {
        let header = match space {
            Space::App if self.app_keys.is_some() => 1 + self.remote_cid.len(),
            // Long headers: worst-case with token length for Initials.
            _ => 7 + self.remote_cid.len() + self.local_cid.len() + 8 + self.token.len(),
        };
        header + PN_LEN + 16
    }

    /// Builds, seals, and returns one packet carrying `frames`; `None` when
    /// sealing is impossible (missing keys).
    fn build_packet(
        &mut self,
        space: Space,
        frames: Vec<Frame>,
        pad_datagram_to: usize,
        probe_size: Option<usize>,
    ) -> Option<Vec<u8>> {
        if frames.is_empty() {
            return None;
        }
        let use_zero_rtt = space == Space::App && self.app_keys.is_none();
        let mut payload = Vec::new();
        for f in &frames {
            f.encode(&mut payload);
        }

        let pn = self.space(space).next_pn;
        let tag_len = 16usize;

        let serialize_header = |payload_len: usize, buf: &mut Vec<u8>| {
            match space {
                Space::App if !use_zero_rtt => {
                    ShortHeader {
                        dcid: self.remote_cid,
                    }
                    .serialize(PN_LEN, buf);
                }
                _ => {
                    let packet_type = match space {
                        Space::Initial => LongPacketType::Initial,
                        Space::Handshake => LongPacketType::Handshake,
                        Space::App => LongPacketType::ZeroRtt,
                    };
                    LongHeader {
                        packet_type,
                        version: QUIC_VERSION_1,
                        dcid: self.remote_cid,
                        scid: self.local_cid,
                        token: if space == Space::Initial {
                            self.token.clone()
                        } else {
                            Vec::new()
                        },
                        length: (PN_LEN + payload_len + tag_len) as u64,
                    }
                    .serialize(PN_LEN, buf);
                }
            }
        };

        // Client Initial datagrams must reach 1200 bytes; PMTUD probes pad to
        // their probed size exactly. Padding is measured against the real
        // header so the datagram lands on the target, not near it.
        if probe_size.is_some() || (space == Space::Initial && self.side == Side::Client) {
            let mut trial = Vec::new();
            serialize_header(payload.len(), &mut trial);
            let total = trial.len() + PN_LEN + payload.len() + tag_len;
            if total < pad_datagram_to {
                let mut pad = pad_datagram_to - total;
                // Growing the payload can grow the length varint too.
                let before =
                    super::varint::encoded_len((PN_LEN + payload.len() + tag_len) as u64);
                let after =
                    super::varint::encoded_len((PN_LEN + payload.len() + pad + tag_len) as u64);
                pad = pad.saturating_sub(after - before);
                Frame::Padding(pad).encode(&mut payload);
            }
        }

        let mut header = Vec::new();
        serialize_header(payload.len(), &mut header);
        let pn_offset = header.len();
        header.extend_from_slice(&(pn as u32).to_be_bytes());

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let keys = self.send_keys_for(space)?;
        let sealed = match crypto::seal_packet(keys, pn, header, pn_offset, payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(component = %self.source, error = %e, "packet sealing failed");
                return None;
            }
        };

        self.space(space).next_pn += 1;
        self.packets_sent += 1;
        if ack_eliciting {
            self.bytes_in_flight += sealed.len();
            let entry = SentPacket {
                frames,
                size: sealed.len(),
                time: Instant::now(),
                ack_eliciting,
                probe_size,
            };
            self.space(space).sent.insert(pn, entry);
        }
        Some(sealed)
    }

    fn send_datagram(&mut self, datagram: Vec<u8>) {
        self.bytes_sent += datagram.len() as u64;
        let _ = self.outbound.send(datagram);
    }

    fn send_pmtud_probe(&mut self, size: usize, now: Instant) {
        let frames = vec![Frame::Ping];
        if let Some(packet) = self.build_packet(Space::App, frames, size, Some(size)) {
            trace!(component = %self.source, size, "pmtud probe");
            self.pmtud.on_probe_sent(size, now);
            self.send_datagram(packet);
        }
    }

    /// Emits everything currently sendable across all spaces.
    fn flush(&mut self, _now: Instant) {
        if matches!(self.state, ConnState::Draining { .. } | ConnState::Closed) {
            return;
        }
        for space in SPACES {
            if self.send_keys_for(space).is_none() {
                continue;
            }
            loop {
                let budget = self.datagram_budget(space);
                let capacity = budget.saturating_sub(self.packet_overhead(space));
                let mut frames: Vec<Frame> = Vec::new();
                let mut used = 0usize;

                if self.space(space).ack_pending {
                    if let Some(ack) = self.space(space).ack_frame() {
                        let mut tmp = Vec::new();
                        ack.encode(&mut tmp);
                        used += tmp.len();
                        frames.push(ack);
                    }
                    self.space(space).ack_pending = false;
                }

                // Retransmissions first.
                while let Some(f) = self.space(space).lost_frames.pop() {
                    let mut tmp = Vec::new();
                    f.encode(&mut tmp);
                    if used + tmp.len() > capacity && !frames.is_empty() {
                        self.space(space).lost_frames.push(f);
                        break;
                    }
                    used += tmp.len();
                    frames.push(f);
                }

                // Pending CRYPTO bytes.
                while !self.space(space).crypto_out.is_empty() && used + 16 < capacity {
                    let room = capacity - used - 16;
                    let take = self.space(space).crypto_out.len().min(room);
                    if take == 0 {
                        break;
                    }
                    let chunk: Vec<u8> =
                        self.space(space).crypto_out.drain(..take).collect();
                    let offset = self.space(space).crypto_out_offset;
                    self.space(space).crypto_out_offset += take as u64;
                    used += chunk.len() + 16;
                    frames.push(Frame::Crypto {
                        offset,
                        data: chunk,
                    });
                }

                if space == Space::App {
                    if self.handshake_done_queued {
                        self.handshake_done_queued = false;
                        frames.push(Frame::HandshakeDone);
                        used += 1;
                    }
                    while let Some(f) = self.pending_frames.pop() {
                        let mut tmp = Vec::new();
                        f.encode(&mut tmp);
                        used += tmp.len();
                        frames.push(f);
                    }
                    // Stream data, bounded by congestion and flow control.
                    let can_zero_rtt =
                        self.app_keys.is_some() || self.zero_rtt_available();
                    if can_zero_rtt {
                        used += self.fill_stream_frames(&mut frames, capacity, used);
                    }
                }

                if frames.is_empty() {
                    break;
                }
                let Some(packet) = self.build_packet(space, frames, budget, None) else {
                    break;
                };
                self.send_datagram(packet);
            }
        }
    }

    /// Appends STREAM frames up to the remaining capacity; returns bytes used.
    fn fill_stream_frames(&mut self, frames: &mut Vec<Frame>, capacity: usize, used: usize) -> usize {
        let mut used_here = 0;
        if self.bytes_in_flight >= self.cwnd {
            return 0;
        }
        let conn_credit = self.max_data_remote.saturating_sub(self.data_sent);
        let mut conn_credit = conn_credit as usize;
        let mut remaining = capacity.saturating_sub(used);
        let mut ids: Vec<u64> = Vec::new();
        for stream in self.streams.iter_mut() {
            if stream.has_pending() {
                ids.push(stream.id());
            }
        }
        for id in ids {
            if remaining <= STREAM_FRAME_OVERHEAD {
                break;
            }
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };
            let max_len = (remaining - STREAM_FRAME_OVERHEAD).min(conn_credit.max(0));
            // FIN-only chunks ride along even at zero credit.
            let Some((offset, data, fin)) = stream.next_chunk(max_len) else {
                continue;
            };
            let len = data.len();
            self.data_sent += len as u64;
            conn_credit = conn_credit.saturating_sub(len);
            let f = Frame::Stream {
                stream_id: id,
                offset,
                data,
                fin,
            };
            let mut tmp = Vec::new();
            f.encode(&mut tmp);
            remaining = remaining.saturating_sub(tmp.len());
            used_here += tmp.len();
            frames.push(f);
        }
        used_here
    }
}

// A long header's packet type selects the packet space it belongs to.
impl LongHeader {
    fn space(&self) -> Space {
        match self.packet_type {
            LongPacketType::Initial => Space::Initial,
            LongPacketType::Handshake => Space::Handshake,
            LongPacketType::ZeroRtt | LongPacketType::Retry => Space::App,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_ranges_merge_and_dedupe() {
        let mut space = PacketSpace::default();
        assert!(space.note_received(1));
        assert!(space.note_received(3));
        assert!(space.note_received(2));
        assert!(!space.note_received(2));
        assert_eq!(space.recv_ranges, vec![(1, 3)]);
        assert_eq!(space.largest_recv, Some(3));

        assert!(space.note_received(7));
        assert_eq!(space.recv_ranges, vec![(1, 3), (7, 7)]);
        let ack = space.ack_frame().unwrap();
        assert_eq!(ack.acked_packet_numbers(), vec![(7, 7), (1, 3)]);
    }

    #[test]
    fn crypto_assembler_orders_segments() {
        let mut assembler = CryptoAssembler::default();
        assembler.insert(5, b"world");
        assert!(assembler.drain().is_empty());
        assembler.insert(0, b"hello");
        assert_eq!(assembler.drain(), b"helloworld");
        // Duplicate data is absorbed.
        assembler.insert(0, b"hello");
        assert!(assembler.drain().is_empty());
    }
}
