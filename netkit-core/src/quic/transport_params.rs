//! QUIC transport parameter coding (RFC 9000 §18).
//!
//! Only the parameters this engine acts on are modeled; unknown ids are
//! skipped on parse as the RFC requires.

use super::cid::ConnectionId;
use super::varint;

const P_ORIGINAL_DCID: u64 = 0x00;
const P_MAX_IDLE_TIMEOUT: u64 = 0x01;
const P_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const P_INITIAL_MAX_DATA: u64 = 0x04;
const P_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const P_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const P_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const P_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const P_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const P_INITIAL_SCID: u64 = 0x0f;
const P_RETRY_SCID: u64 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub original_destination_connection_id: Option<ConnectionId>,
    pub max_idle_timeout_ms: u64,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout_ms: 30_000,
            max_udp_payload_size: 65_527,
            initial_max_data: 1_048_576,
            initial_max_stream_data_bidi_local: 65_536,
            initial_max_stream_data_bidi_remote: 65_536,
            initial_max_stream_data_uni: 65_536,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

fn put_int(id: u64, value: u64, buf: &mut Vec<u8>) {
    varint::encode(id, buf);
    varint::encode(varint::encoded_len(value) as u64, buf);
    varint::encode(value, buf);
}

fn put_cid(id: u64, cid: &ConnectionId, buf: &mut Vec<u8>) {
    varint::encode(id, buf);
    varint::encode(cid.len() as u64, buf);
    buf.extend_from_slice(cid.as_slice());
}

impl TransportParams {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(cid) = &self.original_destination_connection_id {
            put_cid(P_ORIGINAL_DCID, cid, &mut buf);
        }
        put_int(P_MAX_IDLE_TIMEOUT, self.max_idle_timeout_ms, &mut buf);
        put_int(P_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size, &mut buf);
        put_int(P_INITIAL_MAX_DATA, self.initial_max_data, &mut buf);
        put_int(
            P_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
            &mut buf,
        );
        put_int(
            P_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
            &mut buf,
        );
        put_int(
            P_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
            &mut buf,
        );
        put_int(P_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi, &mut buf);
        put_int(P_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni, &mut buf);
        if let Some(cid) = &self.initial_source_connection_id {
            put_cid(P_INITIAL_SCID, cid, &mut buf);
        }
        if let Some(cid) = &self.retry_source_connection_id {
            put_cid(P_RETRY_SCID, cid, &mut buf);
        }
        buf
    }

    /// Parses a peer's parameter block; unknown parameters are skipped.
    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        let mut params = Self {
            // Parameters that default to zero when absent.
            max_idle_timeout_ms: 0,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ..Self::default()
        };
        while !buf.is_empty() {
            let (id, consumed) = varint::decode(buf)?;
            buf = &buf[consumed..];
            let (len, consumed) = varint::decode(buf)?;
            buf = &buf[consumed..];
            let len = len as usize;
            if buf.len() < len {
                return None;
            }
            let value = &buf[..len];
            buf = &buf[len..];

            let int = || varint::decode(value).map(|(v, _)| v);
            match id {
                P_ORIGINAL_DCID => {
                    params.original_destination_connection_id = ConnectionId::new(value).ok();
                }
                P_MAX_IDLE_TIMEOUT => params.max_idle_timeout_ms = int()?,
                P_MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = int()?,
                P_INITIAL_MAX_DATA => params.initial_max_data = int()?,
                P_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = int()?
                }
                P_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = int()?
                }
                P_INITIAL_MAX_STREAM_DATA_UNI => params.initial_max_stream_data_uni = int()?,
                P_INITIAL_MAX_STREAMS_BIDI => params.initial_max_streams_bidi = int()?,
                P_INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = int()?,
                P_INITIAL_SCID => {
                    params.initial_source_connection_id = ConnectionId::new(value).ok();
                }
                P_RETRY_SCID => {
                    params.retry_source_connection_id = ConnectionId::new(value).ok();
                }
                _ => {}
            }
        }
        Some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_cids() {
        let params = TransportParams {
            original_destination_connection_id: Some(ConnectionId::new(&[1; 8]).unwrap()),
            initial_source_connection_id: Some(ConnectionId::new(&[2; 8]).unwrap()),
            retry_source_connection_id: Some(ConnectionId::new(&[3; 8]).unwrap()),
            max_idle_timeout_ms: 15_000,
            initial_max_data: 1 << 20,
            initial_max_streams_bidi: 16,
            ..TransportParams::default()
        };
        let parsed = TransportParams::parse(&params.encode()).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn unknown_parameters_are_skipped() {
        let params = TransportParams::default();
        let mut buf = params.encode();
        // GREASE-style unknown parameter.
        varint::encode(0x3a3a, &mut buf);
        varint::encode(3, &mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        let parsed = TransportParams::parse(&buf).unwrap();
        assert_eq!(parsed.initial_max_data, params.initial_max_data);
    }

    #[test]
    fn truncation_rejected() {
        let buf = TransportParams::default().encode();
        assert!(TransportParams::parse(&buf[..buf.len() - 1]).is_none());
    }
}
