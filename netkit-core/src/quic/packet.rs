//! QUIC packet header codec (RFC 9000 §17, RFC 8999 invariants).
//!
//! Parses and serializes the version-independent parts of long and short
//! headers (everything readable before packet protection is removed) and
//! extracts the destination connection id for demultiplexing without touching
//! the payload. Packet numbers are protected fields and are handled by the
//! connection's protection layer, not here.

use super::cid::{ConnectionId, MAX_CID_LEN};
use super::varint;

pub const QUIC_VERSION_1: u32 = 0x0000_0001;

const FORM_LONG: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

/// Long-header packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongPacketType {
    fn bits(self) -> u8 {
        match self {
            LongPacketType::Initial => 0b00,
            LongPacketType::ZeroRtt => 0b01,
            LongPacketType::Handshake => 0b10,
            LongPacketType::Retry => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => LongPacketType::Initial,
            0b01 => LongPacketType::ZeroRtt,
            0b10 => LongPacketType::Handshake,
            _ => LongPacketType::Retry,
        }
    }
}

/// Long header for Initial, 0-RTT and Handshake packets.
///
/// `length` counts packet number + payload + AEAD tag, exactly as on the
/// wire. `token` is only meaningful for Initial packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub packet_type: LongPacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: Vec<u8>,
    pub length: u64,
}

/// Short (1-RTT) header: everything except the DCID is protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    pub dcid: ConnectionId,
}

/// Stateless Retry packet (RFC 9000 §17.2.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPacket {
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: Vec<u8>,
    pub integrity_tag: [u8; 16],
}

/// Version negotiation packet (version field zero).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiation {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub versions: Vec<u32>,
}

/// The parseable view of a datagram's first packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Long(LongHeader),
    Short(ShortHeader),
    Retry(RetryPacket),
    VersionNegotiation(VersionNegotiation),
}

/// Outcome of a successful [`Header::parse`].
pub struct ParsedHeader {
    pub header: Header,
    /// Offset of the (protected) packet number field; for Retry and version
    /// negotiation this is the end of the packet.
    pub pn_offset: usize,
}

impl Header {
    pub fn is_long(first_byte: u8) -> bool {
        first_byte & FORM_LONG != 0
    }

    /// Parses the unprotected header fields of the packet at the start of
    /// `buf`. `short_dcid_len` is the endpoint-local CID length used by short
    /// headers. Returns `None` for anything malformed; callers drop the
    /// datagram silently.
    pub fn parse(buf: &[u8], short_dcid_len: usize) -> Option<ParsedHeader> {
        let first = *buf.first()?;
        if !Self::is_long(first) {
            // Short header: flags byte then DCID of known length.
            if buf.len() < 1 + short_dcid_len {
                return None;
            }
            let dcid = ConnectionId::new(&buf[1..1 + short_dcid_len]).ok()?;
            return Some(ParsedHeader {
                header: Header::Short(ShortHeader { dcid }),
                pn_offset: 1 + short_dcid_len,
            });
        }

        if buf.len() < 7 {
            return None;
        }
        let version = u32::from_be_bytes(buf[1..5].try_into().ok()?);
        let dcid_len = buf[5] as usize;
        if dcid_len > MAX_CID_LEN && version == QUIC_VERSION_1 {
            return None;
        }
        let mut offset = 6;
        let dcid = ConnectionId::new(buf.get(offset..offset + dcid_len)?).ok()?;
        offset += dcid_len;
        let scid_len = *buf.get(offset)? as usize;
        if scid_len > MAX_CID_LEN && version == QUIC_VERSION_1 {
            return None;
        }
        offset += 1;
        let scid = ConnectionId::new(buf.get(offset..offset + scid_len)?).ok()?;
        offset += scid_len;

        if version == 0 {
            // Version negotiation: remainder is a list of 32-bit versions.
            let rest = buf.get(offset..)?;
            if rest.len() % 4 != 0 {
                return None;
            }
            let versions = rest
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            return Some(ParsedHeader {
                header: Header::VersionNegotiation(VersionNegotiation { dcid, scid, versions }),
                pn_offset: buf.len(),
            });
        }

        let packet_type = LongPacketType::from_bits((first >> 4) & 0b11);
        match packet_type {
            LongPacketType::Retry => {
                // Token runs to the end, minus the 16-byte integrity tag.
                let rest = buf.get(offset..)?;
                if rest.len() < 16 {
                    return None;
                }
                let (token, tag) = rest.split_at(rest.len() - 16);
                let mut integrity_tag = [0u8; 16];
                integrity_tag.copy_from_slice(tag);
                Some(ParsedHeader {
                    header: Header::Retry(RetryPacket {
                        version,
                        dcid,
                        scid,
                        token: token.to_vec(),
                        integrity_tag,
                    }),
                    pn_offset: buf.len(),
                })
            }
            _ => {
                let token = if packet_type == LongPacketType::Initial {
                    let (token_len, consumed) = varint::decode(buf.get(offset..)?)?;
                    offset += consumed;
                    let token = buf.get(offset..offset + token_len as usize)?.to_vec();
                    offset += token_len as usize;
                    token
                } else {
                    Vec::new()
                };
                let (length, consumed) = varint::decode(buf.get(offset..)?)?;
                offset += consumed;
                if buf.len() < offset + length as usize {
                    return None;
                }
                Some(ParsedHeader {
                    header: Header::Long(LongHeader {
                        packet_type,
                        version,
                        dcid,
                        scid,
                        token,
                        length,
                    }),
                    pn_offset: offset,
                })
            }
        }
    }
}

impl LongHeader {
    /// First byte with the given packet-number length encoded (1–4 bytes).
    pub fn first_byte(&self, pn_len: usize) -> u8 {
        FORM_LONG | FIXED_BIT | (self.packet_type.bits() << 4) | ((pn_len as u8 - 1) & 0b11)
    }

    /// Serializes up to and including the length field; the caller appends
    /// the packet number and protected payload.
    pub fn serialize(&self, pn_len: usize, buf: &mut Vec<u8>) {
        buf.push(self.first_byte(pn_len));
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.push(self.dcid.len() as u8);
        buf.extend_from_slice(self.dcid.as_slice());
        buf.push(self.scid.len() as u8);
        buf.extend_from_slice(self.scid.as_slice());
        if self.packet_type == LongPacketType::Initial {
            varint::encode(self.token.len() as u64, buf);
            buf.extend_from_slice(&self.token);
        }
        varint::encode(self.length, buf);
    }
}

impl ShortHeader {
    pub fn first_byte(pn_len: usize) -> u8 {
        FIXED_BIT | ((pn_len as u8 - 1) & 0b11)
    }

    pub fn serialize(&self, pn_len: usize, buf: &mut Vec<u8>) {
        buf.push(Self::first_byte(pn_len));
        buf.extend_from_slice(self.dcid.as_slice());
    }
}

impl RetryPacket {
    /// Serializes the complete Retry packet including the integrity tag.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(FORM_LONG | FIXED_BIT | (LongPacketType::Retry.bits() << 4));
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.push(self.dcid.len() as u8);
        buf.extend_from_slice(self.dcid.as_slice());
        buf.push(self.scid.len() as u8);
        buf.extend_from_slice(self.scid.as_slice());
        buf.extend_from_slice(&self.token);
        buf.extend_from_slice(&self.integrity_tag);
    }
}

impl VersionNegotiation {
    /// Serializes a complete version negotiation packet.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        // The form bit is required; remaining first-byte bits are arbitrary.
        buf.push(FORM_LONG);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(self.dcid.len() as u8);
        buf.extend_from_slice(self.dcid.as_slice());
        buf.push(self.scid.len() as u8);
        buf.extend_from_slice(self.scid.as_slice());
        for version in &self.versions {
            buf.extend_from_slice(&version.to_be_bytes());
        }
    }
}

/// Extracts the destination connection id from the first packet of a
/// datagram without decrypting anything. `None` means the datagram is not
/// attributable and must be dropped silently.
pub fn extract_dcid(datagram: &[u8], short_dcid_len: usize) -> Option<ConnectionId> {
    let first = *datagram.first()?;
    if Header::is_long(first) {
        if datagram.len() < 7 {
            return None;
        }
        let dcid_len = datagram[5] as usize;
        if dcid_len > MAX_CID_LEN {
            return None;
        }
        ConnectionId::new(datagram.get(6..6 + dcid_len)?).ok()
    } else {
        ConnectionId::new(datagram.get(1..1 + short_dcid_len)?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::new(bytes).unwrap()
    }

    #[test]
    fn long_header_round_trip() {
        let header = LongHeader {
            packet_type: LongPacketType::Initial,
            version: QUIC_VERSION_1,
            dcid: cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
            scid: cid(&[9, 10]),
            token: vec![0xAA, 0xBB, 0xCC],
            length: 1200,
        };
        let mut buf = Vec::new();
        header.serialize(4, &mut buf);
        // Pad out to the declared length so the bounds check passes.
        buf.resize(buf.len() + 1200, 0);

        let parsed = Header::parse(&buf, 8).unwrap();
        match parsed.header {
            Header::Long(parsed_header) => assert_eq!(parsed_header, header),
            other => panic!("expected long header, got {other:?}"),
        }
    }

    #[test]
    fn handshake_header_has_no_token() {
        let header = LongHeader {
            packet_type: LongPacketType::Handshake,
            version: QUIC_VERSION_1,
            dcid: cid(&[7; 8]),
            scid: cid(&[8; 8]),
            token: Vec::new(),
            length: 40,
        };
        let mut buf = Vec::new();
        header.serialize(2, &mut buf);
        buf.resize(buf.len() + 40, 0);
        let parsed = Header::parse(&buf, 8).unwrap();
        match parsed.header {
            Header::Long(parsed_header) => {
                assert_eq!(parsed_header.packet_type, LongPacketType::Handshake);
                assert!(parsed_header.token.is_empty());
            }
            other => panic!("expected long header, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_dcid_round_trip() {
        let header = LongHeader {
            packet_type: LongPacketType::Initial,
            version: QUIC_VERSION_1,
            dcid: ConnectionId::empty(),
            scid: cid(&[1; 4]),
            token: Vec::new(),
            length: 20,
        };
        let mut buf = Vec::new();
        header.serialize(1, &mut buf);
        buf.resize(buf.len() + 20, 0);
        let parsed = Header::parse(&buf, 0).unwrap();
        match parsed.header {
            Header::Long(parsed_header) => assert!(parsed_header.dcid.is_empty()),
            other => panic!("expected long header, got {other:?}"),
        }
    }

    #[test]
    fn short_header_round_trip() {
        let header = ShortHeader {
            dcid: cid(&[0xEE; 8]),
        };
        let mut buf = Vec::new();
        header.serialize(4, &mut buf);
        buf.extend_from_slice(&[0u8; 30]); // protected pn + payload

        let parsed = Header::parse(&buf, 8).unwrap();
        match parsed.header {
            Header::Short(parsed_header) => assert_eq!(parsed_header, header),
            other => panic!("expected short header, got {other:?}"),
        }
        assert_eq!(parsed.pn_offset, 9);
    }

    #[test]
    fn retry_round_trip() {
        let retry = RetryPacket {
            version: QUIC_VERSION_1,
            dcid: cid(&[1; 8]),
            scid: cid(&[2; 8]),
            token: b"retry-token".to_vec(),
            integrity_tag: [0x5A; 16],
        };
        let mut buf = Vec::new();
        retry.serialize(&mut buf);
        let parsed = Header::parse(&buf, 8).unwrap();
        match parsed.header {
            Header::Retry(parsed_retry) => assert_eq!(parsed_retry, retry),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn version_negotiation_round_trip() {
        let vn = VersionNegotiation {
            dcid: cid(&[3; 8]),
            scid: cid(&[4; 8]),
            versions: vec![QUIC_VERSION_1, 0x709A_50C4],
        };
        let mut buf = Vec::new();
        vn.serialize(&mut buf);
        let parsed = Header::parse(&buf, 8).unwrap();
        match parsed.header {
            Header::VersionNegotiation(parsed_vn) => assert_eq!(parsed_vn, vn),
            other => panic!("expected version negotiation, got {other:?}"),
        }
    }

    #[test]
    fn extract_dcid_from_both_forms() {
        let dcid = cid(&[0xAB; 8]);
        let header = LongHeader {
            packet_type: LongPacketType::Initial,
            version: QUIC_VERSION_1,
            dcid,
            scid: cid(&[1; 4]),
            token: Vec::new(),
            length: 100,
        };
        let mut long = Vec::new();
        header.serialize(4, &mut long);
        long.resize(long.len() + 100, 0);
        assert_eq!(extract_dcid(&long, 8), Some(dcid));

        let mut short = Vec::new();
        ShortHeader { dcid }.serialize(4, &mut short);
        short.extend_from_slice(&[0u8; 20]);
        assert_eq!(extract_dcid(&short, 8), Some(dcid));
    }

    #[test]
    fn malformed_datagrams_yield_none() {
        assert!(extract_dcid(&[], 8).is_none());
        // Truncated long header.
        assert!(extract_dcid(&[0xC0, 0, 0, 0], 8).is_none());
        // DCID length beyond the limit.
        let bad = [0xC0, 0, 0, 0, 1, 21, 0, 0];
        assert!(extract_dcid(&bad, 8).is_none());
        // Short header shorter than the local CID length.
        assert!(extract_dcid(&[0x40, 1, 2], 8).is_none());
        assert!(Header::parse(&[0x40, 1, 2], 8).is_none());
    }

    #[test]
    fn truncated_payload_fails_parse() {
        let header = LongHeader {
            packet_type: LongPacketType::Initial,
            version: QUIC_VERSION_1,
            dcid: cid(&[1; 8]),
            scid: cid(&[2; 8]),
            token: Vec::new(),
            length: 500,
        };
        let mut buf = Vec::new();
        header.serialize(4, &mut buf);
        buf.resize(buf.len() + 100, 0); // less than declared
        assert!(Header::parse(&buf, 8).is_none());
    }
}
