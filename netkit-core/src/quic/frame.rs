//! QUIC frame codec (RFC 9000 §19).
//!
//! Parses every frame type a v1 peer may legally send and encodes the subset
//! this engine emits. ACK ranges are kept in wire form (`first_range` plus
//! alternating gap/length pairs); [`Frame::ack_from_ranges`] and
//! [`Frame::acked_packet_numbers`] convert to and from explicit ranges.

use super::cid::ConnectionId;
use super::varint;

/// Decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Run-length encoded PADDING
    Padding(usize),
    Ping,
    Ack {
        largest: u64,
        delay: u64,
        first_range: u64,
        /// (gap, range_length) pairs, wire order (descending packet numbers)
        ranges: Vec<(u64, u64)>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },
    NewToken {
        token: Vec<u8>,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        data: Vec<u8>,
        fin: bool,
    },
    MaxData(u64),
    MaxStreamData {
        stream_id: u64,
        max: u64,
    },
    MaxStreams {
        bidi: bool,
        max: u64,
    },
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: u64,
        max: u64,
    },
    StreamsBlocked {
        bidi: bool,
        max: u64,
    },
    NewConnectionId {
        seq: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    },
    RetireConnectionId {
        seq: u64,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose {
        error_code: u64,
        /// `Some(frame_type)` for transport close (0x1c), `None` for the
        /// application variant (0x1d)
        frame_type: Option<u64>,
        reason: Vec<u8>,
    },
    HandshakeDone,
}

impl Frame {
    /// Everything except ACK, PADDING and CONNECTION_CLOSE elicits an ACK.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack { .. } | Frame::Padding(_) | Frame::ConnectionClose { .. }
        )
    }

    /// Builds an ACK frame from descending, non-overlapping inclusive packet
    /// number ranges (`ranges[0]` contains the largest).
    pub fn ack_from_ranges(delay: u64, ranges: &[(u64, u64)]) -> Option<Frame> {
        let (first_lo, largest) = *ranges.first()?;
        let mut wire = Vec::new();
        let mut prev_lo = first_lo;
        for (lo, hi) in &ranges[1..] {
            // gap = number of missing packets between ranges, minus one
            let gap = prev_lo - hi - 2;
            wire.push((gap, hi - lo));
            prev_lo = *lo;
        }
        Some(Frame::Ack {
            largest,
            delay,
            first_range: largest - first_lo,
            ranges: wire,
        })
    }

    /// Expands an ACK frame into descending `(lo, hi)` inclusive ranges.
    pub fn acked_packet_numbers(&self) -> Vec<(u64, u64)> {
        let Frame::Ack {
            largest,
            first_range,
            ranges,
            ..
        } = self
        else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(ranges.len() + 1);
        let mut hi = *largest;
        let Some(mut lo) = hi.checked_sub(*first_range) else {
            return Vec::new();
        };
        out.push((lo, hi));
        for (gap, len) in ranges {
            let Some(next_hi) = lo.checked_sub(gap + 2) else {
                return out;
            };
            hi = next_hi;
            let Some(next_lo) = hi.checked_sub(*len) else {
                return out;
            };
            lo = next_lo;
            out.push((lo, hi));
        }
        out
    }

    /// Appends the wire encoding.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Padding(len) => buf.extend(std::iter::repeat_n(0u8, *len)),
            Frame::Ping => varint::encode(0x01, buf),
            Frame::Ack {
                largest,
                delay,
                first_range,
                ranges,
            } => {
                varint::encode(0x02, buf);
                varint::encode(*largest, buf);
                varint::encode(*delay, buf);
                varint::encode(ranges.len() as u64, buf);
                varint::encode(*first_range, buf);
                for (gap, len) in ranges {
                    varint::encode(*gap, buf);
                    varint::encode(*len, buf);
                }
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                varint::encode(0x04, buf);
                varint::encode(*stream_id, buf);
                varint::encode(*error_code, buf);
                varint::encode(*final_size, buf);
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                varint::encode(0x05, buf);
                varint::encode(*stream_id, buf);
                varint::encode(*error_code, buf);
            }
            Frame::Crypto { offset, data } => {
                varint::encode(0x06, buf);
                varint::encode(*offset, buf);
                varint::encode(data.len() as u64, buf);
                buf.extend_from_slice(data);
            }
            Frame::NewToken { token } => {
                varint::encode(0x07, buf);
                varint::encode(token.len() as u64, buf);
                buf.extend_from_slice(token);
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                // OFF and LEN bits always set; FIN as requested.
                let mut frame_type = 0x08 | 0x04 | 0x02;
                if *fin {
                    frame_type |= 0x01;
                }
                varint::encode(frame_type, buf);
                varint::encode(*stream_id, buf);
                varint::encode(*offset, buf);
                varint::encode(data.len() as u64, buf);
                buf.extend_from_slice(data);
            }
            Frame::MaxData(max) => {
                varint::encode(0x10, buf);
                varint::encode(*max, buf);
            }
            Frame::MaxStreamData { stream_id, max } => {
                varint::encode(0x11, buf);
                varint::encode(*stream_id, buf);
                varint::encode(*max, buf);
            }
            Frame::MaxStreams { bidi, max } => {
                varint::encode(if *bidi { 0x12 } else { 0x13 }, buf);
                varint::encode(*max, buf);
            }
            Frame::DataBlocked(limit) => {
                varint::encode(0x14, buf);
                varint::encode(*limit, buf);
            }
            Frame::StreamDataBlocked { stream_id, max } => {
                varint::encode(0x15, buf);
                varint::encode(*stream_id, buf);
                varint::encode(*max, buf);
            }
            Frame::StreamsBlocked { bidi, max } => {
                varint::encode(if *bidi { 0x16 } else { 0x17 }, buf);
                varint::encode(*max, buf);
            }
            Frame::NewConnectionId {
                seq,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                varint::encode(0x18, buf);
                varint::encode(*seq, buf);
                varint::encode(*retire_prior_to, buf);
                buf.push(cid.len() as u8);
                buf.extend_from_slice(cid.as_slice());
                buf.extend_from_slice(reset_token);
            }
            Frame::RetireConnectionId { seq } => {
                varint::encode(0x19, buf);
                varint::encode(*seq, buf);
            }
            Frame::PathChallenge(data) => {
                varint::encode(0x1a, buf);
                buf.extend_from_slice(data);
            }
            Frame::PathResponse(data) => {
                varint::encode(0x1b, buf);
                buf.extend_from_slice(data);
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                match frame_type {
                    Some(ft) => {
                        varint::encode(0x1c, buf);
                        varint::encode(*error_code, buf);
                        varint::encode(*ft, buf);
                    }
                    None => {
                        varint::encode(0x1d, buf);
                        varint::encode(*error_code, buf);
                    }
                }
                varint::encode(reason.len() as u64, buf);
                buf.extend_from_slice(reason);
            }
            Frame::HandshakeDone => varint::encode(0x1e, buf),
        }
    }
}

/// Parses a decrypted packet payload into frames. `None` marks a malformed
/// payload; the connection treats that as a protocol error.
pub fn parse_frames(mut buf: &[u8]) -> Option<Vec<Frame>> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        let (frame, rest) = parse_one(buf)?;
        frames.push(frame);
        buf = rest;
    }
    Some(frames)
}

fn take<'a>(buf: &'a [u8], n: usize) -> Option<(&'a [u8], &'a [u8])> {
    if buf.len() < n {
        None
    } else {
        Some(buf.split_at(n))
    }
}

fn take_varint(buf: &[u8]) -> Option<(u64, &[u8])> {
    let (value, consumed) = varint::decode(buf)?;
    Some((value, &buf[consumed..]))
}

fn parse_one(buf: &[u8]) -> Option<(Frame, &[u8])> {
    let (frame_type, mut rest) = take_varint(buf)?;
    let frame = match frame_type {
        0x00 => {
            // Coalesce the run of padding bytes.
            let mut len = 1;
            while rest.first() == Some(&0) {
                rest = &rest[1..];
                len += 1;
            }
            Frame::Padding(len)
        }
        0x01 => Frame::Ping,
        0x02 | 0x03 => {
            let (largest, r) = take_varint(rest)?;
            let (delay, r) = take_varint(r)?;
            let (range_count, r) = take_varint(r)?;
            let (first_range, mut r) = take_varint(r)?;
            let mut ranges = Vec::new();
            for _ in 0..range_count {
                let (gap, r2) = take_varint(r)?;
                let (len, r2) = take_varint(r2)?;
                ranges.push((gap, len));
                r = r2;
            }
            if frame_type == 0x03 {
                // ECN counts; parsed and ignored.
                let (_, r2) = take_varint(r)?;
                let (_, r2) = take_varint(r2)?;
                let (_, r2) = take_varint(r2)?;
                r = r2;
            }
            rest = r;
            Frame::Ack {
                largest,
                delay,
                first_range,
                ranges,
            }
        }
        0x04 => {
            let (stream_id, r) = take_varint(rest)?;
            let (error_code, r) = take_varint(r)?;
            let (final_size, r) = take_varint(r)?;
            rest = r;
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            }
        }
        0x05 => {
            let (stream_id, r) = take_varint(rest)?;
            let (error_code, r) = take_varint(r)?;
            rest = r;
            Frame::StopSending {
                stream_id,
                error_code,
            }
        }
        0x06 => {
            let (offset, r) = take_varint(rest)?;
            let (len, r) = take_varint(r)?;
            let (data, r) = take(r, len as usize)?;
            rest = r;
            Frame::Crypto {
                offset,
                data: data.to_vec(),
            }
        }
        0x07 => {
            let (len, r) = take_varint(rest)?;
            let (token, r) = take(r, len as usize)?;
            rest = r;
            Frame::NewToken {
                token: token.to_vec(),
            }
        }
        0x08..=0x0f => {
            let has_offset = frame_type & 0x04 != 0;
            let has_len = frame_type & 0x02 != 0;
            let fin = frame_type & 0x01 != 0;
            let (stream_id, r) = take_varint(rest)?;
            let (offset, r) = if has_offset {
                take_varint(r)?
            } else {
                (0, r)
            };
            let (data, r) = if has_len {
                let (len, r) = take_varint(r)?;
                take(r, len as usize)?
            } else {
                (r, &r[r.len()..])
            };
            rest = r;
            Frame::Stream {
                stream_id,
                offset,
                data: data.to_vec(),
                fin,
            }
        }
        0x10 => {
            let (max, r) = take_varint(rest)?;
            rest = r;
            Frame::MaxData(max)
        }
        0x11 => {
            let (stream_id, r) = take_varint(rest)?;
            let (max, r) = take_varint(r)?;
            rest = r;
            Frame::MaxStreamData { stream_id, max }
        }
        0x12 | 0x13 => {
            let (max, r) = take_varint(rest)?;
            rest = r;
            Frame::MaxStreams {
                bidi: frame_type == 0x12,
                max,
            }
        }
        0x14 => {
            let (limit, r) = take_varint(rest)?;
            rest = r;
            Frame::DataBlocked(limit)
        }
        0x15 => {
            let (stream_id, r) = take_varint(rest)?;
            let (max, r) = take_varint(r)?;
            rest = r;
            Frame::StreamDataBlocked { stream_id, max }
        }
        0x16 | 0x17 => {
            let (max, r) = take_varint(rest)?;
            rest = r;
            Frame::StreamsBlocked {
                bidi: frame_type == 0x16,
                max,
            }
        }
        0x18 => {
            let (seq, r) = take_varint(rest)?;
            let (retire_prior_to, r) = take_varint(r)?;
            let (len_byte, r) = take(r, 1)?;
            let cid_len = len_byte[0] as usize;
            let (cid_bytes, r) = take(r, cid_len)?;
            let (token_bytes, r) = take(r, 16)?;
            let mut reset_token = [0u8; 16];
            reset_token.copy_from_slice(token_bytes);
            rest = r;
            Frame::NewConnectionId {
                seq,
                retire_prior_to,
                cid: ConnectionId::new(cid_bytes).ok()?,
                reset_token,
            }
        }
        0x19 => {
            let (seq, r) = take_varint(rest)?;
            rest = r;
            Frame::RetireConnectionId { seq }
        }
        0x1a | 0x1b => {
            let (data, r) = take(rest, 8)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            rest = r;
            if frame_type == 0x1a {
                Frame::PathChallenge(bytes)
            } else {
                Frame::PathResponse(bytes)
            }
        }
        0x1c | 0x1d => {
            let (error_code, r) = take_varint(rest)?;
            let (closed_frame_type, r) = if frame_type == 0x1c {
                let (ft, r) = take_varint(r)?;
                (Some(ft), r)
            } else {
                (None, r)
            };
            let (reason_len, r) = take_varint(r)?;
            let (reason, r) = take(r, reason_len as usize)?;
            rest = r;
            Frame::ConnectionClose {
                error_code,
                frame_type: closed_frame_type,
                reason: reason.to_vec(),
            }
        }
        0x1e => Frame::HandshakeDone,
        _ => return None,
    };
    Some((frame, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let parsed = parse_frames(&buf).unwrap();
        assert_eq!(parsed, vec![frame]);
    }

    #[test]
    fn core_frames_round_trip() {
        round_trip(Frame::Ping);
        round_trip(Frame::Crypto {
            offset: 1200,
            data: vec![1, 2, 3, 4],
        });
        round_trip(Frame::Stream {
            stream_id: 4,
            offset: 65_536,
            data: b"hello quic".to_vec(),
            fin: true,
        });
        round_trip(Frame::MaxData(1_048_576));
        round_trip(Frame::MaxStreamData {
            stream_id: 8,
            max: 65_536,
        });
        round_trip(Frame::MaxStreams {
            bidi: true,
            max: 128,
        });
        round_trip(Frame::ResetStream {
            stream_id: 4,
            error_code: 9,
            final_size: 100,
        });
        round_trip(Frame::StopSending {
            stream_id: 4,
            error_code: 9,
        });
        round_trip(Frame::NewConnectionId {
            seq: 3,
            retire_prior_to: 1,
            cid: ConnectionId::new(&[7; 8]).unwrap(),
            reset_token: [9; 16],
        });
        round_trip(Frame::RetireConnectionId { seq: 2 });
        round_trip(Frame::PathChallenge([1, 2, 3, 4, 5, 6, 7, 8]));
        round_trip(Frame::PathResponse([8, 7, 6, 5, 4, 3, 2, 1]));
        round_trip(Frame::ConnectionClose {
            error_code: 0x0a,
            frame_type: Some(0x06),
            reason: b"tls alert".to_vec(),
        });
        round_trip(Frame::ConnectionClose {
            error_code: 0,
            frame_type: None,
            reason: Vec::new(),
        });
        round_trip(Frame::HandshakeDone);
        round_trip(Frame::NewToken {
            token: vec![0xAB; 32],
        });
    }

    #[test]
    fn padding_runs_coalesce() {
        let mut buf = Vec::new();
        Frame::Padding(5).encode(&mut buf);
        Frame::Ping.encode(&mut buf);
        let parsed = parse_frames(&buf).unwrap();
        assert_eq!(parsed, vec![Frame::Padding(5), Frame::Ping]);
    }

    #[test]
    fn ack_range_round_trip() {
        // Received 0..=2, 5..=7, 10 (descending on the wire).
        let ranges = [(10, 10), (5, 7), (0, 2)];
        let ack = Frame::ack_from_ranges(0, &ranges).unwrap();
        assert_eq!(ack.acked_packet_numbers(), ranges.to_vec());

        let mut buf = Vec::new();
        ack.encode(&mut buf);
        let parsed = parse_frames(&buf).unwrap();
        assert_eq!(parsed[0].acked_packet_numbers(), ranges.to_vec());
    }

    #[test]
    fn single_range_ack() {
        let ack = Frame::ack_from_ranges(42, &[(3, 9)]).unwrap();
        assert_eq!(ack.acked_packet_numbers(), vec![(3, 9)]);
        assert!(!ack.is_ack_eliciting());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        // CRYPTO frame claiming more data than present.
        let mut buf = Vec::new();
        varint::encode(0x06, &mut buf);
        varint::encode(0, &mut buf);
        varint::encode(100, &mut buf);
        buf.extend_from_slice(&[0; 10]);
        assert!(parse_frames(&buf).is_none());

        // Reserved/unknown frame type.
        let mut buf = Vec::new();
        varint::encode(0x21, &mut buf);
        assert!(parse_frames(&buf).is_none());
    }

    #[test]
    fn ack_eliciting_classification() {
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(
            Frame::Stream {
                stream_id: 0,
                offset: 0,
                data: vec![],
                fin: true
            }
            .is_ack_eliciting()
        );
        assert!(!Frame::Padding(3).is_ack_eliciting());
        assert!(
            !Frame::ConnectionClose {
                error_code: 0,
                frame_type: None,
                reason: vec![]
            }
            .is_ack_eliciting()
        );
    }
}
