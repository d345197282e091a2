//! HTTP/2 frame codec (RFC 7540 §4, §6).
//!
//! Parses and serializes the nine-byte frame header plus the ten frame types
//! the core recognizes. Header-block payloads (HEADERS, PUSH_PROMISE,
//! CONTINUATION) are carried as opaque fragments; HPACK is the transport
//! library's concern.

use crate::error::{ErrorCode, NetResult, NetworkError};

/// Fixed frame header size on the wire.
pub const FRAME_HEADER_LEN: usize = 9;

/// Frame types from RFC 7540 §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::GoAway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
        }
    }
}

// Flag bits shared across frame types.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// Settings parameters (RFC 7540 §6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
}

impl SettingId {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x1 => SettingId::HeaderTableSize,
            0x2 => SettingId::EnablePush,
            0x3 => SettingId::MaxConcurrentStreams,
            0x4 => SettingId::InitialWindowSize,
            0x5 => SettingId::MaxFrameSize,
            0x6 => SettingId::MaxHeaderListSize,
            _ => return None,
        })
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            SettingId::HeaderTableSize => 0x1,
            SettingId::EnablePush => 0x2,
            SettingId::MaxConcurrentStreams => 0x3,
            SettingId::InitialWindowSize => 0x4,
            SettingId::MaxFrameSize => 0x5,
            SettingId::MaxHeaderListSize => 0x6,
        }
    }
}

/// Error codes surfaced to the application (RFC 7540 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
}

impl Http2ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x0 => Http2ErrorCode::NoError,
            0x1 => Http2ErrorCode::ProtocolError,
            0x2 => Http2ErrorCode::InternalError,
            0x3 => Http2ErrorCode::FlowControlError,
            0x4 => Http2ErrorCode::SettingsTimeout,
            0x5 => Http2ErrorCode::StreamClosed,
            0x6 => Http2ErrorCode::FrameSizeError,
            0x7 => Http2ErrorCode::RefusedStream,
            0x8 => Http2ErrorCode::Cancel,
            0x9 => Http2ErrorCode::CompressionError,
            0xa => Http2ErrorCode::ConnectError,
            0xb => Http2ErrorCode::EnhanceYourCalm,
            0xc => Http2ErrorCode::InadequateSecurity,
            0xd => Http2ErrorCode::Http11Required,
            _ => return None,
        })
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Http2ErrorCode::NoError => 0x0,
            Http2ErrorCode::ProtocolError => 0x1,
            Http2ErrorCode::InternalError => 0x2,
            Http2ErrorCode::FlowControlError => 0x3,
            Http2ErrorCode::SettingsTimeout => 0x4,
            Http2ErrorCode::StreamClosed => 0x5,
            Http2ErrorCode::FrameSizeError => 0x6,
            Http2ErrorCode::RefusedStream => 0x7,
            Http2ErrorCode::Cancel => 0x8,
            Http2ErrorCode::CompressionError => 0x9,
            Http2ErrorCode::ConnectError => 0xa,
            Http2ErrorCode::EnhanceYourCalm => 0xb,
            Http2ErrorCode::InadequateSecurity => 0xc,
            Http2ErrorCode::Http11Required => 0xd,
        }
    }
}

/// The nine-byte frame header: 24-bit length, type, flags, and a 31-bit
/// stream id with one reserved bit (cleared on serialize, masked on parse).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> NetResult<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(frame_err("frame header truncated"));
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let frame_type = FrameType::from_u8(buf[3])
            .ok_or_else(|| frame_err(&format!("unknown frame type {:#x}", buf[3])))?;
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7FFF_FFFF;
        Ok(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        let len = self.length.to_be_bytes();
        buf.extend_from_slice(&[len[1], len[2], len[3]]);
        buf.push(self.frame_type.as_u8());
        buf.push(self.flags);
        buf.extend_from_slice(&(self.stream_id & 0x7FFF_FFFF).to_be_bytes());
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Http2Frame {
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    Headers {
        stream_id: u32,
        fragment: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
        dependency: u32,
        exclusive: bool,
        weight: u8,
    },
    RstStream {
        stream_id: u32,
        error_code: Http2ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Vec<(SettingId, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        fragment: Vec<u8>,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: Http2ErrorCode,
        debug_data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        fragment: Vec<u8>,
        end_headers: bool,
    },
}

fn frame_err(message: &str) -> NetworkError {
    NetworkError::new(ErrorCode::NetworkError, "http2_frame", message)
}

impl Http2Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Http2Frame::Data { .. } => FrameType::Data,
            Http2Frame::Headers { .. } => FrameType::Headers,
            Http2Frame::Priority { .. } => FrameType::Priority,
            Http2Frame::RstStream { .. } => FrameType::RstStream,
            Http2Frame::Settings { .. } => FrameType::Settings,
            Http2Frame::PushPromise { .. } => FrameType::PushPromise,
            Http2Frame::Ping { .. } => FrameType::Ping,
            Http2Frame::GoAway { .. } => FrameType::GoAway,
            Http2Frame::WindowUpdate { .. } => FrameType::WindowUpdate,
            Http2Frame::Continuation { .. } => FrameType::Continuation,
        }
    }

    /// Parses one frame from the start of `buf`; returns the frame and the
    /// bytes consumed.
    pub fn parse(buf: &[u8]) -> NetResult<(Self, usize)> {
        let header = FrameHeader::parse(buf)?;
        let total = FRAME_HEADER_LEN + header.length as usize;
        if buf.len() < total {
            return Err(frame_err("frame payload truncated"));
        }
        let payload = &buf[FRAME_HEADER_LEN..total];
        let frame = Self::parse_payload(&header, payload)?;
        Ok((frame, total))
    }

    fn parse_payload(header: &FrameHeader, payload: &[u8]) -> NetResult<Self> {
        match header.frame_type {
            FrameType::Data => Ok(Http2Frame::Data {
                stream_id: header.stream_id,
                data: payload.to_vec(),
                end_stream: header.flags & FLAG_END_STREAM != 0,
            }),
            FrameType::Headers => Ok(Http2Frame::Headers {
                stream_id: header.stream_id,
                fragment: payload.to_vec(),
                end_stream: header.flags & FLAG_END_STREAM != 0,
                end_headers: header.flags & FLAG_END_HEADERS != 0,
            }),
            FrameType::Priority => {
                if payload.len() != 5 {
                    return Err(frame_err("PRIORITY frame must be 5 bytes"));
                }
                let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Http2Frame::Priority {
                    stream_id: header.stream_id,
                    dependency: raw & 0x7FFF_FFFF,
                    exclusive: raw & 0x8000_0000 != 0,
                    weight: payload[4],
                })
            }
            FrameType::RstStream => {
                if payload.len() != 4 {
                    return Err(frame_err("RST_STREAM frame must be 4 bytes"));
                }
                let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let error_code = Http2ErrorCode::from_u32(raw)
                    .ok_or_else(|| frame_err(&format!("unknown error code {raw:#x}")))?;
                Ok(Http2Frame::RstStream {
                    stream_id: header.stream_id,
                    error_code,
                })
            }
            FrameType::Settings => {
                if payload.len() % 6 != 0 {
                    return Err(frame_err("SETTINGS length must be a multiple of 6"));
                }
                let mut settings = Vec::with_capacity(payload.len() / 6);
                for chunk in payload.chunks_exact(6) {
                    let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                    let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                    // Unknown settings are ignored per RFC 7540 §6.5.2.
                    if let Some(id) = SettingId::from_u16(id) {
                        settings.push((id, value));
                    }
                }
                Ok(Http2Frame::Settings {
                    ack: header.flags & FLAG_ACK != 0,
                    settings,
                })
            }
            FrameType::PushPromise => {
                if payload.len() < 4 {
                    return Err(frame_err("PUSH_PROMISE frame too short"));
                }
                let promised =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & 0x7FFF_FFFF;
                Ok(Http2Frame::PushPromise {
                    stream_id: header.stream_id,
                    promised_stream_id: promised,
                    fragment: payload[4..].to_vec(),
                    end_headers: header.flags & FLAG_END_HEADERS != 0,
                })
            }
            FrameType::Ping => {
                if payload.len() != 8 {
                    return Err(frame_err("PING frame must be 8 bytes"));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(payload);
                Ok(Http2Frame::Ping {
                    ack: header.flags & FLAG_ACK != 0,
                    payload: data,
                })
            }
            FrameType::GoAway => {
                if payload.len() < 8 {
                    return Err(frame_err("GOAWAY frame too short"));
                }
                let last =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & 0x7FFF_FFFF;
                let raw = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                let error_code = Http2ErrorCode::from_u32(raw)
                    .ok_or_else(|| frame_err(&format!("unknown error code {raw:#x}")))?;
                Ok(Http2Frame::GoAway {
                    last_stream_id: last,
                    error_code,
                    debug_data: payload[8..].to_vec(),
                })
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(frame_err("WINDOW_UPDATE frame must be 4 bytes"));
                }
                let increment =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & 0x7FFF_FFFF;
                Ok(Http2Frame::WindowUpdate {
                    stream_id: header.stream_id,
                    increment,
                })
            }
            FrameType::Continuation => Ok(Http2Frame::Continuation {
                stream_id: header.stream_id,
                fragment: payload.to_vec(),
                end_headers: header.flags & FLAG_END_HEADERS != 0,
            }),
        }
    }

    /// Serializes header plus payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        let (stream_id, flags) = match self {
            Http2Frame::Data {
                stream_id,
                data,
                end_stream,
            } => {
                payload.extend_from_slice(data);
                (*stream_id, if *end_stream { FLAG_END_STREAM } else { 0 })
            }
            Http2Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
            } => {
                payload.extend_from_slice(fragment);
                let mut flags = 0;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                (*stream_id, flags)
            }
            Http2Frame::Priority {
                stream_id,
                dependency,
                exclusive,
                weight,
            } => {
                let mut raw = dependency & 0x7FFF_FFFF;
                if *exclusive {
                    raw |= 0x8000_0000;
                }
                payload.extend_from_slice(&raw.to_be_bytes());
                payload.push(*weight);
                (*stream_id, 0)
            }
            Http2Frame::RstStream {
                stream_id,
                error_code,
            } => {
                payload.extend_from_slice(&error_code.as_u32().to_be_bytes());
                (*stream_id, 0)
            }
            Http2Frame::Settings { ack, settings } => {
                for (id, value) in settings {
                    payload.extend_from_slice(&id.as_u16().to_be_bytes());
                    payload.extend_from_slice(&value.to_be_bytes());
                }
                (0, if *ack { FLAG_ACK } else { 0 })
            }
            Http2Frame::PushPromise {
                stream_id,
                promised_stream_id,
                fragment,
                end_headers,
            } => {
                payload.extend_from_slice(&(promised_stream_id & 0x7FFF_FFFF).to_be_bytes());
                payload.extend_from_slice(fragment);
                (*stream_id, if *end_headers { FLAG_END_HEADERS } else { 0 })
            }
            Http2Frame::Ping { ack, payload: data } => {
                payload.extend_from_slice(data);
                (0, if *ack { FLAG_ACK } else { 0 })
            }
            Http2Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                payload.extend_from_slice(&(last_stream_id & 0x7FFF_FFFF).to_be_bytes());
                payload.extend_from_slice(&error_code.as_u32().to_be_bytes());
                payload.extend_from_slice(debug_data);
                (0, 0)
            }
            Http2Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                payload.extend_from_slice(&(increment & 0x7FFF_FFFF).to_be_bytes());
                (*stream_id, 0)
            }
            Http2Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => {
                payload.extend_from_slice(fragment);
                (*stream_id, if *end_headers { FLAG_END_HEADERS } else { 0 })
            }
        };

        let header = FrameHeader {
            length: payload.len() as u32,
            frame_type: self.frame_type(),
            flags,
            stream_id,
        };
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        header.serialize(&mut out);
        out.extend_from_slice(&payload);
        out
    }
}

/// Parses a buffer of concatenated frames.
pub fn parse_frames(mut buf: &[u8]) -> NetResult<Vec<Http2Frame>> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        let (frame, consumed) = Http2Frame::parse(buf)?;
        frames.push(frame);
        buf = &buf[consumed..];
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Http2Frame) {
        let wire = frame.serialize();
        let (parsed, consumed) = Http2Frame::parse(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(parsed, frame);
    }

    #[test]
    fn all_ten_types_round_trip() {
        round_trip(Http2Frame::Data {
            stream_id: 1,
            data: b"hello".to_vec(),
            end_stream: true,
        });
        round_trip(Http2Frame::Headers {
            stream_id: 3,
            fragment: vec![0x82, 0x86],
            end_stream: false,
            end_headers: true,
        });
        round_trip(Http2Frame::Priority {
            stream_id: 5,
            dependency: 3,
            exclusive: true,
            weight: 255,
        });
        round_trip(Http2Frame::RstStream {
            stream_id: 7,
            error_code: Http2ErrorCode::Cancel,
        });
        round_trip(Http2Frame::Settings {
            ack: false,
            settings: vec![
                (SettingId::HeaderTableSize, 4096),
                (SettingId::EnablePush, 0),
                (SettingId::MaxConcurrentStreams, 100),
                (SettingId::InitialWindowSize, 65_535),
                (SettingId::MaxFrameSize, 16_384),
                (SettingId::MaxHeaderListSize, 8192),
            ],
        });
        round_trip(Http2Frame::Settings {
            ack: true,
            settings: Vec::new(),
        });
        round_trip(Http2Frame::PushPromise {
            stream_id: 1,
            promised_stream_id: 2,
            fragment: vec![0x88],
            end_headers: true,
        });
        round_trip(Http2Frame::Ping {
            ack: true,
            payload: [1, 2, 3, 4, 5, 6, 7, 8],
        });
        round_trip(Http2Frame::GoAway {
            last_stream_id: 9,
            error_code: Http2ErrorCode::EnhanceYourCalm,
            debug_data: b"slow down".to_vec(),
        });
        round_trip(Http2Frame::WindowUpdate {
            stream_id: 0,
            increment: 1 << 20,
        });
        round_trip(Http2Frame::Continuation {
            stream_id: 3,
            fragment: vec![0x84],
            end_headers: false,
        });
    }

    #[test]
    fn flag_permutations_round_trip() {
        for end_stream in [false, true] {
            for end_headers in [false, true] {
                round_trip(Http2Frame::Headers {
                    stream_id: 11,
                    fragment: vec![0x82],
                    end_stream,
                    end_headers,
                });
            }
            round_trip(Http2Frame::Data {
                stream_id: 11,
                data: Vec::new(),
                end_stream,
            });
        }
    }

    #[test]
    fn reserved_stream_bit_is_masked() {
        let mut wire = Http2Frame::Data {
            stream_id: 1,
            data: vec![0xFF],
            end_stream: false,
        }
        .serialize();
        // Force the reserved bit on the wire.
        wire[5] |= 0x80;
        let (parsed, _) = Http2Frame::parse(&wire).unwrap();
        assert_eq!(
            parsed,
            Http2Frame::Data {
                stream_id: 1,
                data: vec![0xFF],
                end_stream: false,
            }
        );
    }

    #[test]
    fn header_layout_is_nine_bytes() {
        let header = FrameHeader {
            length: 0x01_02_03,
            frame_type: FrameType::Ping,
            flags: FLAG_ACK,
            stream_id: 0,
        };
        let mut wire = Vec::new();
        header.serialize(&mut wire);
        assert_eq!(wire, vec![0x01, 0x02, 0x03, 0x6, 0x1, 0, 0, 0, 0]);
        assert_eq!(FrameHeader::parse(&wire).unwrap(), header);
    }

    #[test]
    fn size_violations_are_frame_size_errors() {
        let bad_ping = FrameHeader {
            length: 5,
            frame_type: FrameType::Ping,
            flags: 0,
            stream_id: 0,
        };
        let mut wire = Vec::new();
        bad_ping.serialize(&mut wire);
        wire.extend_from_slice(&[0; 5]);
        assert!(Http2Frame::parse(&wire).is_err());

        let bad_rst = FrameHeader {
            length: 3,
            frame_type: FrameType::RstStream,
            flags: 0,
            stream_id: 1,
        };
        let mut wire = Vec::new();
        bad_rst.serialize(&mut wire);
        wire.extend_from_slice(&[0; 3]);
        assert!(Http2Frame::parse(&wire).is_err());
    }

    #[test]
    fn truncated_and_unknown_frames_rejected() {
        assert!(FrameHeader::parse(&[0; 8]).is_err());
        // Unknown type 0xA.
        let wire = [0, 0, 0, 0xA, 0, 0, 0, 0, 1];
        assert!(FrameHeader::parse(&wire).is_err());
    }

    #[test]
    fn unknown_settings_are_skipped() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x1u16.to_be_bytes());
        payload.extend_from_slice(&4096u32.to_be_bytes());
        payload.extend_from_slice(&0xFFu16.to_be_bytes()); // unknown id
        payload.extend_from_slice(&7u32.to_be_bytes());
        let header = FrameHeader {
            length: payload.len() as u32,
            frame_type: FrameType::Settings,
            flags: 0,
            stream_id: 0,
        };
        let mut wire = Vec::new();
        header.serialize(&mut wire);
        wire.extend_from_slice(&payload);
        let (parsed, _) = Http2Frame::parse(&wire).unwrap();
        assert_eq!(
            parsed,
            Http2Frame::Settings {
                ack: false,
                settings: vec![(SettingId::HeaderTableSize, 4096)],
            }
        );
    }

    #[test]
    fn error_code_values_match_rfc() {
        assert_eq!(Http2ErrorCode::NoError.as_u32(), 0x0);
        assert_eq!(Http2ErrorCode::FlowControlError.as_u32(), 0x3);
        assert_eq!(Http2ErrorCode::Http11Required.as_u32(), 0xd);
        assert_eq!(
            Http2ErrorCode::from_u32(0xc),
            Some(Http2ErrorCode::InadequateSecurity)
        );
        assert_eq!(Http2ErrorCode::from_u32(0xe), None);
    }

    #[test]
    fn multiple_frames_parse_in_sequence() {
        let mut wire = Http2Frame::Ping {
            ack: false,
            payload: [0; 8],
        }
        .serialize();
        wire.extend(
            Http2Frame::WindowUpdate {
                stream_id: 1,
                increment: 100,
            }
            .serialize(),
        );
        let frames = parse_frames(&wire).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type(), FrameType::Ping);
        assert_eq!(frames[1].frame_type(), FrameType::WindowUpdate);
    }
}
