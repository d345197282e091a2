//! Packet protection glue over the `rustls::quic` key schedule.
//!
//! rustls supplies the TLS 1.3 handshake and per-space keys; this module
//! applies them to packets: initial secrets, AEAD sealing/opening, header
//! protection, packet-number coding, and the Retry integrity tag
//! (RFC 9001 §5.8).

use super::cid::ConnectionId;
use crate::error::{ErrorCode, NetResult, NetworkError};
use ring::aead;
use rustls::Side;
use rustls::crypto::CryptoProvider;
use rustls::quic::{DirectionalKeys, Keys, Version};
use std::sync::Arc;

/// Packet numbers are always sent with the full four-byte encoding; the
/// decoder still honors any length a peer chooses.
pub const PN_LEN: usize = 4;

/// The crypto provider shared by every netkit QUIC endpoint.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Initial-space keys derived from the client's first DCID (RFC 9001 §5.2).
pub fn initial_keys(dcid: &ConnectionId, side: Side) -> NetResult<Keys> {
    let provider = provider();
    let suite = provider
        .cipher_suites
        .iter()
        .find_map(|suite| match suite {
            rustls::SupportedCipherSuite::Tls13(tls13)
                if tls13.common.suite == rustls::CipherSuite::TLS13_AES_128_GCM_SHA256 =>
            {
                Some(*tls13)
            }
            _ => None,
        })
        .ok_or_else(|| {
            NetworkError::new(
                ErrorCode::InternalError,
                "quic_crypto",
                "provider lacks TLS13_AES_128_GCM_SHA256",
            )
        })?;
    let quic_suite = suite.quic.ok_or_else(|| {
        NetworkError::new(
            ErrorCode::InternalError,
            "quic_crypto",
            "initial suite lacks QUIC support",
        )
    })?;
    Ok(Keys::initial(
        Version::V1,
        suite,
        quic_suite,
        dcid.as_slice(),
        side,
    ))
}

/// Seals one packet in place.
///
/// `packet` holds the serialized header followed by the 4-byte packet number;
/// `pn_offset` marks where the packet number begins. The payload is encrypted,
/// the tag appended, and header protection applied. Returns the finished wire
/// bytes.
pub fn seal_packet(
    keys: &DirectionalKeys,
    pn: u64,
    mut packet: Vec<u8>,
    pn_offset: usize,
    mut payload: Vec<u8>,
) -> NetResult<Vec<u8>> {
    let tag = keys
        .packet
        .encrypt_in_place(pn, &packet, &mut payload)
        .map_err(crypto_err)?;
    packet.extend_from_slice(&payload);
    packet.extend_from_slice(tag.as_ref());

    let sample_start = pn_offset + PN_LEN;
    let sample_len = keys.header.sample_len();
    if packet.len() < sample_start + sample_len {
        return Err(NetworkError::new(
            ErrorCode::InternalError,
            "quic_crypto",
            "packet too short for header protection sample",
        ));
    }
    let sample = packet[sample_start..sample_start + sample_len].to_vec();
    let (head, tail) = packet.split_at_mut(pn_offset);
    keys.header
        .encrypt_in_place(&sample, &mut head[0], &mut tail[..PN_LEN])
        .map_err(crypto_err)?;
    Ok(packet)
}

/// Result of opening one protected packet.
pub struct OpenedPacket {
    pub pn: u64,
    pub plaintext: Vec<u8>,
}

/// Removes header protection and decrypts the payload of the packet occupying
/// `packet[..packet_len]`, where `pn_offset` marks the protected packet
/// number. `largest_pn` is the highest packet number seen in this space.
pub fn open_packet(
    keys: &DirectionalKeys,
    packet: &[u8],
    pn_offset: usize,
    largest_pn: Option<u64>,
) -> NetResult<OpenedPacket> {
    let sample_len = keys.header.sample_len();
    let sample_start = pn_offset + PN_LEN;
    if packet.len() < sample_start + sample_len {
        return Err(NetworkError::new(
            ErrorCode::NetworkError,
            "quic_crypto",
            "packet too short for header protection sample",
        ));
    }
    let sample = packet[sample_start..sample_start + sample_len].to_vec();

    let mut header = packet[..pn_offset + PN_LEN].to_vec();
    let (head, tail) = header.split_at_mut(pn_offset);
    keys.header
        .decrypt_in_place(&sample, &mut head[0], &mut tail[..PN_LEN])
        .map_err(crypto_err)?;

    let pn_len = (header[0] & 0x03) as usize + 1;
    let mut truncated: u64 = 0;
    for byte in &header[pn_offset..pn_offset + pn_len] {
        truncated = (truncated << 8) | u64::from(*byte);
    }
    let pn = decode_packet_number(truncated, pn_len, largest_pn);

    let aad = &header[..pn_offset + pn_len];
    let mut ciphertext = packet[pn_offset + pn_len..].to_vec();
    let plaintext = keys
        .packet
        .decrypt_in_place(pn, aad, &mut ciphertext)
        .map_err(crypto_err)?;
    let plaintext = plaintext.to_vec();
    Ok(OpenedPacket { pn, plaintext })
}

/// RFC 9000 Appendix A.3 packet number reconstruction.
pub fn decode_packet_number(truncated: u64, pn_len: usize, largest: Option<u64>) -> u64 {
    let expected = largest.map_or(0, |l| l + 1);
    let pn_nbits = 8 * pn_len as u32;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;
    let candidate = (expected & !pn_mask) | truncated;
    if candidate + pn_hwin <= expected && candidate + pn_win < (1 << 62) {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

fn crypto_err(err: rustls::Error) -> NetworkError {
    NetworkError::new(
        ErrorCode::NetworkError,
        "quic_crypto",
        format!("packet protection failure: {err}"),
    )
}

// ---------------------------------------------------------------------
// Retry integrity (RFC 9001 §5.8)
// ---------------------------------------------------------------------

const RETRY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// Tag over the Retry pseudo-packet: ODCID-length, ODCID, then the Retry
/// packet bytes without the tag.
pub fn retry_integrity_tag(odcid: &ConnectionId, retry_without_tag: &[u8]) -> NetResult<[u8; 16]> {
    let mut pseudo = Vec::with_capacity(1 + odcid.len() + retry_without_tag.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid.as_slice());
    pseudo.extend_from_slice(retry_without_tag);

    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_KEY).map_err(|_| {
            NetworkError::new(ErrorCode::InternalError, "quic_crypto", "retry key setup failed")
        })?,
    );
    let nonce = aead::Nonce::assume_unique_for_key(RETRY_NONCE);
    let mut empty: Vec<u8> = Vec::new();
    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(pseudo), &mut empty)
        .map_err(|_| {
            NetworkError::new(ErrorCode::InternalError, "quic_crypto", "retry tag sealing failed")
        })?;
    let mut out = [0u8; 16];
    out.copy_from_slice(tag.as_ref());
    Ok(out)
}

/// Constant-shape verification of a received Retry packet's tag.
pub fn verify_retry_integrity(
    odcid: &ConnectionId,
    retry_without_tag: &[u8],
    tag: &[u8; 16],
) -> bool {
    matches!(retry_integrity_tag(odcid, retry_without_tag), Ok(expected) if &expected == tag)
}
