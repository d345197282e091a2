//! Stateless retry tokens for address validation (RFC 9000 §8.1.2).
//!
//! Tokens are MAC'd over the client IP, the original DCID, and the issue
//! time; the server keeps no per-client state. The key is taken from the
//! server configuration or freshly generated per server start when empty, so
//! tokens never outlive a server run.

use super::cid::ConnectionId;
use rand::RngCore;
use ring::hmac;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAC_LEN: usize = 32;

/// Default validity window for issued tokens.
pub const DEFAULT_TOKEN_WINDOW: Duration = Duration::from_secs(30);

pub struct RetryTokenIssuer {
    key: hmac::Key,
    window: Duration,
}

impl RetryTokenIssuer {
    /// Builds an issuer from configured key bytes; an empty slice selects a
    /// fresh random key.
    pub fn new(key_bytes: &[u8], window: Duration) -> Self {
        let key = if key_bytes.is_empty() {
            let mut fresh = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut fresh);
            hmac::Key::new(hmac::HMAC_SHA256, &fresh)
        } else {
            hmac::Key::new(hmac::HMAC_SHA256, key_bytes)
        };
        Self { key, window }
    }

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn mac(&self, client_ip: IpAddr, odcid: &ConnectionId, issued_at: u64) -> hmac::Tag {
        let mut message = Vec::new();
        match client_ip {
            IpAddr::V4(ip) => message.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => message.extend_from_slice(&ip.octets()),
        }
        message.extend_from_slice(odcid.as_slice());
        message.extend_from_slice(&issued_at.to_be_bytes());
        hmac::sign(&self.key, &message)
    }

    /// Mints a token binding the client address to the original DCID.
    ///
    /// Layout: odcid length (1) | odcid | issue time (8, BE) | MAC (32).
    pub fn mint(&self, client_ip: IpAddr, odcid: &ConnectionId) -> Vec<u8> {
        let issued_at = Self::unix_now();
        let mut token = Vec::with_capacity(1 + odcid.len() + 8 + MAC_LEN);
        token.push(odcid.len() as u8);
        token.extend_from_slice(odcid.as_slice());
        token.extend_from_slice(&issued_at.to_be_bytes());
        token.extend_from_slice(self.mac(client_ip, odcid, issued_at).as_ref());
        token
    }

    /// Validates a token presented from `client_ip`; returns the original
    /// DCID it was issued for. `None` covers forged, foreign, and expired
    /// tokens alike.
    pub fn validate(&self, client_ip: IpAddr, token: &[u8]) -> Option<ConnectionId> {
        let odcid_len = *token.first()? as usize;
        let rest = token.get(1..)?;
        if rest.len() != odcid_len + 8 + MAC_LEN {
            return None;
        }
        let odcid = ConnectionId::new(&rest[..odcid_len]).ok()?;
        let issued_at = u64::from_be_bytes(rest[odcid_len..odcid_len + 8].try_into().ok()?);
        let mac = &rest[odcid_len + 8..];

        let expected = self.mac(client_ip, &odcid, issued_at);
        if ring::constant_time::verify_slices_are_equal(expected.as_ref(), mac).is_err() {
            return None;
        }

        let now = Self::unix_now();
        if now < issued_at || now - issued_at > self.window.as_secs() {
            return None;
        }
        Some(odcid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn issuer() -> RetryTokenIssuer {
        RetryTokenIssuer::new(&[], DEFAULT_TOKEN_WINDOW)
    }

    #[test]
    fn mint_validate_round_trip() {
        let issuer = issuer();
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
        let odcid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let token = issuer.mint(ip, &odcid);
        assert_eq!(issuer.validate(ip, &token), Some(odcid));
    }

    #[test]
    fn token_is_address_bound() {
        let issuer = issuer();
        let odcid = ConnectionId::new(&[9; 8]).unwrap();
        let token = issuer.mint(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)), &odcid);
        assert!(
            issuer
                .validate(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8)), &token)
                .is_none()
        );
    }

    #[test]
    fn tampered_token_rejected() {
        let issuer = issuer();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let odcid = ConnectionId::new(&[5; 8]).unwrap();
        let mut token = issuer.mint(ip, &odcid);
        let last = token.len() - 1;
        token[last] ^= 1;
        assert!(issuer.validate(ip, &token).is_none());
        assert!(issuer.validate(ip, &[]).is_none());
        assert!(issuer.validate(ip, &token[..4]).is_none());
    }

    #[test]
    fn keys_do_not_cross_validate() {
        let a = issuer();
        let b = issuer();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let odcid = ConnectionId::new(&[5; 8]).unwrap();
        let token = a.mint(ip, &odcid);
        assert!(b.validate(ip, &token).is_none());
    }

    #[test]
    fn expired_token_rejected() {
        let issuer = RetryTokenIssuer::new(b"fixed-test-key", Duration::from_secs(0));
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let odcid = ConnectionId::new(&[5; 8]).unwrap();
        let mut token = issuer.mint(ip, &odcid);
        // Backdate the issue time by two seconds and re-sign.
        let issued_at = RetryTokenIssuer::unix_now() - 2;
        let odcid_len = odcid.len();
        token[1 + odcid_len..1 + odcid_len + 8].copy_from_slice(&issued_at.to_be_bytes());
        let mac = issuer.mac(ip, &odcid, issued_at);
        token.truncate(1 + odcid_len + 8);
        token.extend_from_slice(mac.as_ref());
        assert!(issuer.validate(ip, &token).is_none());
    }
}
