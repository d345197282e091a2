//! rustls configuration assembly for the QUIC components.
//!
//! Translates the public [`QuicClientConfig`]/[`QuicServerConfig`] values
//! (certificate paths, verification policy, ALPN, early data) into rustls
//! configs, and hosts the resumption-store wrapper that surfaces new TLS
//! session tickets to the application.

use crate::callback::{CallbackSlot, SessionTicketCallback};
use crate::error::{ErrorCode, NetResult, NetworkError};
use crate::pem::{load_certs, load_key, root_store};
use base64::Engine as _;
use netkit_config::{QuicClientConfig, QuicServerConfig};
use rustls::RootCertStore;
use rustls::client::ClientSessionStore;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Certificate verifier that accepts anything; selected only by explicit
/// `verify_server: false` configuration.
#[derive(Debug)]
struct AcceptAnyServerCert(rustls::crypto::WebPkiSupportedAlgorithms);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// Resumption store that notifies the application whenever the TLS layer
/// caches a new session ticket. Raw tickets are not exportable from rustls;
/// the notification carries an opaque ticket id instead.
pub struct ObservingSessionStore {
    inner: Arc<dyn ClientSessionStore>,
    ticket_cb: Arc<CallbackSlot<SessionTicketCallback>>,
    ticket_seq: AtomicU64,
    max_early_data: u32,
}

impl ObservingSessionStore {
    pub fn new(
        ticket_cb: Arc<CallbackSlot<SessionTicketCallback>>,
        max_early_data: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(rustls::client::ClientSessionMemoryCache::new(64)),
            ticket_cb,
            ticket_seq: AtomicU64::new(0),
            max_early_data,
        })
    }
}

impl std::fmt::Debug for ObservingSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservingSessionStore").finish_non_exhaustive()
    }
}

impl ClientSessionStore for ObservingSessionStore {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: rustls::NamedGroup) {
        self.inner.set_kx_hint(server_name, group)
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<rustls::NamedGroup> {
        self.inner.kx_hint(server_name)
    }

    fn set_tls12_session(
        &self,
        server_name: ServerName<'static>,
        value: rustls::client::Tls12ClientSessionValue,
    ) {
        self.inner.set_tls12_session(server_name, value)
    }

    fn tls12_session(
        &self,
        server_name: &ServerName<'_>,
    ) -> Option<rustls::client::Tls12ClientSessionValue> {
        self.inner.tls12_session(server_name)
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        self.inner.remove_tls12_session(server_name)
    }

    fn insert_tls13_ticket(
        &self,
        server_name: ServerName<'static>,
        value: rustls::client::Tls13ClientSessionValue,
    ) {
        let seq = self.ticket_seq.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = self.ticket_cb.get() {
            let ticket_id = base64::engine::general_purpose::STANDARD
                .encode(format!("{server_name:?}#{seq}"))
                .into_bytes();
            cb(ticket_id, 0, self.max_early_data);
        }
        self.inner.insert_tls13_ticket(server_name, value)
    }

    fn take_tls13_ticket(
        &self,
        server_name: &ServerName<'static>,
    ) -> Option<rustls::client::Tls13ClientSessionValue> {
        self.inner.take_tls13_ticket(server_name)
    }
}

/// Builds the rustls client config for a QUIC client.
pub fn build_client_config(
    source: &str,
    config: &QuicClientConfig,
    resumption_store: Arc<ObservingSessionStore>,
) -> NetResult<Arc<rustls::ClientConfig>> {
    let provider = super::crypto::provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| {
            NetworkError::new(
                ErrorCode::InternalError,
                source,
                format!("TLS 1.3 unavailable: {e}"),
            )
        })?;

    let builder = if config.verify_server {
        let roots = match &config.ca_cert_file {
            Some(path) => root_store(source, path)?,
            None => RootCertStore::empty(),
        };
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(
                provider.signature_verification_algorithms,
            )))
    };

    let mut tls = match (&config.client_cert_file, &config.client_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(source, cert_path)?;
            let key = load_key(source, key_path)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                NetworkError::new(
                    ErrorCode::InvalidArgument,
                    source,
                    format!("client certificate rejected: {e}"),
                )
            })?
        }
        _ => builder.with_no_client_auth(),
    };

    tls.alpn_protocols = config
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    tls.enable_early_data = config.enable_early_data;
    tls.resumption = rustls::client::Resumption::store(resumption_store);
    Ok(Arc::new(tls))
}

/// Builds the rustls server config for a QUIC server.
pub fn build_server_config(source: &str, config: &QuicServerConfig) -> NetResult<Arc<rustls::ServerConfig>> {
    let provider = super::crypto::provider();
    let builder = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| {
            NetworkError::new(
                ErrorCode::InternalError,
                source,
                format!("TLS 1.3 unavailable: {e}"),
            )
        })?;

    let builder = if config.require_client_cert {
        let ca_path = config.ca_cert_file.as_ref().ok_or_else(|| {
            NetworkError::invalid_argument(
                source,
                "require_client_cert set without ca_cert_file",
            )
        })?;
        let roots = root_store(source, ca_path)?;
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| {
                NetworkError::new(
                    ErrorCode::InvalidArgument,
                    source,
                    format!("client verifier setup failed: {e}"),
                )
            })?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let certs = load_certs(source, &config.cert_file)?;
    let key = load_key(source, &config.key_file)?;
    let mut tls = builder.with_single_cert(certs, key).map_err(|e| {
        NetworkError::new(
            ErrorCode::InvalidArgument,
            source,
            format!("server certificate rejected: {e}"),
        )
    })?;

    tls.alpn_protocols = config
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    // QUIC requires the sentinel value when early data is on at all.
    tls.max_early_data_size = u32::MAX;
    Ok(Arc::new(tls))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("netkit-tls-test-{name}-{}", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn client_config_without_verification() {
        let config = QuicClientConfig {
            verify_server: false,
            alpn_protocols: vec!["h3".into()],
            ..QuicClientConfig::default()
        };
        let store = ObservingSessionStore::new(Arc::new(CallbackSlot::new()), 0);
        let tls = build_client_config("test", &config, store).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"h3".to_vec()]);
    }

    #[test]
    fn server_config_from_generated_cert() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_path = write_temp("cert", &cert.cert.pem());
        let key_path = write_temp("key", &cert.signing_key.serialize_pem());

        let config = QuicServerConfig {
            cert_file: cert_path.to_string_lossy().into_owned(),
            key_file: key_path.to_string_lossy().into_owned(),
            ca_cert_file: None,
            require_client_cert: false,
            alpn_protocols: vec!["h3".into()],
            max_idle_timeout_ms: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data: 1 << 16,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            max_connections: 16,
            enable_retry: false,
            retry_key: Vec::new(),
        };
        let tls = build_server_config("test", &config).unwrap();
        assert_eq!(tls.max_early_data_size, u32::MAX);

        std::fs::remove_file(cert_path).ok();
        std::fs::remove_file(key_path).ok();
    }

    #[test]
    fn missing_cert_file_is_reported() {
        let config = QuicServerConfig {
            cert_file: "/nonexistent/cert.pem".into(),
            key_file: "/nonexistent/key.pem".into(),
            ca_cert_file: None,
            require_client_cert: false,
            alpn_protocols: Vec::new(),
            max_idle_timeout_ms: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data: 1 << 16,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            max_connections: 16,
            enable_retry: true,
            retry_key: Vec::new(),
        };
        let err = build_server_config("test", &config).unwrap_err();
        assert!(!err.message.is_empty());
        assert!(err.details.unwrap().contains("cert.pem"));
    }
}
