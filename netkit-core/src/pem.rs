//! PEM certificate and key loading shared by the TLS-capable components.

use crate::error::{ErrorCode, NetResult, NetworkError};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;

pub(crate) fn load_certs(source: &str, path: &str) -> NetResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        NetworkError::from_io(source, "open certificate", e).with_details(format!("path={path}"))
    })?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| {
        NetworkError::from_io(source, "parse certificate", e).with_details(format!("path={path}"))
    })?;
    if certs.is_empty() {
        return Err(NetworkError::invalid_argument(
            source,
            format!("no certificates found in {path}"),
        ));
    }
    Ok(certs)
}

pub(crate) fn load_key(source: &str, path: &str) -> NetResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        NetworkError::from_io(source, "open private key", e).with_details(format!("path={path}"))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            NetworkError::from_io(source, "parse private key", e)
                .with_details(format!("path={path}"))
        })?
        .ok_or_else(|| {
            NetworkError::invalid_argument(source, format!("no private key found in {path}"))
        })
}

pub(crate) fn root_store(source: &str, path: &str) -> NetResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(source, path)? {
        roots.add(cert).map_err(|e| {
            NetworkError::new(
                ErrorCode::InvalidArgument,
                source,
                format!("unusable CA certificate: {e}"),
            )
        })?;
    }
    Ok(roots)
}
