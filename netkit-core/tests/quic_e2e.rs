//! QUIC end-to-end over loopback: handshake, default-stream echo,
//! multi-stream exchange with FIN, and the stream-limit boundary.

#![cfg(feature = "experimental")]

use netkit_core::config::{QuicClientConfig, QuicServerConfig};
use netkit_core::error::ErrorCode;
use netkit_core::quic::{QuicClient, QuicServer};
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !probe() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct CertFiles {
    cert: std::path::PathBuf,
    key: std::path::PathBuf,
}

impl CertFiles {
    fn generate(tag: &str) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert_path = std::env::temp_dir();
        cert_path.push(format!("netkit-quic-{tag}-{}.pem", std::process::id()));
        let mut key_path = std::env::temp_dir();
        key_path.push(format!("netkit-quic-{tag}-{}.key", std::process::id()));
        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(cert.cert.pem().as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(cert.signing_key.serialize_pem().as_bytes())
            .unwrap();
        Self {
            cert: cert_path,
            key: key_path,
        }
    }
}

impl Drop for CertFiles {
    fn drop(&mut self) {
        std::fs::remove_file(&self.cert).ok();
        std::fs::remove_file(&self.key).ok();
    }
}

fn server_config(certs: &CertFiles, enable_retry: bool) -> QuicServerConfig {
    QuicServerConfig {
        cert_file: certs.cert.to_string_lossy().into_owned(),
        key_file: certs.key.to_string_lossy().into_owned(),
        ca_cert_file: None,
        require_client_cert: false,
        alpn_protocols: vec!["h3".into()],
        max_idle_timeout_ms: 30_000,
        initial_max_data: 1 << 20,
        initial_max_stream_data: 1 << 16,
        initial_max_streams_bidi: 2,
        initial_max_streams_uni: 2,
        max_connections: 8,
        enable_retry,
        retry_key: Vec::new(),
    }
}

fn client_config() -> QuicClientConfig {
    QuicClientConfig {
        verify_server: false,
        alpn_protocols: vec!["h3".into()],
        ..QuicClientConfig::default()
    }
}

#[tokio::test]
async fn default_stream_round_trip() {
    init_tracing();
    let certs = CertFiles::generate("s4");
    let server = Arc::new(QuicServer::new("s4", server_config(&certs, false)));
    {
        let echo = Arc::clone(&server);
        server.set_receive_callback(move |session_id, data| {
            echo.send_to_session(session_id, data).unwrap();
        });
    }
    server.start(41051).await.unwrap();

    let client = Arc::new(QuicClient::new("s4", client_config()));
    let inbox: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let inbox = inbox.clone();
        client.set_receive_callback(move |data| {
            inbox.lock().unwrap().push(data);
        });
    }
    client.start("localhost", 41051).await.unwrap();

    wait_until(|| client.is_handshake_complete()).await;
    assert_eq!(client.alpn_protocol().as_deref(), Some("h3"));
    wait_until(|| server.session_count() == 1).await;

    client.send_packet(vec![b'A', b'B', b'C']).unwrap();
    wait_until(|| !inbox.lock().unwrap().is_empty()).await;
    let echoed: Vec<u8> = inbox.lock().unwrap().concat();
    assert_eq!(echoed, b"ABC");

    assert!(client.stats().packets_sent > 0);
    let server_stats = server
        .get_session(&server.sessions().session_ids()[0])
        .downcast_ref::<netkit_core::quic::QuicSession>()
        .map(|session| session.stats())
        .unwrap();
    assert!(server_stats.packets_sent > 0);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn multi_stream_with_fin_and_stream_limit() {
    init_tracing();
    let certs = CertFiles::generate("s5");
    let server = Arc::new(QuicServer::new("s5", server_config(&certs, false)));
    let server_streams: Arc<Mutex<Vec<(u64, Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = server_streams.clone();
        let replier = Arc::clone(&server);
        server.set_stream_receive_callback(move |session_id, stream_id, data, fin| {
            seen.lock().unwrap().push((stream_id, data, fin));
            if fin && stream_id != 0 {
                replier
                    .send_on_stream(session_id, stream_id, vec![b'Z'], true)
                    .unwrap();
            }
        });
    }
    server.start(41052).await.unwrap();

    let client = Arc::new(QuicClient::new("s5", client_config()));
    let client_streams: Arc<Mutex<Vec<(u64, Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = client_streams.clone();
        client.set_stream_receive_callback(move |stream_id, data, fin| {
            seen.lock().unwrap().push((stream_id, data, fin));
        });
    }
    client.start("localhost", 41052).await.unwrap();
    wait_until(|| client.is_handshake_complete()).await;

    // Exercise the default stream first so the explicit stream is distinct.
    client.send_packet(b"warmup".to_vec()).unwrap();

    let stream_id = client.create_stream().unwrap();
    assert_ne!(stream_id, 0);
    client
        .send_on_stream(stream_id, vec![b'X', b'Y'], true)
        .unwrap();

    wait_until(|| {
        server_streams
            .lock()
            .unwrap()
            .iter()
            .any(|(id, _, fin)| *id == stream_id && *fin)
    })
    .await;
    {
        let seen = server_streams.lock().unwrap();
        let bytes: Vec<u8> = seen
            .iter()
            .filter(|(id, _, _)| *id == stream_id)
            .flat_map(|(_, data, _)| data.clone())
            .collect();
        assert_eq!(bytes, b"XY");
    }

    // The server's FIN'd reply arrives on the same stream.
    wait_until(|| {
        client_streams
            .lock()
            .unwrap()
            .iter()
            .any(|(id, _, fin)| *id == stream_id && *fin)
    })
    .await;
    {
        let seen = client_streams.lock().unwrap();
        let bytes: Vec<u8> = seen
            .iter()
            .filter(|(id, _, _)| *id == stream_id)
            .flat_map(|(_, data, _)| data.clone())
            .collect();
        assert_eq!(bytes, b"Z");
    }

    // Two bidi streams (default + explicit) exhaust the server's cap of 2.
    let err = client.create_stream().unwrap_err();
    assert_eq!(err.code, ErrorCode::StreamLimit);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn retry_validates_addresses_transparently() {
    init_tracing();
    let certs = CertFiles::generate("retry");
    let server = Arc::new(QuicServer::new("retry", server_config(&certs, true)));
    {
        let echo = Arc::clone(&server);
        server.set_receive_callback(move |session_id, data| {
            echo.send_to_session(session_id, data).unwrap();
        });
    }
    server.start(41053).await.unwrap();

    let client = Arc::new(QuicClient::new("retry", client_config()));
    let inbox: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let inbox = inbox.clone();
        client.set_receive_callback(move |data| {
            inbox.lock().unwrap().push(data);
        });
    }
    client.start("localhost", 41053).await.unwrap();

    // The extra round trip happens under the hood; the handshake still
    // completes and data flows.
    wait_until(|| client.is_handshake_complete()).await;
    client.send_packet(b"validated".to_vec()).unwrap();
    wait_until(|| !inbox.lock().unwrap().is_empty()).await;
    assert_eq!(inbox.lock().unwrap().concat(), b"validated");

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}
