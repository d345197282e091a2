//! Plain UDP client/server round trips over loopback.

use netkit_core::config::SessionConfig;
use netkit_core::udp::{UdpClient, UdpServer};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;

async fn wait_until(mut probe: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !probe() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn udp_echo_round_trip() {
    let server = Arc::new(UdpServer::new("udp-echo"));
    let server_seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let admitted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let admitted = admitted.clone();
        server.set_connection_callback(move |session_id| {
            admitted.lock().unwrap().push(session_id.to_string());
        });
    }
    {
        let server_seen = server_seen.clone();
        let echo = Arc::clone(&server);
        server.set_receive_callback(move |session_id, data| {
            server_seen.lock().unwrap().push(data.clone());
            echo.send_to_session(session_id, data).unwrap();
        });
    }
    server.start(41071).await.unwrap();

    let client = Arc::new(UdpClient::new("udp-probe"));
    let client_seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let client_seen = client_seen.clone();
        client.set_receive_callback(move |data| {
            client_seen.lock().unwrap().push(data);
        });
    }
    client.start("127.0.0.1", 41071).await.unwrap();
    client.send_packet(vec![0x0A, 0x0B]).await.unwrap();

    wait_until(|| !client_seen.lock().unwrap().is_empty()).await;
    assert_eq!(client_seen.lock().unwrap()[0], vec![0x0A, 0x0B]);
    assert_eq!(server_seen.lock().unwrap()[0], vec![0x0A, 0x0B]);
    assert_eq!(server.session_count(), 1);
    assert_eq!(admitted.lock().unwrap().len(), 1);

    // The same peer keeps its session id across datagrams.
    client.send_packet(vec![0x0C]).await.unwrap();
    wait_until(|| client_seen.lock().unwrap().len() == 2).await;
    assert_eq!(server.session_count(), 1);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
    server.wait_for_stop().await;
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn broadcast_reaches_all_peers() {
    let server = Arc::new(UdpServer::new("udp-bcast"));
    server.start(41072).await.unwrap();
    assert_eq!(server.broadcast(b"early"), 0);

    let mut clients = Vec::new();
    let mut inboxes = Vec::new();
    for i in 0..3 {
        let client = Arc::new(UdpClient::new(format!("c{i}")));
        let inbox: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let inbox = inbox.clone();
            client.set_receive_callback(move |data| {
                inbox.lock().unwrap().push(data);
            });
        }
        client.start("127.0.0.1", 41072).await.unwrap();
        // A first datagram registers the peer with the session manager.
        client.send_packet(b"hello".to_vec()).await.unwrap();
        clients.push(client);
        inboxes.push(inbox);
    }

    wait_until(|| server.session_count() == 3).await;
    assert_eq!(server.broadcast(b"fan-out"), 3);

    timeout(Duration::from_secs(5), async {
        while inboxes.iter().any(|inbox| inbox.lock().unwrap().is_empty()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    for inbox in &inboxes {
        assert_eq!(inbox.lock().unwrap()[0], b"fan-out".to_vec());
    }

    for client in &clients {
        client.stop().await.unwrap();
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn admission_limit_drops_extra_peers() {
    let server = Arc::new(UdpServer::with_session_config(
        "udp-full",
        SessionConfig {
            max_sessions: 1,
            ..SessionConfig::default()
        },
    ));
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        server.set_receive_callback(move |_session_id, data| {
            received.lock().unwrap().push(data);
        });
    }
    server.start(41073).await.unwrap();

    let first = UdpClient::new("first");
    first.start("127.0.0.1", 41073).await.unwrap();
    first.send_packet(b"one".to_vec()).await.unwrap();
    wait_until(|| server.session_count() == 1).await;

    // A second endpoint is over the limit; its datagrams are dropped.
    let second = UdpClient::new("second");
    second.start("127.0.0.1", 41073).await.unwrap();
    second.send_packet(b"two".to_vec()).await.unwrap();
    wait_until(|| server.sessions().total_rejected() >= 1).await;
    assert_eq!(server.session_count(), 1);
    assert_eq!(received.lock().unwrap().as_slice(), &[b"one".to_vec()]);

    // The admitted peer keeps flowing.
    first.send_packet(b"three".to_vec()).await.unwrap();
    wait_until(|| received.lock().unwrap().len() == 2).await;

    first.stop().await.unwrap();
    second.stop().await.unwrap();
    server.stop().await.unwrap();
}
