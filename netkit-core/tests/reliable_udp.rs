//! Reliable-UDP client/server over loopback.

#![cfg(feature = "experimental")]

use netkit_core::reliability::{ReliabilityMode, ReliableUdpClient, ReliableUdpServer};
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
async fn ordered_delivery_over_loopback() {
    let server = Arc::new(ReliableUdpServer::new("rudp", ReliabilityMode::ReliableOrdered));
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        server.set_receive_callback(move |_session_id, data| {
            received.lock().unwrap().push(data);
        });
    }
    server.start(41011).await.unwrap();

    let client = ReliableUdpClient::new("rudp", ReliabilityMode::ReliableOrdered);
    client.start("127.0.0.1", 41011).await.unwrap();

    for seq in 1u8..=4 {
        client.send_packet(vec![seq]).unwrap();
    }

    wait_until(|| received.lock().unwrap().len() == 4).await;
    assert_eq!(
        *received.lock().unwrap(),
        vec![vec![1], vec![2], vec![3], vec![4]]
    );

    // Every packet was acknowledged; nothing needed retransmission on a
    // loss-free loopback, and the ACKs produced RTT samples.
    wait_until(|| client.stats().acks_received == 4).await;
    let stats = client.stats();
    assert_eq!(stats.packets_sent, 4);
    assert_eq!(stats.packets_retransmitted, 0);
    assert_eq!(stats.packets_dropped, 0);
    assert!(stats.average_rtt_ms > 0.0);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_replies_through_session() {
    let server = Arc::new(ReliableUdpServer::new("rudp2", ReliabilityMode::ReliableOrdered));
    let session_ids: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let session_ids = session_ids.clone();
        server.set_connection_callback(move |session_id| {
            session_ids.lock().unwrap().push(session_id.to_string());
        });
    }
    {
        let echo = Arc::clone(&server);
        server.set_receive_callback(move |session_id, data| {
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&data);
            echo.send_to_session(session_id, reply).unwrap();
        });
    }
    server.start(41012).await.unwrap();

    let client = ReliableUdpClient::new("rudp2", ReliabilityMode::ReliableOrdered);
    let replies: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let replies = replies.clone();
        client.set_receive_callback(move |data| {
            replies.lock().unwrap().push(data);
        });
    }
    client.start("127.0.0.1", 41012).await.unwrap();
    client.send_packet(b"hello".to_vec()).unwrap();

    wait_until(|| !replies.lock().unwrap().is_empty()).await;
    assert_eq!(replies.lock().unwrap()[0], b"re:hello");
    assert_eq!(server.session_count(), 1);
    assert_eq!(session_ids.lock().unwrap().len(), 1);

    // FIN from the client retires the server-side peer.
    client.stop().await.unwrap();
    wait_until(|| server.session_count() == 0).await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn unreliable_mode_carries_datagrams() {
    let server = Arc::new(ReliableUdpServer::new("plain", ReliabilityMode::Unreliable));
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        server.set_receive_callback(move |_session_id, data| {
            received.lock().unwrap().push(data);
        });
    }
    server.start(41013).await.unwrap();

    let client = ReliableUdpClient::new("plain", ReliabilityMode::Unreliable);
    client.start("127.0.0.1", 41013).await.unwrap();
    client.send_packet(b"fire-and-forget".to_vec()).unwrap();

    wait_until(|| !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap()[0], b"fire-and-forget");
    // No ACK traffic in unreliable mode.
    assert_eq!(client.stats().acks_received, 0);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}
