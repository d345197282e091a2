//! End-to-end TCP echo over loopback.

use netkit_core::tcp::{TcpClient, TcpServer};
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
async fn tcp_echo_round_trip() {
    let server = Arc::new(TcpServer::new("echo"));
    let server_seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let server_seen = server_seen.clone();
        let echo = Arc::clone(&server);
        server.set_receive_callback(move |session_id, data| {
            server_seen.lock().unwrap().push(data.clone());
            echo.send_to_session(session_id, data).unwrap();
        });
    }
    server.start(41001).await.unwrap();
    assert!(server.is_running());

    let client = Arc::new(TcpClient::new("probe"));
    let client_seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let client_seen = client_seen.clone();
        client.set_receive_callback(move |data| {
            client_seen.lock().unwrap().extend_from_slice(&data);
        });
    }
    client.start("127.0.0.1", 41001).await.unwrap();
    assert!(client.is_running());

    client.send_packet(vec![0x01, 0x02, 0x03]).unwrap();

    wait_until(|| client_seen.lock().unwrap().len() == 3).await;
    assert_eq!(*client_seen.lock().unwrap(), vec![0x01, 0x02, 0x03]);
    assert_eq!(server_seen.lock().unwrap()[0], vec![0x01, 0x02, 0x03]);
    assert_eq!(server.session_count(), 1);

    client.stop().await.unwrap();
    client.wait_for_stop().await;

    // The server notices the disconnect and the registry empties.
    wait_until(|| server.session_count() == 0).await;

    server.stop().await.unwrap();
    server.wait_for_stop().await;
    assert!(!server.is_running());
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn broadcast_reaches_all_clients() {
    let server = Arc::new(TcpServer::new("bcast"));
    server.start(41002).await.unwrap();

    let mut clients = Vec::new();
    let mut inboxes = Vec::new();
    for i in 0..3 {
        let client = Arc::new(TcpClient::new(format!("c{i}")));
        let inbox: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let inbox = inbox.clone();
            client.set_receive_callback(move |data| {
                inbox.lock().unwrap().extend_from_slice(&data);
            });
        }
        client.start("127.0.0.1", 41002).await.unwrap();
        clients.push(client);
        inboxes.push(inbox);
    }

    timeout(Duration::from_secs(5), async {
        while server.session_count() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(server.broadcast(b"fan-out"), 3);
    timeout(Duration::from_secs(5), async {
        while inboxes.iter().any(|inbox| inbox.lock().unwrap().is_empty()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    for inbox in &inboxes {
        assert_eq!(inbox.lock().unwrap().as_slice(), b"fan-out");
    }

    for client in &clients {
        client.stop().await.unwrap();
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn double_stop_is_quiet() {
    let server = Arc::new(TcpServer::new("idem"));
    server.start(41003).await.unwrap();
    server.stop().await.unwrap();
    server.stop().await.unwrap();
    server.wait_for_stop().await;

    // Restart on the same port works after a clean stop.
    server.start(41003).await.unwrap();
    server.stop().await.unwrap();
}
