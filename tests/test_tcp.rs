//! Raw TCP host/connect scenarios.

use lantern::server::tcp::{connect, host, TcpDelegate, TcpHandle, TcpOptions};

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Server side: echoes every payload back with a prefix and reports
/// lifecycle events over channels.
struct EchoServer {
    data_tx: mpsc::UnboundedSender<(u64, Bytes)>,
    closed_tx: mpsc::UnboundedSender<u64>,
}

impl TcpDelegate for EchoServer {
    fn data(&self, conn: &TcpHandle, data: Bytes) {
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(&data);
        conn.send(reply);
        let _ = self.data_tx.send((conn.id(), data));
    }

    fn closed(&self, conn: &TcpHandle) {
        let _ = self.closed_tx.send(conn.id());
    }
}

/// Client side: forwards received payloads to the test body.
struct Recorder {
    data_tx: mpsc::UnboundedSender<Bytes>,
    closed_tx: mpsc::UnboundedSender<()>,
}

impl TcpDelegate for Recorder {
    fn data(&self, _conn: &TcpHandle, data: Bytes) {
        let _ = self.data_tx.send(data);
    }

    fn closed(&self, _conn: &TcpHandle) {
        let _ = self.closed_tx.send(());
    }
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("event before deadline")
        .expect("channel open")
}

#[tokio::test]
async fn test_ping_pong_two_clients() {
    let (data_tx, mut server_data) = mpsc::unbounded_channel();
    let (closed_tx, mut server_closed) = mpsc::unbounded_channel();
    let server = host(TcpOptions::default(), EchoServer { data_tx, closed_tx })
        .await
        .unwrap();
    let addr = server.local_addr();

    let (c1_data_tx, mut c1_data) = mpsc::unbounded_channel();
    let (c1_closed_tx, _c1_closed) = mpsc::unbounded_channel();
    let c1 = connect(
        &addr.ip().to_string(),
        addr.port(),
        Recorder {
            data_tx: c1_data_tx,
            closed_tx: c1_closed_tx,
        },
    )
    .await
    .unwrap();

    let (c2_data_tx, mut c2_data) = mpsc::unbounded_channel();
    let (c2_closed_tx, _c2_closed) = mpsc::unbounded_channel();
    let c2 = connect(
        &addr.ip().to_string(),
        addr.port(),
        Recorder {
            data_tx: c2_data_tx,
            closed_tx: c2_closed_tx,
        },
    )
    .await
    .unwrap();

    c1.send(&b"from one"[..]);
    c2.send(&b"from two"[..]);

    // The server's data callback fires once per client with its payload
    let mut payloads = vec![recv(&mut server_data).await, recv(&mut server_data).await];
    payloads.sort_by_key(|(id, _)| *id);
    let received: Vec<_> = payloads
        .iter()
        .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
        .collect();
    assert!(received.contains(&"from one".to_string()));
    assert!(received.contains(&"from two".to_string()));

    // Each client hears its own echo
    assert_eq!(recv(&mut c1_data).await.as_ref(), b"echo:from one");
    assert_eq!(recv(&mut c2_data).await.as_ref(), b"echo:from two");

    // Stopping the clients surfaces one close per server connection
    c1.stop();
    c2.stop();
    let mut closed = vec![recv(&mut server_closed).await, recv(&mut server_closed).await];
    closed.sort_unstable();
    closed.dedup();
    assert_eq!(closed.len(), 2);

    server.stop();
}

#[tokio::test]
async fn test_server_stop_closes_connections_eagerly() {
    let (data_tx, mut server_data) = mpsc::unbounded_channel();
    let (closed_tx, mut server_closed) = mpsc::unbounded_channel();
    let server = host(TcpOptions::default(), EchoServer { data_tx, closed_tx })
        .await
        .unwrap();
    let addr = server.local_addr();

    let (c_data_tx, mut c_data) = mpsc::unbounded_channel();
    let (c_closed_tx, mut c_closed) = mpsc::unbounded_channel();
    let client = connect(
        &addr.ip().to_string(),
        addr.port(),
        Recorder {
            data_tx: c_data_tx,
            closed_tx: c_closed_tx,
        },
    )
    .await
    .unwrap();

    // Make sure the server has the connection registered before stopping
    client.send(&b"hi"[..]);
    let (_, payload) = recv(&mut server_data).await;
    assert_eq!(payload.as_ref(), b"hi");
    assert_eq!(recv(&mut c_data).await.as_ref(), b"echo:hi");

    server.stop();

    // Both sides observe the eager close
    recv(&mut server_closed).await;
    recv(&mut c_closed).await;

    client.join().await.unwrap();
}

#[tokio::test]
async fn test_connect_refused_when_nothing_listens() {
    // Bind then drop a listener to find a port that is closed
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let (data_tx, _data) = mpsc::unbounded_channel();
    let (closed_tx, _closed) = mpsc::unbounded_channel();
    let result = connect(
        "127.0.0.1",
        port,
        Recorder { data_tx, closed_tx },
    )
    .await;

    assert!(result.is_err());
}
