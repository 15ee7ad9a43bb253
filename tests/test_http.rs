//! End-to-end scenarios against a served socket.

use lantern::http::response::{Response, ResponseBuilder, StatusCode};
use lantern::server::listener::{serve, KeepAlive, ServeOptions, Server};

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn ephemeral() -> ServeOptions {
    ServeOptions::default().with_port(0)
}

async fn client(server: &Server) -> TcpStream {
    TcpStream::connect(server.local_addr())
        .await
        .expect("connect to server")
}

/// Reads one response: headers, then a Content-Length delimited body.
async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse::<usize>().expect("content-length value"))
                .unwrap_or(0);
            let total = end + 4 + length;
            if buf.len() >= total {
                return String::from_utf8_lossy(&buf[..total]).into_owned();
            }
        }

        let n = timeout(WAIT, stream.read(&mut tmp))
            .await
            .expect("response before deadline")
            .expect("read response");
        if n == 0 {
            return String::from_utf8_lossy(&buf).into_owned();
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Reads until the server closes the connection. A reset after the response
/// bytes arrived counts as closed.
async fn read_until_close(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        match timeout(WAIT, stream.read(&mut tmp))
            .await
            .expect("close before deadline")
        {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[tokio::test]
async fn test_echo_200() {
    let server = serve(ephemeral(), |_req| "hello").await.unwrap();

    let mut stream = client(&server).await;
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.ends_with("hello"));

    server.stop();
}

#[tokio::test]
async fn test_keep_alive_reuse() {
    let server = serve(ephemeral(), |req| format!("saw {}", req.path))
        .await
        .unwrap();

    let mut stream = client(&server).await;

    stream
        .write_all(b"GET /first HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let first = read_response(&mut stream).await;
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first.ends_with("saw /first"));

    stream
        .write_all(b"GET /second HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let second = read_response(&mut stream).await;
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(second.ends_with("saw /second"));

    server.stop();
}

#[tokio::test]
async fn test_path_is_percent_decoded() {
    let server = serve(ephemeral(), |req| req.path).await.unwrap();

    let mut stream = client(&server).await;
    stream
        .write_all(b"GET /a%20b HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_close(&mut stream).await;
    assert!(response.ends_with("/a b"));
}

#[tokio::test]
async fn test_uri_too_large_gets_414() {
    let server = serve(ephemeral(), |_req| "unreached").await.unwrap();

    let mut stream = client(&server).await;
    let request = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(300));
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = read_until_close(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 414 URI Too Large\r\n"));
}

#[tokio::test]
async fn test_too_many_headers_gets_431() {
    let server = serve(ephemeral(), |_req| "unreached").await.unwrap();

    let mut stream = client(&server).await;
    let mut request = String::from("GET / HTTP/1.1\r\n");
    for i in 0..101 {
        request.push_str(&format!("h{i}: v\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = read_until_close(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
}

#[tokio::test]
async fn test_body_over_limit_gets_413() {
    let options = ephemeral().with_max_body_size(8);
    let server = serve(options, |_req| "unreached").await.unwrap();

    let mut stream = client(&server).await;
    let mut request = b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n".to_vec();
    request.extend_from_slice(&[b'x'; 100]);
    stream.write_all(&request).await.unwrap();

    let response = read_until_close(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 413 Content Too Large\r\n"));
}

#[tokio::test]
async fn test_post_body_reaches_handler() {
    let server = serve(ephemeral(), |req| {
        let body = req.body.as_deref().unwrap_or_default().to_vec();
        ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .build()
    })
    .await
    .unwrap();

    let mut stream = client(&server).await;
    stream
        .write_all(b"POST /data HTTP/1.1\r\nConnection: close\r\nContent-Length: 7\r\n\r\npayload")
        .await
        .unwrap();

    let response = read_until_close(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 7\r\n"));
    assert!(response.ends_with("payload"));
}

#[tokio::test]
async fn test_handler_panic_gets_500() {
    let server = serve(ephemeral(), |_req| -> Response {
        panic!("handler exploded")
    })
    .await
    .unwrap();

    let mut stream = client(&server).await;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_close(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));

    server.stop();
}

#[tokio::test]
async fn test_idle_client_gets_408() {
    let options = ephemeral().with_client_timeout(Duration::from_secs(1));
    let server = serve(options, |_req| "unreached").await.unwrap();

    let mut stream = client(&server).await;
    // Send nothing and wait for the deadline to fire
    let response = read_until_close(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
    assert!(response.to_ascii_lowercase().contains("connection: close"));
}

#[tokio::test]
async fn test_http10_closes_after_response() {
    let server = serve(ephemeral(), |_req| "old").await.unwrap();

    let mut stream = client(&server).await;
    stream
        .write_all(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_close(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("old"));
}

#[tokio::test]
async fn test_keep_alive_disabled_closes_after_first_response() {
    let options = ephemeral().with_keep_alive(KeepAlive {
        enabled: false,
        timeout: Duration::ZERO,
    });
    let server = serve(options, |_req| "one shot").await.unwrap();

    let mut stream = client(&server).await;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    // Connection must end even though HTTP/1.1 defaults to keep-alive
    let response = read_until_close(&mut stream).await;
    assert!(response.ends_with("one shot"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_backpressure_holds_connection_ceiling() {
    let options = ephemeral().with_max_connections(2);
    let server = serve(options, |_req| {
        // Hold the connection long enough for the ceiling to matter
        std::thread::sleep(Duration::from_millis(100));
        "slow"
    })
    .await
    .unwrap();

    let addr = server.local_addr();
    let clients: Vec<_> = (0..4)
        .map(|_| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                stream
                    .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
                    .await
                    .unwrap();
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await.unwrap();
                String::from_utf8_lossy(&buf).into_owned()
            })
        })
        .collect();

    // The registry must never exceed the ceiling while clients drain
    for _ in 0..20 {
        assert!(server.connection_count() <= 2);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    for handle in clients {
        let response = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(response.ends_with("slow"), "client got: {response}");
    }

    server.stop();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_ends_accepting() {
    let server = serve(ephemeral(), |_req| "up").await.unwrap();
    let addr = server.local_addr();

    server.stop();
    server.stop();
    server.join().await.unwrap();

    // The listener is gone; a fresh connect must fail
    let result = timeout(WAIT, TcpStream::connect(addr)).await.unwrap();
    assert!(result.is_err());
}
