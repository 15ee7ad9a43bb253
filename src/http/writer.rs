use crate::http::response::Response;
use bytes::Bytes;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Renders a response into HTTP/1.1 wire bytes.
///
/// Status line, headers as given, blank line, then the body. A missing
/// `Content-Length` is injected from the body size; caller headers are
/// written verbatim in their original case.
pub fn serialize_response(resp: &Response) -> Bytes {
    let mut buf = Vec::new();

    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    for (k, v) in &resp.headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if let Some(body) = &resp.body {
        let has_length = resp
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-length"));
        if !has_length {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
    }

    buf.extend_from_slice(b"\r\n");

    if let Some(body) = &resp.body {
        buf.extend_from_slice(body);
    }

    Bytes::from(buf)
}

/// Errors by which the peer or the OS signals that the socket is gone.
///
/// Members of this set end a read or write loop silently; anything else is
/// logged first.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

enum WriteCommand {
    Data(Bytes),
    Drain(oneshot::Sender<()>),
    Shutdown,
}

/// Serialized per-connection sender.
///
/// All bytes for one socket go through a single writer task that owns the
/// write half, so messages hit the wire in enqueue order and partial writes
/// never interleave. [`drain`](Self::drain) is the barrier: it resolves once
/// everything enqueued before it has been accepted by the socket. Dropping
/// the last clone shuts the write half down after the queue empties.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl WriteQueue {
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_loop(write_half, rx));
        Self { tx }
    }

    /// Appends a message to the queue. Messages for a closed socket are
    /// dropped.
    pub fn enqueue(&self, bytes: Bytes) {
        let _ = self.tx.send(WriteCommand::Data(bytes));
    }

    /// Waits until all previously enqueued bytes have been written, or the
    /// socket has failed. Returns immediately when the queue is idle.
    pub async fn drain(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriteCommand::Drain(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Shuts the write half down once everything enqueued so far is out.
    /// Later messages are dropped, as for any closed socket.
    pub fn close(&self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
    }
}

async fn drain_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Data(bytes) => {
                let mut written = 0;
                while written < bytes.len() {
                    match write_half.write(&bytes[written..]).await {
                        Ok(0) => return,
                        Ok(n) => written += n,
                        Err(e) if is_disconnect(&e) => return,
                        Err(e) => {
                            tracing::warn!(error = %e, "send failed");
                            return;
                        }
                    }
                }
            }
            WriteCommand::Drain(ack) => {
                let _ = ack.send(());
            }
            WriteCommand::Shutdown => break,
        }
    }

    // Queue closed or handles dropped: flush the FIN
    let _ = write_half.shutdown().await;
}
