use crate::http::parser::{ParseError, ParseLimits, RequestParser};
use crate::http::request::{percent_decode, Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::{is_disconnect, serialize_response, WriteQueue};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Ceiling on bytes read before a request's body starts. A client that sends
/// this much without completing the request head is cut off.
const MAX_REQUEST_HEAD: i64 = 8192;

/// Socket read size per recv.
const RECV_SIZE: usize = 8192;

pub(crate) type Handler = dyn Fn(Request) -> Response + Send + Sync;

/// Limits and timeouts shared by every connection of one server.
pub(crate) struct ConnectionConfig {
    pub limits: ParseLimits,
    pub client_timeout: Duration,
    pub keep_alive_enabled: bool,
    /// Deadline for requests after the first; zero falls back to
    /// `client_timeout`.
    pub keep_alive_timeout: Duration,
}

/// Drives a single accepted socket through its request/response lifecycle.
///
/// One driver task per connection: it receives bytes, feeds the resumable
/// parser, dispatches completed requests to the user callback and enqueues
/// the serialized response on the connection's write queue. The loop repeats
/// while keep-alive holds; on any exit path the write queue is drained
/// before the socket closes, so a final error response always reaches the
/// wire.
///
/// # State machine
///
/// ```text
///         ┌───────────────────────────────────────────────┐
///         │                                               ▼
///  start → recv → method → uri → protocol → headers → [body] → dispatch
///            ▲                                                    │
///            │ need more bytes: any stage, back to recv           │
///            │                                                    │
///            └── keep-alive: reset parser ◄───────────────────────┤
///                no keep-alive: drain + close ◄───────────────────┘
/// ```
pub struct Connection {
    reader: OwnedReadHalf,
    queue: WriteQueue,
    parser: RequestParser,
    config: Arc<ConnectionConfig>,
    handler: Arc<Handler>,
    /// Bytes received before the current request's body. Goes negative right
    /// after a body is consumed so the body bytes do not count against the
    /// next request's head.
    request_header_read: i64,
    requests: u64,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        config: Arc<ConnectionConfig>,
        handler: Arc<Handler>,
    ) -> Self {
        let (reader, write_half) = stream.into_split();
        let parser = RequestParser::new(config.limits.clone());

        Self {
            reader,
            queue: WriteQueue::new(write_half),
            parser,
            config,
            handler,
            request_header_read: 0,
            requests: 0,
        }
    }

    /// Runs the connection until the peer disconnects, keep-alive ends, a
    /// deadline fires or a request is rejected.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut recv_buf = [0u8; RECV_SIZE];

        loop {
            if self.request_header_read >= MAX_REQUEST_HEAD {
                tracing::debug!("request head over limit, closing");
                break;
            }

            let deadline = self.deadline();
            let n = match timeout(deadline, self.reader.read(&mut recv_buf)).await {
                Err(_) => {
                    tracing::debug!(timeout_secs = deadline.as_secs(), "client timed out");
                    self.reject(StatusCode::RequestTimeout).await;
                    return Ok(());
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) if is_disconnect(&e) => break,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "recv failed");
                    break;
                }
            };

            self.request_header_read += n as i64;
            self.parser.feed(&recv_buf[..n]);

            match self.advance() {
                // Mid-element, go get more bytes
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    self.fail(e).await;
                    return Ok(());
                }
            }

            self.requests += 1;
            let keep_alive = self.config.keep_alive_enabled && self.parser.can_keep_alive();
            let request = self.take_request();
            let method = request.method;
            let path = request.path.clone();
            let started = Instant::now();

            let handler = Arc::clone(&self.handler);
            let response = match catch_unwind(AssertUnwindSafe(move || handler(request))) {
                Ok(response) => response,
                Err(_) => {
                    tracing::error!(method = ?method, path = %path, "request callback panicked");
                    self.queue.enqueue(serialize_response(&Response::internal_error()));
                    break;
                }
            };

            tracing::info!(
                method = ?method,
                path = %path,
                status = response.status.as_u16(),
                duration_ms = started.elapsed().as_millis() as u64,
                "request completed"
            );

            self.queue.enqueue(serialize_response(&response));

            if !keep_alive {
                break;
            }
            self.parser.reset();
        }

        self.queue.drain().await;
        Ok(())
    }

    /// First request gets the client timeout; keep-alive successors get the
    /// keep-alive timeout when one is configured.
    fn deadline(&self) -> Duration {
        if self.requests == 0 || self.config.keep_alive_timeout.is_zero() {
            self.config.client_timeout
        } else {
            self.config.keep_alive_timeout
        }
    }

    /// Runs each parser stage that is not yet satisfied for this request.
    ///
    /// `Ok(true)` means a full request is parsed; `Ok(false)` means some
    /// stage ran out of bytes and the caller should recv again.
    fn advance(&mut self) -> Result<bool, ParseError> {
        if self.parser.method().is_none() && !run_stage(self.parser.parse_method())? {
            return Ok(false);
        }
        if self.parser.uri().is_none() && !run_stage(self.parser.parse_uri())? {
            return Ok(false);
        }
        if self.parser.protocol().is_none() && !run_stage(self.parser.parse_protocol())? {
            return Ok(false);
        }
        if self.parser.headers().is_none() || self.parser.headers_incomplete() {
            if !run_stage(self.parser.parse_headers())? {
                return Ok(false);
            }
        }
        if self.parser.method() != Some(Method::GET) && !self.parser.body_done() {
            if !run_stage(self.parser.parse_body())? {
                return Ok(false);
            }
            // Body bytes must not count against the next request's head
            self.request_header_read = -(self.config.limits.max_body_size as i64);
        }

        Ok(true)
    }

    fn take_request(&mut self) -> Request {
        let method = self.parser.method().expect("method stage complete");
        let protocol = self.parser.protocol().expect("protocol stage complete");
        let path = percent_decode(self.parser.uri().expect("uri stage complete")).into_owned();

        Request {
            method,
            path,
            protocol,
            headers: self.parser.take_headers(),
            body: self.parser.take_body(),
        }
    }

    /// Applies the parse-error policy: some rejections get a response before
    /// the connection ends, the rest end it silently.
    async fn fail(&mut self, err: ParseError) {
        let status = match err {
            ParseError::UriTooLarge => Some(StatusCode::UriTooLarge),
            ParseError::TooManyHeaders | ParseError::HeaderTooLarge => {
                Some(StatusCode::HeaderFieldsTooLarge)
            }
            ParseError::TooLarge => Some(StatusCode::ContentTooLarge),
            _ => None,
        };

        match status {
            Some(status) => {
                tracing::debug!(error = %err, status = status.as_u16(), "rejecting request");
                self.reject(status).await;
            }
            None => {
                tracing::debug!(error = %err, "closing on parse error");
                self.queue.drain().await;
            }
        }
    }

    async fn reject(&mut self, status: StatusCode) {
        self.queue
            .enqueue(serialize_response(&Response::engine_error(status)));
        self.queue.drain().await;
    }
}

fn run_stage(result: Result<(), ParseError>) -> Result<bool, ParseError> {
    match result {
        Ok(()) => Ok(true),
        Err(ParseError::TooSmall) => Ok(false),
        Err(e) => Err(e),
    }
}
