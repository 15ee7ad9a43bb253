//! HTTP/1.x line server engine.
//!
//! This module implements the byte-oriented request parser and the
//! per-connection machinery that turns an accepted socket into a stream of
//! request callbacks.
//!
//! # Architecture
//!
//! - **`parser`**: resumable request parser; survives arbitrary TCP
//!   segmentations by stashing the unread tail between reads
//! - **`request`**: parsed request representation handed to the callback
//! - **`response`**: response representation with builder pattern
//! - **`writer`**: response serialization and the per-connection write queue
//! - **`connection`**: the driver loop: recv, parse, dispatch, keep-alive
//!
//! # Connection lifecycle
//!
//! Each accepted connection cycles through:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Receive   │ ← Wait for request bytes
//!        └──────┬──────┘
//!               │ Request complete
//!               ▼
//!        ┌──────────────────┐
//!        │    Dispatch      │ ← Run the request callback
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Enqueue       │ ← Hand response to the write queue
//!        └──────┬───────────┘
//!               │
//!               ├─ Keep-Alive → Receive (parser reset, same connection)
//!               └─ Close → drain write queue, close socket
//! ```
//!
//! # Example
//!
//! ```ignore
//! use lantern::server::listener::{serve, ServeOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = serve(
//!         ServeOptions::default().with_port(8088),
//!         |_req| "hello",
//!     )
//!     .await?;
//!     server.join().await
//! }
//! ```

pub mod connection;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
