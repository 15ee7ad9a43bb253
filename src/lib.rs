//! Lantern - embeddable HTTP/1.x line server and raw TCP primitives
//!
//! Core library for serving HTTP/1.x over per-connection driver tasks.

pub mod config;
pub mod http;
pub mod server;
