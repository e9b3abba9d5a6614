//! Socket transport to the worker process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐      Unix / TCP socket       ┌─────────────────────┐
//! │  Bridge         │  ◄──────────────────────────►│   worker process    │
//! │ (SocketChannel) │    JSON + Content-Length     │                     │
//! └─────────────────┘                              └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 51\r\n
//! \r\n
//! {"type":"command","id":1,"command":{"name":"PING"}}
//! ```
//!
//! The worker answers each command with
//! `{"id":1,"status":"ok","payload":"PONG"}` (or `"status":"error"` /
//! `"status":"timeout"`). After `{"type":"done"}` it closes the connection.

pub mod framing;
mod socket;

pub use framing::{read_message, write_message, FramingError};
pub use socket::SocketChannel;
