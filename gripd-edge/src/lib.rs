//! Edge adapter: bridges an external web server's request/response protocol
//! to the internal ZHTTP transport.
//!
//! The external server terminates sockets and HTTP parsing; we own
//! per-connection session state, chunked and WebSocket framing toward the
//! client, flow-control credit conversion, idle expiry, and worker handoff.

pub mod adapter;
pub mod packet;
pub mod session;

pub use adapter::{EdgeAdapter, EdgeConfig};
