//! ZHTTP session layer.
//!
//! ZHTTP carries HTTP and WebSocket traffic over the bus as sequenced,
//! credit-flow-controlled packet streams. Each request/response exchange is
//! one session, addressed by rid. A session endpoint uses three bus
//! endpoints:
//!
//! - `<base>-in` — push/pull, first packet of each new request
//! - `<base>-in-stream` — router/dealer, subsequent client-to-server
//!   packets, addressed by the receiving worker's instance id
//! - `<base>-out` — pub/sub, server-to-client packets, filtered by the
//!   client's instance id prefix
//!
//! Invariants enforced here: the first packet in each direction carries a
//! reply address; `seq` is monotonic per direction from zero and a gap
//! cancels the session; a sender never exceeds the credits its peer has
//! granted; sessions idle past [`SESSION_EXPIRE`] are cancelled.

mod client;
mod server;
mod table;

pub use client::{ClientManager, ClientRequest, OutboundRequest};
pub use server::{ServerHandle, ServerManager, ServerRequest, SessionState};

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use gripd_wire::zhttp::ContentType;
use gripd_x::HttpHeaders;

/// Idle sessions are cancelled after this long without traffic.
pub const SESSION_EXPIRE: Duration = Duration::from_secs(60);

/// Keep-alives are emitted at half the expiry interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default receive-buffer grant advertised to peers.
pub const DEFAULT_CREDITS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum ZhttpError {
    #[error("bus error: {0}")]
    Bus(#[from] gripd_x::bus::BusError),

    #[error("session not started")]
    NotStarted,

    #[error("session already finished")]
    Finished,

    #[error("insufficient credit: need {need}, have {have}")]
    InsufficientCredit { need: usize, have: usize },

    #[error("peer reply address unknown")]
    NoPeerAddress,
}

pub type Result<T> = std::result::Result<T, ZhttpError>;

/// Events a session surfaces to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// First data packet of a response (client side only).
    Headers {
        code: u16,
        reason: Bytes,
        headers: HttpHeaders,
        body: Bytes,
        more: bool,
        credits: u32,
    },
    /// Body continuation in either direction.
    Body {
        data: Bytes,
        more: bool,
        content_type: Option<ContentType>,
    },
    /// Peer granted more send credit.
    Credit(u32),
    /// Peer started a handoff; delivery pauses until a new owner speaks.
    HandoffStart,
    /// Peer acknowledged our handoff.
    HandoffProceed,
    /// WebSocket close.
    Close { status: Option<u16> },
    /// Typed failure from the peer. The session is over.
    Error { condition: Bytes },
    /// Peer cancelled (or the session expired). The session is over.
    Cancelled,
}

impl SessionEvent {
    /// Whether this event terminates the session.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Error { .. } | Self::Cancelled => true,
            Self::Body { more, .. } => !more,
            Self::Close { .. } => true,
            _ => false,
        }
    }
}

/// Bus endpoint names for one ZHTTP link.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub base: String,
}

impl EndpointSpec {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn in_endpoint(&self) -> String {
        format!("{}-in", self.base)
    }

    pub fn in_stream_endpoint(&self) -> String {
        format!("{}-in-stream", self.base)
    }

    pub fn out_endpoint(&self) -> String {
        format!("{}-out", self.base)
    }
}
