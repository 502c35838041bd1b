//! Proxy layer: route resolution, proxy sessions, WebSocket GRIP
//! extension handling, and the accept handoff toward the handler.

pub mod accept;
pub mod engine;
pub mod routes;
pub mod session;
pub mod wssession;

pub use accept::{AcceptClient, AcceptOutcome};
pub use engine::{ProxyConfig, ProxyEngine};
pub use routes::{RouteEntry, RouteTable, Scheme, Target, TargetKind};
pub use session::{ProxySession, SessionContext, SessionOutcome};
pub use wssession::{WsOutcome, WsProxySession};
