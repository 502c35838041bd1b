//! Shared core types for the gripd workspace.
//!
//! This crate holds everything more than one layer needs: the request-id
//! model, the HTTP header/request/response data types, RFC 6455 frame
//! encoding, the in-process message bus the components talk over, and the
//! stats engine.

pub mod bus;
pub mod headers;
pub mod http;
pub mod rid;
pub mod stats;
pub mod status;
pub mod websocket;

pub use headers::{HeaderParameters, HttpHeaders, ParseMode};
pub use http::{HttpRequestData, HttpResponseData};
pub use rid::Rid;
pub use status::status_reason;
