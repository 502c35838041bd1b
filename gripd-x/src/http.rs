//! HTTP request and response payload containers.

use bytes::Bytes;

use crate::headers::HttpHeaders;

/// An HTTP request as carried between components.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequestData {
    pub method: String,
    pub uri: String,
    pub headers: HttpHeaders,
    pub body: Bytes,
}

/// An HTTP response as carried between components.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponseData {
    pub code: u16,
    pub reason: Bytes,
    pub headers: HttpHeaders,
    pub body: Bytes,
}

impl Default for HttpResponseData {
    fn default() -> Self {
        Self {
            code: 200,
            reason: Bytes::from_static(b"OK"),
            headers: HttpHeaders::new(),
            body: Bytes::new(),
        }
    }
}

impl HttpResponseData {
    pub fn new(code: u16, reason: impl Into<Bytes>) -> Self {
        Self {
            code,
            reason: reason.into(),
            headers: HttpHeaders::new(),
            body: Bytes::new(),
        }
    }
}
