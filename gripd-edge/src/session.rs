//! Per-connection state and HTTP/WebSocket byte emission.

use bytes::{BufMut, Bytes, BytesMut};

use gripd_wire::zhttp::ContentType;
use gripd_x::websocket::{self, Frame, Opcode};
use gripd_x::HttpHeaders;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Http,
    WebSocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    V1_0,
    V1_1,
}

/// State for one external connection bridged to a ZHTTP session.
pub struct EdgeSession {
    pub sender: Bytes,
    pub ext_id: Bytes,
    pub zhttp_id: Bytes,
    pub mode: Mode,
    pub http_version: HttpVersion,

    pub persistent: bool,
    pub allow_chunked: bool,
    pub respond_keep_alive: bool,
    pub respond_close: bool,
    pub chunked: bool,

    /// Request-body bytes accepted so far (continuation offset check).
    pub read_count: u64,
    /// Inbound body buffered while a handoff is in progress.
    pub pending_in: BytesMut,
    pub pending_in_more: bool,
    /// Credits received from the worker while in handoff.
    pub pending_in_credits: u32,

    pub sent_response_header: bool,
    pub out_seq: u64,
    pub in_seq: u64,

    /// Current worker reply address; learned from the first response.
    pub zhttp_address: Option<Bytes>,

    pub in_finished: bool,
    pub down_closed: bool,
    pub up_closed: bool,
    pub in_handoff: bool,

    pub written: u64,
    pub confirmed_written: u64,

    pub last_active: Instant,
}

impl EdgeSession {
    pub fn new(
        sender: Bytes,
        ext_id: Bytes,
        zhttp_id: Bytes,
        mode: Mode,
        http_version: HttpVersion,
        now: Instant,
    ) -> Self {
        Self {
            sender,
            ext_id,
            zhttp_id,
            mode,
            http_version,
            persistent: false,
            allow_chunked: http_version == HttpVersion::V1_1,
            respond_keep_alive: false,
            respond_close: false,
            chunked: false,
            read_count: 0,
            pending_in: BytesMut::new(),
            pending_in_more: false,
            pending_in_credits: 0,
            sent_response_header: false,
            out_seq: 0,
            in_seq: 0,
            zhttp_address: None,
            in_finished: false,
            down_closed: false,
            up_closed: false,
            in_handoff: false,
            written: 0,
            confirmed_written: 0,
            last_active: now,
        }
    }

    /// Apply the client's expressed connection preference.
    pub fn apply_connection_preference(&mut self, headers: &HttpHeaders) {
        match self.http_version {
            HttpVersion::V1_0 => {
                let keep_alive = headers
                    .get_all("Connection")
                    .iter()
                    .any(|v| v.eq_ignore_ascii_case(b"Keep-Alive"));
                if keep_alive {
                    self.persistent = true;
                    self.respond_keep_alive = true;
                }
                self.allow_chunked = false;
            }
            HttpVersion::V1_1 => {
                let close = headers
                    .get_all("Connection")
                    .iter()
                    .any(|v| v.eq_ignore_ascii_case(b"close"));
                if close {
                    self.respond_close = true;
                } else {
                    self.persistent = true;
                }
            }
        }
    }

    /// Build the response head for the first data packet. Decides chunking
    /// per the rules: chunked iff more body follows, no Content-Length, and
    /// the client allows it; otherwise an unknown-length response disables
    /// persistence.
    pub fn build_response_header(
        &mut self,
        code: u16,
        reason: &Bytes,
        headers: &HttpHeaders,
        more: bool,
    ) -> Bytes {
        let have_length = headers.contains("Content-Length");

        if more && !have_length {
            if self.allow_chunked {
                self.chunked = true;
            } else {
                self.persistent = false;
                self.respond_keep_alive = false;
            }
        }

        let mut out = BytesMut::new();
        let version = match self.http_version {
            HttpVersion::V1_0 => "HTTP/1.0",
            HttpVersion::V1_1 => "HTTP/1.1",
        };
        out.put_slice(version.as_bytes());
        out.put_slice(b" ");
        out.put_slice(code.to_string().as_bytes());
        out.put_slice(b" ");
        out.put_slice(reason);
        out.put_slice(b"\r\n");

        for (k, v) in headers.iter() {
            // framing toward the client is ours to decide
            if k.eq_ignore_ascii_case(b"Transfer-Encoding") {
                continue;
            }
            out.put_slice(k);
            out.put_slice(b": ");
            out.put_slice(v);
            out.put_slice(b"\r\n");
        }

        if self.chunked {
            out.put_slice(b"Transfer-Encoding: chunked\r\n");
        }
        if self.respond_keep_alive {
            out.put_slice(b"Connection: Keep-Alive\r\n");
        }
        if self.respond_close {
            out.put_slice(b"Connection: close\r\n");
        }
        out.put_slice(b"\r\n");

        self.sent_response_header = true;
        out.freeze()
    }

    /// Frame a body chunk for the wire (chunked framing when negotiated).
    pub fn frame_body(&self, data: &Bytes) -> Bytes {
        if !self.chunked {
            return data.clone();
        }
        if data.is_empty() {
            return Bytes::new();
        }
        let mut out = BytesMut::with_capacity(data.len() + 16);
        out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.put_slice(data);
        out.put_slice(b"\r\n");
        out.freeze()
    }

    /// Terminal chunk for a chunked response.
    pub fn frame_body_end(&self) -> Option<Bytes> {
        if self.chunked {
            Some(Bytes::from_static(b"0\r\n\r\n"))
        } else {
            None
        }
    }
}

/// Encode one outbound WebSocket message as frame bytes.
pub fn build_ws_message(content_type: Option<ContentType>, payload: &Bytes) -> Bytes {
    let opcode = match content_type {
        Some(ContentType::Binary) => Opcode::Binary,
        // text is the default
        _ => Opcode::Text,
    };
    let mut out = BytesMut::new();
    websocket::encode_message(opcode, payload, &mut out);
    out.freeze()
}

/// Encode an outbound WebSocket close with a status code.
pub fn build_ws_close(status: Option<u16>) -> Bytes {
    let frame = Frame::close(status.unwrap_or(websocket::CLOSE_STATUS_NORMAL), b"");
    let mut out = BytesMut::new();
    websocket::encode_frame(&frame, &mut out);
    out.freeze()
}

/// Encode an outbound ping or pong.
pub fn build_ws_control(opcode: Opcode, payload: &Bytes) -> Bytes {
    let mut out = BytesMut::new();
    websocket::encode_frame(
        &Frame {
            fin: true,
            opcode,
            payload: payload.clone(),
        },
        &mut out,
    );
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(version: HttpVersion) -> EdgeSession {
        EdgeSession::new(
            Bytes::from_static(b"ext-1"),
            Bytes::from_static(b"1"),
            Bytes::from_static(b"edge-1-1"),
            Mode::Http,
            version,
            Instant::now(),
        )
    }

    fn headers(pairs: &[(&str, &str)]) -> HttpHeaders {
        let mut h = HttpHeaders::new();
        for (k, v) in pairs {
            h.push(
                Bytes::copy_from_slice(k.as_bytes()),
                Bytes::copy_from_slice(v.as_bytes()),
            );
        }
        h
    }

    #[test]
    fn http10_keepalive_preference() {
        let mut s = session(HttpVersion::V1_0);
        s.apply_connection_preference(&headers(&[("Connection", "Keep-Alive")]));
        assert!(s.persistent);
        assert!(s.respond_keep_alive);
        assert!(!s.allow_chunked);
    }

    #[test]
    fn http11_default_is_persistent() {
        let mut s = session(HttpVersion::V1_1);
        s.apply_connection_preference(&headers(&[]));
        assert!(s.persistent);
        assert!(!s.respond_close);
        assert!(s.allow_chunked);
    }

    #[test]
    fn http11_close_preference() {
        let mut s = session(HttpVersion::V1_1);
        s.apply_connection_preference(&headers(&[("Connection", "close")]));
        assert!(!s.persistent);
        assert!(s.respond_close);
    }

    #[test]
    fn chunked_iff_more_and_no_length_and_allowed() {
        // more + no length + 1.1 => chunked
        let mut s = session(HttpVersion::V1_1);
        let head = s.build_response_header(
            200,
            &Bytes::from_static(b"OK"),
            &headers(&[("Content-Type", "text/plain")]),
            true,
        );
        assert!(s.chunked);
        assert!(std::str::from_utf8(&head)
            .unwrap()
            .contains("Transfer-Encoding: chunked\r\n"));

        // more + length => not chunked
        let mut s = session(HttpVersion::V1_1);
        s.build_response_header(
            200,
            &Bytes::from_static(b"OK"),
            &headers(&[("Content-Length", "10")]),
            true,
        );
        assert!(!s.chunked);

        // more + no length + 1.0 => persistence disabled instead
        let mut s = session(HttpVersion::V1_0);
        s.persistent = true;
        s.respond_keep_alive = true;
        s.allow_chunked = false;
        s.build_response_header(200, &Bytes::from_static(b"OK"), &headers(&[]), true);
        assert!(!s.chunked);
        assert!(!s.persistent);
        assert!(!s.respond_keep_alive);
    }

    #[test]
    fn response_head_bytes() {
        let mut s = session(HttpVersion::V1_1);
        s.respond_close = true;
        let head = s.build_response_header(
            404,
            &Bytes::from_static(b"Not Found"),
            &headers(&[("Content-Length", "0")]),
            false,
        );
        assert_eq!(
            head.as_ref(),
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn chunk_framing() {
        let mut s = session(HttpVersion::V1_1);
        s.chunked = true;
        assert_eq!(
            s.frame_body(&Bytes::from_static(b"hello")).as_ref(),
            b"5\r\nhello\r\n"
        );
        assert_eq!(s.frame_body_end().unwrap().as_ref(), b"0\r\n\r\n");

        s.chunked = false;
        assert_eq!(s.frame_body(&Bytes::from_static(b"hello")).as_ref(), b"hello");
        assert!(s.frame_body_end().is_none());
    }

    #[test]
    fn ws_text_is_default_opcode() {
        let bytes = build_ws_message(None, &Bytes::from_static(b"hi"));
        assert_eq!(bytes[0] & 0x0f, 1);
        let bytes = build_ws_message(Some(ContentType::Binary), &Bytes::from_static(b"hi"));
        assert_eq!(bytes[0] & 0x0f, 2);
    }

    #[test]
    fn ws_close_carries_status() {
        let bytes = build_ws_close(Some(1001));
        assert_eq!(bytes[0] & 0x0f, 8);
        assert_eq!(&bytes[2..4], &[0x03, 0xe9]);
    }
}
