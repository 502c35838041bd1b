//! External web server packet formats.
//!
//! Requests arrive as a single binary message:
//!
//! ```text
//! <sender> <id> <path> <headers-tnetstring><body-tnetstring>
//! ```
//!
//! Headers are a tnetstring map (or a byte string holding JSON) whose
//! all-caps keys are connection metadata (`METHOD`, `VERSION`, `URI`,
//! `PATTERN`, `UPLOAD-OFFSET`, `UPLOAD-DONE`) and whose mixed-case keys are
//! forwarded HTTP headers. A body with `METHOD=JSON` carries a typed
//! sentinel, currently only `{"type": "disconnect"}`.
//!
//! Responses are `"<sender> <id> "` followed by raw HTTP or WebSocket
//! bytes; a zero-length payload closes the connection. Control messages are
//! `"<sender> X <id> "` followed by a typed map.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use gripd_wire::tnetstring::{self, MapBuilder, TnValue};
use gripd_x::HttpHeaders;

#[derive(Debug, Error, PartialEq)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("codec: {0}")]
    Wire(#[from] gripd_wire::WireError),
}

pub type Result<T> = std::result::Result<T, PacketError>;

/// A decoded message from the external web server.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRequestPacket {
    pub sender: Bytes,
    pub id: Bytes,
    pub path: Bytes,
    /// Connection metadata (the all-caps keys).
    pub method: String,
    pub version: String,
    pub uri: Bytes,
    pub scheme: Option<String>,
    /// Forwarded HTTP headers (mixed-case keys, meta keys removed).
    pub headers: HttpHeaders,
    pub body: Bytes,
    pub remote_address: Option<String>,
    /// Body continuation offset, when this is an upload chunk.
    pub upload_offset: Option<u64>,
    pub upload_done: bool,
    pub is_disconnect: bool,
}

fn is_all_caps(key: &[u8]) -> bool {
    !key.is_empty()
        && key
            .iter()
            .all(|&b| b.is_ascii_uppercase() || b == b'-' || b == b'_')
}

fn next_token(input: &Bytes, start: usize) -> Result<(Bytes, usize)> {
    let rel = input[start..]
        .iter()
        .position(|&b| b == b' ')
        .ok_or(PacketError::Malformed("missing token separator"))?;
    Ok((input.slice(start..start + rel), start + rel + 1))
}

impl EdgeRequestPacket {
    pub fn decode(input: &Bytes) -> Result<Self> {
        let (sender, pos) = next_token(input, 0)?;
        let (id, pos) = next_token(input, pos)?;
        let (path, pos) = next_token(input, pos)?;

        let (vheaders, pos) = tnetstring_prefix(input, pos)?;
        let (vbody, _pos) = tnetstring_prefix(input, pos)?;

        let body = vbody
            .as_bytes()
            .cloned()
            .ok_or(PacketError::Malformed("body is not a byte string"))?;

        // headers: either a map, or a byte string holding JSON
        let header_entries: Vec<(String, String)> = match &vheaders {
            TnValue::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = std::str::from_utf8(k)
                        .map_err(|_| PacketError::Malformed("non-utf8 header name"))?;
                    let val = v
                        .as_str()
                        .ok_or(PacketError::Malformed("non-string header value"))?;
                    out.push((key.to_string(), val.to_string()));
                }
                out
            }
            TnValue::Bytes(raw) => {
                let parsed: serde_json::Value = serde_json::from_slice(raw)
                    .map_err(|_| PacketError::Malformed("header JSON parse failed"))?;
                let obj = parsed
                    .as_object()
                    .ok_or(PacketError::Malformed("header JSON is not an object"))?;
                obj.iter()
                    .map(|(k, v)| {
                        v.as_str()
                            .map(|s| (k.clone(), s.to_string()))
                            .ok_or(PacketError::Malformed("non-string header value"))
                    })
                    .collect::<Result<_>>()?
            }
            _ => return Err(PacketError::Malformed("headers have wrong type")),
        };

        let meta = |name: &str| -> Option<&str> {
            header_entries
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        let method = meta("METHOD").unwrap_or_default().to_string();

        if method == "JSON" {
            let parsed: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|_| PacketError::Malformed("sentinel JSON parse failed"))?;
            let kind = parsed
                .get("type")
                .and_then(serde_json::Value::as_str)
                .ok_or(PacketError::Malformed("sentinel without type"))?;
            if kind != "disconnect" {
                return Err(PacketError::Malformed("unknown sentinel type"));
            }
            return Ok(Self {
                sender,
                id,
                path,
                method,
                version: String::new(),
                uri: Bytes::new(),
                scheme: None,
                headers: HttpHeaders::new(),
                body: Bytes::new(),
                remote_address: None,
                upload_offset: None,
                upload_done: false,
                is_disconnect: true,
            });
        }

        let version = meta("VERSION").unwrap_or_default().to_string();
        let uri = meta("URI")
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .unwrap_or_else(|| path.clone());
        let scheme = meta("URL_SCHEME").map(str::to_string);
        let remote_address = meta("REMOTE_ADDR").map(str::to_string);
        let upload_offset = match meta("UPLOAD-OFFSET") {
            Some(s) => Some(
                s.parse()
                    .map_err(|_| PacketError::Malformed("bad upload offset"))?,
            ),
            None => None,
        };
        let upload_done = meta("UPLOAD-DONE") == Some("true");

        let mut headers = HttpHeaders::new();
        for (k, v) in &header_entries {
            if is_all_caps(k.as_bytes()) {
                continue;
            }
            headers.push(
                Bytes::copy_from_slice(k.as_bytes()),
                Bytes::copy_from_slice(v.as_bytes()),
            );
        }

        Ok(Self {
            sender,
            id,
            path,
            method,
            version,
            uri,
            scheme,
            headers,
            body,
            remote_address,
            upload_offset,
            upload_done,
            is_disconnect: false,
        })
    }

    /// Encode (used by tests and simulators).
    pub fn encode(&self) -> Bytes {
        let mut header_map: Vec<(Bytes, TnValue)> = Vec::new();
        let mut put = |k: &str, v: &str| {
            header_map.push((Bytes::copy_from_slice(k.as_bytes()), TnValue::string(v)));
        };
        if self.is_disconnect {
            put("METHOD", "JSON");
        } else {
            put("METHOD", &self.method);
            if !self.version.is_empty() {
                put("VERSION", &self.version);
            }
            if !self.uri.is_empty() {
                put("URI", &String::from_utf8_lossy(&self.uri));
            }
            if let Some(scheme) = &self.scheme {
                put("URL_SCHEME", scheme);
            }
            if let Some(addr) = &self.remote_address {
                put("REMOTE_ADDR", addr);
            }
            if let Some(offset) = self.upload_offset {
                put("UPLOAD-OFFSET", &offset.to_string());
            }
            if self.upload_done {
                put("UPLOAD-DONE", "true");
            }
        }
        for (k, v) in self.headers.iter() {
            header_map.push((k.clone(), TnValue::Bytes(v.clone())));
        }

        let body = if self.is_disconnect {
            Bytes::from_static(b"{\"type\":\"disconnect\"}")
        } else {
            self.body.clone()
        };

        let mut out = BytesMut::new();
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(b" ");
        out.extend_from_slice(&self.id);
        out.extend_from_slice(b" ");
        out.extend_from_slice(&self.path);
        out.extend_from_slice(b" ");
        tnetstring::encode(&TnValue::Map(header_map), &mut out);
        tnetstring::encode(&TnValue::Bytes(body), &mut out);
        out.freeze()
    }
}

fn tnetstring_prefix(input: &Bytes, start: usize) -> Result<(TnValue, usize)> {
    // find the end of one tnetstring value: <len>:<payload><type>
    let colon = input[start..]
        .iter()
        .position(|&b| b == b':')
        .ok_or(PacketError::Malformed("missing tnetstring length"))?
        + start;
    let len: usize = std::str::from_utf8(&input[start..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(PacketError::Malformed("bad tnetstring length"))?;
    let end = colon + 1 + len + 1;
    if input.len() < end {
        return Err(PacketError::Malformed("truncated tnetstring"));
    }
    let value = tnetstring::decode(&input.slice(start..end))?;
    Ok((value, end))
}

/// Raw bytes toward one external connection.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeResponsePacket {
    pub sender: Bytes,
    pub id: Bytes,
    /// Zero-length data closes the connection.
    pub data: Bytes,
}

impl EdgeResponsePacket {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.sender.len() + self.id.len() + 2 + self.data.len());
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(b" ");
        out.extend_from_slice(&self.id);
        out.extend_from_slice(b" ");
        out.extend_from_slice(&self.data);
        out.freeze()
    }

    pub fn decode(input: &Bytes) -> Result<Self> {
        let (sender, pos) = next_token(input, 0)?;
        let (id, pos) = next_token(input, pos)?;
        Ok(Self {
            sender,
            id,
            data: input.slice(pos..),
        })
    }
}

/// Control action toward one external connection.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeControlAction {
    Cancel,
    Credits(u32),
    KeepAlive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeControlPacket {
    pub sender: Bytes,
    pub id: Bytes,
    pub action: EdgeControlAction,
}

impl EdgeControlPacket {
    pub fn encode(&self) -> Bytes {
        let value = match &self.action {
            EdgeControlAction::Cancel => {
                MapBuilder::new().put("cancel", TnValue::Bool(true)).build()
            }
            EdgeControlAction::Credits(n) => MapBuilder::new()
                .put("credits", TnValue::Int(*n as i64))
                .build(),
            EdgeControlAction::KeepAlive => MapBuilder::new()
                .put("keep-alive", TnValue::Bool(true))
                .build(),
        };

        let mut out = BytesMut::new();
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(b" X ");
        out.extend_from_slice(&self.id);
        out.extend_from_slice(b" ");
        tnetstring::encode(&value, &mut out);
        out.freeze()
    }

    pub fn decode(input: &Bytes) -> Result<Self> {
        let (sender, pos) = next_token(input, 0)?;
        let (marker, pos) = next_token(input, pos)?;
        if marker.as_ref() != b"X" {
            return Err(PacketError::Malformed("missing control marker"));
        }
        let (id, pos) = next_token(input, pos)?;
        let value = tnetstring::decode(&input.slice(pos..))?;

        let action = if value.get("cancel").and_then(TnValue::as_bool) == Some(true) {
            EdgeControlAction::Cancel
        } else if let Some(n) = value.get("credits").and_then(TnValue::as_int) {
            EdgeControlAction::Credits(n.max(0) as u32)
        } else if value.get("keep-alive").and_then(TnValue::as_bool) == Some(true) {
            EdgeControlAction::KeepAlive
        } else {
            return Err(PacketError::Malformed("unknown control action"));
        };

        Ok(Self { sender, id, action })
    }
}

/// Ack-progress poll: the adapter asks the external server how many bytes
/// it has confirmed written per connection.
pub fn encode_status_request() -> Bytes {
    let mut out = BytesMut::new();
    tnetstring::encode(
        &MapBuilder::new().put("type", TnValue::string("status")).build(),
        &mut out,
    );
    out.freeze()
}

/// Reply: map of connection id to confirmed byte count.
pub fn decode_status_reply(input: &Bytes) -> Result<Vec<(Bytes, u64)>> {
    let value = tnetstring::decode(input)?;
    let entries = value
        .as_map()
        .ok_or(PacketError::Malformed("status reply is not a map"))?;
    let mut out = Vec::with_capacity(entries.len());
    for (id, v) in entries {
        let n = v
            .as_int()
            .ok_or(PacketError::Malformed("status count is not an integer"))?;
        out.push((id.clone(), n.max(0) as u64));
    }
    Ok(out)
}

pub fn encode_status_reply(entries: &[(Bytes, u64)]) -> Bytes {
    let mut out = BytesMut::new();
    tnetstring::encode(
        &TnValue::Map(
            entries
                .iter()
                .map(|(id, n)| (id.clone(), TnValue::Int(*n as i64)))
                .collect(),
        ),
        &mut out,
    );
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EdgeRequestPacket {
        let mut headers = HttpHeaders::new();
        headers.push("Host", "example.com");
        headers.push("Accept", "*/*");
        EdgeRequestPacket {
            sender: Bytes::from_static(b"ext-1"),
            id: Bytes::from_static(b"7"),
            path: Bytes::from_static(b"/x"),
            method: "GET".into(),
            version: "HTTP/1.1".into(),
            uri: Bytes::from_static(b"/x?q=1"),
            scheme: Some("https".into()),
            headers,
            body: Bytes::new(),
            remote_address: Some("10.0.0.5".into()),
            upload_offset: None,
            upload_done: false,
            is_disconnect: false,
        }
    }

    #[test]
    fn request_roundtrip() {
        let packet = request();
        let decoded = EdgeRequestPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn meta_headers_are_separated_from_http_headers() {
        let decoded = EdgeRequestPacket::decode(&request().encode()).unwrap();
        assert_eq!(decoded.method, "GET");
        assert!(!decoded.headers.contains("METHOD"));
        assert!(!decoded.headers.contains("URI"));
        assert!(decoded.headers.contains("Host"));
    }

    #[test]
    fn disconnect_sentinel() {
        let packet = EdgeRequestPacket {
            is_disconnect: true,
            ..request()
        };
        let decoded = EdgeRequestPacket::decode(&packet.encode()).unwrap();
        assert!(decoded.is_disconnect);
        assert_eq!(decoded.id.as_ref(), b"7");
    }

    #[test]
    fn upload_continuation_fields() {
        let packet = EdgeRequestPacket {
            upload_offset: Some(4096),
            upload_done: true,
            body: Bytes::from_static(b"tail"),
            ..request()
        };
        let decoded = EdgeRequestPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.upload_offset, Some(4096));
        assert!(decoded.upload_done);
        assert_eq!(decoded.body.as_ref(), b"tail");
    }

    #[test]
    fn json_headers_variant() {
        // hand-build a packet whose headers are a JSON byte string
        let mut out = BytesMut::new();
        out.extend_from_slice(b"ext-1 9 /y ");
        let json = br#"{"METHOD":"GET","VERSION":"HTTP/1.1","URI":"/y","Host":"a"}"#;
        tnetstring::encode(&TnValue::Bytes(Bytes::from_static(json)), &mut out);
        tnetstring::encode(&TnValue::Bytes(Bytes::new()), &mut out);

        let decoded = EdgeRequestPacket::decode(&out.freeze()).unwrap();
        assert_eq!(decoded.method, "GET");
        assert_eq!(decoded.headers.get("Host").unwrap().as_ref(), b"a");
    }

    #[test]
    fn truncated_request_rejected() {
        let encoded = request().encode();
        for cut in [0, 5, 10, encoded.len() - 1] {
            assert!(EdgeRequestPacket::decode(&encoded.slice(..cut)).is_err());
        }
    }

    #[test]
    fn response_prefix_format() {
        let packet = EdgeResponsePacket {
            sender: Bytes::from_static(b"ext-1"),
            id: Bytes::from_static(b"7"),
            data: Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"),
        };
        let encoded = packet.encode();
        assert!(encoded.starts_with(b"ext-1 7 HTTP/1.1"));
        assert_eq!(EdgeResponsePacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn control_actions_roundtrip() {
        for action in [
            EdgeControlAction::Cancel,
            EdgeControlAction::Credits(512),
            EdgeControlAction::KeepAlive,
        ] {
            let packet = EdgeControlPacket {
                sender: Bytes::from_static(b"ext-1"),
                id: Bytes::from_static(b"7"),
                action: action.clone(),
            };
            let encoded = packet.encode();
            assert!(encoded.starts_with(b"ext-1 X 7 "));
            assert_eq!(EdgeControlPacket::decode(&encoded).unwrap().action, action);
        }
    }

    #[test]
    fn status_reply_roundtrip() {
        let entries = vec![
            (Bytes::from_static(b"7"), 1024u64),
            (Bytes::from_static(b"8"), 0u64),
        ];
        let decoded = decode_status_reply(&encode_status_reply(&entries)).unwrap();
        assert_eq!(decoded, entries);
    }
}
