//! Published items and their transport formats.
//!
//! An item addresses one channel and carries one or more formats; each
//! subscriber picks the format matching its transport. `id == None` means
//! the item does not advance the channel's last id; `prev_id == None` means
//! it is accepted without an ordering check.

use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use gripd_x::{status_reason, HttpHeaders};

#[derive(Debug, Error, PartialEq)]
pub enum ItemError {
    #[error("item is not an object")]
    NotAnObject,

    #[error("item has no channel")]
    NoChannel,

    #[error("item has no recognized formats")]
    NoFormats,

    #[error("{0} contains '{1}' with wrong type")]
    WrongType(&'static str, &'static str),

    #[error("{0} contains '{1}' with invalid value")]
    BadValue(&'static str, &'static str),

    #[error("{0} does not contain content")]
    NoContent(&'static str),
}

pub type Result<T> = std::result::Result<T, ItemError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMessageKind {
    Text,
    Binary,
    Ping,
    Pong,
}

/// One transport rendering of a published item.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishFormat {
    HttpResponse {
        code: u16,
        reason: Bytes,
        headers: HttpHeaders,
        body: Bytes,
        body_patch: Option<Value>,
    },
    HttpStream {
        body: Bytes,
        close: bool,
    },
    WsMessage {
        kind: WsMessageKind,
        body: Bytes,
        close: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishItem {
    pub channel: String,
    pub id: Option<String>,
    pub prev_id: Option<String>,
    pub formats: Vec<PublishFormat>,
}

impl PublishItem {
    pub fn format_http_response(&self) -> Option<&PublishFormat> {
        self.formats
            .iter()
            .find(|f| matches!(f, PublishFormat::HttpResponse { .. }))
    }

    pub fn format_http_stream(&self) -> Option<&PublishFormat> {
        self.formats
            .iter()
            .find(|f| matches!(f, PublishFormat::HttpStream { .. }))
    }

    pub fn format_ws_message(&self) -> Option<&PublishFormat> {
        self.formats
            .iter()
            .find(|f| matches!(f, PublishFormat::WsMessage { .. }))
    }

    /// Parse an item from its published JSON form.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or(ItemError::NotAnObject)?;

        let channel = obj
            .get("channel")
            .and_then(Value::as_str)
            .ok_or(ItemError::NoChannel)?
            .to_string();
        if channel.is_empty() {
            return Err(ItemError::NoChannel);
        }

        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or(ItemError::WrongType("item", "id"))?
                    .to_string(),
            ),
        };
        let prev_id = match obj.get("prev-id") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or(ItemError::WrongType("item", "prev-id"))?
                    .to_string(),
            ),
        };

        let formats_obj = obj
            .get("formats")
            .and_then(Value::as_object)
            .ok_or(ItemError::NoFormats)?;

        let mut formats = Vec::new();
        if let Some(v) = formats_obj.get("http-response") {
            formats.push(parse_http_response(v)?);
        }
        if let Some(v) = formats_obj.get("http-stream") {
            formats.push(parse_http_stream(v)?);
        }
        if let Some(v) = formats_obj.get("ws-message") {
            formats.push(parse_ws_message(v)?);
        }
        if formats.is_empty() {
            return Err(ItemError::NoFormats);
        }

        Ok(Self {
            channel,
            id,
            prev_id,
            formats,
        })
    }
}

fn content_bytes(
    obj: &serde_json::Map<String, Value>,
    pn: &'static str,
    bin_key: &'static str,
    plain_key: &'static str,
) -> Result<Option<(Bytes, bool)>> {
    if let Some(v) = obj.get(bin_key) {
        let encoded = v.as_str().ok_or(ItemError::WrongType(pn, bin_key))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| ItemError::BadValue(pn, bin_key))?;
        return Ok(Some((Bytes::from(decoded), true)));
    }
    if let Some(v) = obj.get(plain_key) {
        let s = v.as_str().ok_or(ItemError::WrongType(pn, plain_key))?;
        return Ok(Some((Bytes::copy_from_slice(s.as_bytes()), false)));
    }
    Ok(None)
}

fn parse_headers(pn: &'static str, value: &Value) -> Result<HttpHeaders> {
    let mut headers = HttpHeaders::new();
    match value {
        Value::Array(list) => {
            for pair in list {
                let pair = pair.as_array().ok_or(ItemError::WrongType(pn, "headers"))?;
                if pair.len() != 2 {
                    return Err(ItemError::BadValue(pn, "headers"));
                }
                let name = pair[0].as_str().ok_or(ItemError::WrongType(pn, "headers"))?;
                let val = pair[1].as_str().ok_or(ItemError::WrongType(pn, "headers"))?;
                headers.push(
                    Bytes::copy_from_slice(name.as_bytes()),
                    Bytes::copy_from_slice(val.as_bytes()),
                );
            }
        }
        Value::Object(map) => {
            for (name, val) in map {
                headers.push(
                    Bytes::copy_from_slice(name.as_bytes()),
                    Bytes::copy_from_slice(
                        val.as_str()
                            .ok_or(ItemError::WrongType(pn, "headers"))?
                            .as_bytes(),
                    ),
                );
            }
        }
        _ => return Err(ItemError::WrongType(pn, "headers")),
    }
    Ok(headers)
}

fn parse_http_response(value: &Value) -> Result<PublishFormat> {
    const PN: &str = "'http-response'";
    let obj = value.as_object().ok_or(ItemError::WrongType(PN, "format"))?;

    let code = match obj.get("code") {
        Some(v) => {
            let c = v.as_i64().ok_or(ItemError::WrongType(PN, "code"))?;
            if !(0..=999).contains(&c) {
                return Err(ItemError::BadValue(PN, "code"));
            }
            c as u16
        }
        None => 200,
    };

    let reason = match obj.get("reason").and_then(Value::as_str) {
        Some(r) if !r.is_empty() => Bytes::copy_from_slice(r.as_bytes()),
        _ => Bytes::from_static(status_reason(code).as_bytes()),
    };

    let headers = match obj.get("headers") {
        Some(v) => parse_headers(PN, v)?,
        None => HttpHeaders::new(),
    };

    let (body, body_patch) = match content_bytes(obj, PN, "body-bin", "body")? {
        Some((body, _)) => (body, None),
        None => match obj.get("body-patch") {
            Some(patch) => {
                if !patch.is_array() {
                    return Err(ItemError::WrongType(PN, "body-patch"));
                }
                (Bytes::new(), Some(patch.clone()))
            }
            None => return Err(ItemError::NoContent(PN)),
        },
    };

    Ok(PublishFormat::HttpResponse {
        code,
        reason,
        headers,
        body,
        body_patch,
    })
}

fn parse_http_stream(value: &Value) -> Result<PublishFormat> {
    const PN: &str = "'http-stream'";
    let obj = value.as_object().ok_or(ItemError::WrongType(PN, "format"))?;

    let close = obj.get("action").and_then(Value::as_str) == Some("close");
    if close {
        return Ok(PublishFormat::HttpStream {
            body: Bytes::new(),
            close: true,
        });
    }

    let (body, _) = content_bytes(obj, PN, "content-bin", "content")?
        .ok_or(ItemError::NoContent(PN))?;
    Ok(PublishFormat::HttpStream { body, close: false })
}

fn parse_ws_message(value: &Value) -> Result<PublishFormat> {
    const PN: &str = "'ws-message'";
    let obj = value.as_object().ok_or(ItemError::WrongType(PN, "format"))?;

    let close = obj.get("action").and_then(Value::as_str) == Some("close");
    if close {
        return Ok(PublishFormat::WsMessage {
            kind: WsMessageKind::Text,
            body: Bytes::new(),
            close: true,
        });
    }

    let (body, binary) = content_bytes(obj, PN, "content-bin", "content")?
        .ok_or(ItemError::NoContent(PN))?;

    let kind = match obj.get("type").and_then(Value::as_str) {
        Some("ping") => WsMessageKind::Ping,
        Some("pong") => WsMessageKind::Pong,
        Some("binary") => WsMessageKind::Binary,
        Some("text") => WsMessageKind::Text,
        None => {
            if binary {
                WsMessageKind::Binary
            } else {
                WsMessageKind::Text
            }
        }
        Some(_) => return Err(ItemError::BadValue(PN, "type")),
    };

    Ok(PublishFormat::WsMessage {
        kind,
        body,
        close: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_item() {
        let item = PublishItem::from_json(&json!({
            "channel": "c",
            "id": "a2",
            "prev-id": "a1",
            "formats": {"http-stream": {"content": "X\n"}},
        }))
        .unwrap();

        assert_eq!(item.channel, "c");
        assert_eq!(item.id.as_deref(), Some("a2"));
        assert_eq!(item.prev_id.as_deref(), Some("a1"));
        assert_eq!(
            item.formats[0],
            PublishFormat::HttpStream {
                body: Bytes::from_static(b"X\n"),
                close: false,
            }
        );
    }

    #[test]
    fn stream_close_action() {
        let item = PublishItem::from_json(&json!({
            "channel": "c",
            "formats": {"http-stream": {"action": "close"}},
        }))
        .unwrap();
        assert_eq!(
            item.formats[0],
            PublishFormat::HttpStream {
                body: Bytes::new(),
                close: true,
            }
        );
    }

    #[test]
    fn response_item_with_defaults() {
        let item = PublishItem::from_json(&json!({
            "channel": "c",
            "formats": {"http-response": {"body": "done\n"}},
        }))
        .unwrap();
        match &item.formats[0] {
            PublishFormat::HttpResponse { code, reason, body, .. } => {
                assert_eq!(*code, 200);
                assert_eq!(reason.as_ref(), b"OK");
                assert_eq!(body.as_ref(), b"done\n");
            }
            other => panic!("wrong format: {other:?}"),
        }
    }

    #[test]
    fn response_item_with_body_patch() {
        let item = PublishItem::from_json(&json!({
            "channel": "c",
            "formats": {"http-response": {"body-patch": [
                {"op": "replace", "path": "/count", "value": 2}
            ]}},
        }))
        .unwrap();
        match &item.formats[0] {
            PublishFormat::HttpResponse { body_patch, .. } => {
                assert!(body_patch.is_some());
            }
            other => panic!("wrong format: {other:?}"),
        }
    }

    #[test]
    fn ws_message_type_inference() {
        let item = PublishItem::from_json(&json!({
            "channel": "c",
            "formats": {"ws-message": {"content": "hello"}},
        }))
        .unwrap();
        assert!(matches!(
            item.formats[0],
            PublishFormat::WsMessage { kind: WsMessageKind::Text, .. }
        ));

        let item = PublishItem::from_json(&json!({
            "channel": "c",
            "formats": {"ws-message": {"content-bin": "AAE="}},
        }))
        .unwrap();
        assert!(matches!(
            item.formats[0],
            PublishFormat::WsMessage { kind: WsMessageKind::Binary, .. }
        ));
    }

    #[test]
    fn multiple_formats_in_one_item() {
        let item = PublishItem::from_json(&json!({
            "channel": "c",
            "formats": {
                "http-stream": {"content": "s"},
                "ws-message": {"content": "w"},
            },
        }))
        .unwrap();
        assert!(item.format_http_stream().is_some());
        assert!(item.format_ws_message().is_some());
        assert!(item.format_http_response().is_none());
    }

    #[test]
    fn bad_items_rejected() {
        assert_eq!(
            PublishItem::from_json(&json!({"formats": {}})),
            Err(ItemError::NoChannel)
        );
        assert_eq!(
            PublishItem::from_json(&json!({"channel": "c"})),
            Err(ItemError::NoFormats)
        );
        assert_eq!(
            PublishItem::from_json(&json!({
                "channel": "c",
                "formats": {"http-stream": {}},
            })),
            Err(ItemError::NoContent("'http-stream'"))
        );
    }
}
