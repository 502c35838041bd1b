//! GRIP WebSocket control messages.
//!
//! When a WebSocket origin negotiates the `grip` extension, frames it sends
//! with the control prefix carry a JSON object describing a control action.
//! These frames are consumed by the proxy and never forwarded to the client.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::tnetstring::{self, MapBuilder, TnValue};
use crate::{Result, WireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMessageType {
    Text,
    Binary,
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WsControlMessage {
    Subscribe {
        channel: String,
        filters: Vec<String>,
    },
    Unsubscribe {
        channel: String,
    },
    /// Detach from the origin: keep serving the client from publishes only.
    Detach,
    Session {
        id: String,
    },
    SetMeta {
        name: String,
        value: String,
    },
    KeepAlive {
        message_type: Option<WsMessageType>,
        content: Option<Bytes>,
        timeout: Option<u32>,
    },
}

impl WsControlMessage {
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or(WireError::Malformed("control message is not an object"))?;

        let msg_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(WireError::FieldMissing("type"))?;

        match msg_type {
            "subscribe" => {
                let channel = require_nonempty_str(obj, "channel")?;
                let mut filters = Vec::new();
                if let Some(vfilters) = obj.get("filters") {
                    let list = vfilters
                        .as_array()
                        .ok_or(WireError::FieldType("filters"))?;
                    for f in list {
                        filters.push(
                            f.as_str()
                                .ok_or(WireError::FieldType("filters"))?
                                .to_string(),
                        );
                    }
                }
                Ok(Self::Subscribe { channel, filters })
            }
            "unsubscribe" => Ok(Self::Unsubscribe {
                channel: require_nonempty_str(obj, "channel")?,
            }),
            "detach" => Ok(Self::Detach),
            "session" => Ok(Self::Session {
                id: require_nonempty_str(obj, "id")?,
            }),
            "set-meta" => Ok(Self::SetMeta {
                name: require_nonempty_str(obj, "name")?,
                value: obj
                    .get("value")
                    .map(|v| v.as_str().ok_or(WireError::FieldType("value")))
                    .transpose()?
                    .unwrap_or_default()
                    .to_string(),
            }),
            "keep-alive" => {
                let message_type = match obj.get("message-type").and_then(Value::as_str) {
                    None => None,
                    Some("text") => Some(WsMessageType::Text),
                    Some("binary") => Some(WsMessageType::Binary),
                    Some("ping") => Some(WsMessageType::Ping),
                    Some("pong") => Some(WsMessageType::Pong),
                    Some(_) => return Err(WireError::FieldValue("message-type")),
                };

                let (content, inferred) = decode_content(obj)?;
                let message_type = message_type.or(inferred);

                let timeout = match obj.get("timeout") {
                    None => None,
                    Some(v) => {
                        let t = v.as_i64().ok_or(WireError::FieldType("timeout"))?;
                        if t < 0 {
                            return Err(WireError::FieldValue("timeout"));
                        }
                        Some(t as u32)
                    }
                };

                Ok(Self::KeepAlive {
                    message_type,
                    content,
                    timeout,
                })
            }
            _ => Err(WireError::FieldValue("type")),
        }
    }
}

/// Decode `content` (utf-8, implies text) or `content-bin` (base64,
/// implies binary).
fn decode_content(
    obj: &serde_json::Map<String, Value>,
) -> Result<(Option<Bytes>, Option<WsMessageType>)> {
    if let Some(v) = obj.get("content-bin") {
        let encoded = v.as_str().ok_or(WireError::FieldType("content-bin"))?;
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| WireError::FieldValue("content-bin"))?;
        return Ok((Some(Bytes::from(decoded)), Some(WsMessageType::Binary)));
    }
    if let Some(v) = obj.get("content") {
        let s = v.as_str().ok_or(WireError::FieldType("content"))?;
        return Ok((
            Some(Bytes::copy_from_slice(s.as_bytes())),
            Some(WsMessageType::Text),
        ));
    }
    Ok((None, None))
}

/// Proxy-to-handler announcements about a GRIP-enabled WebSocket session.
#[derive(Debug, Clone, PartialEq)]
pub enum WsControlItem {
    /// Session established (or still alive).
    Here {
        cid: Bytes,
        uri: String,
        channel_prefix: Option<String>,
        route: Bytes,
    },
    /// Origin control frame payload (JSON), to be parsed as a
    /// [`WsControlMessage`].
    Grip { cid: Bytes, message: Bytes },
    /// Session ended.
    Gone { cid: Bytes },
    /// Deliver a message to the client.
    Send {
        cid: Bytes,
        message_type: WsMessageType,
        content: Bytes,
    },
    /// Close the client connection.
    Close { cid: Bytes, code: Option<u16> },
    /// Drop the origin half, keep serving the client from publishes.
    Detach { cid: Bytes },
    /// Tear the session down.
    Cancel { cid: Bytes },
}

impl WsControlItem {
    pub fn cid(&self) -> &Bytes {
        match self {
            Self::Here { cid, .. }
            | Self::Grip { cid, .. }
            | Self::Gone { cid }
            | Self::Send { cid, .. }
            | Self::Close { cid, .. }
            | Self::Detach { cid }
            | Self::Cancel { cid } => cid,
        }
    }

    fn to_value(&self) -> TnValue {
        match self {
            Self::Here {
                cid,
                uri,
                channel_prefix,
                route,
            } => MapBuilder::new()
                .put("type", TnValue::string("here"))
                .put("cid", TnValue::Bytes(cid.clone()))
                .put("uri", TnValue::string(uri))
                .put_opt(
                    "channel-prefix",
                    channel_prefix.as_deref().map(TnValue::string),
                )
                .put("route", TnValue::Bytes(route.clone()))
                .build(),
            Self::Grip { cid, message } => MapBuilder::new()
                .put("type", TnValue::string("grip"))
                .put("cid", TnValue::Bytes(cid.clone()))
                .put("message", TnValue::Bytes(message.clone()))
                .build(),
            Self::Gone { cid } => MapBuilder::new()
                .put("type", TnValue::string("gone"))
                .put("cid", TnValue::Bytes(cid.clone()))
                .build(),
            Self::Send {
                cid,
                message_type,
                content,
            } => MapBuilder::new()
                .put("type", TnValue::string("send"))
                .put("cid", TnValue::Bytes(cid.clone()))
                .put(
                    "message-type",
                    TnValue::string(match message_type {
                        WsMessageType::Text => "text",
                        WsMessageType::Binary => "binary",
                        WsMessageType::Ping => "ping",
                        WsMessageType::Pong => "pong",
                    }),
                )
                .put("content", TnValue::Bytes(content.clone()))
                .build(),
            Self::Close { cid, code } => MapBuilder::new()
                .put("type", TnValue::string("close"))
                .put("cid", TnValue::Bytes(cid.clone()))
                .put_opt("code", code.map(|c| TnValue::Int(c as i64)))
                .build(),
            Self::Detach { cid } => MapBuilder::new()
                .put("type", TnValue::string("detach"))
                .put("cid", TnValue::Bytes(cid.clone()))
                .build(),
            Self::Cancel { cid } => MapBuilder::new()
                .put("type", TnValue::string("cancel"))
                .put("cid", TnValue::Bytes(cid.clone()))
                .build(),
        }
    }

    fn from_value(value: &TnValue) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(TnValue::as_bytes)
            .ok_or(WireError::FieldMissing("type"))?;
        let cid = value
            .get("cid")
            .and_then(TnValue::as_bytes)
            .cloned()
            .ok_or(WireError::FieldMissing("cid"))?;

        Ok(match kind.as_ref() {
            b"here" => Self::Here {
                cid,
                uri: value
                    .get("uri")
                    .and_then(TnValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                channel_prefix: value
                    .get("channel-prefix")
                    .and_then(TnValue::as_str)
                    .map(str::to_string),
                route: value
                    .get("route")
                    .and_then(TnValue::as_bytes)
                    .cloned()
                    .unwrap_or_default(),
            },
            b"grip" => Self::Grip {
                cid,
                message: value
                    .get("message")
                    .and_then(TnValue::as_bytes)
                    .cloned()
                    .ok_or(WireError::FieldMissing("message"))?,
            },
            b"gone" => Self::Gone { cid },
            b"send" => Self::Send {
                cid,
                message_type: match value
                    .get("message-type")
                    .and_then(TnValue::as_bytes)
                    .map(|b| b.as_ref())
                {
                    Some(b"text") | None => WsMessageType::Text,
                    Some(b"binary") => WsMessageType::Binary,
                    Some(b"ping") => WsMessageType::Ping,
                    Some(b"pong") => WsMessageType::Pong,
                    Some(_) => return Err(WireError::FieldValue("message-type")),
                },
                content: value
                    .get("content")
                    .and_then(TnValue::as_bytes)
                    .cloned()
                    .unwrap_or_default(),
            },
            b"close" => Self::Close {
                cid,
                code: value
                    .get("code")
                    .and_then(TnValue::as_int)
                    .map(|c| c as u16),
            },
            b"detach" => Self::Detach { cid },
            b"cancel" => Self::Cancel { cid },
            _ => return Err(WireError::FieldValue("type")),
        })
    }
}

/// A batch of control items from one sender.
#[derive(Debug, Clone, PartialEq)]
pub struct WsControlPacket {
    pub from: Bytes,
    pub items: Vec<WsControlItem>,
}

impl WsControlPacket {
    pub fn encode(&self) -> Bytes {
        let value = MapBuilder::new()
            .put("from", TnValue::Bytes(self.from.clone()))
            .put(
                "items",
                TnValue::List(self.items.iter().map(WsControlItem::to_value).collect()),
            )
            .build();
        let mut out = BytesMut::new();
        out.extend_from_slice(b"T");
        tnetstring::encode(&value, &mut out);
        out.freeze()
    }

    pub fn decode(input: &Bytes) -> Result<Self> {
        if input.first() != Some(&b'T') {
            return Err(WireError::Malformed("missing format tag"));
        }
        let value = tnetstring::decode(&input.slice(1..))?;
        let from = value
            .get("from")
            .and_then(TnValue::as_bytes)
            .cloned()
            .ok_or(WireError::FieldMissing("from"))?;
        let vitems = value
            .get("items")
            .and_then(TnValue::as_list)
            .ok_or(WireError::FieldMissing("items"))?;
        let items = vitems
            .iter()
            .map(WsControlItem::from_value)
            .collect::<Result<_>>()?;
        Ok(Self { from, items })
    }
}

fn require_nonempty_str(obj: &serde_json::Map<String, Value>, key: &'static str) -> Result<String> {
    let s = obj
        .get(key)
        .ok_or(WireError::FieldMissing(key))?
        .as_str()
        .ok_or(WireError::FieldType(key))?;
    if s.is_empty() {
        return Err(WireError::FieldValue(key));
    }
    Ok(s.to_string())
}
