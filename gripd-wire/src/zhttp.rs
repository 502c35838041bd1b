//! ZHTTP packet encoding.
//!
//! A ZHTTP message is the byte `T` followed by a typed map (see
//! [`crate::tnetstring`]). On router sockets the message is preceded by the
//! destination address frame and an empty delimiter frame; that framing is
//! the transport's concern, not this module's.
//!
//! The `type` key is omitted for data packets and names the packet type for
//! everything else. Unknown keys are ignored when decoding.

use bytes::{Bytes, BytesMut};

use gripd_x::HttpHeaders;

use crate::tnetstring::{self, MapBuilder, TnValue};
use crate::{Result, WireError};

/// Packet kind. `Data` carries request/response bytes; the rest are
/// control messages scoped to one rid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketType {
    #[default]
    Data,
    Error,
    Credit,
    KeepAlive,
    Cancel,
    HandoffStart,
    HandoffProceed,
    Close,
    Ping,
    Pong,
}

impl PacketType {
    fn wire_name(self) -> Option<&'static str> {
        match self {
            Self::Data => None,
            Self::Error => Some("error"),
            Self::Credit => Some("credit"),
            Self::KeepAlive => Some("keep-alive"),
            Self::Cancel => Some("cancel"),
            Self::HandoffStart => Some("handoff-start"),
            Self::HandoffProceed => Some("handoff-proceed"),
            Self::Close => Some("close"),
            Self::Ping => Some("ping"),
            Self::Pong => Some("pong"),
        }
    }

    fn from_wire_name(name: &[u8]) -> Result<Self> {
        Ok(match name {
            b"error" => Self::Error,
            b"credit" => Self::Credit,
            b"keep-alive" => Self::KeepAlive,
            b"cancel" => Self::Cancel,
            b"handoff-start" => Self::HandoffStart,
            b"handoff-proceed" => Self::HandoffProceed,
            b"close" => Self::Close,
            b"ping" => Self::Ping,
            b"pong" => Self::Pong,
            _ => return Err(WireError::FieldValue("type")),
        })
    }
}

/// WebSocket payload kind for data packets on a WebSocket-mode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Binary,
}

/// One ZHTTP message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZhttpPacket {
    /// Reply address of the sender. Required on the first packet of a
    /// sequence in each direction.
    pub from: Bytes,
    pub id: Bytes,
    /// Monotonic per-direction sequence number; `None` on the wire means
    /// "current" and is only legal from peers that track externally.
    pub seq: Option<u64>,
    pub ptype: PacketType,

    pub condition: Option<Bytes>,
    pub credits: Option<u32>,
    pub more: bool,
    pub stream: bool,
    pub max_size: Option<u64>,

    pub method: Option<String>,
    pub uri: Option<String>,
    pub headers: Option<HttpHeaders>,
    pub body: Option<Bytes>,
    pub content_type: Option<ContentType>,
    pub code: Option<u16>,
    pub reason: Option<Bytes>,

    pub ignore_policies: bool,
    pub peer_address: Option<String>,
    pub connect_host: Option<String>,
    pub connect_port: Option<u16>,

    /// Routing metadata consumed by the receiving proxy (internal-route
    /// flag, signing material, trust), never forwarded to the origin.
    pub passthrough: Option<TnValue>,

    /// Opaque value preserved across handoffs.
    pub user_data: Option<TnValue>,
}

impl ZhttpPacket {
    pub fn new(ptype: PacketType, id: impl Into<Bytes>) -> Self {
        Self {
            ptype,
            id: id.into(),
            ..Self::default()
        }
    }

    /// Serialize as `T` + typed map.
    pub fn encode(&self) -> Bytes {
        let mut map = MapBuilder::new();

        if !self.from.is_empty() {
            map = map.put("from", TnValue::Bytes(self.from.clone()));
        }
        map = map.put("id", TnValue::Bytes(self.id.clone()));
        if let Some(seq) = self.seq {
            map = map.put("seq", TnValue::Int(seq as i64));
        }
        if let Some(name) = self.ptype.wire_name() {
            map = map.put("type", TnValue::string(name));
        }
        map = map
            .put_opt(
                "condition",
                self.condition.clone().map(TnValue::Bytes),
            )
            .put_opt("credits", self.credits.map(|c| TnValue::Int(c as i64)));
        if self.more {
            map = map.put("more", TnValue::Bool(true));
        }
        if self.stream {
            map = map.put("stream", TnValue::Bool(true));
        }
        map = map
            .put_opt("max-size", self.max_size.map(|v| TnValue::Int(v as i64)))
            .put_opt("method", self.method.as_deref().map(TnValue::string))
            .put_opt("uri", self.uri.as_deref().map(TnValue::string));
        if let Some(headers) = &self.headers {
            map = map.put("headers", encode_headers(headers));
        }
        map = map
            .put_opt("body", self.body.clone().map(TnValue::Bytes))
            .put_opt(
                "content-type",
                self.content_type.map(|ct| {
                    TnValue::string(match ct {
                        ContentType::Text => "text",
                        ContentType::Binary => "binary",
                    })
                }),
            )
            .put_opt("code", self.code.map(|c| TnValue::Int(c as i64)))
            .put_opt("reason", self.reason.clone().map(TnValue::Bytes));
        if self.ignore_policies {
            map = map.put("ignore-policies", TnValue::Bool(true));
        }
        map = map
            .put_opt(
                "peer-address",
                self.peer_address.as_deref().map(TnValue::string),
            )
            .put_opt(
                "connect-host",
                self.connect_host.as_deref().map(TnValue::string),
            )
            .put_opt(
                "connect-port",
                self.connect_port.map(|p| TnValue::Int(p as i64)),
            )
            .put_opt("passthrough", self.passthrough.clone())
            .put_opt("user-data", self.user_data.clone());

        let mut out = BytesMut::new();
        out.extend_from_slice(b"T");
        tnetstring::encode(&map.build(), &mut out);
        out.freeze()
    }

    /// Parse a `T`-tagged message.
    pub fn decode(input: &Bytes) -> Result<Self> {
        if input.first() != Some(&b'T') {
            return Err(WireError::Malformed("missing format tag"));
        }
        let value = tnetstring::decode(&input.slice(1..))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &TnValue) -> Result<Self> {
        if value.as_map().is_none() {
            return Err(WireError::Malformed("packet is not a map"));
        }

        let mut packet = Self {
            from: get_bytes_opt(value, "from")?.unwrap_or_default(),
            id: get_bytes_opt(value, "id")?.ok_or(WireError::FieldMissing("id"))?,
            ..Self::default()
        };

        if let Some(seq) = get_int_opt(value, "seq")? {
            if seq >= 0 {
                packet.seq = Some(seq as u64);
            }
        }

        if let Some(type_name) = get_bytes_opt(value, "type")? {
            packet.ptype = PacketType::from_wire_name(&type_name)?;
        }

        packet.condition = get_bytes_opt(value, "condition")?;
        packet.credits = match get_int_opt(value, "credits")? {
            Some(c) if c >= 0 => Some(c as u32),
            Some(_) => return Err(WireError::FieldValue("credits")),
            None => None,
        };
        packet.more = get_bool_opt(value, "more")?.unwrap_or(false);
        packet.stream = get_bool_opt(value, "stream")?.unwrap_or(false);
        packet.max_size = get_int_opt(value, "max-size")?.map(|v| v as u64);
        packet.method = get_string_opt(value, "method")?;
        packet.uri = get_string_opt(value, "uri")?;

        if let Some(vheaders) = value.get("headers") {
            packet.headers = Some(decode_headers(vheaders)?);
        }

        packet.body = get_bytes_opt(value, "body")?;

        if let Some(ct) = get_bytes_opt(value, "content-type")? {
            packet.content_type = Some(match ct.as_ref() {
                b"text" => ContentType::Text,
                b"binary" => ContentType::Binary,
                _ => return Err(WireError::FieldValue("content-type")),
            });
        }

        packet.code = match get_int_opt(value, "code")? {
            Some(c) if (0..=999).contains(&c) => Some(c as u16),
            Some(_) => return Err(WireError::FieldValue("code")),
            None => None,
        };
        packet.reason = get_bytes_opt(value, "reason")?;
        packet.ignore_policies = get_bool_opt(value, "ignore-policies")?.unwrap_or(false);
        packet.peer_address = get_string_opt(value, "peer-address")?;
        packet.connect_host = get_string_opt(value, "connect-host")?;
        packet.connect_port = match get_int_opt(value, "connect-port")? {
            Some(p) if (0..=65535).contains(&p) => Some(p as u16),
            Some(_) => return Err(WireError::FieldValue("connect-port")),
            None => None,
        };
        packet.passthrough = value.get("passthrough").cloned();
        packet.user_data = value.get("user-data").cloned();

        Ok(packet)
    }
}

pub fn encode_headers(headers: &HttpHeaders) -> TnValue {
    TnValue::List(
        headers
            .iter()
            .map(|(k, v)| {
                TnValue::List(vec![TnValue::Bytes(k.clone()), TnValue::Bytes(v.clone())])
            })
            .collect(),
    )
}

pub fn decode_headers(value: &TnValue) -> Result<HttpHeaders> {
    let list = value.as_list().ok_or(WireError::FieldType("headers"))?;
    let mut headers = HttpHeaders::new();
    for entry in list {
        let pair = entry.as_list().ok_or(WireError::FieldType("headers"))?;
        if pair.len() != 2 {
            return Err(WireError::FieldValue("headers"));
        }
        let name = pair[0].as_bytes().ok_or(WireError::FieldType("headers"))?;
        let val = pair[1].as_bytes().ok_or(WireError::FieldType("headers"))?;
        headers.push(name.clone(), val.clone());
    }
    Ok(headers)
}

fn get_bytes_opt(value: &TnValue, key: &'static str) -> Result<Option<Bytes>> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_bytes()
            .cloned()
            .map(Some)
            .ok_or(WireError::FieldType(key)),
    }
}

fn get_string_opt(value: &TnValue, key: &'static str) -> Result<Option<String>> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or(WireError::FieldType(key)),
    }
}

fn get_int_opt(value: &TnValue, key: &'static str) -> Result<Option<i64>> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v.as_int().map(Some).ok_or(WireError::FieldType(key)),
    }
}

fn get_bool_opt(value: &TnValue, key: &'static str) -> Result<Option<bool>> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or(WireError::FieldType(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_request_packet() -> ZhttpPacket {
        let mut headers = HttpHeaders::new();
        headers.push("Host", "example.com");
        headers.push("Accept", "*/*");

        ZhttpPacket {
            from: Bytes::from_static(b"proxy-1"),
            id: Bytes::from_static(b"req-7"),
            seq: Some(0),
            ptype: PacketType::Data,
            condition: None,
            credits: Some(100_000),
            more: true,
            stream: true,
            max_size: Some(16_384),
            method: Some("POST".into()),
            uri: Some("http://example.com/publish".into()),
            headers: Some(headers),
            body: Some(Bytes::from_static(b"{\"n\":1}")),
            content_type: None,
            code: None,
            reason: None,
            ignore_policies: true,
            peer_address: Some("10.0.0.9".into()),
            connect_host: Some("origin.internal".into()),
            connect_port: Some(8080),
            passthrough: Some(TnValue::Map(vec![(
                Bytes::from_static(b"trusted"),
                TnValue::Bool(true),
            )])),
            user_data: Some(TnValue::Map(vec![(
                Bytes::from_static(b"route"),
                TnValue::string("r1"),
            )])),
        }
    }

    #[test]
    fn data_packet_roundtrip_is_identity() {
        let packet = full_request_packet();
        let decoded = ZhttpPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn response_packet_roundtrip() {
        let mut headers = HttpHeaders::new();
        headers.push("Content-Type", "text/plain");
        let packet = ZhttpPacket {
            from: Bytes::from_static(b"origin-1"),
            id: Bytes::from_static(b"req-7"),
            seq: Some(1),
            code: Some(200),
            reason: Some(Bytes::from_static(b"OK")),
            headers: Some(headers),
            body: Some(Bytes::from_static(b"hi")),
            more: false,
            ..Default::default()
        };
        let decoded = ZhttpPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn control_types_roundtrip() {
        for ptype in [
            PacketType::Error,
            PacketType::Credit,
            PacketType::KeepAlive,
            PacketType::Cancel,
            PacketType::HandoffStart,
            PacketType::HandoffProceed,
            PacketType::Close,
            PacketType::Ping,
            PacketType::Pong,
        ] {
            let packet = ZhttpPacket::new(ptype, "id-1");
            let decoded = ZhttpPacket::decode(&packet.encode()).unwrap();
            assert_eq!(decoded.ptype, ptype);
        }
    }

    #[test]
    fn missing_type_means_data() {
        let packet = ZhttpPacket::new(PacketType::Data, "x");
        let encoded = packet.encode();
        assert!(!encoded
            .windows(b"type".len() + 1)
            .any(|w| w == b"type,"));
        assert_eq!(ZhttpPacket::decode(&encoded).unwrap().ptype, PacketType::Data);
    }

    #[test]
    fn unknown_keys_ignored() {
        let value = MapBuilder::new()
            .put("id", TnValue::string("a"))
            .put("future-field", TnValue::Int(9))
            .build();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"T");
        tnetstring::encode(&value, &mut buf);
        let packet = ZhttpPacket::decode(&buf.freeze()).unwrap();
        assert_eq!(packet.id.as_ref(), b"a");
    }

    #[test]
    fn missing_id_is_an_error() {
        let value = MapBuilder::new().put("seq", TnValue::Int(0)).build();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"T");
        tnetstring::encode(&value, &mut buf);
        assert_eq!(
            ZhttpPacket::decode(&buf.freeze()),
            Err(WireError::FieldMissing("id"))
        );
    }

    #[test]
    fn wrong_typed_field_is_an_error() {
        let value = MapBuilder::new()
            .put("id", TnValue::string("a"))
            .put("credits", TnValue::string("many"))
            .build();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"T");
        tnetstring::encode(&value, &mut buf);
        assert_eq!(
            ZhttpPacket::decode(&buf.freeze()),
            Err(WireError::FieldType("credits"))
        );
    }

    #[test]
    fn negative_seq_means_current() {
        let value = MapBuilder::new()
            .put("id", TnValue::string("a"))
            .put("seq", TnValue::Int(-1))
            .build();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"T");
        tnetstring::encode(&value, &mut buf);
        let packet = ZhttpPacket::decode(&buf.freeze()).unwrap();
        assert_eq!(packet.seq, None);
    }

    #[test]
    fn tag_required() {
        assert_eq!(
            ZhttpPacket::decode(&Bytes::from_static(b"0:~")),
            Err(WireError::Malformed("missing format tag"))
        );
    }
}
