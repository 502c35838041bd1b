//! Proxy-to-handler handoff RPC payloads.
//!
//! When a proxy session decides to retain a request past its origin
//! response, it bundles the paused session state and sends it to the
//! handler over a request/reply pair. The reply either takes ownership
//! (`accepted`) or names a rejection condition, in which case the proxy
//! falls back to serving the response it buffered.

use bytes::{Bytes, BytesMut};

use gripd_x::{HttpRequestData, HttpResponseData, Rid};

use crate::tnetstring::{self, MapBuilder, TnValue};
use crate::zhttp::{decode_headers, encode_headers};
use crate::{Result, WireError};

/// RPC envelope: a method call with an opaque correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: Bytes,
    pub method: String,
    pub args: TnValue,
}

impl RpcRequest {
    pub fn encode(&self) -> Bytes {
        let value = MapBuilder::new()
            .put("id", TnValue::Bytes(self.id.clone()))
            .put("method", TnValue::string(&self.method))
            .put("args", self.args.clone())
            .build();
        let mut out = BytesMut::new();
        out.extend_from_slice(b"T");
        tnetstring::encode(&value, &mut out);
        out.freeze()
    }

    pub fn decode(input: &Bytes) -> Result<Self> {
        let value = decode_tagged(input)?;
        Ok(Self {
            id: require_bytes(&value, "id")?,
            method: require_str(&value, "method")?,
            args: value.get("args").cloned().unwrap_or(TnValue::Null),
        })
    }
}

/// RPC reply: success with a value, or a failure condition.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: Bytes,
    pub success: bool,
    pub value: TnValue,
    pub condition: Option<Bytes>,
}

impl RpcResponse {
    pub fn ok(id: Bytes, value: TnValue) -> Self {
        Self {
            id,
            success: true,
            value,
            condition: None,
        }
    }

    pub fn error(id: Bytes, condition: &'static str) -> Self {
        Self {
            id,
            success: false,
            value: TnValue::Null,
            condition: Some(Bytes::from_static(condition.as_bytes())),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut map = MapBuilder::new()
            .put("id", TnValue::Bytes(self.id.clone()))
            .put("success", TnValue::Bool(self.success));
        if self.success {
            map = map.put("value", self.value.clone());
        } else {
            map = map.put_opt("condition", self.condition.clone().map(TnValue::Bytes));
        }
        let mut out = BytesMut::new();
        out.extend_from_slice(b"T");
        tnetstring::encode(&map.build(), &mut out);
        out.freeze()
    }

    pub fn decode(input: &Bytes) -> Result<Self> {
        let value = decode_tagged(input)?;
        let success = value
            .get("success")
            .and_then(TnValue::as_bool)
            .ok_or(WireError::FieldMissing("success"))?;
        Ok(Self {
            id: require_bytes(&value, "id")?,
            success,
            value: value.get("value").cloned().unwrap_or(TnValue::Null),
            condition: match value.get("condition") {
                Some(v) => Some(
                    v.as_bytes()
                        .cloned()
                        .ok_or(WireError::FieldType("condition"))?,
                ),
                None => None,
            },
        })
    }
}

/// ZHTTP session coordinates for one paused client request.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptRequestItem {
    pub rid: Rid,
    /// Next seq the handler should use toward the client.
    pub out_seq: u64,
    /// Next seq the handler should expect from the client.
    pub in_seq: u64,
    /// Credits outstanding toward the client.
    pub out_credits: u32,
    pub user_data: Option<TnValue>,
}

/// Everything the handler needs to own a held request.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptData {
    pub requests: Vec<AcceptRequestItem>,
    pub request_data: HttpRequestData,
    pub response_data: HttpResponseData,
    pub route: Bytes,
    pub channel_prefix: String,
    pub peer_address: Option<String>,
    pub auto_cross_origin: bool,
    pub jsonp_callback: Option<Bytes>,
    pub jsonp_extended_response: bool,
    pub sig_iss: Option<Bytes>,
    pub sig_key: Option<Bytes>,
    pub trusted: bool,
    pub sid: Option<Bytes>,
    pub response_sent: bool,
    pub debug: bool,
}

impl Default for AcceptData {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            request_data: HttpRequestData::default(),
            response_data: HttpResponseData::default(),
            route: Bytes::new(),
            channel_prefix: String::new(),
            peer_address: None,
            auto_cross_origin: false,
            jsonp_callback: None,
            jsonp_extended_response: false,
            sig_iss: None,
            sig_key: None,
            trusted: false,
            sid: None,
            response_sent: false,
            debug: false,
        }
    }
}

impl AcceptData {
    pub fn to_value(&self) -> TnValue {
        let requests = TnValue::List(
            self.requests
                .iter()
                .map(|r| {
                    MapBuilder::new()
                        .put(
                            "rid",
                            TnValue::List(vec![
                                TnValue::Bytes(r.rid.sender.clone()),
                                TnValue::Bytes(r.rid.id.clone()),
                            ]),
                        )
                        .put("out-seq", TnValue::Int(r.out_seq as i64))
                        .put("in-seq", TnValue::Int(r.in_seq as i64))
                        .put("out-credits", TnValue::Int(r.out_credits as i64))
                        .put_opt("user-data", r.user_data.clone())
                        .build()
                })
                .collect(),
        );

        let request_data = MapBuilder::new()
            .put("method", TnValue::string(&self.request_data.method))
            .put("uri", TnValue::string(&self.request_data.uri))
            .put("headers", encode_headers(&self.request_data.headers))
            .put("body", TnValue::Bytes(self.request_data.body.clone()))
            .build();

        let response_data = MapBuilder::new()
            .put("code", TnValue::Int(self.response_data.code as i64))
            .put("reason", TnValue::Bytes(self.response_data.reason.clone()))
            .put("headers", encode_headers(&self.response_data.headers))
            .put("body", TnValue::Bytes(self.response_data.body.clone()))
            .build();

        let mut map = MapBuilder::new()
            .put("requests", requests)
            .put("request-data", request_data)
            .put("response-data", response_data)
            .put("route", TnValue::Bytes(self.route.clone()))
            .put("channel-prefix", TnValue::string(&self.channel_prefix))
            .put_opt(
                "peer-address",
                self.peer_address.as_deref().map(TnValue::string),
            );
        if self.auto_cross_origin {
            map = map.put("auto-cross-origin", TnValue::Bool(true));
        }
        map = map
            .put_opt(
                "jsonp-callback",
                self.jsonp_callback.clone().map(TnValue::Bytes),
            )
            .put_opt("sig-iss", self.sig_iss.clone().map(TnValue::Bytes))
            .put_opt("sig-key", self.sig_key.clone().map(TnValue::Bytes));
        if self.jsonp_extended_response {
            map = map.put("jsonp-extended-response", TnValue::Bool(true));
        }
        if self.trusted {
            map = map.put("trusted", TnValue::Bool(true));
        }
        map = map.put_opt("sid", self.sid.clone().map(TnValue::Bytes));
        if self.response_sent {
            map = map.put("response-sent", TnValue::Bool(true));
        }
        if self.debug {
            map = map.put("debug", TnValue::Bool(true));
        }
        map.build()
    }

    pub fn from_value(value: &TnValue) -> Result<Self> {
        let vrequests = value
            .get("requests")
            .and_then(TnValue::as_list)
            .ok_or(WireError::FieldMissing("requests"))?;

        let mut requests = Vec::with_capacity(vrequests.len());
        for vreq in vrequests {
            let vrid = vreq
                .get("rid")
                .and_then(TnValue::as_list)
                .ok_or(WireError::FieldMissing("rid"))?;
            if vrid.len() != 2 {
                return Err(WireError::FieldValue("rid"));
            }
            let sender = vrid[0].as_bytes().ok_or(WireError::FieldType("rid"))?;
            let id = vrid[1].as_bytes().ok_or(WireError::FieldType("rid"))?;

            requests.push(AcceptRequestItem {
                rid: Rid::new(sender.clone(), id.clone()),
                out_seq: get_uint(vreq, "out-seq")?,
                in_seq: get_uint(vreq, "in-seq")?,
                out_credits: get_uint(vreq, "out-credits")? as u32,
                user_data: vreq.get("user-data").cloned(),
            });
        }

        let vreq_data = value
            .get("request-data")
            .ok_or(WireError::FieldMissing("request-data"))?;
        let request_data = HttpRequestData {
            method: require_str(vreq_data, "method")?,
            uri: require_str(vreq_data, "uri")?,
            headers: decode_headers(
                vreq_data
                    .get("headers")
                    .ok_or(WireError::FieldMissing("headers"))?,
            )?,
            body: require_bytes(vreq_data, "body")?,
        };

        let vresp_data = value
            .get("response-data")
            .ok_or(WireError::FieldMissing("response-data"))?;
        let response_data = HttpResponseData {
            code: get_uint(vresp_data, "code")? as u16,
            reason: require_bytes(vresp_data, "reason")?,
            headers: decode_headers(
                vresp_data
                    .get("headers")
                    .ok_or(WireError::FieldMissing("headers"))?,
            )?,
            body: require_bytes(vresp_data, "body")?,
        };

        Ok(Self {
            requests,
            request_data,
            response_data,
            route: require_bytes(value, "route")?,
            channel_prefix: value
                .get("channel-prefix")
                .and_then(TnValue::as_str)
                .unwrap_or_default()
                .to_string(),
            peer_address: value
                .get("peer-address")
                .and_then(TnValue::as_str)
                .map(str::to_string),
            auto_cross_origin: get_flag(value, "auto-cross-origin"),
            jsonp_callback: value.get("jsonp-callback").and_then(TnValue::as_bytes).cloned(),
            jsonp_extended_response: get_flag(value, "jsonp-extended-response"),
            sig_iss: value.get("sig-iss").and_then(TnValue::as_bytes).cloned(),
            sig_key: value.get("sig-key").and_then(TnValue::as_bytes).cloned(),
            trusted: get_flag(value, "trusted"),
            sid: value.get("sid").and_then(TnValue::as_bytes).cloned(),
            response_sent: get_flag(value, "response-sent"),
            debug: get_flag(value, "debug"),
        })
    }
}

fn decode_tagged(input: &Bytes) -> Result<TnValue> {
    if input.first() != Some(&b'T') {
        return Err(WireError::Malformed("missing format tag"));
    }
    tnetstring::decode(&input.slice(1..))
}

fn require_bytes(value: &TnValue, key: &'static str) -> Result<Bytes> {
    value
        .get(key)
        .ok_or(WireError::FieldMissing(key))?
        .as_bytes()
        .cloned()
        .ok_or(WireError::FieldType(key))
}

fn require_str(value: &TnValue, key: &'static str) -> Result<String> {
    value
        .get(key)
        .ok_or(WireError::FieldMissing(key))?
        .as_str()
        .map(str::to_string)
        .ok_or(WireError::FieldType(key))
}

fn get_uint(value: &TnValue, key: &'static str) -> Result<u64> {
    let v = value
        .get(key)
        .ok_or(WireError::FieldMissing(key))?
        .as_int()
        .ok_or(WireError::FieldType(key))?;
    if v < 0 {
        return Err(WireError::FieldValue(key));
    }
    Ok(v as u64)
}

fn get_flag(value: &TnValue, key: &str) -> bool {
    value.get(key).and_then(TnValue::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gripd_x::HttpHeaders;

    fn sample_accept_data() -> AcceptData {
        let mut req_headers = HttpHeaders::new();
        req_headers.push("Host", "app.example.com");
        let mut resp_headers = HttpHeaders::new();
        resp_headers.push("Content-Type", "application/grip-instruct");

        AcceptData {
            requests: vec![AcceptRequestItem {
                rid: Rid::new("edge-1", "33"),
                out_seq: 2,
                in_seq: 1,
                out_credits: 100_000,
                user_data: Some(TnValue::string("opaque")),
            }],
            request_data: HttpRequestData {
                method: "GET".into(),
                uri: "http://app.example.com/stream".into(),
                headers: req_headers,
                body: Bytes::new(),
            },
            response_data: HttpResponseData {
                code: 200,
                reason: Bytes::from_static(b"OK"),
                headers: resp_headers,
                body: Bytes::from_static(b"{\"hold\":{}}"),
            },
            route: Bytes::from_static(b"route-1"),
            channel_prefix: "app-".into(),
            peer_address: Some("10.1.2.3".into()),
            auto_cross_origin: true,
            jsonp_callback: None,
            jsonp_extended_response: false,
            sig_iss: Some(Bytes::from_static(b"iss")),
            sig_key: Some(Bytes::from_static(b"key")),
            trusted: true,
            sid: Some(Bytes::from_static(b"sid-9")),
            response_sent: false,
            debug: false,
        }
    }

    #[test]
    fn accept_data_roundtrip() {
        let data = sample_accept_data();
        let decoded = AcceptData::from_value(&data.to_value()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn rpc_request_roundtrip() {
        let req = RpcRequest {
            id: Bytes::from_static(b"call-1"),
            method: "accept".into(),
            args: sample_accept_data().to_value(),
        };
        let decoded = RpcRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn rpc_response_roundtrips_both_outcomes() {
        let ok = RpcResponse::ok(Bytes::from_static(b"call-1"), TnValue::Bool(true));
        assert_eq!(RpcResponse::decode(&ok.encode()).unwrap(), ok);

        let err = RpcResponse::error(Bytes::from_static(b"call-2"), "accept-rejected");
        let decoded = RpcResponse::decode(&err.encode()).unwrap();
        assert!(!decoded.success);
        assert_eq!(decoded.condition.unwrap().as_ref(), b"accept-rejected");
    }

    #[test]
    fn missing_requests_field_is_an_error() {
        let value = MapBuilder::new().put("route", TnValue::string("r")).build();
        assert_eq!(
            AcceptData::from_value(&value),
            Err(WireError::FieldMissing("requests"))
        );
    }
}
