//! GRIP instruction parsing.
//!
//! An origin response becomes an instruction through its `Grip-*` headers,
//! optionally merged with an `application/grip-instruct` JSON body. The
//! JSON wins on conflict. The leftover `response` is what the client sees
//! absent any publish: the timeout response for a response hold, the
//! initial response for a stream hold.

use std::collections::HashMap;

use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use gripd_x::{status_reason, HttpHeaders, HttpResponseData};

/// Default and floor for the response-hold timeout, seconds.
pub const DEFAULT_RESPONSE_TIMEOUT: u32 = 55;
pub const MINIMUM_RESPONSE_TIMEOUT: u32 = 5;

#[derive(Debug, Error, PartialEq)]
pub enum InstructError {
    #[error("Grip-Hold must be set to either 'response' or 'stream'")]
    BadHoldMode,

    #[error("failed to parse Grip-Channel")]
    BadChannel,

    #[error("failed to parse Grip-Timeout")]
    BadTimeout,

    #[error("Grip-Keep-Alive cannot be empty")]
    EmptyKeepAlive,

    #[error("failed to parse Grip-Keep-Alive timeout value")]
    BadKeepAliveTimeout,

    #[error("no such Grip-Keep-Alive format '{0}'")]
    BadKeepAliveFormat(String),

    #[error("failed to parse Grip-Keep-Alive cstring format")]
    BadCstring,

    #[error("Grip-Set-Meta cannot be empty")]
    EmptyMeta,

    #[error("failed to parse Grip-Link")]
    BadLink,

    #[error("response code for application/grip-instruct content must be 200")]
    InstructNot200,

    #[error("failed to parse application/grip-instruct content as JSON")]
    BadInstructJson,

    #[error("instruct {0} has wrong type")]
    WrongType(&'static str),

    #[error("instruct {0} has invalid value")]
    BadValue(&'static str),

    #[error("hold mode 'response' requires at least one channel")]
    ResponseHoldWithoutChannels,
}

pub type Result<T> = std::result::Result<T, InstructError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HoldMode {
    #[default]
    NoHold,
    ResponseHold,
    StreamHold,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Channel {
    pub name: String,
    pub prev_id: Option<String>,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instruct {
    pub hold_mode: HoldMode,
    pub channels: Vec<Channel>,
    /// Response-hold timeout, seconds (clamped).
    pub timeout: u32,
    pub expose_headers: Vec<Bytes>,
    pub keep_alive_data: Bytes,
    /// Keep-alive interval, seconds. `None` disables keep-alives.
    pub keep_alive_timeout: Option<u32>,
    pub meta: HashMap<String, String>,
    /// Client-facing response with the Grip headers stripped.
    pub response: HttpResponseData,
    pub next_link: Option<Url>,
}

impl Instruct {
    /// Parse an origin response into an instruction. `base_uri` resolves a
    /// relative next link.
    pub fn from_response(response: &HttpResponseData, base_uri: Option<&Url>) -> Result<Self> {
        let mut hold_mode = HoldMode::NoHold;
        let mut channels: Vec<Channel> = Vec::new();
        let mut timeout: Option<u32> = None;
        let mut keep_alive_data = Bytes::new();
        let mut keep_alive_timeout: Option<u32> = None;
        let mut meta: HashMap<String, String> = HashMap::new();
        let mut next_link: Option<Url> = None;

        if let Some(hold) = response.headers.get("Grip-Hold") {
            hold_mode = match hold.as_ref() {
                b"response" => HoldMode::ResponseHold,
                b"stream" => HoldMode::StreamHold,
                b"none" => HoldMode::NoHold,
                _ => return Err(InstructError::BadHoldMode),
            };
        }

        let channel_prefix = response
            .headers
            .get("Grip-Channel-Prefix")
            .map(|v| String::from_utf8_lossy(v).to_string())
            .unwrap_or_default();

        for member in response.headers.get_all_as_parameters("Grip-Channel") {
            let Some(name) = member.principal() else {
                return Err(InstructError::BadChannel);
            };
            if name.is_empty() {
                return Err(InstructError::BadChannel);
            }
            let mut channel = Channel {
                name: format!("{channel_prefix}{}", String::from_utf8_lossy(name)),
                prev_id: member
                    .get("prev-id")
                    .map(|v| String::from_utf8_lossy(v).to_string()),
                filters: Vec::new(),
            };
            for filter in member.get_all("filter") {
                channel
                    .filters
                    .push(String::from_utf8_lossy(filter).to_string());
            }
            channels.push(channel);
        }

        if let Some(value) = response.headers.get("Grip-Timeout") {
            let parsed: i64 = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or(InstructError::BadTimeout)?;
            if parsed < 0 {
                return Err(InstructError::BadTimeout);
            }
            timeout = Some(parsed as u32);
        }

        let expose_headers: Vec<Bytes> = response.headers.get_all("Grip-Expose-Headers");

        if let Some(params) = response.headers.get_as_parameters("Grip-Keep-Alive") {
            let value = params.principal().cloned().unwrap_or_default();
            if value.is_empty() {
                return Err(InstructError::EmptyKeepAlive);
            }

            keep_alive_timeout = Some(match params.get("timeout") {
                Some(t) => {
                    let parsed: i64 = std::str::from_utf8(t)
                        .ok()
                        .and_then(|s| s.trim().parse().ok())
                        .ok_or(InstructError::BadKeepAliveTimeout)?;
                    if parsed < 0 {
                        return Err(InstructError::BadKeepAliveTimeout);
                    }
                    parsed as u32
                }
                None => DEFAULT_RESPONSE_TIMEOUT,
            });

            let format = params
                .get("format")
                .map(|f| String::from_utf8_lossy(f).to_string())
                .unwrap_or_default();
            keep_alive_data = match format.as_str() {
                "" | "raw" => value,
                "cstring" => unescape(&value).ok_or(InstructError::BadCstring)?,
                "base64" => Bytes::from(
                    base64::engine::general_purpose::STANDARD
                        .decode(value.as_ref())
                        .map_err(|_| InstructError::BadKeepAliveFormat(format.clone()))?,
                ),
                other => return Err(InstructError::BadKeepAliveFormat(other.to_string())),
            };
        }

        for member in response
            .headers
            .get_all_as_parameters_mode("Grip-Set-Meta", gripd_x::ParseMode::ParseAllParameters)
        {
            let Some((key, value)) = member.0.first() else {
                return Err(InstructError::EmptyMeta);
            };
            meta.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }

        for member in response.headers.get_all_as_parameters("Grip-Link") {
            if member.get("rel").map(|r| r.as_ref()) != Some(b"next".as_slice()) {
                continue;
            }
            let target = member.principal().ok_or(InstructError::BadLink)?;
            // principal form is <uri>
            let target = target
                .strip_prefix(b"<")
                .and_then(|t| t.strip_suffix(b">"))
                .ok_or(InstructError::BadLink)?;
            let target = std::str::from_utf8(target).map_err(|_| InstructError::BadLink)?;

            next_link = Some(match base_uri {
                Some(base) => base.join(target).map_err(|_| InstructError::BadLink)?,
                None => Url::parse(target).map_err(|_| InstructError::BadLink)?,
            });
        }

        // client-facing response: strip grip headers, honor expose list
        let mut new_response = HttpResponseData {
            code: response.code,
            reason: response.reason.clone(),
            headers: HttpHeaders::new(),
            body: response.body.clone(),
        };
        for (name, value) in response.headers.iter() {
            if name.len() >= 5 && name[..5].eq_ignore_ascii_case(b"Grip-") {
                continue;
            }
            if !expose_headers.is_empty()
                && !expose_headers
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(name))
            {
                continue;
            }
            new_response.headers.push(name.clone(), value.clone());
        }

        // JSON instruct body merges over the headers
        let content_type = response.headers.get_first_parameter("Content-Type");
        if content_type.as_deref() == Some(b"application/grip-instruct".as_slice()) {
            if response.code != 200 {
                return Err(InstructError::InstructNot200);
            }

            let doc: Value = serde_json::from_slice(&response.body)
                .map_err(|_| InstructError::BadInstructJson)?;
            let obj = doc.as_object().ok_or(InstructError::BadInstructJson)?;

            if let Some(vhold) = obj.get("hold") {
                let hold = vhold
                    .as_object()
                    .ok_or(InstructError::WrongType("'hold'"))?;

                hold_mode = match hold.get("mode").and_then(Value::as_str) {
                    None => HoldMode::ResponseHold,
                    Some("response") => HoldMode::ResponseHold,
                    Some("stream") => HoldMode::StreamHold,
                    Some(_) => return Err(InstructError::BadHoldMode),
                };

                let vchannels = hold
                    .get("channels")
                    .and_then(Value::as_array)
                    .ok_or(InstructError::WrongType("'channels'"))?;
                channels.clear();
                for vchannel in vchannels {
                    let name = vchannel
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or(InstructError::WrongType("channel 'name'"))?;
                    let mut channel = Channel {
                        name: format!("{channel_prefix}{name}"),
                        prev_id: vchannel
                            .get("prev-id")
                            .map(|v| {
                                v.as_str()
                                    .map(str::to_string)
                                    .ok_or(InstructError::WrongType("channel 'prev-id'"))
                            })
                            .transpose()?,
                        filters: Vec::new(),
                    };
                    if let Some(vfilters) = vchannel.get("filters") {
                        let filters = vfilters
                            .as_array()
                            .ok_or(InstructError::WrongType("'filters'"))?;
                        for f in filters {
                            channel.filters.push(
                                f.as_str()
                                    .ok_or(InstructError::WrongType("'filters'"))?
                                    .to_string(),
                            );
                        }
                    }
                    channels.push(channel);
                }

                if let Some(vtimeout) = hold.get("timeout") {
                    let t = vtimeout
                        .as_i64()
                        .ok_or(InstructError::WrongType("'timeout'"))?;
                    if t < 0 {
                        return Err(InstructError::BadValue("'timeout'"));
                    }
                    timeout = Some(t as u32);
                }

                if let Some(vka) = hold.get("keep-alive") {
                    let ka = vka
                        .as_object()
                        .ok_or(InstructError::WrongType("'keep-alive'"))?;

                    if let Some(content_bin) = ka.get("content-bin") {
                        let encoded = content_bin
                            .as_str()
                            .ok_or(InstructError::WrongType("'content-bin'"))?;
                        keep_alive_data = Bytes::from(
                            base64::engine::general_purpose::STANDARD
                                .decode(encoded)
                                .map_err(|_| InstructError::BadValue("'content-bin'"))?,
                        );
                    } else if let Some(content) = ka.get("content") {
                        keep_alive_data = Bytes::copy_from_slice(
                            content
                                .as_str()
                                .ok_or(InstructError::WrongType("'content'"))?
                                .as_bytes(),
                        );
                    }

                    keep_alive_timeout = Some(match ka.get("timeout") {
                        Some(t) => {
                            let t = t.as_i64().ok_or(InstructError::WrongType("'timeout'"))?;
                            if t < 0 {
                                return Err(InstructError::BadValue("'timeout'"));
                            }
                            t as u32
                        }
                        None => DEFAULT_RESPONSE_TIMEOUT,
                    });
                }

                if let Some(vmeta) = hold.get("meta") {
                    let m = vmeta.as_object().ok_or(InstructError::WrongType("'meta'"))?;
                    for (key, value) in m {
                        meta.insert(
                            key.clone(),
                            value
                                .as_str()
                                .ok_or(InstructError::WrongType("'meta'"))?
                                .to_string(),
                        );
                    }
                }

                if let Some(vlink) = hold.get("next-link") {
                    let link = vlink
                        .as_str()
                        .ok_or(InstructError::WrongType("'next-link'"))?;
                    next_link = Some(match base_uri {
                        Some(base) => base.join(link).map_err(|_| InstructError::BadLink)?,
                        None => Url::parse(link).map_err(|_| InstructError::BadLink)?,
                    });
                }
            }

            new_response.headers = HttpHeaders::new();
            new_response.body = Bytes::new();

            if let Some(vresponse) = obj.get("response") {
                let resp = vresponse
                    .as_object()
                    .ok_or(InstructError::WrongType("'response'"))?;

                new_response.code = match resp.get("code") {
                    Some(c) => {
                        let c = c.as_i64().ok_or(InstructError::WrongType("'code'"))?;
                        if !(0..=999).contains(&c) {
                            return Err(InstructError::BadValue("'code'"));
                        }
                        c as u16
                    }
                    None => 200,
                };

                new_response.reason = match resp.get("reason").and_then(Value::as_str) {
                    Some(r) if !r.is_empty() => Bytes::copy_from_slice(r.as_bytes()),
                    _ => Bytes::from_static(status_reason(new_response.code).as_bytes()),
                };

                if let Some(vheaders) = resp.get("headers") {
                    match vheaders {
                        Value::Array(list) => {
                            for pair in list {
                                let pair = pair
                                    .as_array()
                                    .ok_or(InstructError::WrongType("'headers'"))?;
                                if pair.len() != 2 {
                                    return Err(InstructError::BadValue("'headers'"));
                                }
                                let name = pair[0]
                                    .as_str()
                                    .ok_or(InstructError::WrongType("'headers'"))?;
                                let value = pair[1]
                                    .as_str()
                                    .ok_or(InstructError::WrongType("'headers'"))?;
                                new_response.headers.push(
                                    Bytes::copy_from_slice(name.as_bytes()),
                                    Bytes::copy_from_slice(value.as_bytes()),
                                );
                            }
                        }
                        Value::Object(map) => {
                            for (name, value) in map {
                                new_response.headers.push(
                                    Bytes::copy_from_slice(name.as_bytes()),
                                    Bytes::copy_from_slice(
                                        value
                                            .as_str()
                                            .ok_or(InstructError::WrongType("'headers'"))?
                                            .as_bytes(),
                                    ),
                                );
                            }
                        }
                        _ => return Err(InstructError::WrongType("'headers'")),
                    }
                }

                if let Some(body_bin) = resp.get("body-bin") {
                    let encoded = body_bin
                        .as_str()
                        .ok_or(InstructError::WrongType("'body-bin'"))?;
                    new_response.body = Bytes::from(
                        base64::engine::general_purpose::STANDARD
                            .decode(encoded)
                            .map_err(|_| InstructError::BadValue("'body-bin'"))?,
                    );
                } else if let Some(body) = resp.get("body") {
                    new_response.body = Bytes::copy_from_slice(
                        body.as_str()
                            .ok_or(InstructError::WrongType("'body'"))?
                            .as_bytes(),
                    );
                }
            } else {
                new_response.code = 200;
                new_response.reason = Bytes::from_static(b"OK");
            }
        }

        if hold_mode == HoldMode::ResponseHold && channels.is_empty() {
            return Err(InstructError::ResponseHoldWithoutChannels);
        }

        let timeout = timeout
            .unwrap_or(DEFAULT_RESPONSE_TIMEOUT)
            .max(MINIMUM_RESPONSE_TIMEOUT);
        let keep_alive_timeout = keep_alive_timeout.map(|t| t.max(1));

        Ok(Self {
            hold_mode,
            channels,
            timeout,
            expose_headers,
            keep_alive_data,
            keep_alive_timeout,
            meta,
            response: new_response,
            next_link,
        })
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode the `cstring` keep-alive format: `\\`, `\r`, `\n`, `\xHH`.
fn unescape(input: &[u8]) -> Option<Bytes> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'\\' {
            out.push(input[i]);
            i += 1;
            continue;
        }
        i += 1;
        match input.get(i)? {
            b'\\' => out.push(b'\\'),
            b'r' => out.push(b'\r'),
            b'n' => out.push(b'\n'),
            b'x' => {
                let hi = hex_digit(*input.get(i + 1)?)?;
                let lo = hex_digit(*input.get(i + 2)?)?;
                out.push((hi << 4) | lo);
                i += 2;
            }
            _ => return None,
        }
        i += 1;
    }
    Some(Bytes::from(out))
}
