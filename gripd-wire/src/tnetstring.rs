//! Typed netstring-style encoding.
//!
//! A value is `<len>:<payload><type>` where `len` is the decimal byte length
//! of the payload and the trailing type byte selects the interpretation:
//!
//! | byte | value |
//! |---|---|
//! | `,` | byte string |
//! | `#` | integer |
//! | `^` | float |
//! | `!` | boolean (`true` / `false`) |
//! | `~` | null (empty payload) |
//! | `]` | list of values |
//! | `}` | map of string keys to values |
//!
//! Maps preserve insertion order. Consumers must ignore keys they do not
//! recognize.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, WireError};

/// Self-describing nested value.
#[derive(Debug, Clone, PartialEq)]
pub enum TnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Bytes),
    List(Vec<TnValue>),
    Map(Vec<(Bytes, TnValue)>),
}

impl TnValue {
    pub fn string(s: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[TnValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Bytes, TnValue)]> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Look up a map entry by key. `None` for non-maps and absent keys.
    pub fn get(&self, key: &str) -> Option<&TnValue> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_ref() == key.as_bytes())
            .map(|(_, v)| v)
    }
}

/// A map builder keeping encode-side ergonomics terse.
#[derive(Debug, Default)]
pub struct MapBuilder(Vec<(Bytes, TnValue)>);

impl MapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: &'static str, value: TnValue) -> Self {
        self.0.push((Bytes::from_static(key.as_bytes()), value));
        self
    }

    pub fn put_opt(self, key: &'static str, value: Option<TnValue>) -> Self {
        match value {
            Some(v) => self.put(key, v),
            None => self,
        }
    }

    pub fn build(self) -> TnValue {
        TnValue::Map(self.0)
    }
}

/// Encode a value, appending to `out`.
pub fn encode(value: &TnValue, out: &mut BytesMut) {
    let mut payload = BytesMut::new();
    let type_byte = match value {
        TnValue::Null => b'~',
        TnValue::Bool(b) => {
            payload.put_slice(if *b { b"true" } else { b"false" });
            b'!'
        }
        TnValue::Int(i) => {
            payload.put_slice(i.to_string().as_bytes());
            b'#'
        }
        TnValue::Float(f) => {
            payload.put_slice(format!("{f:e}").as_bytes());
            b'^'
        }
        TnValue::Bytes(b) => {
            payload.put_slice(b);
            b','
        }
        TnValue::List(items) => {
            for item in items {
                encode(item, &mut payload);
            }
            b']'
        }
        TnValue::Map(entries) => {
            for (k, v) in entries {
                encode(&TnValue::Bytes(k.clone()), &mut payload);
                encode(v, &mut payload);
            }
            b'}'
        }
    };

    out.put_slice(payload.len().to_string().as_bytes());
    out.put_u8(b':');
    out.put_slice(&payload);
    out.put_u8(type_byte);
}

/// Encode a value into a standalone buffer.
pub fn encode_to_bytes(value: &TnValue) -> Bytes {
    let mut out = BytesMut::new();
    encode(value, &mut out);
    out.freeze()
}

/// Decode a single value occupying the entire input.
pub fn decode(input: &Bytes) -> Result<TnValue> {
    let (value, consumed) = decode_prefix(input, 0)?;
    if consumed != input.len() {
        return Err(WireError::Malformed("trailing bytes after value"));
    }
    Ok(value)
}

/// Decode one value starting at `offset`; returns the value and the offset
/// just past it.
fn decode_prefix(input: &Bytes, offset: usize) -> Result<(TnValue, usize)> {
    let colon = input[offset..]
        .iter()
        .position(|&b| b == b':')
        .ok_or(WireError::Truncated)?
        + offset;

    if colon == offset || colon - offset > 9 {
        return Err(WireError::Malformed("bad length prefix"));
    }
    let len: usize = std::str::from_utf8(&input[offset..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(WireError::Malformed("bad length prefix"))?;

    let payload_start = colon + 1;
    let payload_end = payload_start + len;
    if input.len() < payload_end + 1 {
        return Err(WireError::Truncated);
    }

    let payload = input.slice(payload_start..payload_end);
    let type_byte = input[payload_end];
    let next = payload_end + 1;

    let value = match type_byte {
        b'~' => {
            if !payload.is_empty() {
                return Err(WireError::Malformed("null with payload"));
            }
            TnValue::Null
        }
        b'!' => match payload.as_ref() {
            b"true" => TnValue::Bool(true),
            b"false" => TnValue::Bool(false),
            _ => return Err(WireError::Malformed("bad boolean payload")),
        },
        b'#' => {
            let i = std::str::from_utf8(&payload)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(WireError::Malformed("bad integer payload"))?;
            TnValue::Int(i)
        }
        b'^' => {
            let f = std::str::from_utf8(&payload)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(WireError::Malformed("bad float payload"))?;
            TnValue::Float(f)
        }
        b',' => TnValue::Bytes(payload),
        b']' => {
            let mut items = Vec::new();
            let mut pos = 0;
            while pos < payload.len() {
                let (item, next_pos) = decode_prefix(&payload, pos)?;
                items.push(item);
                pos = next_pos;
            }
            TnValue::List(items)
        }
        b'}' => {
            let mut entries = Vec::new();
            let mut pos = 0;
            while pos < payload.len() {
                let (key, after_key) = decode_prefix(&payload, pos)?;
                let key = match key {
                    TnValue::Bytes(b) => b,
                    _ => return Err(WireError::Malformed("map key is not a string")),
                };
                if after_key >= payload.len() {
                    return Err(WireError::Malformed("map key without value"));
                }
                let (value, after_value) = decode_prefix(&payload, after_key)?;
                entries.push((key, value));
                pos = after_value;
            }
            TnValue::Map(entries)
        }
        _ => return Err(WireError::Malformed("unknown type byte")),
    };

    Ok((value, next))
}

/// Convert to a JSON value; byte strings must be UTF-8.
pub fn to_json(value: &TnValue) -> Option<serde_json::Value> {
    use serde_json::Value;
    Some(match value {
        TnValue::Null => Value::Null,
        TnValue::Bool(b) => Value::Bool(*b),
        TnValue::Int(i) => Value::Number((*i).into()),
        TnValue::Float(f) => Value::Number(serde_json::Number::from_f64(*f)?),
        TnValue::Bytes(b) => Value::String(std::str::from_utf8(b).ok()?.to_string()),
        TnValue::List(items) => Value::Array(items.iter().map(to_json).collect::<Option<_>>()?),
        TnValue::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                map.insert(std::str::from_utf8(k).ok()?.to_string(), to_json(v)?);
            }
            Value::Object(map)
        }
    })
}

/// Convert from a JSON value. Numbers outside i64 become floats.
pub fn from_json(value: &serde_json::Value) -> TnValue {
    use serde_json::Value;
    match value {
        Value::Null => TnValue::Null,
        Value::Bool(b) => TnValue::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map(TnValue::Int)
            .unwrap_or_else(|| TnValue::Float(n.as_f64().unwrap_or(0.0))),
        Value::String(s) => TnValue::string(s),
        Value::Array(items) => TnValue::List(items.iter().map(from_json).collect()),
        Value::Object(map) => TnValue::Map(
            map.iter()
                .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), from_json(v)))
                .collect(),
        ),
    }
}

/// Convenience for building an ordered map from a `HashMap`.
pub fn map_from(entries: HashMap<String, TnValue>) -> TnValue {
    let mut pairs: Vec<_> = entries
        .into_iter()
        .map(|(k, v)| (Bytes::from(k.into_bytes()), v))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    TnValue::Map(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: TnValue) -> TnValue {
        let encoded = encode_to_bytes(&value);
        decode(&encoded).unwrap()
    }

    #[test]
    fn scalar_encodings() {
        assert_eq!(encode_to_bytes(&TnValue::Null).as_ref(), b"0:~");
        assert_eq!(encode_to_bytes(&TnValue::Bool(true)).as_ref(), b"4:true!");
        assert_eq!(encode_to_bytes(&TnValue::Bool(false)).as_ref(), b"5:false!");
        assert_eq!(encode_to_bytes(&TnValue::Int(42)).as_ref(), b"2:42#");
        assert_eq!(encode_to_bytes(&TnValue::Int(-7)).as_ref(), b"2:-7#");
        assert_eq!(encode_to_bytes(&TnValue::string("hello")).as_ref(), b"5:hello,");
    }

    #[test]
    fn nested_structure_roundtrip() {
        let value = TnValue::Map(vec![
            (Bytes::from_static(b"id"), TnValue::string("req-1")),
            (
                Bytes::from_static(b"headers"),
                TnValue::List(vec![TnValue::List(vec![
                    TnValue::string("Host"),
                    TnValue::string("example.com"),
                ])]),
            ),
            (Bytes::from_static(b"more"), TnValue::Bool(true)),
            (Bytes::from_static(b"credits"), TnValue::Int(100_000)),
            (Bytes::from_static(b"body"), TnValue::Bytes(Bytes::from_static(b"\x00\x01\x02"))),
            (Bytes::from_static(b"user-data"), TnValue::Null),
        ]);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn map_preserves_order() {
        let value = TnValue::Map(vec![
            (Bytes::from_static(b"z"), TnValue::Int(1)),
            (Bytes::from_static(b"a"), TnValue::Int(2)),
        ]);
        let decoded = roundtrip(value);
        let entries = decoded.as_map().unwrap();
        assert_eq!(entries[0].0.as_ref(), b"z");
        assert_eq!(entries[1].0.as_ref(), b"a");
    }

    #[test]
    fn get_finds_key() {
        let value = TnValue::Map(vec![(Bytes::from_static(b"seq"), TnValue::Int(3))]);
        assert_eq!(value.get("seq").and_then(TnValue::as_int), Some(3));
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn truncated_inputs_error() {
        for input in [&b"5:hell"[..], b"5", b"5:", b"12:abc,"] {
            let err = decode(&Bytes::copy_from_slice(input)).unwrap_err();
            assert!(
                matches!(err, WireError::Truncated | WireError::Malformed(_)),
                "input {input:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        assert_eq!(
            decode(&Bytes::from_static(b"0:~0:~")),
            Err(WireError::Malformed("trailing bytes after value"))
        );
    }

    #[test]
    fn bad_type_byte_rejected() {
        assert!(matches!(
            decode(&Bytes::from_static(b"1:a?")),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn map_key_must_be_string() {
        // map whose key encodes as an integer
        assert!(matches!(
            decode(&Bytes::from_static(b"8:1:1#1:2#}")),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn json_conversion_roundtrip() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"hold":{"mode":"stream","channels":[{"name":"c","prev-id":"a1"}]},"n":3}"#,
        )
        .unwrap();
        let tn = from_json(&json);
        assert_eq!(to_json(&tn).unwrap(), json);
    }

    #[test]
    fn binary_bytes_fail_json_conversion() {
        let tn = TnValue::Bytes(Bytes::from_static(b"\xff\xfe"));
        assert!(to_json(&tn).is_none());
    }
}
