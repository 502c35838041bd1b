//! Ordered, case-insensitive HTTP header collection.
//!
//! Headers are kept as an ordered list of name/value pairs so the emitted
//! bytes preserve origin ordering and repeated names. Lookup is ASCII
//! case-insensitive. The parameter helpers implement the grammar the GRIP
//! headers use: a header value is a comma-separated list of members, each
//! member a semicolon-separated list of `key=value` parameters where the
//! first parameter's key is the member's principal value.

use bytes::Bytes;

/// Whether the first parameter of a member is itself split on `=`.
///
/// GRIP headers carry an opaque principal value first (channel name,
/// keep-alive payload), so the default leaves it whole; `Grip-Set-Meta`
/// style headers want every parameter parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    #[default]
    NoParseFirstParameter,
    ParseAllParameters,
}

/// One parsed header member: `principal; k1=v1; k2=v2`.
///
/// The principal value is the first entry's key (its value is empty unless
/// the member itself was written `k=v` and parsed with
/// [`ParseMode::ParseAllParameters`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderParameters(pub Vec<(Bytes, Bytes)>);

impl HeaderParameters {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The member's principal value (the first parameter's key).
    pub fn principal(&self) -> Option<&Bytes> {
        self.0.first().map(|(k, _)| k)
    }

    /// Value of a named parameter, if present.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.0
            .iter()
            .find(|(k, _)| k.as_ref() == key.as_bytes())
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// All values for a repeated parameter key, in order.
    pub fn get_all(&self, key: &str) -> Vec<&Bytes> {
        self.0
            .iter()
            .filter(|(k, _)| k.as_ref() == key.as_bytes())
            .map(|(_, v)| v)
            .collect()
    }
}

/// Ordered multimap of HTTP headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders(pub Vec<(Bytes, Bytes)>);

impl HttpHeaders {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Bytes)> {
        self.0.iter()
    }

    pub fn push(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First value for a name, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v)
    }

    /// All values for a name, in order.
    pub fn get_all(&self, name: &str) -> Vec<Bytes> {
        self.0
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Remove every occurrence of a name.
    pub fn remove_all(&mut self, name: &str) {
        self.0
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name.as_bytes()));
    }

    /// Replace all occurrences of a name with a single value.
    pub fn set(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        let name = name.into();
        self.remove_all(&String::from_utf8_lossy(&name));
        self.0.push((name, value.into()));
    }

    /// First value with any `;`-separated parameters stripped and whitespace
    /// trimmed. `Content-Type: application/grip-instruct; charset=utf-8`
    /// yields `application/grip-instruct`.
    pub fn get_first_parameter(&self, name: &str) -> Option<Bytes> {
        let v = self.get(name)?;
        let end = v.iter().position(|&b| b == b';').unwrap_or(v.len());
        Some(trim_bytes(&v.slice(..end)))
    }

    /// Parse the first occurrence of a header as a parameter list.
    pub fn get_as_parameters(&self, name: &str) -> Option<HeaderParameters> {
        let v = self.get(name)?;
        parse_member(v, ParseMode::NoParseFirstParameter)
    }

    /// Parse every occurrence of a header, splitting each value on commas
    /// into members and each member on semicolons into parameters.
    pub fn get_all_as_parameters(&self, name: &str) -> Vec<HeaderParameters> {
        self.get_all_as_parameters_mode(name, ParseMode::NoParseFirstParameter)
    }

    pub fn get_all_as_parameters_mode(&self, name: &str, mode: ParseMode) -> Vec<HeaderParameters> {
        let mut out = Vec::new();
        for value in self.get_all(name) {
            for member in split_outside_quotes(&value, b',') {
                if let Some(params) = parse_member(&member, mode) {
                    out.push(params);
                }
            }
        }
        out
    }
}

impl FromIterator<(Bytes, Bytes)> for HttpHeaders {
    fn from_iter<T: IntoIterator<Item = (Bytes, Bytes)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn trim_bytes(b: &Bytes) -> Bytes {
    let start = b
        .iter()
        .position(|c| !c.is_ascii_whitespace())
        .unwrap_or(b.len());
    let end = b
        .iter()
        .rposition(|c| !c.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    b.slice(start..end)
}

fn unquote(b: Bytes) -> Bytes {
    if b.len() >= 2 && b[0] == b'"' && b[b.len() - 1] == b'"' {
        b.slice(1..b.len() - 1)
    } else {
        b
    }
}

/// Split on a separator byte, ignoring separators inside double quotes.
fn split_outside_quotes(value: &Bytes, sep: u8) -> Vec<Bytes> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, &b) in value.iter().enumerate() {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if b == sep && !in_quotes {
            parts.push(value.slice(start..i));
            start = i + 1;
        }
    }
    parts.push(value.slice(start..));
    parts
}

fn parse_member(member: &Bytes, mode: ParseMode) -> Option<HeaderParameters> {
    let mut params = Vec::new();
    for part in split_outside_quotes(member, b';') {
        let part = trim_bytes(&part);
        if part.is_empty() {
            continue;
        }
        let split_this = mode == ParseMode::ParseAllParameters || !params.is_empty();
        match part.iter().position(|&b| b == b'=').filter(|_| split_this) {
            Some(eq) => {
                let key = trim_bytes(&part.slice(..eq));
                let val = unquote(trim_bytes(&part.slice(eq + 1..)));
                params.push((key, val));
            }
            None => params.push((part, Bytes::new())),
        }
    }
    if params.is_empty() {
        None
    } else {
        Some(HeaderParameters(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HttpHeaders {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    Bytes::copy_from_slice(k.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect()
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let h = headers(&[("Content-Type", "text/plain")]);
        assert_eq!(h.get("content-type").unwrap().as_ref(), b"text/plain");
        assert!(h.contains("CONTENT-TYPE"));
        assert!(!h.contains("Content-Length"));
    }

    #[test]
    fn get_all_preserves_order() {
        let h = headers(&[("Grip-Channel", "a"), ("X", "y"), ("Grip-Channel", "b")]);
        let all = h.get_all("grip-channel");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].as_ref(), b"a");
        assert_eq!(all[1].as_ref(), b"b");
    }

    #[test]
    fn remove_all_drops_every_occurrence() {
        let mut h = headers(&[("A", "1"), ("a", "2"), ("B", "3")]);
        h.remove_all("A");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("B").unwrap().as_ref(), b"3");
    }

    #[test]
    fn first_parameter_strips_params_and_space() {
        let h = headers(&[("Content-Type", "application/grip-instruct; charset=utf-8")]);
        assert_eq!(
            h.get_first_parameter("Content-Type").unwrap().as_ref(),
            b"application/grip-instruct"
        );
    }

    #[test]
    fn grip_channel_grammar() {
        let h = headers(&[
            ("Grip-Channel", "room-1; prev-id=a1; filter=skip-self"),
            ("Grip-Channel", "room-2, room-3; filter=f1; filter=f2"),
        ]);
        let members = h.get_all_as_parameters("Grip-Channel");
        assert_eq!(members.len(), 3);

        assert_eq!(members[0].principal().unwrap().as_ref(), b"room-1");
        assert_eq!(members[0].get("prev-id").unwrap().as_ref(), b"a1");
        assert_eq!(members[0].get("filter").unwrap().as_ref(), b"skip-self");

        assert_eq!(members[1].principal().unwrap().as_ref(), b"room-2");
        assert!(members[1].get("prev-id").is_none());

        let filters = members[2].get_all("filter");
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].as_ref(), b"f1");
        assert_eq!(filters[1].as_ref(), b"f2");
    }

    #[test]
    fn principal_with_equals_stays_whole() {
        // base64 padding must survive in the principal position
        let h = headers(&[("Grip-Keep-Alive", "cGluZw==; format=base64")]);
        let p = h.get_as_parameters("Grip-Keep-Alive").unwrap();
        assert_eq!(p.principal().unwrap().as_ref(), b"cGluZw==");
        assert_eq!(p.get("format").unwrap().as_ref(), b"base64");
    }

    #[test]
    fn parse_all_mode_splits_first_parameter() {
        let h = headers(&[("Grip-Set-Meta", "user=alice; note=x")]);
        let members = h.get_all_as_parameters_mode("Grip-Set-Meta", ParseMode::ParseAllParameters);
        assert_eq!(members[0].0[0].0.as_ref(), b"user");
        assert_eq!(members[0].0[0].1.as_ref(), b"alice");
    }

    #[test]
    fn quoted_values_are_unwrapped() {
        let h = headers(&[("Grip-Link", "</stream/?after=3>; rel=\"next\"")]);
        let p = h.get_as_parameters("Grip-Link").unwrap();
        assert_eq!(p.get("rel").unwrap().as_ref(), b"next");
    }

    #[test]
    fn commas_inside_quotes_do_not_split() {
        let h = headers(&[("X", "a; note=\"one, two\", b")]);
        let members = h.get_all_as_parameters("X");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].get("note").unwrap().as_ref(), b"one, two");
        assert_eq!(members[1].principal().unwrap().as_ref(), b"b");
    }
}
