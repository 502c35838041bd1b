//! Route table: maps `(scheme, tls, host, path)` to an ordered target list
//! with per-route policy.
//!
//! A route line is the host (with optional `,key=value` properties), then
//! one target per following whitespace-separated token:
//!
//! ```text
//! example.com,path_beg=/api,sig_iss=app,sig_key=secret 10.0.0.1:8080,trusted 10.0.0.2:8080
//! *,prefix=pub- test
//! ```
//!
//! Hosts match verbatim first, then the `*` wildcard. Among a host's
//! entries, the longest `path_beg` wins.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("route line has no targets")]
    NoTargets,

    #[error("bad route property '{0}'")]
    BadProperty(String),

    #[error("bad target '{0}'")]
    BadTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Default,
    Custom,
    Test,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub kind: TargetKind,
    pub connect_host: String,
    pub connect_port: u16,
    pub ssl: bool,
    pub trusted: bool,
    pub over_http: bool,
    pub sub_channel: Option<String>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            kind: TargetKind::Default,
            connect_host: String::new(),
            connect_port: 80,
            ssl: false,
            trusted: false,
            over_http: false,
            sub_channel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteEntry {
    pub id: Bytes,
    pub host: String,
    pub path_beg: String,
    pub as_host: Option<String>,
    pub path_remove: usize,
    pub path_prepend: Option<String>,
    /// Channel prefix applied to every GRIP channel on this route.
    pub prefix: String,
    pub sig_iss: Option<Bytes>,
    pub sig_key: Option<Bytes>,
    /// Extra headers added to upstream requests.
    pub headers: Vec<(Bytes, Bytes)>,
    pub targets: Vec<Target>,
    pub trusted: bool,
    pub auto_cross_origin: bool,
    pub debug: bool,
}

impl RouteEntry {
    /// Parse one route line.
    pub fn parse(line: &str) -> Result<Self, RouteError> {
        let mut tokens = line.split_whitespace();
        let head = tokens.next().ok_or(RouteError::NoTargets)?;

        let mut entry = Self::default();
        let mut head_parts = head.split(',');
        entry.host = head_parts.next().unwrap_or_default().to_string();
        entry.id = Bytes::from(entry.host.clone().into_bytes());

        for prop in head_parts {
            let (key, value) = match prop.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (prop, None),
            };
            match (key, value) {
                ("path_beg", Some(v)) => entry.path_beg = v.to_string(),
                ("as_host", Some(v)) => entry.as_host = Some(v.to_string()),
                ("path_remove", Some(v)) => {
                    entry.path_remove = v
                        .parse()
                        .map_err(|_| RouteError::BadProperty(prop.to_string()))?;
                }
                ("path_prepend", Some(v)) => entry.path_prepend = Some(v.to_string()),
                ("prefix", Some(v)) => entry.prefix = v.to_string(),
                ("sig_iss", Some(v)) => {
                    entry.sig_iss = Some(Bytes::copy_from_slice(v.as_bytes()));
                }
                ("sig_key", Some(v)) => {
                    entry.sig_key = Some(Bytes::copy_from_slice(v.as_bytes()));
                }
                ("id", Some(v)) => entry.id = Bytes::copy_from_slice(v.as_bytes()),
                ("header", Some(v)) => {
                    let (name, val) = v
                        .split_once(':')
                        .ok_or_else(|| RouteError::BadProperty(prop.to_string()))?;
                    entry.headers.push((
                        Bytes::copy_from_slice(name.as_bytes()),
                        Bytes::copy_from_slice(val.as_bytes()),
                    ));
                }
                ("trusted", None) => entry.trusted = true,
                ("auto_cross_origin", None) => entry.auto_cross_origin = true,
                ("debug", None) => entry.debug = true,
                _ => return Err(RouteError::BadProperty(prop.to_string())),
            }
        }

        for token in tokens {
            entry.targets.push(parse_target(token)?);
        }
        if entry.targets.is_empty() {
            return Err(RouteError::NoTargets);
        }

        Ok(entry)
    }

    /// Apply `as_host`, `path_remove`, and `path_prepend` to a request path.
    pub fn transform_path(&self, path: &str) -> String {
        let mut path = path.to_string();
        if self.path_remove > 0 && path.len() >= self.path_remove {
            path = path[self.path_remove..].to_string();
        }
        if let Some(prepend) = &self.path_prepend {
            path = format!("{prepend}{path}");
        }
        path
    }
}

fn parse_target(token: &str) -> Result<Target, RouteError> {
    let mut parts = token.split(',');
    let addr = parts.next().unwrap_or_default();

    let mut target = Target::default();

    if addr == "test" {
        target.kind = TargetKind::Test;
    } else {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| RouteError::BadTarget(token.to_string()))?;
        target.connect_host = host.to_string();
        target.connect_port = port
            .parse()
            .map_err(|_| RouteError::BadTarget(token.to_string()))?;
    }

    for prop in parts {
        match prop {
            "ssl" => target.ssl = true,
            "trusted" => target.trusted = true,
            "over_http" => target.over_http = true,
            _ => {
                if let Some(chan) = prop.strip_prefix("sub_channel=") {
                    target.sub_channel = Some(chan.to_string());
                    target.kind = TargetKind::Custom;
                } else {
                    return Err(RouteError::BadTarget(token.to_string()));
                }
            }
        }
    }

    Ok(target)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    WebSocket,
}

/// Ordered collection of route entries with host/path resolution.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lines<'a>(
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, RouteError> {
        let mut table = Self::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            table.add(RouteEntry::parse(line)?);
        }
        Ok(table)
    }

    pub fn add(&mut self, entry: RouteEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the best route: exact host first, wildcard second, longest
    /// matching `path_beg` among candidates.
    pub fn resolve(
        &self,
        _scheme: Scheme,
        _tls: bool,
        host: &str,
        path: &str,
    ) -> Option<&RouteEntry> {
        let host = host.split(':').next().unwrap_or(host);

        let best_for = |want: &str| {
            self.entries
                .iter()
                .filter(|e| e.host == want && path.starts_with(&e.path_beg))
                .max_by_key(|e| e.path_beg.len())
        };

        best_for(host).or_else(|| best_for("*"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_line() {
        let entry = RouteEntry::parse("example.com 10.0.0.1:8080").unwrap();
        assert_eq!(entry.host, "example.com");
        assert_eq!(entry.targets.len(), 1);
        assert_eq!(entry.targets[0].connect_host, "10.0.0.1");
        assert_eq!(entry.targets[0].connect_port, 8080);
        assert!(!entry.targets[0].ssl);
    }

    #[test]
    fn parse_full_line() {
        let entry = RouteEntry::parse(
            "api.example.com,path_beg=/v1,path_remove=3,path_prepend=/api,prefix=app-,sig_iss=me,sig_key=secret,trusted \
             origin-1:443,ssl,trusted origin-2:8080,over_http",
        )
        .unwrap();
        assert_eq!(entry.path_beg, "/v1");
        assert_eq!(entry.path_remove, 3);
        assert_eq!(entry.path_prepend.as_deref(), Some("/api"));
        assert_eq!(entry.prefix, "app-");
        assert_eq!(entry.sig_iss.as_ref().unwrap().as_ref(), b"me");
        assert!(entry.trusted);
        assert_eq!(entry.targets.len(), 2);
        assert!(entry.targets[0].ssl);
        assert!(entry.targets[0].trusted);
        assert!(entry.targets[1].over_http);
    }

    #[test]
    fn parse_test_target() {
        let entry = RouteEntry::parse("* test").unwrap();
        assert_eq!(entry.targets[0].kind, TargetKind::Test);
    }

    #[test]
    fn reject_bad_lines() {
        assert_eq!(RouteEntry::parse("host-only"), Err(RouteError::NoTargets));
        assert!(matches!(
            RouteEntry::parse("h,bogus=1 t:80"),
            Err(RouteError::BadProperty(_))
        ));
        assert!(matches!(
            RouteEntry::parse("h notaport"),
            Err(RouteError::BadTarget(_))
        ));
    }

    #[test]
    fn resolve_prefers_exact_host_then_wildcard() {
        let table = RouteTable::from_lines([
            "example.com 10.0.0.1:80",
            "* 10.0.0.9:80",
        ])
        .unwrap();

        let exact = table
            .resolve(Scheme::Http, false, "example.com", "/")
            .unwrap();
        assert_eq!(exact.targets[0].connect_host, "10.0.0.1");

        let fallback = table.resolve(Scheme::Http, false, "other.com", "/").unwrap();
        assert_eq!(fallback.targets[0].connect_host, "10.0.0.9");
    }

    #[test]
    fn resolve_longest_path_beg_wins() {
        let table = RouteTable::from_lines([
            "example.com 10.0.0.1:80",
            "example.com,path_beg=/api 10.0.0.2:80",
            "example.com,path_beg=/api/v2 10.0.0.3:80",
        ])
        .unwrap();

        let root = table
            .resolve(Scheme::Http, false, "example.com", "/index.html")
            .unwrap();
        assert_eq!(root.targets[0].connect_host, "10.0.0.1");

        let api = table
            .resolve(Scheme::Http, false, "example.com", "/api/users")
            .unwrap();
        assert_eq!(api.targets[0].connect_host, "10.0.0.2");

        let v2 = table
            .resolve(Scheme::Http, false, "example.com", "/api/v2/users")
            .unwrap();
        assert_eq!(v2.targets[0].connect_host, "10.0.0.3");
    }

    #[test]
    fn resolve_ignores_host_port() {
        let table = RouteTable::from_lines(["example.com 10.0.0.1:80"]).unwrap();
        assert!(table
            .resolve(Scheme::Http, false, "example.com:8080", "/")
            .is_some());
    }

    #[test]
    fn no_route_is_none() {
        let table = RouteTable::from_lines(["example.com 10.0.0.1:80"]).unwrap();
        assert!(table.resolve(Scheme::Http, false, "missing.com", "/").is_none());
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let table = RouteTable::from_lines([
            "# routes",
            "",
            "example.com 10.0.0.1:80",
        ])
        .unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn path_transform() {
        let entry = RouteEntry::parse("h,path_beg=/api,path_remove=4,path_prepend=/internal t:80")
            .unwrap();
        assert_eq!(entry.transform_path("/api/users"), "/internal/users");
    }
}
