//! Connection and subscription accounting.
//!
//! Two TTL-driven tables. Local records are refreshed in buckets: a ring is
//! sized so every entry is re-announced within three quarters of its TTL at
//! one bucket per second, so peers holding our records never see them lapse.
//! External records (announced by other instances) are not refreshed here
//! and expire on their own `last_active`.
//!
//! The engine is passive: the owner drives it with `tick()` once per second
//! and reads emitted packets from the outbound channel.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// One refresh bucket is processed per tick.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Fraction of a TTL within which every entry must be refreshed.
fn refresh_horizon(ttl: Duration) -> Duration {
    ttl * 3 / 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Http,
    WebSocket,
}

/// Packets the engine emits toward peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsPacket {
    Connected {
        id: Bytes,
        route: Bytes,
        kind: ConnectionKind,
        peer_address: Option<String>,
        ssl: bool,
        ttl: Duration,
    },
    Disconnected {
        id: Bytes,
        route: Bytes,
    },
    Subscribed {
        mode: Bytes,
        channel: Bytes,
        subscribers: u32,
        ttl: Duration,
    },
    Unsubscribed {
        mode: Bytes,
        channel: Bytes,
    },
    Report {
        route: Bytes,
        connections_max: u32,
        connection_minutes: u64,
        messages_received: u64,
        messages_sent: u64,
    },
}

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub connection_ttl: Duration,
    pub subscription_ttl: Duration,
    pub subscription_linger: Duration,
    pub report_interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            connection_ttl: Duration::from_secs(120),
            subscription_ttl: Duration::from_secs(60),
            subscription_linger: Duration::from_secs(60),
            report_interval: Duration::from_secs(10),
        }
    }
}

struct ConnectionRecord {
    route: Bytes,
    kind: ConnectionKind,
    peer_address: Option<String>,
    ssl: bool,
    bucket: usize,
    lingering_until: Option<Instant>,
    started: Instant,
    last_report: Instant,
}

struct SubscriptionRecord {
    subscribers: u32,
    bucket: usize,
    lingering_until: Option<Instant>,
}

struct ExternalConnectionRecord {
    route: Bytes,
    last_active: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct RouteActivity {
    activity: u64,
    messages_received: u64,
    messages_sent: u64,
    connections_max: u32,
    connections_current: u32,
    connection_minutes: u64,
}

/// Connection and subscription tables with TTL refresh.
pub struct StatsEngine {
    config: StatsConfig,
    out: mpsc::UnboundedSender<StatsPacket>,

    connections: HashMap<Bytes, ConnectionRecord>,
    subscriptions: HashMap<(Bytes, Bytes), SubscriptionRecord>,
    external: HashMap<Bytes, ExternalConnectionRecord>,
    routes: HashMap<Bytes, RouteActivity>,

    connection_buckets: usize,
    subscription_buckets: usize,
    tick_count: u64,
    next_bucket: usize,
    last_report: Instant,
}

impl StatsEngine {
    pub fn new(config: StatsConfig, now: Instant) -> (Self, mpsc::UnboundedReceiver<StatsPacket>) {
        let (out, rx) = mpsc::unbounded_channel();
        let connection_buckets = bucket_count(config.connection_ttl);
        let subscription_buckets = bucket_count(config.subscription_ttl);
        (
            Self {
                config,
                out,
                connections: HashMap::new(),
                subscriptions: HashMap::new(),
                external: HashMap::new(),
                routes: HashMap::new(),
                connection_buckets,
                subscription_buckets,
                tick_count: 0,
                next_bucket: 0,
                last_report: now,
            },
            rx,
        )
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.lingering_until.is_none())
            .count()
    }

    /// Register a connection. Emits `Connected` immediately and then again
    /// on every bucket refresh until removal.
    pub fn add_connection(
        &mut self,
        id: impl Into<Bytes>,
        route: impl Into<Bytes>,
        kind: ConnectionKind,
        peer_address: Option<String>,
        ssl: bool,
        now: Instant,
    ) {
        let id = id.into();
        let route = route.into();

        let bucket = self.spread_bucket(self.connection_buckets);
        let record = ConnectionRecord {
            route: route.clone(),
            kind,
            peer_address,
            ssl,
            bucket,
            lingering_until: None,
            started: now,
            last_report: now,
        };
        self.emit_connected(&id, &record);
        self.connections.insert(id, record);

        let entry = self.routes.entry(route).or_default();
        entry.connections_current += 1;
        entry.connections_max = entry.connections_max.max(entry.connections_current);
    }

    /// Remove a connection. With `linger`, the `Disconnected` announcement
    /// is deferred by the linger period so a quick reconnect is seamless.
    pub fn remove_connection(&mut self, id: &Bytes, linger: bool, now: Instant) {
        let Some(record) = self.connections.get_mut(id) else {
            return;
        };
        if record.lingering_until.is_some() {
            return;
        }

        let minutes = accrued_minutes(record.last_report, now);
        let route = record.route.clone();
        if let Some(entry) = self.routes.get_mut(&route) {
            entry.connection_minutes += minutes;
            entry.connections_current = entry.connections_current.saturating_sub(1);
        }

        if linger {
            record.lingering_until = Some(now + self.config.subscription_linger);
        } else {
            let record = self.connections.remove(id).expect("present");
            let _ = self.out.send(StatsPacket::Disconnected {
                id: id.clone(),
                route: record.route,
            });
        }
    }

    pub fn add_subscription(&mut self, mode: impl Into<Bytes>, channel: impl Into<Bytes>) {
        let key = (mode.into(), channel.into());
        let bucket = self.spread_bucket(self.subscription_buckets);
        let record = self
            .subscriptions
            .entry(key.clone())
            .or_insert(SubscriptionRecord {
                subscribers: 0,
                bucket,
                lingering_until: None,
            });
        record.subscribers += 1;
        record.lingering_until = None;
        let _ = self.out.send(StatsPacket::Subscribed {
            mode: key.0,
            channel: key.1,
            subscribers: record.subscribers,
            ttl: self.config.subscription_ttl,
        });
    }

    pub fn remove_subscription(
        &mut self,
        mode: impl Into<Bytes>,
        channel: impl Into<Bytes>,
        linger: bool,
        now: Instant,
    ) {
        let key = (mode.into(), channel.into());
        let Some(record) = self.subscriptions.get_mut(&key) else {
            return;
        };
        record.subscribers = record.subscribers.saturating_sub(1);
        if record.subscribers > 0 {
            return;
        }

        if linger {
            record.lingering_until = Some(now + self.config.subscription_linger);
        } else {
            self.subscriptions.remove(&key);
            let _ = self.out.send(StatsPacket::Unsubscribed {
                mode: key.0,
                channel: key.1,
            });
        }
    }

    /// Record keep-alive or publish activity against a route.
    pub fn add_activity(&mut self, route: impl Into<Bytes>, count: u64) {
        self.routes.entry(route.into()).or_default().activity += count;
    }

    pub fn add_message_received(&mut self, route: impl Into<Bytes>) {
        self.routes.entry(route.into()).or_default().messages_received += 1;
    }

    pub fn add_message_sent(&mut self, route: impl Into<Bytes>) {
        self.routes.entry(route.into()).or_default().messages_sent += 1;
    }

    /// Record a connection announced by another instance. Never refreshed
    /// locally; expires when its own TTL lapses without renewal.
    pub fn handle_external_connected(
        &mut self,
        id: impl Into<Bytes>,
        route: impl Into<Bytes>,
        ttl: Duration,
        now: Instant,
    ) {
        self.external.insert(
            id.into(),
            ExternalConnectionRecord {
                route: route.into(),
                last_active: now,
                ttl,
            },
        );
    }

    pub fn handle_external_disconnected(&mut self, id: &Bytes) {
        self.external.remove(id);
    }

    pub fn external_count(&self) -> usize {
        self.external.len()
    }

    /// Advance the engine by one refresh interval.
    pub fn tick(&mut self, now: Instant) {
        self.tick_count += 1;
        let bucket = self.next_bucket;
        self.next_bucket = (self.next_bucket + 1) % self.connection_buckets.max(1);

        // refresh local connections in this bucket, expire lingerers
        let mut expired = Vec::new();
        for (id, record) in &self.connections {
            if let Some(deadline) = record.lingering_until {
                if now >= deadline {
                    expired.push(id.clone());
                }
                continue;
            }
            if record.bucket == bucket {
                self.emit_connected(id, record);
            }
        }
        for id in expired {
            let record = self.connections.remove(&id).expect("present");
            let _ = self.out.send(StatsPacket::Disconnected {
                id,
                route: record.route,
            });
        }

        // refresh subscriptions on their own ring
        let sub_bucket = (self.tick_count as usize) % self.subscription_buckets.max(1);
        let mut expired_subs = Vec::new();
        for (key, record) in &self.subscriptions {
            if let Some(deadline) = record.lingering_until {
                if now >= deadline {
                    expired_subs.push(key.clone());
                }
                continue;
            }
            if record.bucket == sub_bucket {
                let _ = self.out.send(StatsPacket::Subscribed {
                    mode: key.0.clone(),
                    channel: key.1.clone(),
                    subscribers: record.subscribers,
                    ttl: self.config.subscription_ttl,
                });
            }
        }
        for key in expired_subs {
            self.subscriptions.remove(&key);
            let _ = self.out.send(StatsPacket::Unsubscribed {
                mode: key.0,
                channel: key.1,
            });
        }

        // expire external records on their own clock
        self.external
            .retain(|_, record| now.duration_since(record.last_active) < record.ttl);

        if now.duration_since(self.last_report) >= self.config.report_interval {
            self.flush_reports(now);
            self.last_report = now;
        }
    }

    fn flush_reports(&mut self, now: Instant) {
        // accrue in-flight connection time before reporting
        for record in self.connections.values_mut() {
            if record.lingering_until.is_some() {
                continue;
            }
            let minutes = accrued_minutes(record.last_report, now);
            if minutes > 0 {
                record.last_report = now;
                if let Some(entry) = self.routes.get_mut(&record.route) {
                    entry.connection_minutes += minutes;
                }
            }
        }

        for (route, entry) in &mut self.routes {
            if entry.connection_minutes == 0
                && entry.messages_received == 0
                && entry.messages_sent == 0
                && entry.activity == 0
                && entry.connections_max == 0
            {
                continue;
            }
            debug!(route = %String::from_utf8_lossy(route), "stats report");
            let _ = self.out.send(StatsPacket::Report {
                route: route.clone(),
                connections_max: entry.connections_max,
                connection_minutes: entry.connection_minutes,
                messages_received: entry.messages_received,
                messages_sent: entry.messages_sent,
            });
            entry.connection_minutes = 0;
            entry.messages_received = 0;
            entry.messages_sent = 0;
            entry.activity = 0;
            entry.connections_max = entry.connections_current;
        }
    }

    fn emit_connected(&self, id: &Bytes, record: &ConnectionRecord) {
        let _ = self.out.send(StatsPacket::Connected {
            id: id.clone(),
            route: record.route.clone(),
            kind: record.kind,
            peer_address: record.peer_address.clone(),
            ssl: record.ssl,
            ttl: self.config.connection_ttl,
        });
    }

    /// Spread new records across the ring so refresh load stays level.
    fn spread_bucket(&self, buckets: usize) -> usize {
        (self.tick_count as usize + self.connections.len() + self.subscriptions.len())
            % buckets.max(1)
    }
}

fn bucket_count(ttl: Duration) -> usize {
    let horizon = refresh_horizon(ttl);
    (horizon.as_secs() as usize / REFRESH_INTERVAL.as_secs() as usize).max(1)
}

fn accrued_minutes(since: Instant, now: Instant) -> u64 {
    now.duration_since(since).as_secs() / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (StatsEngine, mpsc::UnboundedReceiver<StatsPacket>, Instant) {
        let now = Instant::now();
        let (engine, rx) = StatsEngine::new(StatsConfig::default(), now);
        (engine, rx, now)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StatsPacket>) -> Vec<StatsPacket> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[test]
    fn bucket_ring_covers_three_quarters_of_ttl() {
        assert_eq!(bucket_count(Duration::from_secs(120)), 90);
        assert_eq!(bucket_count(Duration::from_secs(60)), 45);
        assert_eq!(bucket_count(Duration::from_secs(1)), 1);
    }

    #[test]
    fn add_connection_announces_immediately() {
        let (mut engine, mut rx, now) = engine();
        engine.add_connection("c1", "route-a", ConnectionKind::Http, None, false, now);

        let packets = drain(&mut rx);
        assert_eq!(packets.len(), 1);
        assert!(matches!(
            &packets[0],
            StatsPacket::Connected { id, route, .. }
                if id.as_ref() == b"c1" && route.as_ref() == b"route-a"
        ));
        assert_eq!(engine.connection_count(), 1);
    }

    #[test]
    fn remove_without_linger_announces_disconnect() {
        let (mut engine, mut rx, now) = engine();
        engine.add_connection("c1", "r", ConnectionKind::Http, None, false, now);
        drain(&mut rx);

        engine.remove_connection(&Bytes::from_static(b"c1"), false, now);
        let packets = drain(&mut rx);
        assert!(matches!(&packets[0], StatsPacket::Disconnected { id, .. } if id.as_ref() == b"c1"));
        assert_eq!(engine.connection_count(), 0);
    }

    #[test]
    fn lingering_disconnect_is_deferred() {
        let (mut engine, mut rx, now) = engine();
        engine.add_connection("c1", "r", ConnectionKind::WebSocket, None, true, now);
        drain(&mut rx);

        engine.remove_connection(&Bytes::from_static(b"c1"), true, now);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.connection_count(), 0);

        engine.tick(now + Duration::from_secs(61));
        let packets = drain(&mut rx);
        assert!(packets
            .iter()
            .any(|p| matches!(p, StatsPacket::Disconnected { id, .. } if id.as_ref() == b"c1")));
    }

    #[test]
    fn every_connection_refreshes_within_horizon() {
        let (mut engine, mut rx, now) = engine();
        for i in 0..200 {
            engine.add_connection(
                format!("c{i}"),
                "r",
                ConnectionKind::Http,
                None,
                false,
                now,
            );
        }
        drain(&mut rx);

        let horizon_ticks = bucket_count(Duration::from_secs(120));
        let mut refreshed = std::collections::HashSet::new();
        for t in 0..horizon_ticks {
            engine.tick(now + Duration::from_secs(t as u64 + 1));
            for p in drain(&mut rx) {
                if let StatsPacket::Connected { id, .. } = p {
                    refreshed.insert(id);
                }
            }
        }
        assert_eq!(refreshed.len(), 200);
    }

    #[test]
    fn external_records_expire_on_last_active() {
        let (mut engine, _rx, now) = engine();
        engine.handle_external_connected("x1", "r", Duration::from_secs(30), now);
        assert_eq!(engine.external_count(), 1);

        engine.tick(now + Duration::from_secs(10));
        assert_eq!(engine.external_count(), 1);

        engine.tick(now + Duration::from_secs(31));
        assert_eq!(engine.external_count(), 0);
    }

    #[test]
    fn subscription_linger_then_expiry() {
        let (mut engine, mut rx, now) = engine();
        engine.add_subscription("stream", "chan");
        drain(&mut rx);

        engine.remove_subscription("stream", "chan", true, now);
        assert!(drain(&mut rx).is_empty());

        engine.tick(now + Duration::from_secs(61));
        let packets = drain(&mut rx);
        assert!(packets.iter().any(|p| matches!(
            p,
            StatsPacket::Unsubscribed { channel, .. } if channel.as_ref() == b"chan"
        )));
    }

    #[test]
    fn resubscribe_during_linger_revives_entry() {
        let (mut engine, mut rx, now) = engine();
        engine.add_subscription("stream", "chan");
        engine.remove_subscription("stream", "chan", true, now);
        engine.add_subscription("stream", "chan");
        drain(&mut rx);

        engine.tick(now + Duration::from_secs(120));
        let packets = drain(&mut rx);
        assert!(!packets
            .iter()
            .any(|p| matches!(p, StatsPacket::Unsubscribed { .. })));
    }

    #[test]
    fn report_aggregates_and_resets() {
        let (mut engine, mut rx, now) = engine();
        engine.add_connection("c1", "r", ConnectionKind::Http, None, false, now);
        engine.add_message_received("r");
        engine.add_message_received("r");
        engine.add_message_sent("r");
        drain(&mut rx);

        engine.tick(now + Duration::from_secs(11));
        let packets = drain(&mut rx);
        let report = packets
            .iter()
            .find_map(|p| match p {
                StatsPacket::Report {
                    route,
                    connections_max,
                    messages_received,
                    messages_sent,
                    ..
                } if route.as_ref() == b"r" => {
                    Some((*connections_max, *messages_received, *messages_sent))
                }
                _ => None,
            })
            .expect("report emitted");
        assert_eq!(report, (1, 2, 1));
    }
}
