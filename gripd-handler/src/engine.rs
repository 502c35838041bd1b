//! Handler engine: accepts handed-off sessions, runs hold sessions, takes
//! publish intake through the sequencer, and fans items out to HTTP holds
//! and GRIP WebSocket sessions.

use std::collections::{HashMap, HashSet};
use std::time::Instant as StdInstant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use gripd_wire::accept::{AcceptData, RpcRequest, RpcResponse};
use gripd_wire::wscontrol::{WsControlItem, WsControlMessage, WsControlPacket, WsMessageType};
use gripd_x::bus::{Bus, PubSocket, PullSocket, RouterSocket, DEFAULT_HWM, STATS_HWM};
use gripd_x::stats::{ConnectionKind, StatsConfig, StatsEngine, StatsPacket};
use gripd_zhttp::{ClientManager, EndpointSpec, ServerManager, SessionState};
use url::Url;

use crate::hold::{HoldCommand, HoldSession};
use crate::instruct::{HoldMode, Instruct};
use crate::item::{PublishFormat, PublishItem, WsMessageKind};
use crate::sequencer::Sequencer;
use crate::subs::{SubscriptionEvent, SubscriptionRegistry};

/// Channels tracked in the last-id cache.
const LAST_IDS_CAPACITY: usize = 10_000;

/// Idle GRIP WebSocket sessions are forgotten after this long without a
/// refresh from their proxy.
const WS_SESSION_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub instance_id: Bytes,
    /// Edge-facing ZHTTP endpoints (adopted sessions only).
    pub edge: EndpointSpec,
    /// Origin-facing ZHTTP endpoints (next-link fetches).
    pub origin: EndpointSpec,
    /// Accept bridge endpoint (we are the router side).
    pub accept_endpoint: String,
    /// Publish intake endpoint (JSON items, pushed by origins).
    pub publish_endpoint: String,
    /// WebSocket control endpoints (proxies push to us; we publish back).
    pub wscontrol_in: String,
    pub wscontrol_out: String,
    /// Stats publish endpoint.
    pub stats_endpoint: String,
}

struct WsSession {
    proxy: Bytes,
    channel_prefix: String,
    channels: HashSet<String>,
    route: Bytes,
    meta: HashMap<String, String>,
    keep_alive: Option<(WsMessageType, Bytes, Duration)>,
    keep_alive_at: Option<Instant>,
    last_active: Instant,
}

pub struct HandlerEngine {
    config: HandlerConfig,
    server: ServerManager,
    zclient: ClientManager,

    accept_router: RouterSocket,
    publish_pull: PullSocket,
    wsctl_pull: PullSocket,
    wsctl_pub: PubSocket,

    registry: SubscriptionRegistry,
    sequencer: Sequencer,
    commands_rx: mpsc::UnboundedReceiver<HoldCommand>,
    commands_tx: mpsc::UnboundedSender<HoldCommand>,
    next_session: u64,
    hold_conns: HashMap<u64, Bytes>,

    ws_sessions: HashMap<Bytes, WsSession>,
    ws_channels: HashMap<String, HashSet<Bytes>>,

    stats: StatsEngine,
    stats_rx: mpsc::UnboundedReceiver<StatsPacket>,
    stats_pub: PubSocket,
}

impl HandlerEngine {
    pub fn new(
        bus: &Bus,
        config: HandlerConfig,
        stats_config: StatsConfig,
    ) -> gripd_zhttp::Result<Self> {
        let server = ServerManager::new(bus, config.instance_id.clone(), &config.edge, false)?;
        let zclient = ClientManager::new(bus, config.instance_id.clone(), &config.origin);

        let accept_router = bus.bind_router(&config.accept_endpoint, DEFAULT_HWM)?;
        let publish_pull = bus.bind_pull(&config.publish_endpoint, DEFAULT_HWM)?;
        let wsctl_pull = bus.bind_pull(&config.wscontrol_in, DEFAULT_HWM)?;
        let wsctl_pub = bus.bind_pub(&config.wscontrol_out, DEFAULT_HWM);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stats, stats_rx) = StatsEngine::new(stats_config, StdInstant::now());
        let stats_pub = bus.bind_pub(&config.stats_endpoint, STATS_HWM);

        Ok(Self {
            config,
            server,
            zclient,
            accept_router,
            publish_pull,
            wsctl_pull,
            wsctl_pub,
            registry: SubscriptionRegistry::new(),
            sequencer: Sequencer::new(LAST_IDS_CAPACITY),
            commands_rx,
            commands_tx,
            next_session: 0,
            hold_conns: HashMap::new(),
            ws_sessions: HashMap::new(),
            ws_channels: HashMap::new(),
            stats,
            stats_rx,
            stats_pub,
        })
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            instance = %String::from_utf8_lossy(&self.config.instance_id),
            "handler engine started"
        );

        loop {
            tokio::select! {
                msg = self.accept_router.recv() => {
                    let Some((identity, msg)) = msg else { break };
                    self.handle_accept_call(identity, msg).await;
                }
                msg = self.publish_pull.recv() => {
                    let Some(msg) = msg else { break };
                    if let Some(frame) = msg.into_iter().next() {
                        self.handle_publish(frame);
                    }
                }
                msg = self.wsctl_pull.recv() => {
                    let Some(msg) = msg else { break };
                    if let Some(frame) = msg.into_iter().next() {
                        self.handle_wscontrol(frame);
                    }
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command);
                }
                _ = tick.tick() => self.handle_tick(),
                _ = &mut shutdown => break,
            }
        }

        info!("handler engine stopped");
    }

    async fn handle_accept_call(&mut self, identity: Bytes, msg: Vec<Bytes>) {
        let Some(frame) = msg.iter().find(|f| !f.is_empty()) else {
            return;
        };
        let request = match RpcRequest::decode(frame) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "accept call invalid, skipping");
                return;
            }
        };

        let reply = if request.method == "accept" {
            self.handle_accept(&request)
        } else {
            RpcResponse::error(request.id.clone(), "method-not-found")
        };

        let _ = self
            .accept_router
            .send_to(&identity, vec![Bytes::new(), reply.encode()])
            .await;
    }

    fn handle_accept(&mut self, request: &RpcRequest) -> RpcResponse {
        let adata = match AcceptData::from_value(&request.args) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "accept args invalid");
                return RpcResponse::error(request.id.clone(), "bad-format");
            }
        };

        let base_uri = Url::parse(&adata.request_data.uri).ok();
        let instruct = match Instruct::from_response(&adata.response_data, base_uri.as_ref()) {
            Ok(i) => i,
            Err(e) => {
                debug!(error = %e, "rejecting accept: bad instruct");
                return RpcResponse::error(request.id.clone(), "bad-instruct");
            }
        };

        if instruct.hold_mode == HoldMode::NoHold && instruct.next_link.is_none() {
            // nothing for us to do with it; proxy should just respond
            return RpcResponse::error(request.id.clone(), "not-held");
        }

        debug!(
            mode = ?instruct.hold_mode,
            channels = instruct.channels.len(),
            requests = adata.requests.len(),
            "accepting held session"
        );

        for item in &adata.requests {
            let state = SessionState {
                rid: item.rid.clone(),
                out_seq: item.out_seq,
                in_seq: item.in_seq,
                out_credits: item.out_credits,
                user_data: item.user_data.clone(),
            };
            let req = self.server.restore(state, adata.response_sent);

            let session_id = self.next_session;
            self.next_session += 1;

            let conn_id = Bytes::from(format!("{}", item.rid));
            self.stats.add_connection(
                conn_id.clone(),
                adata.route.clone(),
                ConnectionKind::Http,
                adata.peer_address.clone(),
                false,
                StdInstant::now(),
            );
            self.hold_conns.insert(session_id, conn_id);

            let session = HoldSession::new(
                session_id,
                req,
                adata.clone(),
                instruct.clone(),
                self.zclient.clone(),
                self.commands_tx.clone(),
            );
            let commands = self.commands_tx.clone();
            tokio::spawn(async move {
                let outcome = session.run().await;
                debug!(session = session_id, ?outcome, "hold session done");
                // Finished is sent by the session itself; this double-send
                // is harmless and covers panics in the body
                let _ = commands.send(HoldCommand::Finished {
                    session: session_id,
                });
            });
        }

        RpcResponse::ok(request.id.clone(), gripd_wire::TnValue::Bool(true))
    }

    fn handle_publish(&mut self, frame: Bytes) {
        let parsed: serde_json::Value = match serde_json::from_slice(&frame) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "publish frame is not JSON, skipping");
                return;
            }
        };
        let item = match PublishItem::from_json(&parsed) {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "publish item invalid, skipping");
                return;
            }
        };

        debug!(
            channel = %item.channel,
            id = item.id.as_deref().unwrap_or(""),
            "publish received"
        );

        self.sequencer.add_item(item, StdInstant::now());
        self.deliver_ready();
    }

    fn deliver_ready(&mut self) {
        for item in self.sequencer.take_ready() {
            let delivered = self.registry.dispatch(&item);
            let ws_delivered = self.deliver_ws(&item);
            debug!(
                channel = %item.channel,
                delivered,
                ws_delivered,
                "item dispatched"
            );
        }
        self.drain_registry_events();
    }

    fn deliver_ws(&mut self, item: &PublishItem) -> usize {
        let Some(PublishFormat::WsMessage { kind, body, close }) = item.format_ws_message()
        else {
            return 0;
        };
        let Some(cids) = self.ws_channels.get(&item.channel) else {
            return 0;
        };

        let mut items_by_proxy: HashMap<Bytes, Vec<WsControlItem>> = HashMap::new();
        for cid in cids {
            let Some(session) = self.ws_sessions.get(cid) else {
                continue;
            };
            let item = if *close {
                WsControlItem::Close {
                    cid: cid.clone(),
                    code: None,
                }
            } else {
                WsControlItem::Send {
                    cid: cid.clone(),
                    message_type: match kind {
                        WsMessageKind::Text => WsMessageType::Text,
                        WsMessageKind::Binary => WsMessageType::Binary,
                        WsMessageKind::Ping => WsMessageType::Ping,
                        WsMessageKind::Pong => WsMessageType::Pong,
                    },
                    content: body.clone(),
                }
            };
            items_by_proxy
                .entry(session.proxy.clone())
                .or_default()
                .push(item);
        }

        let mut delivered = 0;
        for (proxy, items) in items_by_proxy {
            delivered += items.len();
            self.publish_wscontrol(&proxy, items);
        }
        delivered
    }

    fn publish_wscontrol(&mut self, proxy: &Bytes, items: Vec<WsControlItem>) {
        let packet = WsControlPacket {
            from: self.config.instance_id.clone(),
            items,
        };
        let mut frame = proxy.to_vec();
        frame.push(b' ');
        frame.extend_from_slice(&packet.encode());
        self.wsctl_pub.send(vec![Bytes::from(frame)]);
    }

    fn handle_command(&mut self, command: HoldCommand) {
        let now = StdInstant::now();
        match command {
            HoldCommand::Subscribe {
                session,
                channel,
                sink,
            } => {
                self.registry.subscribe(session, &channel, sink);
                self.drain_registry_events();
            }
            HoldCommand::Unsubscribe { session, channel } => {
                self.registry.unsubscribe(session, &channel, true, now);
                self.drain_registry_events();
            }
            HoldCommand::Finished { session } => {
                self.registry.remove_session(session, true, now);
                if let Some(conn_id) = self.hold_conns.remove(&session) {
                    self.stats.remove_connection(&conn_id, false, now);
                }
                self.drain_registry_events();
            }
            HoldCommand::Activity { route } => {
                self.stats.add_activity(route.clone(), 1);
                self.stats.add_message_sent(route);
            }
        }
    }

    fn drain_registry_events(&mut self) {
        let now = StdInstant::now();
        for event in self.registry.take_events() {
            match event {
                SubscriptionEvent::Subscribed { channel } => {
                    self.stats.add_subscription("http", channel.into_bytes());
                }
                SubscriptionEvent::Unsubscribed { channel } => {
                    self.stats
                        .remove_subscription("http", channel.into_bytes(), false, now);
                }
            }
        }
    }

    fn handle_wscontrol(&mut self, frame: Bytes) {
        let packet = match WsControlPacket::decode(&frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "ws control packet invalid, skipping");
                return;
            }
        };

        for item in packet.items {
            self.handle_wscontrol_item(&packet.from, item);
        }
    }

    fn handle_wscontrol_item(&mut self, proxy: &Bytes, item: WsControlItem) {
        let now = Instant::now();
        match item {
            WsControlItem::Here {
                cid,
                channel_prefix,
                route,
                ..
            } => {
                let session = self.ws_sessions.entry(cid).or_insert_with(|| WsSession {
                    proxy: proxy.clone(),
                    channel_prefix: String::new(),
                    channels: HashSet::new(),
                    route: Bytes::new(),
                    meta: HashMap::new(),
                    keep_alive: None,
                    keep_alive_at: None,
                    last_active: now,
                });
                session.proxy = proxy.clone();
                session.channel_prefix = channel_prefix.unwrap_or_default();
                session.route = route;
                session.last_active = now;
            }
            WsControlItem::Grip { cid, message } => {
                let parsed = serde_json::from_slice::<serde_json::Value>(&message)
                    .ok()
                    .and_then(|v| WsControlMessage::from_json(&v).ok());
                let Some(control) = parsed else {
                    warn!("ws grip message unparsable, dropping");
                    return;
                };
                self.handle_ws_grip(&cid, control);
            }
            WsControlItem::Gone { cid } | WsControlItem::Cancel { cid } => {
                self.remove_ws_session(&cid);
            }
            _ => {
                debug!("unexpected ws control item from proxy");
            }
        }
    }

    fn handle_ws_grip(&mut self, cid: &Bytes, control: WsControlMessage) {
        let now = Instant::now();
        let Some(session) = self.ws_sessions.get_mut(cid) else {
            debug!("grip control for unknown ws session");
            return;
        };
        session.last_active = now;

        match control {
            WsControlMessage::Subscribe { channel, .. } => {
                let name = format!("{}{}", session.channel_prefix, channel);
                if session.channels.insert(name.clone()) {
                    let entry = self.ws_channels.entry(name.clone()).or_default();
                    if entry.is_empty() {
                        self.stats
                            .add_subscription("ws", name.clone().into_bytes());
                    }
                    entry.insert(cid.clone());
                    debug!(
                        cid = %String::from_utf8_lossy(cid),
                        channel = %name,
                        "ws subscribed"
                    );
                }
            }
            WsControlMessage::Unsubscribe { channel } => {
                let name = format!("{}{}", session.channel_prefix, channel);
                session.channels.remove(&name);
                self.ws_channel_drop(&name, cid);
            }
            WsControlMessage::Detach => {
                let proxy = session.proxy.clone();
                self.publish_wscontrol(
                    &proxy,
                    vec![WsControlItem::Detach { cid: cid.clone() }],
                );
            }
            WsControlMessage::Session { id } => {
                session.meta.insert("session".into(), id);
            }
            WsControlMessage::SetMeta { name, value } => {
                if value.is_empty() {
                    session.meta.remove(&name);
                } else {
                    session.meta.insert(name, value);
                }
            }
            WsControlMessage::KeepAlive {
                message_type,
                content,
                timeout,
            } => match (content, timeout) {
                (Some(content), Some(timeout)) if timeout > 0 => {
                    let interval = Duration::from_secs(timeout as u64);
                    session.keep_alive = Some((
                        message_type.unwrap_or(WsMessageType::Text),
                        content,
                        interval,
                    ));
                    session.keep_alive_at = Some(now + interval);
                }
                _ => {
                    session.keep_alive = None;
                    session.keep_alive_at = None;
                }
            },
        }
    }

    fn ws_channel_drop(&mut self, channel: &str, cid: &Bytes) {
        if let Some(entry) = self.ws_channels.get_mut(channel) {
            entry.remove(cid);
            if entry.is_empty() {
                self.ws_channels.remove(channel);
                self.stats.remove_subscription(
                    "ws",
                    channel.to_string().into_bytes(),
                    false,
                    StdInstant::now(),
                );
            }
        }
    }

    fn remove_ws_session(&mut self, cid: &Bytes) {
        let Some(session) = self.ws_sessions.remove(cid) else {
            return;
        };
        for channel in session.channels {
            self.ws_channel_drop(&channel, cid);
        }
        debug!(cid = %String::from_utf8_lossy(cid), "ws session removed");
    }

    fn handle_tick(&mut self) {
        let now = StdInstant::now();

        self.sequencer.expire(now);
        self.deliver_ready();

        self.registry.sweep(now);
        self.drain_registry_events();

        // ws keep-alives and expiry
        let tnow = Instant::now();
        let mut keepalives: Vec<(Bytes, WsControlItem)> = Vec::new();
        let mut expired: Vec<Bytes> = Vec::new();
        for (cid, session) in &mut self.ws_sessions {
            if tnow.duration_since(session.last_active) > WS_SESSION_TTL {
                expired.push(cid.clone());
                continue;
            }
            if let (Some((kind, content, interval)), Some(at)) =
                (&session.keep_alive, session.keep_alive_at)
            {
                if tnow >= at {
                    session.keep_alive_at = Some(tnow + *interval);
                    keepalives.push((
                        session.proxy.clone(),
                        WsControlItem::Send {
                            cid: cid.clone(),
                            message_type: *kind,
                            content: content.clone(),
                        },
                    ));
                }
            }
        }
        for (proxy, item) in keepalives {
            self.publish_wscontrol(&proxy, vec![item]);
        }
        for cid in expired {
            self.remove_ws_session(&cid);
        }

        self.stats.tick(now);
        while let Ok(packet) = self.stats_rx.try_recv() {
            let frame = gripd_wire::stats::encode(&self.config.instance_id, &packet);
            self.stats_pub.send(vec![frame]);
        }
    }
}
