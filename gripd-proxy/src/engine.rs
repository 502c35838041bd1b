//! Proxy engine: accepts ZHTTP requests from the edge, resolves routes,
//! and runs proxy sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use gripd_wire::wscontrol::{WsControlItem, WsControlPacket};
use gripd_x::bus::{Bus, PubSocket, PushSocket, SubSocket, DEFAULT_HWM, STATS_HWM};
use gripd_x::stats::{ConnectionKind, StatsConfig, StatsEngine, StatsPacket};
use gripd_x::HttpHeaders;
use gripd_zhttp::{ClientManager, EndpointSpec, ServerManager, ServerRequest};

use crate::accept::AcceptClient;
use crate::routes::{RouteTable, Scheme};
use crate::session::{ProxySession, SessionContext, SessionOutcome};
use crate::wssession::WsProxySession;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub instance_id: Bytes,
    /// Edge-facing ZHTTP endpoints (we are the server).
    pub edge: EndpointSpec,
    /// Origin-facing ZHTTP endpoints (we are the client).
    pub origin: EndpointSpec,
    /// Accept bridge endpoint toward the handler.
    pub accept_endpoint: String,
    /// WebSocket control endpoints toward the handler.
    pub wscontrol_in: String,
    pub wscontrol_out: String,
    /// Stats publish endpoint.
    pub stats_endpoint: String,
}

pub struct ProxyEngine {
    config: ProxyConfig,
    server: ServerManager,
    ctx: SessionContext,
    routes: RouteTable,

    stats: Arc<Mutex<StatsEngine>>,
    stats_rx: mpsc::UnboundedReceiver<StatsPacket>,
    stats_pub: PubSocket,

    wsctl_out: PushSocket,
    wsctl_sub: SubSocket,
    wsctl_items: mpsc::UnboundedReceiver<WsControlItem>,
    wsctl_items_tx: mpsc::UnboundedSender<WsControlItem>,
    ws_sessions: Arc<Mutex<HashMap<Bytes, mpsc::UnboundedSender<WsControlItem>>>>,

    /// Shareable upstreams keyed by method + uri.
    shared: HashMap<String, mpsc::UnboundedSender<ServerRequest>>,
    next_cid: u64,
}

impl ProxyEngine {
    pub fn new(
        bus: &Bus,
        config: ProxyConfig,
        routes: RouteTable,
        stats_config: StatsConfig,
    ) -> gripd_zhttp::Result<Self> {
        let server = ServerManager::new(bus, config.instance_id.clone(), &config.edge, true)?;
        let zclient = ClientManager::new(bus, config.instance_id.clone(), &config.origin);
        let accept = AcceptClient::new(bus, config.instance_id.clone(), &config.accept_endpoint);

        let ctx = SessionContext {
            zclient,
            accept,
            server: server.handle(),
        };

        let (stats, stats_rx) = StatsEngine::new(stats_config, Instant::now());
        let stats_pub = bus.bind_pub(&config.stats_endpoint, STATS_HWM);

        let wsctl_out = bus.connect_push(&config.wscontrol_in);
        let mut prefix = config.instance_id.to_vec();
        prefix.push(b' ');
        let wsctl_sub = bus.connect_sub(&config.wscontrol_out, prefix);
        let (wsctl_items_tx, wsctl_items) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            server,
            ctx,
            routes,
            stats: Arc::new(Mutex::new(stats)),
            stats_rx,
            stats_pub,
            wsctl_out,
            wsctl_sub,
            wsctl_items,
            wsctl_items_tx,
            ws_sessions: Arc::new(Mutex::new(HashMap::new())),
            shared: HashMap::new(),
            next_cid: 0,
        })
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut stats_timer = interval(Duration::from_secs(1));
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            instance = %String::from_utf8_lossy(&self.config.instance_id),
            routes = self.routes.len(),
            "proxy engine started"
        );

        loop {
            tokio::select! {
                req = self.server.accept() => {
                    let Some(req) = req else { break };
                    self.handle_request(req);
                }
                msg = self.wsctl_sub.recv() => {
                    let Ok(msg) = msg else { break };
                    if let Some(frame) = msg.into_iter().next() {
                        self.dispatch_wscontrol(frame);
                    }
                }
                Some(item) = self.wsctl_items.recv() => {
                    let packet = WsControlPacket {
                        from: self.config.instance_id.clone(),
                        items: vec![item],
                    };
                    let _ = self.wsctl_out.send(vec![packet.encode()]).await;
                }
                _ = stats_timer.tick() => {
                    self.stats.lock().unwrap().tick(Instant::now());
                    while let Ok(packet) = self.stats_rx.try_recv() {
                        let frame = gripd_wire::stats::encode(&self.config.instance_id, &packet);
                        self.stats_pub.send(vec![frame]);
                    }
                    self.shared.retain(|_, tx| !tx.is_closed());
                }
                _ = &mut shutdown => break,
            }
        }

        info!("proxy engine stopped");
    }

    fn handle_request(&mut self, mut req: ServerRequest) {
        let Ok(url) = url::Url::parse(&req.uri) else {
            warn!(uri = %req.uri, "unparsable request uri");
            req.error("bad-request");
            return;
        };

        let is_ws = matches!(url.scheme(), "ws" | "wss");
        let tls = matches!(url.scheme(), "https" | "wss");
        let host = url.host_str().unwrap_or("").to_string();
        let path = url.path().to_string();

        let scheme = if is_ws { Scheme::WebSocket } else { Scheme::Http };
        let Some(route) = self.routes.resolve(scheme, tls, &host, &path).cloned() else {
            info!(host = %host, "no route");
            respond_no_route(&mut req, &host);
            return;
        };

        debug!(
            rid = %req.rid(),
            host = %host,
            route = %String::from_utf8_lossy(&route.id),
            ws = is_ws,
            "routed request"
        );

        let conn_id = Bytes::from(format!("{}", req.rid()));
        self.stats.lock().unwrap().add_connection(
            conn_id.clone(),
            route.id.clone(),
            if is_ws {
                ConnectionKind::WebSocket
            } else {
                ConnectionKind::Http
            },
            req.peer_address.clone(),
            tls,
            Instant::now(),
        );
        let stats = self.stats.clone();

        if is_ws {
            let cid = Bytes::from(format!(
                "{}-{}",
                String::from_utf8_lossy(&self.config.instance_id),
                self.next_cid
            ));
            self.next_cid += 1;

            let (item_tx, item_rx) = mpsc::unbounded_channel();
            self.ws_sessions
                .lock()
                .unwrap()
                .insert(cid.clone(), item_tx);
            let ws_sessions = self.ws_sessions.clone();

            let session = WsProxySession::new(
                cid.clone(),
                route,
                req,
                self.ctx.zclient.clone(),
                self.wsctl_items_tx.clone(),
                item_rx,
            );
            tokio::spawn(async move {
                let outcome = session.run().await;
                debug!(?outcome, "websocket session finished");
                ws_sessions.lock().unwrap().remove(&cid);
                stats
                    .lock()
                    .unwrap()
                    .remove_connection(&conn_id, false, Instant::now());
            });
            return;
        }

        // share upstreams across identical idempotent requests
        let share_key = format!("{} {}", req.method, req.uri);
        let sharable = req.method == "GET" && !req.more;
        if sharable {
            if let Some(tx) = self.shared.get(&share_key) {
                match tx.send(req) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(back)) => {
                        self.shared.remove(&share_key);
                        req = back;
                    }
                }
            }
        }

        let mut session = ProxySession::new(self.ctx.clone(), route, req);
        if sharable {
            self.shared.insert(share_key, session.attach_sender());
        }

        tokio::spawn(async move {
            let outcome = session.run().await;
            debug!(?outcome, "proxy session finished");
            let linger = outcome == SessionOutcome::Accepted;
            stats
                .lock()
                .unwrap()
                .remove_connection(&conn_id, linger, Instant::now());
        });
    }

    fn dispatch_wscontrol(&mut self, frame: Bytes) {
        let payload = frame.slice(self.config.instance_id.len() + 1..);
        let packet = match WsControlPacket::decode(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "ws control packet invalid, skipping");
                return;
            }
        };

        let sessions = self.ws_sessions.lock().unwrap();
        for item in packet.items {
            match sessions.get(item.cid()) {
                Some(tx) => {
                    let _ = tx.send(item);
                }
                None => debug!("ws control item for unknown session"),
            }
        }
    }
}

fn respond_no_route(req: &mut ServerRequest, host: &str) {
    let body = Bytes::from(format!("no route for host: {host}\n").into_bytes());
    let mut headers = HttpHeaders::new();
    headers.push("Content-Type", "text/plain");
    headers.push(
        "Content-Length",
        Bytes::from(body.len().to_string().into_bytes()),
    );
    let _ = req.begin_response(502, Bytes::from_static(b"Bad Gateway"), headers, None);
    let _ = req.write_body(body, false);
}
