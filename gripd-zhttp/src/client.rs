//! Client side of a ZHTTP link: opens outbound requests toward an origin
//! endpoint and streams the responses back to the owner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gripd_wire::zhttp::{ContentType, PacketType, ZhttpPacket};
use gripd_wire::TnValue;
use gripd_x::bus::{Bus, DealerSender, Message, PushSocket, DEFAULT_HWM};
use gripd_x::{HttpHeaders, Rid};

use crate::table::SessionTable;
use crate::{
    EndpointSpec, Result, SessionEvent, ZhttpError, KEEPALIVE_INTERVAL, SESSION_EXPIRE,
};

/// Parameters for starting an outbound request.
#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    pub method: String,
    pub uri: String,
    pub headers: HttpHeaders,
    pub body: Bytes,
    /// More request body will follow via `write_body`.
    pub more: bool,
    pub connect_host: Option<String>,
    pub connect_port: Option<u16>,
    pub ignore_policies: bool,
    /// Routing metadata for the receiving proxy (internal route flag,
    /// signing material, trust).
    pub passthrough: Option<TnValue>,
}

struct SessionEntry {
    events: mpsc::UnboundedSender<SessionEvent>,
    in_seq: u64,
    out_seq: u64,
    out_credits: u32,
    got_headers: bool,
    ws: bool,
    peer: Option<Bytes>,
    last_active: Instant,
}

struct ClientInner {
    instance_id: Bytes,
    out: PushSocket,
    out_stream: DealerSender,
    sessions: Mutex<SessionTable<Bytes, SessionEntry>>,
    next_id: AtomicU64,
}

impl ClientInner {
    fn control_packet(&self, id: &Bytes, ptype: PacketType) -> Option<ZhttpPacket> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.get_mut(id)?;
        let mut packet = ZhttpPacket::new(ptype, id.clone());
        packet.from = self.instance_id.clone();
        packet.seq = Some(entry.out_seq);
        entry.out_seq += 1;
        Some(packet)
    }
}

/// Manages all outbound requests this component makes over one link.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ClientInner>,
}

impl ClientManager {
    /// Connect to a link's endpoints and start the receive and timer tasks.
    pub fn new(bus: &Bus, instance_id: impl Into<Bytes>, spec: &EndpointSpec) -> Self {
        let instance_id = instance_id.into();

        let out = bus.connect_push(&spec.in_endpoint());
        let out_stream = bus
            .connect_dealer(&spec.in_stream_endpoint(), instance_id.clone(), DEFAULT_HWM)
            .sender();
        let mut prefix = Vec::with_capacity(instance_id.len() + 1);
        prefix.extend_from_slice(&instance_id);
        prefix.push(b' ');
        let mut sub = bus.connect_sub(&spec.out_endpoint(), prefix);

        let inner = Arc::new(ClientInner {
            instance_id,
            out,
            out_stream,
            sessions: Mutex::new(SessionTable::new()),
            next_id: AtomicU64::new(0),
        });

        let recv_inner = inner.clone();
        tokio::spawn(async move {
            while let Ok(msg) = sub.recv().await {
                handle_incoming(&recv_inner, msg).await;
            }
        });

        let timer_inner = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                run_timers(&timer_inner).await;
            }
        });

        Self { inner }
    }

    pub fn instance_id(&self) -> &Bytes {
        &self.inner.instance_id
    }

    /// Allocate a new request session.
    pub fn create_request(&self) -> ClientRequest {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = Bytes::from(format!("{}-{}", String::from_utf8_lossy(&self.inner.instance_id), n));
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.sessions.lock().unwrap().insert(
            id.clone(),
            SessionEntry {
                events: tx,
                in_seq: 0,
                out_seq: 0,
                out_credits: 0,
                got_headers: false,
                ws: false,
                peer: None,
                last_active: Instant::now(),
            },
        );

        ClientRequest {
            inner: self.inner.clone(),
            id,
            events: rx,
            started: false,
        }
    }

    /// Number of live sessions (for stats and tests).
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }
}

async fn handle_incoming(inner: &Arc<ClientInner>, msg: Message) {
    let Some(frame) = msg.first() else {
        return;
    };
    // strip "<instance-id> " prefix
    let payload = frame.slice(inner.instance_id.len() + 1..);

    let packet = match ZhttpPacket::decode(&payload) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "zhttp client: invalid packet, skipping");
            return;
        }
    };

    enum Action {
        None,
        Reply(PacketType),
        NotOurs,
    }

    let action = {
        let mut sessions = inner.sessions.lock().unwrap();
        if !sessions.contains(&packet.id) {
            // not ours (anymore); tell the sender to stop, unless it was
            // itself a cancel
            Action::NotOurs
        } else {
        let entry = sessions.get_mut(&packet.id).expect("checked");

        if let Some(seq) = packet.seq {
            if seq != entry.in_seq {
                warn!(
                    id = %String::from_utf8_lossy(&packet.id),
                    expected = entry.in_seq,
                    got = seq,
                    "zhttp client: sequence gap, cancelling"
                );
                let _ = entry.events.send(SessionEvent::Cancelled);
                sessions.remove(&packet.id);
                return;
            }
        }
        entry.in_seq += 1;
        entry.last_active = Instant::now();
        if !packet.from.is_empty() {
            entry.peer = Some(packet.from.clone());
        }

        let mut action = Action::None;
        match packet.ptype {
            PacketType::Data => {
                if let Some(c) = packet.credits {
                    entry.out_credits = entry.out_credits.saturating_add(c);
                    if entry.got_headers && c > 0 {
                        let _ = entry.events.send(SessionEvent::Credit(c));
                    }
                }
                if !entry.got_headers {
                    entry.got_headers = true;
                    entry.ws = packet.code == Some(101);
                    let _ = entry.events.send(SessionEvent::Headers {
                        code: packet.code.unwrap_or(200),
                        reason: packet.reason.clone().unwrap_or_default(),
                        headers: packet.headers.clone().unwrap_or_default(),
                        body: packet.body.clone().unwrap_or_default(),
                        more: packet.more,
                        credits: packet.credits.unwrap_or(0),
                    });
                    if !packet.more && !entry.ws {
                        sessions.remove(&packet.id);
                        return;
                    }
                } else {
                    let _ = entry.events.send(SessionEvent::Body {
                        data: packet.body.clone().unwrap_or_default(),
                        more: packet.more,
                        content_type: packet.content_type,
                    });
                    if !packet.more && !entry.ws {
                        sessions.remove(&packet.id);
                        return;
                    }
                }
            }
            PacketType::Credit => {
                let c = packet.credits.unwrap_or(0);
                entry.out_credits = entry.out_credits.saturating_add(c);
                let _ = entry.events.send(SessionEvent::Credit(c));
            }
            PacketType::KeepAlive => {}
            PacketType::Ping => {
                action = Action::Reply(PacketType::Pong);
            }
            PacketType::Pong => {}
            PacketType::Close => {
                let _ = entry.events.send(SessionEvent::Close {
                    status: packet.code,
                });
            }
            PacketType::HandoffStart => {
                action = Action::Reply(PacketType::HandoffProceed);
                let _ = entry.events.send(SessionEvent::HandoffStart);
            }
            PacketType::HandoffProceed => {
                let _ = entry.events.send(SessionEvent::HandoffProceed);
            }
            PacketType::Error => {
                let _ = entry.events.send(SessionEvent::Error {
                    condition: packet.condition.clone().unwrap_or_default(),
                });
                sessions.remove(&packet.id);
                return;
            }
            PacketType::Cancel => {
                let _ = entry.events.send(SessionEvent::Cancelled);
                sessions.remove(&packet.id);
                return;
            }
        }

        action
        }
    };

    match action {
        Action::Reply(ptype) => {
            if let Some(reply) = inner.control_packet(&packet.id, ptype) {
                send_stream(inner, reply).await;
            }
        }
        Action::NotOurs => {
            if !packet.from.is_empty() && packet.ptype != PacketType::Cancel {
                let mut cancel = ZhttpPacket::new(PacketType::Cancel, packet.id.clone());
                cancel.from = inner.instance_id.clone();
                send_stream(inner, cancel).await;
            }
        }
        Action::None => {}
    }
}

async fn run_timers(inner: &Arc<ClientInner>) {
    let now = Instant::now();
    let mut keepalives = Vec::new();
    let mut expired = Vec::new();

    {
        let mut sessions = inner.sessions.lock().unwrap();
        sessions.retain(|id, entry| {
            if now.duration_since(entry.last_active) > SESSION_EXPIRE {
                debug!(id = %String::from_utf8_lossy(id), "zhttp client: session expired");
                let _ = entry.events.send(SessionEvent::Cancelled);
                expired.push(id.clone());
                return false;
            }
            if entry.peer.is_some() {
                let mut packet = ZhttpPacket::new(PacketType::KeepAlive, id.clone());
                packet.from = inner.instance_id.clone();
                packet.seq = Some(entry.out_seq);
                entry.out_seq += 1;
                keepalives.push(packet);
            }
            true
        });
    }

    for id in expired {
        let mut cancel = ZhttpPacket::new(PacketType::Cancel, id);
        cancel.from = inner.instance_id.clone();
        send_stream(inner, cancel).await;
    }
    for packet in keepalives {
        send_stream(inner, packet).await;
    }
}

async fn send_stream(inner: &Arc<ClientInner>, packet: ZhttpPacket) {
    let msg = vec![Bytes::new(), packet.encode()];
    if inner.out_stream.send(msg).await.is_err() {
        debug!("zhttp client: stream endpoint closed");
    }
}

/// One outbound request session.
pub struct ClientRequest {
    inner: Arc<ClientInner>,
    id: Bytes,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    started: bool,
}

impl ClientRequest {
    pub fn rid(&self) -> Rid {
        Rid::new(self.inner.instance_id.clone(), self.id.clone())
    }

    /// Send the opening packet.
    pub async fn start(&mut self, req: OutboundRequest) -> Result<()> {
        let mut packet = ZhttpPacket::new(PacketType::Data, self.id.clone());
        packet.from = self.inner.instance_id.clone();
        packet.seq = Some(0);
        packet.credits = Some(crate::DEFAULT_CREDITS);
        packet.stream = true;
        packet.more = req.more;
        packet.method = Some(req.method);
        packet.uri = Some(req.uri);
        packet.headers = Some(req.headers);
        packet.body = Some(req.body);
        packet.connect_host = req.connect_host;
        packet.connect_port = req.connect_port;
        packet.ignore_policies = req.ignore_policies;
        packet.passthrough = req.passthrough;

        {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions
                .get_mut(&self.id)
                .ok_or(ZhttpError::Finished)?;
            entry.out_seq = 1;
            entry.last_active = Instant::now();
        }

        self.started = true;
        self.inner.out.send(vec![packet.encode()]).await?;
        Ok(())
    }

    /// Credits currently available for request-body writes.
    pub fn write_bytes_available(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(&self.id)
            .map(|e| e.out_credits as usize)
            .unwrap_or(0)
    }

    /// Stream more request body. Fails rather than over-running the peer's
    /// granted credit; the caller holds anything that does not fit.
    pub async fn write_body(&mut self, data: Bytes, more: bool) -> Result<()> {
        if !self.started {
            return Err(ZhttpError::NotStarted);
        }
        let packet = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions.get_mut(&self.id).ok_or(ZhttpError::Finished)?;
            if (entry.out_credits as usize) < data.len() {
                return Err(ZhttpError::InsufficientCredit {
                    need: data.len(),
                    have: entry.out_credits as usize,
                });
            }
            entry.out_credits -= data.len() as u32;
            let mut packet = ZhttpPacket::new(PacketType::Data, self.id.clone());
            packet.from = self.inner.instance_id.clone();
            packet.seq = Some(entry.out_seq);
            entry.out_seq += 1;
            packet.body = Some(data);
            packet.more = more;
            packet
        };
        send_stream(&self.inner, packet).await;
        Ok(())
    }

    /// Send a WebSocket message toward the origin.
    pub async fn write_ws(&mut self, content_type: ContentType, data: Bytes) -> Result<()> {
        if !self.started {
            return Err(ZhttpError::NotStarted);
        }
        let packet = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions.get_mut(&self.id).ok_or(ZhttpError::Finished)?;
            if (entry.out_credits as usize) < data.len() {
                return Err(ZhttpError::InsufficientCredit {
                    need: data.len(),
                    have: entry.out_credits as usize,
                });
            }
            entry.out_credits -= data.len() as u32;
            let mut packet = ZhttpPacket::new(PacketType::Data, self.id.clone());
            packet.from = self.inner.instance_id.clone();
            packet.seq = Some(entry.out_seq);
            entry.out_seq += 1;
            packet.body = Some(data);
            packet.content_type = Some(content_type);
            packet.more = false;
            packet
        };
        send_stream(&self.inner, packet).await;
        Ok(())
    }

    /// Grant the origin more response credit.
    pub async fn send_credit(&mut self, credits: u32) -> Result<()> {
        let packet = self
            .inner
            .control_packet(&self.id, PacketType::Credit)
            .map(|mut p| {
                p.credits = Some(credits);
                p
            })
            .ok_or(ZhttpError::Finished)?;
        send_stream(&self.inner, packet).await;
        Ok(())
    }

    /// Send a WebSocket close toward the origin.
    pub async fn close(&mut self, status: Option<u16>) -> Result<()> {
        let packet = self
            .inner
            .control_packet(&self.id, PacketType::Close)
            .map(|mut p| {
                p.code = status;
                p
            })
            .ok_or(ZhttpError::Finished)?;
        send_stream(&self.inner, packet).await;
        Ok(())
    }

    /// Next event from the origin side.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Detach the event stream so another task can pump it while this
    /// handle keeps the write side. `next_event` yields nothing afterwards.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (_tx, rx) = mpsc::unbounded_channel();
        std::mem::replace(&mut self.events, rx)
    }

    /// Cancel the request and drop the session.
    pub async fn cancel(mut self) {
        if let Some(packet) = self.inner.control_packet(&self.id, PacketType::Cancel) {
            send_stream(&self.inner, packet).await;
        }
        self.inner.sessions.lock().unwrap().remove(&self.id);
        self.events.close();
    }
}

impl Drop for ClientRequest {
    fn drop(&mut self) {
        self.inner.sessions.lock().unwrap().remove(&self.id);
    }
}
