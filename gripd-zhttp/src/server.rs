//! Server side of a ZHTTP link: receives requests from an edge adapter,
//! streams responses back, and supports handing a live session to another
//! worker without the client noticing.

use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gripd_wire::zhttp::{ContentType, PacketType, ZhttpPacket};
use gripd_wire::TnValue;
use gripd_x::bus::{Bus, Message, PubSocket, DEFAULT_HWM};
use gripd_x::{HttpHeaders, Rid};

use crate::table::SessionTable;
use crate::{
    EndpointSpec, Result, SessionEvent, ZhttpError, KEEPALIVE_INTERVAL, SESSION_EXPIRE,
};

/// Coordinates needed to resume a session in another worker.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub rid: Rid,
    /// Next seq toward the client.
    pub out_seq: u64,
    /// Next seq expected from the client.
    pub in_seq: u64,
    /// Credits outstanding toward the client.
    pub out_credits: u32,
    pub user_data: Option<TnValue>,
}

struct SessionEntry {
    events: mpsc::UnboundedSender<SessionEvent>,
    in_seq: u64,
    out_seq: u64,
    out_credits: u32,
    last_active: Instant,
}

struct ServerInner {
    instance_id: Bytes,
    out: PubSocket,
    sessions: Mutex<SessionTable<Rid, SessionEntry>>,
}

impl ServerInner {
    fn publish(&self, to: &Bytes, packet: &ZhttpPacket) {
        let encoded = packet.encode();
        let mut frame = BytesMut::with_capacity(to.len() + 1 + encoded.len());
        frame.extend_from_slice(to);
        frame.extend_from_slice(b" ");
        frame.extend_from_slice(&encoded);
        self.out.send(vec![frame.freeze()]);
    }

    /// Build a control packet for a live session, advancing its out seq.
    fn control_packet(&self, rid: &Rid, ptype: PacketType) -> Option<ZhttpPacket> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.get_mut(rid)?;
        let mut packet = ZhttpPacket::new(ptype, rid.id.clone());
        packet.from = self.instance_id.clone();
        packet.seq = Some(entry.out_seq);
        entry.out_seq += 1;
        Some(packet)
    }
}

/// A freshly accepted inbound request.
pub struct ServerRequest {
    inner: Arc<ServerInner>,
    rid: Rid,
    events: mpsc::UnboundedReceiver<SessionEvent>,

    pub method: String,
    pub uri: String,
    pub headers: HttpHeaders,
    pub body: Bytes,
    /// More request body will arrive as events.
    pub more: bool,
    pub peer_address: Option<String>,
    /// Credits the client granted us for the response.
    pub initial_credits: u32,
    pub passthrough: Option<TnValue>,
    pub user_data: Option<TnValue>,

    sent_header: bool,
}

/// Owns the server end of a link: accepts new requests and dispatches
/// packets to live sessions.
pub struct ServerManager {
    inner: Arc<ServerInner>,
    accept_rx: mpsc::UnboundedReceiver<ServerRequest>,
}

impl ServerManager {
    /// Create a manager. `bind_in` is set by the worker that receives new
    /// requests (the proxy); a worker that only adopts handed-off sessions
    /// (the handler) leaves it unset.
    pub fn new(
        bus: &Bus,
        instance_id: impl Into<Bytes>,
        spec: &EndpointSpec,
        bind_in: bool,
    ) -> Result<Self> {
        let instance_id = instance_id.into();
        let out = bus.bind_pub(&spec.out_endpoint(), DEFAULT_HWM);

        let inner = Arc::new(ServerInner {
            instance_id: instance_id.clone(),
            out,
            sessions: Mutex::new(SessionTable::new()),
        });

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        if bind_in {
            let mut pull = bus.bind_pull(&spec.in_endpoint(), DEFAULT_HWM)?;
            let pull_inner = inner.clone();
            let pull_accept = accept_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = pull.recv().await {
                    handle_first_packet(&pull_inner, msg, &pull_accept);
                }
            });
        }

        let mut stream = bus.connect_dealer(&spec.in_stream_endpoint(), instance_id, DEFAULT_HWM);
        let stream_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.recv().await {
                handle_stream_packet(&stream_inner, msg);
            }
        });

        let timer_inner = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                run_timers(&timer_inner);
            }
        });

        Ok(Self { inner, accept_rx })
    }

    pub fn instance_id(&self) -> &Bytes {
        &self.inner.instance_id
    }

    /// Next inbound request.
    pub async fn accept(&mut self) -> Option<ServerRequest> {
        self.accept_rx.recv().await
    }

    /// Adopt a session handed off from another worker. The first packet we
    /// send will carry our reply address, redirecting the edge to us.
    /// `response_begun` says whether the previous owner already sent the
    /// response header.
    pub fn restore(&self, state: SessionState, response_begun: bool) -> ServerRequest {
        self.handle().restore(state, response_begun)
    }

    /// Number of live sessions (for stats and tests).
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    /// A cloneable handle for restoring sessions outside the accept loop.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            inner: self.inner.clone(),
        }
    }
}

/// Cloneable access to a server manager's session table.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
}

impl ServerHandle {
    pub fn instance_id(&self) -> &Bytes {
        &self.inner.instance_id
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    /// See [`ServerManager::restore`].
    pub fn restore(&self, state: SessionState, response_begun: bool) -> ServerRequest {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.sessions.lock().unwrap().insert(
            state.rid.clone(),
            SessionEntry {
                events: tx,
                in_seq: state.in_seq,
                out_seq: state.out_seq,
                out_credits: state.out_credits,
                last_active: Instant::now(),
            },
        );

        ServerRequest {
            inner: self.inner.clone(),
            rid: state.rid,
            events: rx,
            method: String::new(),
            uri: String::new(),
            headers: HttpHeaders::new(),
            body: Bytes::new(),
            more: false,
            peer_address: None,
            initial_credits: state.out_credits,
            passthrough: None,
            user_data: state.user_data,
            sent_header: response_begun,
        }
    }
}

fn handle_first_packet(
    inner: &Arc<ServerInner>,
    msg: Message,
    accept_tx: &mpsc::UnboundedSender<ServerRequest>,
) {
    let Some(frame) = msg.first() else {
        return;
    };
    let packet = match ZhttpPacket::decode(frame) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "zhttp server: invalid packet, skipping");
            return;
        }
    };

    if packet.from.is_empty() {
        warn!("zhttp server: first packet without reply address, skipping");
        return;
    }
    if packet.ptype != PacketType::Data || packet.method.is_none() {
        warn!("zhttp server: first packet is not a request, skipping");
        return;
    }
    if let Some(seq) = packet.seq {
        if seq != 0 {
            warn!(seq, "zhttp server: first packet with nonzero seq, skipping");
            return;
        }
    }

    let rid = Rid::new(packet.from.clone(), packet.id.clone());
    let (tx, rx) = mpsc::unbounded_channel();

    {
        let mut sessions = inner.sessions.lock().unwrap();
        if sessions.contains(&rid) {
            drop(sessions);
            warn!(rid = %rid, "zhttp server: duplicate rid, cancelling both");
            let mut cancel = ZhttpPacket::new(PacketType::Cancel, rid.id.clone());
            cancel.from = inner.instance_id.clone();
            inner.publish(&rid.sender, &cancel);
            inner.sessions.lock().unwrap().remove(&rid);
            return;
        }
        sessions.insert(
            rid.clone(),
            SessionEntry {
                events: tx,
                in_seq: 1,
                out_seq: 0,
                out_credits: packet.credits.unwrap_or(0),
                last_active: Instant::now(),
            },
        );
    }

    let request = ServerRequest {
        inner: inner.clone(),
        rid,
        events: rx,
        method: packet.method.unwrap_or_default(),
        uri: packet.uri.unwrap_or_default(),
        headers: packet.headers.unwrap_or_default(),
        body: packet.body.unwrap_or_default(),
        more: packet.more,
        peer_address: packet.peer_address,
        initial_credits: packet.credits.unwrap_or(0),
        passthrough: packet.passthrough,
        user_data: packet.user_data,
        sent_header: false,
    };

    if accept_tx.send(request).is_err() {
        debug!("zhttp server: accept queue closed");
    }
}

fn handle_stream_packet(inner: &Arc<ServerInner>, msg: Message) {
    // [empty delimiter, packet]
    let Some(frame) = msg.iter().find(|f| !f.is_empty()) else {
        return;
    };
    let packet = match ZhttpPacket::decode(frame) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "zhttp server: invalid stream packet, skipping");
            return;
        }
    };

    if packet.from.is_empty() {
        warn!("zhttp server: stream packet without sender, skipping");
        return;
    }
    let rid = Rid::new(packet.from.clone(), packet.id.clone());

    let mut sessions = inner.sessions.lock().unwrap();
    if !sessions.contains(&rid) {
        drop(sessions);
        if packet.ptype != PacketType::Cancel {
            let mut cancel = ZhttpPacket::new(PacketType::Cancel, rid.id.clone());
            cancel.from = inner.instance_id.clone();
            inner.publish(&rid.sender, &cancel);
        }
        return;
    }
    let entry = sessions.get_mut(&rid).expect("checked");

    if let Some(seq) = packet.seq {
        if seq != entry.in_seq {
            warn!(
                rid = %rid,
                expected = entry.in_seq,
                got = seq,
                "zhttp server: sequence gap, cancelling"
            );
            let _ = entry.events.send(SessionEvent::Cancelled);
            sessions.remove(&rid);
            drop(sessions);
            let mut cancel = ZhttpPacket::new(PacketType::Cancel, rid.id.clone());
            cancel.from = inner.instance_id.clone();
            inner.publish(&rid.sender, &cancel);
            return;
        }
    }
    entry.in_seq += 1;
    entry.last_active = Instant::now();

    match packet.ptype {
        PacketType::Data => {
            let _ = entry.events.send(SessionEvent::Body {
                data: packet.body.unwrap_or_default(),
                more: packet.more,
                content_type: packet.content_type,
            });
        }
        PacketType::Credit => {
            let c = packet.credits.unwrap_or(0);
            entry.out_credits = entry.out_credits.saturating_add(c);
            let _ = entry.events.send(SessionEvent::Credit(c));
        }
        PacketType::KeepAlive => {}
        PacketType::Ping => {
            drop(sessions);
            if let Some(mut pong) = inner.control_packet(&rid, PacketType::Pong) {
                pong.ptype = PacketType::Pong;
                inner.publish(&rid.sender, &pong);
            }
        }
        PacketType::Pong => {}
        PacketType::Close => {
            let _ = entry.events.send(SessionEvent::Close {
                status: packet.code,
            });
        }
        PacketType::HandoffStart => {
            let _ = entry.events.send(SessionEvent::HandoffStart);
        }
        PacketType::HandoffProceed => {
            let _ = entry.events.send(SessionEvent::HandoffProceed);
        }
        PacketType::Error => {
            let _ = entry.events.send(SessionEvent::Error {
                condition: packet.condition.unwrap_or_default(),
            });
            sessions.remove(&rid);
        }
        PacketType::Cancel => {
            let _ = entry.events.send(SessionEvent::Cancelled);
            sessions.remove(&rid);
        }
    }
}

fn run_timers(inner: &Arc<ServerInner>) {
    let now = Instant::now();
    let mut keepalives = Vec::new();

    {
        let mut sessions = inner.sessions.lock().unwrap();
        sessions.retain(|rid, entry| {
            if now.duration_since(entry.last_active) > SESSION_EXPIRE {
                debug!(rid = %rid, "zhttp server: session expired");
                let _ = entry.events.send(SessionEvent::Cancelled);
                let mut cancel = ZhttpPacket::new(PacketType::Cancel, rid.id.clone());
                cancel.from = inner.instance_id.clone();
                cancel.seq = Some(entry.out_seq);
                keepalives.push((rid.sender.clone(), cancel));
                return false;
            }
            let mut packet = ZhttpPacket::new(PacketType::KeepAlive, rid.id.clone());
            packet.from = inner.instance_id.clone();
            packet.seq = Some(entry.out_seq);
            entry.out_seq += 1;
            keepalives.push((rid.sender.clone(), packet));
            true
        });
    }

    for (to, packet) in keepalives {
        inner.publish(&to, &packet);
    }
}

impl ServerRequest {
    pub fn rid(&self) -> &Rid {
        &self.rid
    }

    /// Credits currently available for response-body writes.
    pub fn write_bytes_available(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(&self.rid)
            .map(|e| e.out_credits as usize)
            .unwrap_or(0)
    }

    /// Grant the client more request-body credit.
    pub async fn send_credit(&mut self, credits: u32) -> Result<()> {
        let mut packet = self
            .inner
            .control_packet(&self.rid, PacketType::Credit)
            .ok_or(ZhttpError::Finished)?;
        packet.credits = Some(credits);
        self.inner.publish(&self.rid.sender, &packet);
        Ok(())
    }

    /// Send the response header. Must precede any body write.
    pub fn begin_response(
        &mut self,
        code: u16,
        reason: Bytes,
        headers: HttpHeaders,
        credits: Option<u32>,
    ) -> Result<()> {
        let packet = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions.get_mut(&self.rid).ok_or(ZhttpError::Finished)?;
            let mut packet = ZhttpPacket::new(PacketType::Data, self.rid.id.clone());
            packet.from = self.inner.instance_id.clone();
            packet.seq = Some(entry.out_seq);
            entry.out_seq += 1;
            packet.code = Some(code);
            packet.reason = Some(reason);
            packet.headers = Some(headers);
            packet.more = true;
            packet.credits = credits;
            packet
        };
        self.sent_header = true;
        self.inner.publish(&self.rid.sender, &packet);
        Ok(())
    }

    /// Stream response body within the granted credit.
    pub fn write_body(&mut self, data: Bytes, more: bool) -> Result<()> {
        if !self.sent_header {
            return Err(ZhttpError::NotStarted);
        }
        let packet = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions.get_mut(&self.rid).ok_or(ZhttpError::Finished)?;
            if (entry.out_credits as usize) < data.len() {
                return Err(ZhttpError::InsufficientCredit {
                    need: data.len(),
                    have: entry.out_credits as usize,
                });
            }
            entry.out_credits -= data.len() as u32;
            let mut packet = ZhttpPacket::new(PacketType::Data, self.rid.id.clone());
            packet.from = self.inner.instance_id.clone();
            packet.seq = Some(entry.out_seq);
            entry.out_seq += 1;
            packet.body = Some(data);
            packet.more = more;
            packet
        };
        self.inner.publish(&self.rid.sender, &packet);
        if !more {
            self.inner.sessions.lock().unwrap().remove(&self.rid);
        }
        Ok(())
    }

    pub fn end_body(&mut self) -> Result<()> {
        self.write_body(Bytes::new(), false)
    }

    /// Send a WebSocket message toward the client.
    pub fn write_ws(&mut self, content_type: ContentType, data: Bytes) -> Result<()> {
        let packet = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions.get_mut(&self.rid).ok_or(ZhttpError::Finished)?;
            if (entry.out_credits as usize) < data.len() {
                return Err(ZhttpError::InsufficientCredit {
                    need: data.len(),
                    have: entry.out_credits as usize,
                });
            }
            entry.out_credits -= data.len() as u32;
            let mut packet = ZhttpPacket::new(PacketType::Data, self.rid.id.clone());
            packet.from = self.inner.instance_id.clone();
            packet.seq = Some(entry.out_seq);
            entry.out_seq += 1;
            packet.body = Some(data);
            packet.content_type = Some(content_type);
            packet
        };
        self.inner.publish(&self.rid.sender, &packet);
        Ok(())
    }

    /// Send a WebSocket close toward the client and drop the session.
    pub fn close(&mut self, status: Option<u16>) -> Result<()> {
        let mut packet = self
            .inner
            .control_packet(&self.rid, PacketType::Close)
            .ok_or(ZhttpError::Finished)?;
        packet.code = status;
        self.inner.publish(&self.rid.sender, &packet);
        self.inner.sessions.lock().unwrap().remove(&self.rid);
        Ok(())
    }

    /// Fail the session with a condition and drop it.
    pub fn error(&mut self, condition: &'static str) {
        if let Some(mut packet) = self.inner.control_packet(&self.rid, PacketType::Error) {
            packet.condition = Some(Bytes::from_static(condition.as_bytes()));
            self.inner.publish(&self.rid.sender, &packet);
        }
        self.inner.sessions.lock().unwrap().remove(&self.rid);
    }

    /// Cancel the session and drop it.
    pub fn cancel(&mut self) {
        if let Some(packet) = self.inner.control_packet(&self.rid, PacketType::Cancel) {
            self.inner.publish(&self.rid.sender, &packet);
        }
        self.inner.sessions.lock().unwrap().remove(&self.rid);
    }

    /// Ask the edge to pause delivery for a handoff. The edge acknowledges
    /// with a `HandoffProceed` event.
    pub fn start_handoff(&mut self) -> Result<()> {
        let packet = self
            .inner
            .control_packet(&self.rid, PacketType::HandoffStart)
            .ok_or(ZhttpError::Finished)?;
        self.inner.publish(&self.rid.sender, &packet);
        Ok(())
    }

    /// Next event from the client side.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Detach the event stream so another task can pump it while this
    /// handle keeps the write side. `next_event` yields nothing afterwards.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (_tx, rx) = mpsc::unbounded_channel();
        std::mem::replace(&mut self.events, rx)
    }

    /// Give up ownership, returning the coordinates a new owner needs.
    pub fn release(mut self) -> SessionState {
        let state = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions.remove(&self.rid);
            match entry {
                Some(entry) => SessionState {
                    rid: self.rid.clone(),
                    out_seq: entry.out_seq,
                    in_seq: entry.in_seq,
                    out_credits: entry.out_credits,
                    user_data: self.user_data.clone(),
                },
                None => SessionState {
                    rid: self.rid.clone(),
                    out_seq: 0,
                    in_seq: 0,
                    out_credits: 0,
                    user_data: self.user_data.clone(),
                },
            }
        };
        self.events.close();
        state
    }
}

impl Drop for ServerRequest {
    fn drop(&mut self) {
        self.inner.sessions.lock().unwrap().remove(&self.rid);
    }
}
