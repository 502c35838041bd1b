//! The edge adapter event loop.
//!
//! One task owns every session. External web server packets come in on a
//! pull socket; worker packets come in on a sub socket filtered by our
//! instance id; everything else is timers. Responses and control actions
//! go out on a pub socket the external server subscribes to, and ack
//! progress is polled over a dealer/router pair.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use gripd_wire::zhttp::{ContentType, PacketType, ZhttpPacket};
use gripd_x::bus::{Bus, DealerSocket, PubSocket, PullSocket, PushSocket, RouterSocket, SubSocket, DEFAULT_HWM};
use gripd_x::websocket::{self, Opcode};
use gripd_x::HttpHeaders;
use gripd_zhttp::EndpointSpec;

use crate::packet::{
    decode_status_reply, encode_status_request, EdgeControlAction, EdgeControlPacket,
    EdgeRequestPacket, EdgeResponsePacket,
};
use crate::session::{EdgeSession, HttpVersion, Mode};

/// Sessions idle past this are torn down.
pub const SESSION_EXPIRE: Duration = Duration::from_secs(60);

/// ZHTTP keep-alive cadence toward workers.
pub const ZHTTP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Keep-alive cadence toward the external server.
pub const EXT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// How often we ask the external server for write-ack progress.
pub const ACK_POLL_INTERVAL: Duration = Duration::from_millis(250);

const EXPIRE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Largest WebSocket frame we accept from a client.
const WS_FRAME_MAX: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Our ZHTTP sender identity.
    pub instance_id: Bytes,
    /// External server's request endpoint (we pull).
    pub ext_in: String,
    /// External server's response endpoint (we publish).
    pub ext_out: String,
    /// External server's control endpoint (we poll over dealer/router).
    pub ext_control: String,
    /// ZHTTP endpoints toward the workers.
    pub zhttp: EndpointSpec,
    /// Response-buffer credit granted per new session.
    pub client_buffer: u32,
}

struct WsInbound {
    buf: BytesMut,
}

pub struct EdgeAdapter {
    config: EdgeConfig,

    ext_in: PullSocket,
    ext_out: PubSocket,
    ext_control: DealerSocket,

    zhttp_push: PushSocket,
    zhttp_router: RouterSocket,
    zhttp_sub: SubSocket,

    sessions: HashMap<Bytes, EdgeSession>,
    by_ext: HashMap<(Bytes, Bytes), Bytes>,
    ws_in: HashMap<Bytes, WsInbound>,
    next_session: u64,
}

impl EdgeAdapter {
    pub fn new(bus: &Bus, config: EdgeConfig) -> gripd_x::bus::Result<Self> {
        let ext_in = bus.bind_pull(&config.ext_in, DEFAULT_HWM)?;
        let ext_out = bus.bind_pub(&config.ext_out, DEFAULT_HWM);
        let ext_control = bus.connect_dealer(&config.ext_control, config.instance_id.clone(), DEFAULT_HWM);

        let zhttp_push = bus.connect_push(&config.zhttp.in_endpoint());
        let zhttp_router = bus.bind_router(&config.zhttp.in_stream_endpoint(), DEFAULT_HWM)?;
        let mut prefix = config.instance_id.to_vec();
        prefix.push(b' ');
        let zhttp_sub = bus.connect_sub(&config.zhttp.out_endpoint(), prefix);

        Ok(Self {
            config,
            ext_in,
            ext_out,
            ext_control,
            zhttp_push,
            zhttp_router,
            zhttp_sub,
            sessions: HashMap::new(),
            by_ext: HashMap::new(),
            ws_in: HashMap::new(),
            next_session: 0,
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut ack_timer = interval(ACK_POLL_INTERVAL);
        let mut zhttp_ka_timer = interval(ZHTTP_KEEPALIVE_INTERVAL);
        let mut ext_ka_timer = interval(EXT_KEEPALIVE_INTERVAL);
        let mut expire_timer = interval(EXPIRE_CHECK_INTERVAL);
        for t in [
            &mut ack_timer,
            &mut zhttp_ka_timer,
            &mut ext_ka_timer,
            &mut expire_timer,
        ] {
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            instance = %String::from_utf8_lossy(&self.config.instance_id),
            "edge adapter started"
        );

        loop {
            tokio::select! {
                msg = self.ext_in.recv() => {
                    let Some(msg) = msg else { break };
                    if let Some(frame) = msg.into_iter().next() {
                        self.handle_external(frame).await;
                    }
                }
                msg = self.zhttp_sub.recv() => {
                    let Ok(msg) = msg else { break };
                    if let Some(frame) = msg.into_iter().next() {
                        self.handle_zhttp(frame).await;
                    }
                }
                reply = self.ext_control.recv() => {
                    if let Some(msg) = reply {
                        if let Some(frame) = msg.into_iter().next() {
                            self.handle_status_reply(frame).await;
                        }
                    }
                }
                _ = ack_timer.tick() => self.poll_acks().await,
                _ = zhttp_ka_timer.tick() => self.send_zhttp_keepalives().await,
                _ = ext_ka_timer.tick() => self.send_ext_keepalives(),
                _ = expire_timer.tick() => self.expire_sessions().await,
                _ = &mut shutdown => break,
            }
        }

        info!("edge adapter stopped");
    }

    async fn handle_external(&mut self, frame: Bytes) {
        let packet = match EdgeRequestPacket::decode(&frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "external packet invalid, skipping");
                return;
            }
        };

        if packet.is_disconnect {
            self.handle_disconnect(&packet).await;
            return;
        }

        if packet.version.is_empty() && packet.upload_offset.is_some() {
            self.handle_continuation(packet).await;
            return;
        }

        self.handle_new_request(packet).await;
    }

    async fn handle_disconnect(&mut self, packet: &EdgeRequestPacket) {
        let key = (packet.sender.clone(), packet.id.clone());
        let Some(zhttp_id) = self.by_ext.get(&key).cloned() else {
            return;
        };
        debug!(id = %String::from_utf8_lossy(&packet.id), "client disconnected");

        let defer = {
            let session = self.sessions.get_mut(&zhttp_id).expect("index consistent");
            session.down_closed = true;
            session.in_handoff || session.zhttp_address.is_none()
        };

        if defer {
            // cancel goes out once the handoff settles
            return;
        }

        self.send_session_cancel(&zhttp_id).await;
        self.destroy_session(&zhttp_id, false);
    }

    async fn handle_new_request(&mut self, packet: EdgeRequestPacket) {
        let key = (packet.sender.clone(), packet.id.clone());
        if self.by_ext.contains_key(&key) {
            warn!(id = %String::from_utf8_lossy(&packet.id), "duplicate request id, skipping");
            return;
        }

        let version = match packet.version.as_str() {
            "HTTP/1.0" => HttpVersion::V1_0,
            "HTTP/1.1" => HttpVersion::V1_1,
            other => {
                warn!(version = other, "unsupported http version, skipping");
                return;
            }
        };

        let mut host = packet
            .headers
            .get("Host")
            .map(|h| h.clone())
            .unwrap_or_else(|| Bytes::from_static(b"localhost"));
        if let Some(at) = host.iter().position(|&b| b == b':') {
            host = host.slice(..at);
        }
        if host.is_empty() || host.contains(&b'/') {
            warn!(host = %String::from_utf8_lossy(&host), "invalid host, skipping");
            return;
        }
        if packet.uri.first() != Some(&b'/') {
            warn!(uri = %String::from_utf8_lossy(&packet.uri), "invalid uri, skipping");
            return;
        }

        let is_ws = packet
            .headers
            .get("Upgrade")
            .map(|v| v.eq_ignore_ascii_case(b"websocket"))
            .unwrap_or(false);

        let tls = matches!(packet.scheme.as_deref(), Some("https") | Some("wss"));
        let scheme = match (is_ws, tls) {
            (true, true) => "wss",
            (true, false) => "ws",
            (false, true) => "https",
            (false, false) => "http",
        };

        let mut uri = String::with_capacity(scheme.len() + 3 + host.len() + packet.uri.len());
        uri.push_str(scheme);
        uri.push_str("://");
        uri.push_str(&String::from_utf8_lossy(&host));
        uri.push_str(&String::from_utf8_lossy(&packet.uri));

        let zhttp_id = Bytes::from(format!(
            "{}-{}",
            String::from_utf8_lossy(&self.config.instance_id),
            self.next_session
        ));
        self.next_session += 1;

        let mode = if is_ws { Mode::WebSocket } else { Mode::Http };
        let mut session = EdgeSession::new(
            packet.sender.clone(),
            packet.id.clone(),
            zhttp_id.clone(),
            mode,
            version,
            Instant::now(),
        );
        session.apply_connection_preference(&packet.headers);

        let streaming = packet.upload_offset.is_some() && !packet.upload_done;
        session.read_count = packet.body.len() as u64;
        session.in_finished = !streaming;

        info!(
            id = %String::from_utf8_lossy(&packet.id),
            method = %packet.method,
            uri = %uri,
            ws = is_ws,
            "new request"
        );

        let mut zreq = ZhttpPacket::new(PacketType::Data, zhttp_id.clone());
        zreq.from = self.config.instance_id.clone();
        zreq.seq = Some(0);
        zreq.credits = Some(self.config.client_buffer);
        zreq.stream = true;
        zreq.more = streaming;
        zreq.method = Some(packet.method.clone());
        zreq.uri = Some(uri);
        zreq.headers = Some(packet.headers.clone());
        zreq.body = Some(packet.body.clone());
        zreq.peer_address = packet.remote_address.clone();
        zreq.ignore_policies = false;
        session.out_seq = 1;

        self.by_ext.insert(key, zhttp_id.clone());
        self.sessions.insert(zhttp_id.clone(), session);
        if is_ws {
            self.ws_in
                .insert(zhttp_id.clone(), WsInbound { buf: BytesMut::new() });
        }

        if self.zhttp_push.send(vec![zreq.encode()]).await.is_err() {
            warn!("zhttp intake closed, dropping request");
            self.destroy_session(&zhttp_id, false);
        }
    }

    async fn handle_continuation(&mut self, packet: EdgeRequestPacket) {
        let key = (packet.sender.clone(), packet.id.clone());
        let Some(zhttp_id) = self.by_ext.get(&key).cloned() else {
            debug!(id = %String::from_utf8_lossy(&packet.id), "continuation for unknown session");
            return;
        };

        let offset = packet.upload_offset.unwrap_or(0);
        let (offset_ok, in_handoff, addr_known) = {
            let session = self.sessions.get_mut(&zhttp_id).expect("index consistent");
            session.last_active = Instant::now();
            let ok = offset == session.read_count;
            if ok {
                session.read_count += packet.body.len() as u64;
                if packet.upload_done {
                    session.in_finished = true;
                }
            }
            (ok, session.in_handoff, session.zhttp_address.is_some())
        };

        if !offset_ok {
            warn!(
                id = %String::from_utf8_lossy(&packet.id),
                offset,
                "continuation offset mismatch, failing session"
            );
            self.send_session_error(&zhttp_id, "bad-request").await;
            self.send_ext_cancel(&zhttp_id);
            self.destroy_session(&zhttp_id, false);
            return;
        }

        if in_handoff || !addr_known {
            let session = self.sessions.get_mut(&zhttp_id).expect("index consistent");
            session.pending_in.extend_from_slice(&packet.body);
            session.pending_in_more = !packet.upload_done;
            return;
        }

        match self.sessions.get(&zhttp_id).map(|s| s.mode) {
            Some(Mode::WebSocket) => {
                self.handle_ws_client_bytes(&zhttp_id, &packet.body).await;
            }
            Some(Mode::Http) => {
                let more = !packet.upload_done;
                self.send_session_body(&zhttp_id, packet.body.clone(), more)
                    .await;
            }
            None => {}
        }
    }

    /// Parse client WebSocket frames and convert to ZHTTP packets.
    async fn handle_ws_client_bytes(&mut self, zhttp_id: &Bytes, data: &[u8]) {
        let Some(inbound) = self.ws_in.get_mut(zhttp_id) else {
            return;
        };
        inbound.buf.extend_from_slice(data);

        loop {
            let frame = match websocket::parse_frame(&mut self.ws_in.get_mut(zhttp_id).unwrap().buf, WS_FRAME_MAX) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "bad client websocket frame, failing session");
                    self.send_session_error(zhttp_id, "bad-request").await;
                    self.send_ext_cancel(zhttp_id);
                    self.destroy_session(zhttp_id, false);
                    return;
                }
            };

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    let ct = if frame.opcode == Opcode::Text {
                        ContentType::Text
                    } else {
                        ContentType::Binary
                    };
                    let packet = self.session_data_packet(zhttp_id, frame.payload, false, Some(ct));
                    if let Some(packet) = packet {
                        self.send_to_worker(zhttp_id, packet).await;
                    }
                }
                Opcode::Ping | Opcode::Pong => {
                    let ptype = if frame.opcode == Opcode::Ping {
                        PacketType::Ping
                    } else {
                        PacketType::Pong
                    };
                    if let Some(mut packet) = self.session_control_packet(zhttp_id, ptype) {
                        packet.body = Some(frame.payload);
                        self.send_to_worker(zhttp_id, packet).await;
                    }
                }
                Opcode::Close => {
                    let status = frame.close_status();
                    if let Some(mut packet) = self.session_control_packet(zhttp_id, PacketType::Close) {
                        packet.code = Some(status);
                        self.send_to_worker(zhttp_id, packet).await;
                    }
                    if let Some(session) = self.sessions.get_mut(zhttp_id) {
                        session.down_closed = true;
                    }
                }
                Opcode::Continuation => {
                    // fragmented client messages are reassembled upstream of
                    // us only for control purposes; forward as binary chunk
                    let packet = self.session_data_packet(
                        zhttp_id,
                        frame.payload,
                        !frame.fin,
                        Some(ContentType::Binary),
                    );
                    if let Some(packet) = packet {
                        self.send_to_worker(zhttp_id, packet).await;
                    }
                }
            }
        }
    }

    async fn handle_zhttp(&mut self, frame: Bytes) {
        let payload = frame.slice(self.config.instance_id.len() + 1..);
        let packet = match ZhttpPacket::decode(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "zhttp packet invalid, skipping");
                return;
            }
        };

        let Some(session) = self.sessions.get_mut(&packet.id) else {
            debug!(
                id = %String::from_utf8_lossy(&packet.id),
                "zhttp packet for unknown session, cancelling sender"
            );
            if !packet.from.is_empty()
                && !matches!(packet.ptype, PacketType::Cancel | PacketType::Error)
            {
                let mut cancel = ZhttpPacket::new(PacketType::Cancel, packet.id.clone());
                cancel.from = self.config.instance_id.clone();
                let _ = self
                    .zhttp_router
                    .send_to(&packet.from, vec![Bytes::new(), cancel.encode()])
                    .await;
            }
            return;
        };

        // first response must identify the worker
        if session.zhttp_address.is_none() && packet.from.is_empty() {
            warn!(
                id = %String::from_utf8_lossy(&packet.id),
                "first zhttp response without reply address, failing session"
            );
            let id = packet.id.clone();
            self.send_ext_cancel(&id);
            self.destroy_session(&id, false);
            return;
        }

        let mut handoff_completed = false;
        if !packet.from.is_empty() {
            let was = session.zhttp_address.replace(packet.from.clone());
            if session.in_handoff && was.as_deref() != Some(packet.from.as_ref()) {
                session.in_handoff = false;
                handoff_completed = true;
            } else if was.is_none() {
                // address learned; buffered input may now flow
                handoff_completed = !session.pending_in.is_empty()
                    || session.pending_in_credits > 0
                    || session.down_closed;
            }
        }

        if let Some(seq) = packet.seq {
            if seq != session.in_seq {
                warn!(
                    id = %String::from_utf8_lossy(&packet.id),
                    expected = session.in_seq,
                    got = seq,
                    "zhttp sequence violation, failing session"
                );
                let id = packet.id.clone();
                self.send_session_cancel(&id).await;
                self.send_ext_cancel(&id);
                self.destroy_session(&id, false);
                return;
            }
        }
        session.in_seq += 1;
        session.last_active = Instant::now();

        let id = packet.id.clone();

        match packet.ptype {
            PacketType::Data => self.handle_zhttp_data(&id, packet).await,
            PacketType::Credit => {
                // worker grants request-body credit; nothing is buffered on
                // credit here because the external server streams at will
            }
            PacketType::KeepAlive => {}
            PacketType::Ping => {
                let session = self.sessions.get_mut(&id).expect("checked");
                if session.mode == Mode::WebSocket {
                    let data = crate::session::build_ws_control(
                        Opcode::Ping,
                        &packet.body.unwrap_or_default(),
                    );
                    self.write_ext(&id, data);
                }
            }
            PacketType::Pong => {
                let session = self.sessions.get_mut(&id).expect("checked");
                if session.mode == Mode::WebSocket {
                    let data = crate::session::build_ws_control(
                        Opcode::Pong,
                        &packet.body.unwrap_or_default(),
                    );
                    self.write_ext(&id, data);
                }
            }
            PacketType::Close => {
                let data = crate::session::build_ws_close(packet.code);
                self.write_ext(&id, data);
                self.close_ext(&id);
                self.destroy_session(&id, false);
                return;
            }
            PacketType::HandoffStart => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.in_handoff = true;
                }
                if let Some(reply) = self.session_control_packet(&id, PacketType::HandoffProceed) {
                    self.send_to_worker(&id, reply).await;
                }
                return;
            }
            PacketType::HandoffProceed => {}
            PacketType::Error | PacketType::Cancel => {
                if let Some(condition) = &packet.condition {
                    debug!(
                        id = %String::from_utf8_lossy(&id),
                        condition = %String::from_utf8_lossy(condition),
                        "session failed by worker"
                    );
                }
                self.fail_ext(&id);
                self.destroy_session(&id, false);
                return;
            }
        }

        if handoff_completed {
            self.finish_handoff(&id).await;
        }
    }

    async fn handle_zhttp_data(&mut self, id: &Bytes, packet: ZhttpPacket) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };

        match session.mode {
            Mode::Http => {
                let body = packet.body.unwrap_or_default();
                let mut out = BytesMut::new();

                if !session.sent_response_header {
                    let headers = packet.headers.unwrap_or_default();
                    let head = session.build_response_header(
                        packet.code.unwrap_or(200),
                        &packet.reason.clone().unwrap_or_else(|| Bytes::from_static(b"OK")),
                        &headers,
                        packet.more,
                    );
                    out.extend_from_slice(&head);
                }

                out.extend_from_slice(&session.frame_body(&body));
                if !packet.more {
                    if let Some(end) = session.frame_body_end() {
                        out.extend_from_slice(&end);
                    }
                }

                let persistent = session.persistent;
                if !out.is_empty() {
                    let data = out.freeze();
                    if let Some(session) = self.sessions.get_mut(id) {
                        session.written += data.len() as u64;
                    }
                    self.write_ext(id, data);
                }

                if !packet.more {
                    if !persistent {
                        self.close_ext(id);
                    }
                    self.destroy_session(id, false);
                }
            }
            Mode::WebSocket => {
                if !session.sent_response_header {
                    // handshake response: emit the raw 101 head
                    let code = packet.code.unwrap_or(101);
                    let head = session.build_response_header(
                        code,
                        &packet
                            .reason
                            .clone()
                            .unwrap_or_else(|| Bytes::from_static(b"Switching Protocols")),
                        &packet.headers.clone().unwrap_or_default(),
                        false,
                    );
                    // never chunk a websocket stream
                    session.chunked = false;
                    let head_len = head.len() as u64;
                    session.written += head_len;
                    self.write_ext(id, head);

                    if code != 101 {
                        // refused upgrade; treat like a finished response
                        self.close_ext(id);
                        self.destroy_session(id, false);
                    }
                    return;
                }

                let body = packet.body.unwrap_or_default();
                let data = crate::session::build_ws_message(packet.content_type, &body);
                if let Some(session) = self.sessions.get_mut(id) {
                    session.written += data.len() as u64;
                }
                self.write_ext(id, data);
            }
        }
    }

    async fn handle_status_reply(&mut self, frame: Bytes) {
        let entries = match decode_status_reply(&frame) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "status reply invalid, skipping");
                return;
            }
        };

        for (ext_id, confirmed) in entries {
            // status replies are keyed by external connection id; we may
            // serve several senders, so scan our index
            let Some(zhttp_id) = self
                .by_ext
                .iter()
                .find(|((_, id), _)| *id == ext_id)
                .map(|(_, v)| v.clone())
            else {
                continue;
            };

            let (delta, ready) = {
                let session = self.sessions.get_mut(&zhttp_id).expect("index consistent");
                let delta = confirmed.saturating_sub(session.confirmed_written);
                session.confirmed_written = session.confirmed_written.max(confirmed);
                if delta == 0 {
                    continue;
                }
                if session.in_handoff || session.zhttp_address.is_none() {
                    session.pending_in_credits =
                        session.pending_in_credits.saturating_add(delta as u32);
                    (0, false)
                } else {
                    (delta as u32, true)
                }
            };

            if ready {
                if let Some(mut packet) = self.session_control_packet(&zhttp_id, PacketType::Credit)
                {
                    packet.credits = Some(delta);
                    self.send_to_worker(&zhttp_id, packet).await;
                }
            }
        }
    }

    async fn poll_acks(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let _ = self.ext_control.send(vec![encode_status_request()]).await;
    }

    async fn send_zhttp_keepalives(&mut self) {
        let ids: Vec<Bytes> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.zhttp_address.is_some() && !s.in_handoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(packet) = self.session_control_packet(&id, PacketType::KeepAlive) {
                self.send_to_worker(&id, packet).await;
            }
        }
    }

    fn send_ext_keepalives(&mut self) {
        let packets: Vec<EdgeControlPacket> = self
            .sessions
            .values()
            .map(|s| EdgeControlPacket {
                sender: s.sender.clone(),
                id: s.ext_id.clone(),
                action: EdgeControlAction::KeepAlive,
            })
            .collect();
        for packet in packets {
            self.ext_out.send(vec![packet.encode()]);
        }
    }

    async fn expire_sessions(&mut self) {
        let now = Instant::now();
        let expired: Vec<Bytes> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_active) > SESSION_EXPIRE)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            debug!(id = %String::from_utf8_lossy(&id), "session expired");
            self.send_session_cancel(&id).await;
            self.fail_ext(&id);
            self.destroy_session(&id, false);
        }
    }

    /// Flush buffered body and credits once a (new) worker owns the session.
    async fn finish_handoff(&mut self, id: &Bytes) {
        let (body, more, credits, down_closed, mode) = {
            let Some(session) = self.sessions.get_mut(id) else {
                return;
            };
            let body = session.pending_in.split().freeze();
            let more = session.pending_in_more;
            let credits = std::mem::take(&mut session.pending_in_credits);
            (body, more, credits, session.down_closed, session.mode)
        };

        if down_closed {
            self.send_session_cancel(id).await;
            self.destroy_session(id, false);
            return;
        }

        if !body.is_empty() {
            match mode {
                Mode::Http => {
                    self.send_session_body(id, body, more).await;
                }
                Mode::WebSocket => {
                    self.handle_ws_client_bytes(id, &body).await;
                }
            }
        }

        if credits > 0 {
            if let Some(mut packet) = self.session_control_packet(id, PacketType::Credit) {
                packet.credits = Some(credits);
                self.send_to_worker(id, packet).await;
            }
        }
    }

    fn session_data_packet(
        &mut self,
        id: &Bytes,
        body: Bytes,
        more: bool,
        content_type: Option<ContentType>,
    ) -> Option<ZhttpPacket> {
        let session = self.sessions.get_mut(id)?;
        let mut packet = ZhttpPacket::new(PacketType::Data, id.clone());
        packet.from = self.config.instance_id.clone();
        packet.seq = Some(session.out_seq);
        session.out_seq += 1;
        packet.body = Some(body);
        packet.more = more;
        packet.content_type = content_type;
        Some(packet)
    }

    fn session_control_packet(&mut self, id: &Bytes, ptype: PacketType) -> Option<ZhttpPacket> {
        let session = self.sessions.get_mut(id)?;
        let mut packet = ZhttpPacket::new(ptype, id.clone());
        packet.from = self.config.instance_id.clone();
        packet.seq = Some(session.out_seq);
        session.out_seq += 1;
        Some(packet)
    }

    async fn send_session_body(&mut self, id: &Bytes, body: Bytes, more: bool) {
        if let Some(packet) = self.session_data_packet(id, body, more, None) {
            self.send_to_worker(id, packet).await;
        }
    }

    async fn send_session_cancel(&mut self, id: &Bytes) {
        if let Some(packet) = self.session_control_packet(id, PacketType::Cancel) {
            self.send_to_worker(id, packet).await;
        }
    }

    async fn send_session_error(&mut self, id: &Bytes, condition: &'static str) {
        if let Some(mut packet) = self.session_control_packet(id, PacketType::Error) {
            packet.condition = Some(Bytes::from_static(condition.as_bytes()));
            self.send_to_worker(id, packet).await;
        }
    }

    async fn send_to_worker(&mut self, id: &Bytes, packet: ZhttpPacket) {
        let Some(addr) = self
            .sessions
            .get(id)
            .and_then(|s| s.zhttp_address.clone())
        else {
            debug!(
                id = %String::from_utf8_lossy(id),
                "no worker address yet, dropping outbound packet"
            );
            return;
        };
        if self
            .zhttp_router
            .send_to(&addr, vec![Bytes::new(), packet.encode()])
            .await
            .is_err()
        {
            debug!("worker stream endpoint gone");
        }
    }

    fn write_ext(&mut self, id: &Bytes, data: Bytes) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let packet = EdgeResponsePacket {
            sender: session.sender.clone(),
            id: session.ext_id.clone(),
            data,
        };
        self.ext_out.send(vec![packet.encode()]);
    }

    /// Zero-length write: tells the external server to close the socket.
    fn close_ext(&mut self, id: &Bytes) {
        self.write_ext(id, Bytes::new());
    }

    fn send_ext_cancel(&mut self, id: &Bytes) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let packet = EdgeControlPacket {
            sender: session.sender.clone(),
            id: session.ext_id.clone(),
            action: EdgeControlAction::Cancel,
        };
        self.ext_out.send(vec![packet.encode()]);
    }

    /// Error-close toward the client: 502 if nothing was written yet,
    /// otherwise just a close.
    fn fail_ext(&mut self, id: &Bytes) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.mode == Mode::Http && !session.sent_response_header {
            let mut headers = HttpHeaders::new();
            headers.push("Content-Type", "text/plain");
            headers.push("Content-Length", "12");
            let head = session.build_response_header(
                502,
                &Bytes::from_static(b"Bad Gateway"),
                &headers,
                false,
            );
            let mut out = BytesMut::from(&head[..]);
            out.extend_from_slice(b"Bad Gateway\n");
            self.write_ext(id, out.freeze());
        } else if session.mode == Mode::WebSocket && session.sent_response_header {
            let data = crate::session::build_ws_close(Some(1011));
            self.write_ext(id, data);
        }
        self.close_ext(id);
    }

    fn destroy_session(&mut self, id: &Bytes, _linger: bool) {
        if let Some(session) = self.sessions.remove(id) {
            self.by_ext.remove(&(session.sender, session.ext_id));
        }
        self.ws_in.remove(id);
    }
}
