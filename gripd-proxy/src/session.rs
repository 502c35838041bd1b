//! Proxy session: one upstream request serving one or more attached client
//! sessions.
//!
//! The session starts in `Requesting`, failing over across the route's
//! targets on connect-class errors. When response headers arrive it either
//! passes the response through (`Responding`) or, on a GRIP instruct
//! content type, buffers the full response and hands everything to the
//! handler (`Accepting`). Multiple clients may share one upstream; a late
//! attach replays the cached response, and the slowest receiver paces the
//! origin.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gripd_wire::accept::{AcceptData, AcceptRequestItem};
use gripd_wire::TnValue;
use gripd_x::{status_reason, HttpHeaders, HttpRequestData, HttpResponseData};
use gripd_zhttp::{
    ClientManager, ClientRequest, OutboundRequest, ServerHandle, ServerRequest, SessionEvent,
};

use crate::accept::{AcceptClient, AcceptOutcome};
use crate::routes::{RouteEntry, TargetKind};

/// Request-body retry buffer cap; past this the session loses accept
/// capability but keeps streaming.
pub const MAX_ACCEPT_REQUEST_BODY: usize = 100_000;

/// Response buffer cap while deciding on or performing an accept.
pub const MAX_ACCEPT_RESPONSE_BODY: usize = 100_000;

/// Shared-response replay cache cap; past this no further client may
/// attach.
pub const MAX_INITIAL_BUFFER: usize = 100_000;

/// Content type that triggers an accept.
const GRIP_INSTRUCT_TYPE: &[u8] = b"application/grip-instruct";

const RETRYABLE_CONDITIONS: &[&[u8]] = &[
    b"remote-connection-failed",
    b"connection-timeout",
    b"tls-error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Requesting,
    Accepting,
    Responding,
}

/// Everything a session needs from its engine.
#[derive(Clone)]
pub struct SessionContext {
    pub zclient: ClientManager,
    pub accept: AcceptClient,
    pub server: ServerHandle,
}

struct AttachedClient {
    idx: usize,
    req: ServerRequest,
    /// Bytes of the shared response this client has been given.
    cursor: usize,
    header_sent: bool,
    ended: bool,
}

/// How the session ended, for the engine's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Passthrough,
    Accepted,
    AcceptRejected,
    Failed,
    ClientGone,
}

pub struct ProxySession {
    ctx: SessionContext,
    route: RouteEntry,
    state: State,

    clients: Vec<AttachedClient>,
    client_events: mpsc::UnboundedReceiver<(usize, SessionEvent)>,
    client_events_tx: mpsc::UnboundedSender<(usize, SessionEvent)>,
    next_client_idx: usize,
    attach_rx: Option<mpsc::UnboundedReceiver<ServerRequest>>,

    request_data: HttpRequestData,
    req_body: BytesMut,
    req_body_over: bool,
    req_finished: bool,
    trusted_client: bool,
    peer_address: Option<String>,

    outbound: Option<ClientRequest>,
    target_index: usize,
    /// Request bytes not yet accepted by the origin (credit wait).
    out_pending: BytesMut,
    out_pending_done: bool,
    test_responded: bool,

    resp_code: u16,
    resp_reason: Bytes,
    resp_headers: HttpHeaders,
    /// Buffered instruct response while accepting.
    resp_body: BytesMut,
    /// Shared replay cache while responding.
    resp_cache: BytesMut,
    resp_complete: bool,
    add_not_allowed: bool,
    /// Origin credit already granted back (slowest-client progress).
    granted: usize,
}

impl ProxySession {
    /// Create a session around its first client.
    pub fn new(ctx: SessionContext, route: RouteEntry, first: ServerRequest) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let trusted_client = first
            .passthrough
            .as_ref()
            .and_then(|p| p.get("trusted"))
            .and_then(TnValue::as_bool)
            .unwrap_or(false);

        let request_data = HttpRequestData {
            method: first.method.clone(),
            uri: first.uri.clone(),
            headers: first.headers.clone(),
            body: Bytes::new(),
        };

        let mut session = Self {
            ctx,
            route,
            state: State::Requesting,
            clients: Vec::new(),
            client_events: rx,
            client_events_tx: tx,
            next_client_idx: 0,
            attach_rx: None,
            request_data,
            req_body: BytesMut::new(),
            req_body_over: false,
            req_finished: !first.more,
            trusted_client,
            peer_address: first.peer_address.clone(),
            outbound: None,
            target_index: 0,
            out_pending: BytesMut::new(),
            out_pending_done: false,
            test_responded: false,
            resp_code: 0,
            resp_reason: Bytes::new(),
            resp_headers: HttpHeaders::new(),
            resp_body: BytesMut::new(),
            resp_cache: BytesMut::new(),
            resp_complete: false,
            add_not_allowed: false,
            granted: 0,
        };

        let body = first.body.clone();
        session.buffer_request_body(&body);
        session.push_client(first);
        session
    }

    /// Whether another client session may share this upstream.
    pub fn can_attach(&self) -> bool {
        !self.add_not_allowed && !self.resp_complete && self.state != State::Accepting
    }

    /// Channel the engine uses to route additional clients with the same
    /// request here.
    pub fn attach_sender(&mut self) -> mpsc::UnboundedSender<ServerRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach_rx = Some(rx);
        tx
    }

    /// Stop accepting attaches; anything already queued gets the cached
    /// response if we have all of it, or is told to retry.
    fn close_attach(&mut self) {
        let Some(mut rx) = self.attach_rx.take() else {
            return;
        };
        rx.close();
        while let Ok(mut req) = rx.try_recv() {
            if self.resp_complete && self.state == State::Responding {
                let headers = self.passthrough_headers();
                let _ = req.begin_response(
                    self.resp_code,
                    self.resp_reason.clone(),
                    headers,
                    None,
                );
                let _ = req.write_body(Bytes::copy_from_slice(&self.resp_cache), false);
            } else {
                let mut headers = HttpHeaders::new();
                headers.push("Content-Type", "text/plain");
                let _ = req.begin_response(
                    503,
                    Bytes::from_static(b"Service Unavailable"),
                    headers,
                    None,
                );
                let _ = req.write_body(Bytes::from_static(b"try again\n"), false);
            }
        }
    }

    /// Attach another client to the shared upstream. A late attach replays
    /// the response cached so far.
    pub fn attach(&mut self, req: ServerRequest) {
        debug_assert!(self.can_attach());
        self.push_client(req);

        if self.state == State::Responding {
            self.send_headers();
            let client = self.clients.last_mut().expect("just pushed");
            flush_one(&self.resp_cache, self.resp_complete, client);
        }
    }

    fn push_client(&mut self, mut req: ServerRequest) {
        let idx = self.next_client_idx;
        self.next_client_idx += 1;

        let mut events = req.take_events();
        let tx = self.client_events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((idx, event)).is_err() {
                    break;
                }
            }
        });

        self.clients.push(AttachedClient {
            idx,
            req,
            cursor: 0,
            header_sent: false,
            ended: false,
        });
    }

    fn buffer_request_body(&mut self, data: &Bytes) {
        if self.req_body_over {
            return;
        }
        if self.req_body.len() + data.len() > MAX_ACCEPT_REQUEST_BODY {
            debug!("request body exceeds retry buffer, accept disabled");
            self.req_body.clear();
            self.req_body_over = true;
            return;
        }
        self.req_body.extend_from_slice(data);
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> SessionOutcome {
        if !self.start_outbound().await {
            self.respond_error(502, "no route targets");
            return SessionOutcome::Failed;
        }
        if self.test_responded {
            return SessionOutcome::Passthrough;
        }

        loop {
            if !self.can_attach() {
                self.close_attach();
            }
            let have_outbound = self.outbound.is_some();
            let can_take_attach = self.attach_rx.is_some();

            tokio::select! {
                event = async {
                    match self.outbound.as_mut() {
                        Some(out) => out.next_event().await,
                        None => std::future::pending().await,
                    }
                }, if have_outbound => {
                    let event = event.unwrap_or(SessionEvent::Cancelled);
                    if let Some(outcome) = self.handle_outbound_event(event).await {
                        return outcome;
                    }
                }
                Some((idx, event)) = self.client_events.recv() => {
                    if let Some(outcome) = self.handle_client_event(idx, event).await {
                        return outcome;
                    }
                }
                req = async {
                    match self.attach_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                }, if can_take_attach => {
                    match req {
                        Some(req) => self.attach(req),
                        None => {
                            // engine let go of the share slot
                            self.attach_rx = None;
                        }
                    }
                }
            }
        }
    }

    async fn start_outbound(&mut self) -> bool {
        loop {
            let Some(target) = self.route.targets.get(self.target_index).cloned() else {
                return false;
            };

            if target.kind == TargetKind::Test {
                self.respond_test();
                self.test_responded = true;
                return true;
            }

            let mut url = match url::Url::parse(&self.request_data.uri) {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "request uri unparsable");
                    return false;
                }
            };

            let is_ws = matches!(url.scheme(), "ws" | "wss");
            let scheme = match (is_ws, target.ssl) {
                (true, true) => "wss",
                (true, false) => "ws",
                (false, true) => "https",
                (false, false) => "http",
            };
            let _ = url.set_scheme(scheme);
            if let Some(as_host) = &self.route.as_host {
                let _ = url.set_host(Some(as_host));
            }
            let new_path = self.route.transform_path(url.path());
            url.set_path(&new_path);

            let mut headers = self.request_data.headers.clone();
            for (k, v) in &self.route.headers {
                headers.push(k.clone(), v.clone());
            }

            let mut out = self.ctx.zclient.create_request();
            let body = if self.req_body_over {
                Bytes::new()
            } else {
                Bytes::copy_from_slice(&self.req_body)
            };
            let started = out
                .start(OutboundRequest {
                    method: self.request_data.method.clone(),
                    uri: url.to_string(),
                    headers,
                    body,
                    more: !self.req_finished,
                    connect_host: Some(target.connect_host.clone()),
                    connect_port: Some(target.connect_port),
                    ignore_policies: false,
                    passthrough: None,
                })
                .await;

            match started {
                Ok(()) => {
                    self.outbound = Some(out);
                    return true;
                }
                Err(e) => {
                    debug!(error = %e, "target unavailable, trying next");
                    self.target_index += 1;
                }
            }
        }
    }

    async fn handle_outbound_event(&mut self, event: SessionEvent) -> Option<SessionOutcome> {
        match event {
            SessionEvent::Headers {
                code,
                reason,
                headers,
                body,
                more,
                ..
            } => {
                // an overrun request buffer means we could not replay the
                // request, so accept capability is gone
                let instruct_type = headers
                    .get_first_parameter("Content-Type")
                    .map(|t| t.as_ref() == GRIP_INSTRUCT_TYPE)
                    .unwrap_or(false);
                let grip_headers = headers.contains("Grip-Hold")
                    || headers.contains("Grip-Channel")
                    || headers.contains("Grip-Link");
                let is_grip =
                    !self.trusted_client && !self.req_body_over && (instruct_type || grip_headers);

                self.resp_code = code;
                self.resp_reason = reason;
                self.resp_headers = headers;

                if is_grip {
                    self.state = State::Accepting;
                    if body.len() > MAX_ACCEPT_RESPONSE_BODY {
                        self.respond_error(502, "grip response too large");
                        return Some(SessionOutcome::Failed);
                    }
                    self.resp_body.extend_from_slice(&body);
                    if !more {
                        return Some(self.do_accept().await);
                    }
                } else {
                    self.state = State::Responding;
                    self.send_headers();
                    self.stream_to_clients(&body, more).await;
                    if !more {
                        return Some(SessionOutcome::Passthrough);
                    }
                }
                None
            }
            SessionEvent::Body { data, more, .. } => match self.state {
                State::Accepting => {
                    if self.resp_body.len() + data.len() > MAX_ACCEPT_RESPONSE_BODY {
                        self.respond_error(502, "grip response too large");
                        return Some(SessionOutcome::Failed);
                    }
                    self.resp_body.extend_from_slice(&data);
                    if !more {
                        return Some(self.do_accept().await);
                    }
                    None
                }
                State::Responding => {
                    self.stream_to_clients(&data, more).await;
                    if !more {
                        return Some(SessionOutcome::Passthrough);
                    }
                    None
                }
                State::Requesting => None,
            },
            SessionEvent::Credit(_) => {
                self.flush_out_pending().await;
                None
            }
            SessionEvent::Error { condition } => self.handle_outbound_failure(condition).await,
            SessionEvent::Cancelled => {
                self.handle_outbound_failure(Bytes::from_static(b"disconnected"))
                    .await
            }
            SessionEvent::Close { .. }
            | SessionEvent::HandoffStart
            | SessionEvent::HandoffProceed => None,
        }
    }

    async fn handle_outbound_failure(&mut self, condition: Bytes) -> Option<SessionOutcome> {
        if self.state == State::Requesting {
            let retryable = RETRYABLE_CONDITIONS.iter().any(|c| *c == condition);
            if retryable && !self.req_body_over {
                self.target_index += 1;
                self.outbound = None;
                debug!(
                    condition = %String::from_utf8_lossy(&condition),
                    target = self.target_index,
                    "trying next target"
                );
                if self.start_outbound().await {
                    return None;
                }
                self.respond_error(502, "no remaining targets");
                return Some(SessionOutcome::Failed);
            }
            if condition.as_ref() == b"length-required" {
                self.respond_error(411, "length required");
                return Some(SessionOutcome::Failed);
            }
            self.respond_error(502, "upstream error");
            return Some(SessionOutcome::Failed);
        }

        // mid-response: a partial response cannot be repaired, drop quietly
        debug!(
            condition = %String::from_utf8_lossy(&condition),
            "upstream failed mid-response, dropping clients"
        );
        for client in &mut self.clients {
            client.req.cancel();
        }
        Some(SessionOutcome::Failed)
    }

    async fn handle_client_event(
        &mut self,
        idx: usize,
        event: SessionEvent,
    ) -> Option<SessionOutcome> {
        match event {
            SessionEvent::Body { data, more, .. } => {
                self.buffer_request_body(&data);
                if !more {
                    self.req_finished = true;
                }
                self.out_pending.extend_from_slice(&data);
                if !more {
                    self.out_pending_done = true;
                }
                self.flush_out_pending().await;

                // replenish the client's request-body credit as we consume
                if !data.is_empty() {
                    if let Some(client) = self.clients.iter_mut().find(|c| c.idx == idx) {
                        let _ = client.req.send_credit(data.len() as u32).await;
                    }
                }
                None
            }
            SessionEvent::Credit(_) => {
                self.flush_clients().await;
                None
            }
            SessionEvent::Cancelled | SessionEvent::Error { .. } | SessionEvent::Close { .. } => {
                debug!(idx, "client departed");
                self.clients.retain(|c| c.idx != idx);
                if self.clients.is_empty() {
                    if let Some(out) = self.outbound.take() {
                        out.cancel().await;
                    }
                    return Some(SessionOutcome::ClientGone);
                }
                None
            }
            _ => None,
        }
    }

    async fn flush_out_pending(&mut self) {
        let Some(out) = self.outbound.as_mut() else {
            return;
        };
        while !self.out_pending.is_empty() {
            let avail = out.write_bytes_available();
            if avail == 0 {
                return;
            }
            let take = avail.min(self.out_pending.len());
            let chunk = self.out_pending.split_to(take).freeze();
            let more = !(self.out_pending.is_empty() && self.out_pending_done);
            if out.write_body(chunk, more).await.is_err() {
                return;
            }
        }
        if self.out_pending_done {
            self.out_pending_done = false;
        }
    }

    /// Headers for the client-facing response in passthrough mode.
    fn passthrough_headers(&self) -> HttpHeaders {
        let mut headers = HttpHeaders::new();
        for (k, v) in self.resp_headers.iter() {
            let drop = k.eq_ignore_ascii_case(b"Connection")
                || k.eq_ignore_ascii_case(b"Keep-Alive")
                || k.eq_ignore_ascii_case(b"Content-Encoding")
                || k.eq_ignore_ascii_case(b"Transfer-Encoding");
            if !drop {
                headers.push(k.clone(), v.clone());
            }
        }
        if !headers.contains("Content-Length") {
            headers.push("Transfer-Encoding", "chunked");
        }
        headers
    }

    fn send_headers(&mut self) {
        let headers = self.passthrough_headers();
        let code = self.resp_code;
        let reason = self.resp_reason.clone();
        for client in &mut self.clients {
            if client.header_sent {
                continue;
            }
            let _ = client
                .req
                .begin_response(code, reason.clone(), headers.clone(), None);
            client.header_sent = true;
        }
    }

    async fn stream_to_clients(&mut self, data: &Bytes, more: bool) {
        if self.resp_cache.len() + data.len() > MAX_INITIAL_BUFFER {
            self.add_not_allowed = true;
        }
        self.resp_cache.extend_from_slice(data);
        if !more {
            self.resp_complete = true;
            self.add_not_allowed = true;
        }
        self.flush_clients().await;
    }

    async fn flush_clients(&mut self) {
        for client in &mut self.clients {
            flush_one(&self.resp_cache, self.resp_complete, client);
        }

        // origin credit follows the slowest receiver
        let min_cursor = self
            .clients
            .iter()
            .map(|c| c.cursor)
            .min()
            .unwrap_or(self.resp_cache.len());
        if min_cursor > self.granted {
            let delta = (min_cursor - self.granted) as u32;
            self.granted = min_cursor;
            if let Some(out) = self.outbound.as_mut() {
                let _ = out.send_credit(delta).await;
            }
        }
    }

    fn respond_test(&mut self) {
        let body = Bytes::from_static(b"test response\n");
        let mut headers = HttpHeaders::new();
        headers.push("Content-Type", "text/plain");
        headers.push(
            "Content-Length",
            Bytes::from(body.len().to_string().into_bytes()),
        );
        for client in &mut self.clients {
            let _ = client
                .req
                .begin_response(200, Bytes::from_static(b"OK"), headers.clone(), None);
            let _ = client.req.write_body(body.clone(), false);
        }
    }

    fn respond_error(&mut self, code: u16, message: &str) {
        info!(code, message, "responding with error");
        let body = Bytes::from(format!("{message}\n").into_bytes());
        let mut headers = HttpHeaders::new();
        headers.push("Content-Type", "text/plain");
        headers.push(
            "Content-Length",
            Bytes::from(body.len().to_string().into_bytes()),
        );
        let reason = Bytes::from_static(status_reason(code).as_bytes());
        for client in &mut self.clients {
            if client.header_sent {
                client.req.cancel();
                continue;
            }
            let _ = client
                .req
                .begin_response(code, reason.clone(), headers.clone(), None);
            let _ = client.req.write_body(body.clone(), false);
        }
    }

    async fn do_accept(&mut self) -> SessionOutcome {
        debug!("grip response complete, accepting");

        // pause every attached session, waiting on each acknowledgment
        let mut paused = Vec::with_capacity(self.clients.len());
        for mut client in self.clients.drain(..) {
            if client.req.start_handoff().is_err() {
                continue;
            }
            paused.push(client);
        }

        let mut released = Vec::with_capacity(paused.len());
        for mut client in paused {
            let idx = client.idx;
            let proceed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
                loop {
                    match self.client_events.recv().await {
                        Some((i, SessionEvent::HandoffProceed)) if i == idx => break true,
                        Some((i, SessionEvent::Cancelled | SessionEvent::Error { .. }))
                            if i == idx =>
                        {
                            break false
                        }
                        Some(_) => continue,
                        None => break false,
                    }
                }
            })
            .await
            .unwrap_or(false);

            if proceed {
                released.push(client.req.release());
            } else {
                client.req.cancel();
            }
        }

        if released.is_empty() {
            if let Some(out) = self.outbound.take() {
                out.cancel().await;
            }
            return SessionOutcome::ClientGone;
        }

        let target_trusted = self
            .route
            .targets
            .get(self.target_index)
            .map(|t| t.trusted)
            .unwrap_or(false);

        let data = AcceptData {
            requests: released
                .iter()
                .map(|s| AcceptRequestItem {
                    rid: s.rid.clone(),
                    out_seq: s.out_seq,
                    in_seq: s.in_seq,
                    out_credits: s.out_credits,
                    user_data: s.user_data.clone(),
                })
                .collect(),
            request_data: HttpRequestData {
                method: self.request_data.method.clone(),
                uri: self.request_data.uri.clone(),
                headers: self.request_data.headers.clone(),
                body: if self.req_body_over {
                    Bytes::new()
                } else {
                    Bytes::copy_from_slice(&self.req_body)
                },
            },
            response_data: HttpResponseData {
                code: self.resp_code,
                reason: self.resp_reason.clone(),
                headers: self.resp_headers.clone(),
                body: self.resp_body.clone().freeze(),
            },
            route: self.route.id.clone(),
            channel_prefix: self.route.prefix.clone(),
            peer_address: self.peer_address.clone(),
            auto_cross_origin: self.route.auto_cross_origin,
            jsonp_callback: None,
            jsonp_extended_response: false,
            sig_iss: self.route.sig_iss.clone(),
            sig_key: self.route.sig_key.clone(),
            trusted: target_trusted,
            sid: None,
            response_sent: false,
            debug: self.route.debug,
        };

        let outcome = self.ctx.accept.accept(&data).await;

        if let Some(out) = self.outbound.take() {
            out.cancel().await;
        }

        match outcome {
            AcceptOutcome::Accepted => SessionOutcome::Accepted,
            AcceptOutcome::Rejected(condition) => {
                info!(
                    condition = %String::from_utf8_lossy(&condition),
                    "accept rejected, serving buffered response"
                );
                for state in released {
                    let mut req = self.ctx.server.restore(state, false);
                    let _ = req.begin_response(
                        self.resp_code,
                        self.resp_reason.clone(),
                        self.resp_headers.clone(),
                        None,
                    );
                    let _ = req.write_body(self.resp_body.clone().freeze(), false);
                }
                SessionOutcome::AcceptRejected
            }
        }
    }
}

fn flush_one(cache: &BytesMut, complete: bool, client: &mut AttachedClient) {
    if client.ended || !client.header_sent {
        return;
    }
    while client.cursor < cache.len() {
        let avail = client.req.write_bytes_available();
        if avail == 0 {
            return;
        }
        let end = (client.cursor + avail).min(cache.len());
        let chunk = Bytes::copy_from_slice(&cache[client.cursor..end]);
        let last = complete && end == cache.len();
        if client.req.write_body(chunk, !last).is_err() {
            return;
        }
        client.cursor = end;
        if last {
            client.ended = true;
        }
    }
    if complete && !client.ended && client.cursor == cache.len() {
        if client.req.write_body(Bytes::new(), false).is_ok() {
            client.ended = true;
        }
    }
}
