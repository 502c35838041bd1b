//! Held client connections.
//!
//! A hold session owns one client request after accept handoff and drives
//! it from publishes: a response hold answers once (first publish or
//! timeout), a stream hold appends published bodies with keep-alives, and
//! a no-hold session streams next-link fetches. Next-link follow-ups may
//! install a new instruction; the retry accounting for failed fetches
//! resets at each instruction transition, not at each write.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use gripd_wire::accept::AcceptData;
use gripd_x::{HttpHeaders, HttpResponseData};
use gripd_zhttp::{ClientManager, ClientRequest, OutboundRequest, ServerRequest, SessionEvent};
use url::Url;

use crate::instruct::{Channel, HoldMode, Instruct};
use crate::item::{PublishFormat, PublishItem};
use crate::jsonpatch;

pub const RETRY_TIMEOUT: Duration = Duration::from_millis(1000);
pub const RETRY_RAND_MAX: u64 = 1000;
pub const RETRY_MAX: u32 = 5;

/// Commands a hold session sends its engine.
#[derive(Debug)]
pub enum HoldCommand {
    Subscribe {
        session: u64,
        channel: String,
        sink: mpsc::UnboundedSender<PublishItem>,
    },
    Unsubscribe {
        session: u64,
        channel: String,
    },
    /// Session is gone; unsubscribe everything (with linger) and drop it.
    Finished {
        session: u64,
    },
    /// Keep-alive or delivery activity for stats.
    Activity {
        route: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendingFirstInstructResponse,
    SendingInitialResponse,
    Holding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    Finished,
    ClientGone,
    Errored,
}

pub struct HoldSession {
    id: u64,
    req: ServerRequest,
    adata: AcceptData,
    instruct: Instruct,
    zclient: ClientManager,
    commands: mpsc::UnboundedSender<HoldCommand>,
    publish_rx: mpsc::UnboundedReceiver<PublishItem>,
    publish_tx: mpsc::UnboundedSender<PublishItem>,

    state: State,
    channels: HashMap<String, Channel>,
    current_uri: Option<Url>,

    /// Bytes queued toward the client awaiting credit.
    write_buf: BytesMut,
    /// Whether response bytes went out since the current instruction was
    /// installed; gates next-link retries.
    sent_since_instruct: bool,
    response_begun: bool,

    out_req: Option<ClientRequest>,
    have_out_headers: bool,
    out_response: Option<HttpResponseData>,
    retries: u32,
    retry_at: Option<Instant>,

    timeout_at: Option<Instant>,
    keepalive_at: Option<Instant>,
}

impl HoldSession {
    pub fn new(
        id: u64,
        req: ServerRequest,
        adata: AcceptData,
        instruct: Instruct,
        zclient: ClientManager,
        commands: mpsc::UnboundedSender<HoldCommand>,
    ) -> Self {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let current_uri = Url::parse(&adata.request_data.uri).ok();
        let response_begun = adata.response_sent;

        Self {
            id,
            req,
            adata,
            instruct,
            zclient,
            commands,
            publish_rx,
            publish_tx,
            state: State::SendingFirstInstructResponse,
            channels: HashMap::new(),
            current_uri,
            write_buf: BytesMut::new(),
            sent_since_instruct: false,
            response_begun,
            out_req: None,
            have_out_headers: false,
            out_response: None,
            retries: 0,
            retry_at: None,
            timeout_at: None,
            keepalive_at: None,
        }
    }

    pub fn hold_mode(&self) -> HoldMode {
        self.instruct.hold_mode
    }

    pub async fn run(mut self) -> HoldOutcome {
        debug!(
            session = self.id,
            mode = ?self.instruct.hold_mode,
            "hold session starting"
        );

        // initial content toward the client
        if matches!(
            self.instruct.hold_mode,
            HoldMode::NoHold | HoldMode::StreamHold
        ) && !self.adata.response_sent
        {
            self.begin_instruct_response();
            let body = self.instruct.response.body.clone();
            self.queue_write(&body);
        }

        if self.write_buf.is_empty() {
            if let Some(outcome) = self.first_response_done() {
                return self.finish(outcome);
            }
        }

        loop {
            let timeout_fire = self.timeout_at;
            let keepalive_fire = self.keepalive_at;
            let retry_fire = self.retry_at;

            tokio::select! {
                item = self.publish_rx.recv() => {
                    let Some(item) = item else { break };
                    if let Some(outcome) = self.handle_publish(item) {
                        return self.finish(outcome);
                    }
                }
                event = self.req.next_event() => {
                    let Some(event) = event else {
                        return self.finish(HoldOutcome::ClientGone);
                    };
                    if let Some(outcome) = self.handle_client_event(event) {
                        return self.finish(outcome);
                    }
                }
                event = async {
                    match self.out_req.as_mut() {
                        Some(out) => out.next_event().await,
                        None => std::future::pending().await,
                    }
                }, if self.out_req.is_some() => {
                    if let Some(outcome) = self.handle_out_event(event).await {
                        return self.finish(outcome);
                    }
                }
                _ = async { sleep_until(timeout_fire.unwrap()).await }, if timeout_fire.is_some() => {
                    if let Some(outcome) = self.handle_timeout() {
                        return self.finish(outcome);
                    }
                }
                _ = async { sleep_until(keepalive_fire.unwrap()).await }, if keepalive_fire.is_some() => {
                    self.handle_keepalive();
                }
                _ = async { sleep_until(retry_fire.unwrap()).await }, if retry_fire.is_some() => {
                    self.retry_at = None;
                    self.request_next_link().await;
                }
            }
        }

        self.finish(HoldOutcome::Finished)
    }

    fn finish(&mut self, outcome: HoldOutcome) -> HoldOutcome {
        debug!(session = self.id, ?outcome, "hold session finishing");
        let _ = self.commands.send(HoldCommand::Finished { session: self.id });
        outcome
    }

    // ---- initial response path ----

    fn begin_instruct_response(&mut self) {
        let mut headers = self.instruct.response.headers.clone();
        headers.remove_all("Content-Length");
        if self.adata.auto_cross_origin {
            apply_cors_headers(&self.adata.request_data.headers, &mut headers);
        }
        let _ = self.req.begin_response(
            self.instruct.response.code,
            self.instruct.response.reason.clone(),
            headers,
            None,
        );
        self.response_begun = true;
    }

    /// Queue client-bound bytes and push out as much as credit allows.
    fn queue_write(&mut self, data: &Bytes) {
        self.write_buf.extend_from_slice(data);
        self.flush_writes();
    }

    fn flush_writes(&mut self) {
        while !self.write_buf.is_empty() {
            let avail = self.req.write_bytes_available();
            if avail == 0 {
                return;
            }
            let take = avail.min(self.write_buf.len());
            let chunk = self.write_buf.split_to(take).freeze();
            if self.req.write_body(chunk, true).is_err() {
                return;
            }
            self.sent_since_instruct = true;
        }
    }

    /// Called when the first instruct response body has fully gone out.
    /// Returns an outcome to finish immediately on setup errors.
    fn first_response_done(&mut self) -> Option<HoldOutcome> {
        match self.instruct.hold_mode {
            HoldMode::NoHold => {
                if self.instruct.next_link.is_none() {
                    warn!(session = self.id, "no-hold instruct without next link");
                    let _ = self.req.end_body();
                    return Some(HoldOutcome::Errored);
                }
                self.state = State::SendingInitialResponse;
                // fetch starts from the loop via retry_at immediately
                self.retry_at = Some(Instant::now());
                None
            }
            HoldMode::ResponseHold | HoldMode::StreamHold => {
                self.state = State::Holding;
                self.setup_hold();
                None
            }
        }
    }

    fn setup_hold(&mut self) {
        let channels: Vec<Channel> = self.instruct.channels.clone();
        for c in channels {
            let name = format!("{}{}", self.adata.channel_prefix, c.name);
            let _ = self.commands.send(HoldCommand::Subscribe {
                session: self.id,
                channel: name.clone(),
                sink: self.publish_tx.clone(),
            });
            self.channels.insert(name, c);
        }

        match self.instruct.hold_mode {
            HoldMode::ResponseHold => {
                self.timeout_at =
                    Some(Instant::now() + Duration::from_secs(self.instruct.timeout as u64));
            }
            HoldMode::StreamHold => {
                self.restart_keepalive();
            }
            HoldMode::NoHold => {}
        }
    }

    fn restart_keepalive(&mut self) {
        self.keepalive_at = self
            .instruct
            .keep_alive_timeout
            .map(|t| Instant::now() + Duration::from_secs(t as u64));
    }

    // ---- client events ----

    fn handle_client_event(&mut self, event: SessionEvent) -> Option<HoldOutcome> {
        match event {
            SessionEvent::Credit(_) => {
                self.flush_writes();
                if self.write_buf.is_empty() && self.state == State::SendingFirstInstructResponse {
                    return self.first_response_done();
                }
                None
            }
            SessionEvent::Cancelled | SessionEvent::Error { .. } | SessionEvent::Close { .. } => {
                Some(HoldOutcome::ClientGone)
            }
            _ => None,
        }
    }

    // ---- timers ----

    fn handle_timeout(&mut self) -> Option<HoldOutcome> {
        self.timeout_at = None;
        debug_assert_eq!(self.instruct.hold_mode, HoldMode::ResponseHold);

        // serve the stored timeout response verbatim
        let response = self.instruct.response.clone();
        self.respond(response.code, response.reason, response.headers, response.body);
        Some(HoldOutcome::Finished)
    }

    fn handle_keepalive(&mut self) {
        self.restart_keepalive();
        let data = self.instruct.keep_alive_data.clone();
        if (self.req.write_bytes_available()) < data.len() {
            debug!(session = self.id, "not enough credit for keep-alive, skipping");
            return;
        }
        if self.req.write_body(data, true).is_ok() {
            self.sent_since_instruct = true;
            let _ = self.commands.send(HoldCommand::Activity {
                route: self.adata.route.clone(),
            });
        }
    }

    // ---- publish delivery ----

    fn handle_publish(&mut self, item: PublishItem) -> Option<HoldOutcome> {
        if self.state != State::Holding {
            // not ready; publishes during transitions are dropped
            return None;
        }

        match self.instruct.hold_mode {
            HoldMode::ResponseHold => self.handle_publish_response(item),
            HoldMode::StreamHold => self.handle_publish_stream(item),
            HoldMode::NoHold => None,
        }
    }

    fn handle_publish_response(&mut self, item: PublishItem) -> Option<HoldOutcome> {
        let format = item.format_http_response()?.clone();
        let PublishFormat::HttpResponse {
            code,
            reason,
            headers,
            body,
            body_patch,
        } = format
        else {
            return None;
        };

        self.timeout_at = None;

        let body = match body_patch {
            Some(patch) => patch_stored_body(&self.instruct.response.body, &patch),
            None => body,
        };

        // inherit headers from the stored response, published headers win
        let mut merged = self.instruct.response.headers.clone();
        for (name, _) in headers.iter() {
            merged.remove_all(&String::from_utf8_lossy(name));
        }
        for (name, value) in headers.iter() {
            merged.push(name.clone(), value.clone());
        }

        self.respond(code, reason, merged, body);
        Some(HoldOutcome::Finished)
    }

    fn handle_publish_stream(&mut self, item: PublishItem) -> Option<HoldOutcome> {
        let format = item.format_http_stream()?.clone();
        let PublishFormat::HttpStream { body, close } = format else {
            return None;
        };

        if close {
            let _ = self.req.end_body();
            self.keepalive_at = None;
            return Some(HoldOutcome::Finished);
        }

        // per-channel ordering: a mismatched prev-id means we missed
        // something; recover through the next link when we have one
        if let Some(channel) = self.channels.get_mut(&item.channel) {
            if let (Some(expected), Some(prev_id)) = (&channel.prev_id, &item.prev_id) {
                if expected != prev_id {
                    info!(
                        session = self.id,
                        channel = %item.channel,
                        expected = %expected,
                        got = %prev_id,
                        "stream item out of order"
                    );
                    if self.instruct.next_link.is_some() {
                        self.state = State::SendingInitialResponse;
                        self.retry_at = Some(Instant::now());
                    }
                    return None;
                }
            }
            if let Some(id) = &item.id {
                channel.prev_id = Some(id.clone());
            }
        }

        if self.req.write_bytes_available() < body.len() {
            debug!(session = self.id, "not enough send credits, dropping");
            return None;
        }
        if self.req.write_body(body, true).is_ok() {
            self.sent_since_instruct = true;
            let _ = self.commands.send(HoldCommand::Activity {
                route: self.adata.route.clone(),
            });
        }
        self.restart_keepalive();
        None
    }

    fn respond(&mut self, code: u16, reason: Bytes, headers: HttpHeaders, body: Bytes) {
        let mut code = code;
        let mut reason = reason;
        let mut headers = headers;
        let mut body = body;

        headers.remove_all("Content-Length");

        if self.adata.auto_cross_origin {
            if let Some(callback) = self.adata.jsonp_callback.clone() {
                if self.adata.jsonp_extended_response {
                    let result = serde_json::json!({
                        "code": code,
                        "reason": String::from_utf8_lossy(&reason),
                        "headers": jsonp_header_map(&headers),
                        "body": String::from_utf8_lossy(&body),
                    });
                    let mut wrapped = Vec::new();
                    wrapped.extend_from_slice(b"/**/");
                    wrapped.extend_from_slice(&callback);
                    wrapped.push(b'(');
                    wrapped.extend_from_slice(result.to_string().as_bytes());
                    wrapped.extend_from_slice(b");\n");
                    body = Bytes::from(wrapped);
                } else {
                    let mut trimmed = body.as_ref();
                    if let Some(t) = trimmed.strip_suffix(b"\r\n") {
                        trimmed = t;
                    } else if let Some(t) = trimmed.strip_suffix(b"\n") {
                        trimmed = t;
                    }
                    let mut wrapped = Vec::new();
                    wrapped.extend_from_slice(b"/**/");
                    wrapped.extend_from_slice(&callback);
                    wrapped.push(b'(');
                    wrapped.extend_from_slice(trimmed);
                    wrapped.extend_from_slice(b");\n");
                    body = Bytes::from(wrapped);
                }

                headers.set("Content-Type", "application/javascript");
                code = 200;
                reason = Bytes::from_static(b"OK");
            } else {
                apply_cors_headers(&self.adata.request_data.headers, &mut headers);
            }
        }

        let _ = self.req.begin_response(code, reason, headers, None);
        let _ = self.req.write_body(body, false);
    }

    // ---- next-link fetches ----

    async fn request_next_link(&mut self) {
        let Some(link) = self.instruct.next_link.clone() else {
            return;
        };
        debug!(session = self.id, link = %link, "fetching next link");

        self.have_out_headers = false;
        self.out_response = None;

        let same_origin = self
            .current_uri
            .as_ref()
            .map(|u| {
                u.scheme() == link.scheme()
                    && u.host_str() == link.host_str()
                    && u.port_or_known_default() == link.port_or_known_default()
            })
            .unwrap_or(false);

        let mut passthrough = Vec::new();
        if same_origin {
            passthrough.push((
                Bytes::from_static(b"route"),
                gripd_wire::TnValue::Bool(true),
            ));
        } else {
            passthrough.push((
                Bytes::from_static(b"route"),
                gripd_wire::TnValue::Bool(false),
            ));
            // signing material travels only when the original request was
            // trusted and the link stays on the original host
            let same_host = self
                .current_uri
                .as_ref()
                .map(|u| u.host_str() == link.host_str())
                .unwrap_or(false);
            if self.adata.trusted && same_host {
                if let Some(iss) = &self.adata.sig_iss {
                    passthrough.push((
                        Bytes::from_static(b"sig-iss"),
                        gripd_wire::TnValue::Bytes(iss.clone()),
                    ));
                }
                if let Some(key) = &self.adata.sig_key {
                    passthrough.push((
                        Bytes::from_static(b"sig-key"),
                        gripd_wire::TnValue::Bytes(key.clone()),
                    ));
                }
                passthrough.push((
                    Bytes::from_static(b"trusted"),
                    gripd_wire::TnValue::Bool(true),
                ));
            }
        }

        // let the origin resume from what each channel last saw
        let mut headers = HttpHeaders::new();
        for (name, channel) in &self.channels {
            if let Some(prev_id) = &channel.prev_id {
                headers.push(
                    "Grip-Last",
                    Bytes::from(format!("{name}; last-id={prev_id}").into_bytes()),
                );
            }
        }

        let mut out = self.zclient.create_request();
        let started = out
            .start(OutboundRequest {
                method: "GET".into(),
                uri: link.to_string(),
                headers,
                body: Bytes::new(),
                more: false,
                connect_host: None,
                connect_port: None,
                ignore_policies: false,
                passthrough: Some(gripd_wire::TnValue::Map(passthrough)),
            })
            .await;

        match started {
            Ok(()) => self.out_req = Some(out),
            Err(_) => self.out_fetch_failed(),
        }
    }

    fn out_fetch_failed(&mut self) {
        self.out_req = None;
        debug!(session = self.id, "failed to retrieve next link");

        // retries are only legal while nothing has been sent since the
        // current instruction was installed
        if !self.sent_since_instruct && self.retries < RETRY_MAX {
            let mut delay = RETRY_TIMEOUT * 2u32.pow(self.retries);
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..RETRY_RAND_MAX));
            debug!(session = self.id, ?delay, "trying next link again later");
            self.retries += 1;
            self.retry_at = Some(Instant::now() + delay);
        } else {
            warn!(session = self.id, "giving up on next link");
            if self.adata.debug {
                let _ = self.req.write_body(
                    Bytes::from_static(b"\n\nFailed to retrieve next link.\n"),
                    true,
                );
            }
            let _ = self.req.end_body();
        }
    }

    async fn handle_out_event(&mut self, event: Option<SessionEvent>) -> Option<HoldOutcome> {
        let Some(event) = event else {
            self.out_fetch_failed();
            return None;
        };

        match event {
            SessionEvent::Headers {
                code,
                reason,
                headers,
                body,
                more,
                ..
            } => {
                self.have_out_headers = true;
                if !(200..300).contains(&code) {
                    self.out_req = None;
                    self.out_fetch_failed();
                    return None;
                }
                let mut response = HttpResponseData {
                    code,
                    reason,
                    headers,
                    body: Bytes::new(),
                };
                let mut collected = BytesMut::from(&body[..]);
                if !more {
                    response.body = collected.freeze();
                    self.out_req = None;
                    return self.next_link_response(response);
                }
                // stash partial state in out_response
                response.body = collected.split().freeze();
                self.out_response = Some(response);
                None
            }
            SessionEvent::Body { data, more, .. } => {
                let Some(response) = self.out_response.as_mut() else {
                    return None;
                };
                let mut collected = BytesMut::from(&response.body[..]);
                collected.extend_from_slice(&data);
                response.body = collected.freeze();
                if !more {
                    let response = self.out_response.take().expect("present");
                    self.out_req = None;
                    return self.next_link_response(response);
                }
                None
            }
            SessionEvent::Error { .. } | SessionEvent::Cancelled => {
                self.out_fetch_failed();
                None
            }
            _ => None,
        }
    }

    fn next_link_response(&mut self, response: HttpResponseData) -> Option<HoldOutcome> {
        self.retries = 0;

        let base = self.instruct.next_link.clone();
        let instruct = match Instruct::from_response(&response, base.as_ref()) {
            Ok(i) => i,
            Err(e) => {
                warn!(session = self.id, error = %e, "bad next link instruct");
                let _ = self.req.end_body();
                return Some(HoldOutcome::Errored);
            }
        };

        if instruct.hold_mode == HoldMode::ResponseHold {
            warn!(session = self.id, "next link returned a response hold");
            let _ = self.req.end_body();
            return Some(HoldOutcome::Errored);
        }

        // unsubscribe channels the new instruction dropped
        let new_names: Vec<String> = instruct
            .channels
            .iter()
            .map(|c| format!("{}{}", self.adata.channel_prefix, c.name))
            .collect();
        let old_names: Vec<String> = self.channels.keys().cloned().collect();
        for name in old_names {
            if !new_names.contains(&name) {
                self.channels.remove(&name);
                let _ = self.commands.send(HoldCommand::Unsubscribe {
                    session: self.id,
                    channel: name,
                });
            }
        }

        if let Some(uri) = &instruct.next_link {
            self.current_uri = Some(uri.clone());
        }
        self.instruct = instruct;
        // accounting resets here, at the instruction transition
        self.sent_since_instruct = false;

        let body = self.instruct.response.body.clone();
        self.queue_write(&body);

        match self.instruct.hold_mode {
            HoldMode::NoHold => {
                if self.instruct.next_link.is_some() {
                    self.state = State::SendingInitialResponse;
                    self.retry_at = Some(Instant::now());
                    None
                } else {
                    let _ = self.req.end_body();
                    Some(HoldOutcome::Finished)
                }
            }
            HoldMode::StreamHold => {
                self.state = State::Holding;
                self.setup_hold();
                None
            }
            HoldMode::ResponseHold => unreachable!("rejected above"),
        }
    }
}

/// Compact headers into a JSON map for the extended JSONP response.
/// Repeated names merge into one comma-joined value under the first
/// spelling seen.
fn jsonp_header_map(headers: &HttpHeaders) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        let name = String::from_utf8_lossy(name).to_string();
        let value = String::from_utf8_lossy(value).to_string();

        let existing = map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
            .map(|(k, _)| k.clone());
        match existing {
            Some(key) => {
                if let Some(Value::String(joined)) = map.get_mut(&key) {
                    joined.push_str(", ");
                    joined.push_str(&value);
                }
            }
            None => {
                map.insert(name, Value::String(value));
            }
        }
    }
    map
}

/// Apply a body patch to the stored instruct body, preserving its
/// trailing-newline style. A stored body that is not a JSON object or
/// array skips the patch and is emitted unchanged.
fn patch_stored_body(original: &Bytes, patch: &Value) -> Bytes {
    let parsed: Result<Value, _> = serde_json::from_slice(original);
    let doc = match parsed {
        Ok(doc @ (Value::Object(_) | Value::Array(_))) => doc,
        _ => {
            debug!("stored body is not JSON, skipping patch");
            return original.clone();
        }
    };

    match jsonpatch::apply(&doc, patch) {
        Ok(patched) => {
            let mut out = serde_json::to_vec(&patched).unwrap_or_default();
            if original.ends_with(b"\r\n") {
                out.extend_from_slice(b"\r\n");
            } else if original.ends_with(b"\n") {
                out.push(b'\n');
            }
            Bytes::from(out)
        }
        Err(e) => {
            debug!(error = %e, "patch failed, using stored body");
            original.clone()
        }
    }
}

/// Add permissive CORS headers mirroring the request's origin.
fn apply_cors_headers(request_headers: &HttpHeaders, headers: &mut HttpHeaders) {
    if headers.contains("Access-Control-Allow-Origin") {
        return;
    }
    let origin = request_headers
        .get("Origin")
        .cloned()
        .unwrap_or_else(|| Bytes::from_static(b"*"));
    headers.push("Access-Control-Allow-Origin", origin);
    if let Some(method) = request_headers.get("Access-Control-Request-Method") {
        headers.push("Access-Control-Allow-Methods", method.clone());
    }
    if let Some(h) = request_headers.get("Access-Control-Request-Headers") {
        headers.push("Access-Control-Allow-Headers", h.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_patch_preserves_newline_style() {
        let original = Bytes::from_static(b"{\"count\":1}\n");
        let patch = json!([{"op": "replace", "path": "/count", "value": 2}]);
        assert_eq!(
            patch_stored_body(&original, &patch).as_ref(),
            b"{\"count\":2}\n"
        );

        let original = Bytes::from_static(b"{\"count\":1}\r\n");
        assert_eq!(
            patch_stored_body(&original, &patch).as_ref(),
            b"{\"count\":2}\r\n"
        );
    }

    #[test]
    fn body_patch_on_non_json_body_is_skipped() {
        let original = Bytes::from_static(b"plain text\n");
        let patch = json!([{"op": "replace", "path": "/count", "value": 2}]);
        assert_eq!(patch_stored_body(&original, &patch), original);

        // scalar JSON is also not patchable
        let original = Bytes::from_static(b"42");
        assert_eq!(patch_stored_body(&original, &patch), original);
    }

    #[test]
    fn failed_patch_falls_back_to_stored_body() {
        let original = Bytes::from_static(b"{\"count\":1}");
        let patch = json!([{"op": "replace", "path": "/missing", "value": 2}]);
        assert_eq!(patch_stored_body(&original, &patch), original);
    }

    #[test]
    fn jsonp_header_map_joins_repeated_names() {
        let mut headers = HttpHeaders::new();
        headers.push("Set-Cookie", "a=1");
        headers.push("Content-Type", "text/plain");
        headers.push("set-cookie", "b=2");

        let map = jsonp_header_map(&headers);
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get("Set-Cookie").and_then(Value::as_str),
            Some("a=1, b=2")
        );
        assert_eq!(
            map.get("Content-Type").and_then(Value::as_str),
            Some("text/plain")
        );
    }

    #[test]
    fn cors_mirrors_origin() {
        let mut request_headers = HttpHeaders::new();
        request_headers.push("Origin", "https://app.example.com");
        let mut headers = HttpHeaders::new();
        apply_cors_headers(&request_headers, &mut headers);
        assert_eq!(
            headers.get("Access-Control-Allow-Origin").unwrap().as_ref(),
            b"https://app.example.com"
        );
    }

    #[test]
    fn cors_does_not_override_existing() {
        let mut headers = HttpHeaders::new();
        headers.push("Access-Control-Allow-Origin", "https://fixed.example.com");
        apply_cors_headers(&HttpHeaders::new(), &mut headers);
        assert_eq!(
            headers.get_all("Access-Control-Allow-Origin").len(),
            1
        );
    }
}
