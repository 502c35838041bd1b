//! WebSocket proxy session with the GRIP extension.
//!
//! The session relays frames between a client and a WebSocket origin. When
//! the origin negotiates the `grip` extension on its `101` response, the
//! origin's text frames become a control channel: frames with the control
//! prefix carry JSON control messages (consumed, forwarded to the handler),
//! frames with the negotiated message prefix are delivered to the client
//! with the prefix stripped, and anything else from the origin is dropped.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gripd_wire::wscontrol::{WsControlItem, WsControlMessage, WsMessageType};
use gripd_wire::zhttp::ContentType;
use gripd_x::HttpHeaders;
use gripd_zhttp::{ClientManager, ClientRequest, OutboundRequest, ServerRequest, SessionEvent};

use crate::routes::RouteEntry;

const CONTROL_PREFIX: &[u8] = b"c:";
const DEFAULT_MESSAGE_PREFIX: &[u8] = b"m:";

/// Sink for control items toward the handler.
pub type WsControlSink = mpsc::UnboundedSender<WsControlItem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOutcome {
    Finished,
    Failed,
}

pub struct WsProxySession {
    cid: Bytes,
    route: RouteEntry,
    client: ServerRequest,
    client_events: mpsc::UnboundedReceiver<SessionEvent>,
    zclient: ClientManager,
    control: WsControlSink,
    /// Items from the handler addressed to this session.
    handler_items: mpsc::UnboundedReceiver<WsControlItem>,

    grip_enabled: bool,
    message_prefix: Bytes,
    detached: bool,
}

impl WsProxySession {
    pub fn new(
        cid: Bytes,
        route: RouteEntry,
        mut client: ServerRequest,
        zclient: ClientManager,
        control: WsControlSink,
        handler_items: mpsc::UnboundedReceiver<WsControlItem>,
    ) -> Self {
        let client_events = client.take_events();
        Self {
            cid,
            route,
            client,
            client_events,
            zclient,
            control,
            handler_items,
            grip_enabled: false,
            message_prefix: Bytes::from_static(DEFAULT_MESSAGE_PREFIX),
            detached: false,
        }
    }

    pub async fn run(mut self) -> WsOutcome {
        let Some(target) = self.route.targets.first().cloned() else {
            self.client.error("bad-request");
            return WsOutcome::Failed;
        };

        // ask the origin for grip handling
        let mut headers = self.client.headers.clone();
        headers.push("Sec-WebSocket-Extensions", "grip");
        for (k, v) in &self.route.headers {
            headers.push(k.clone(), v.clone());
        }

        let mut outbound = self.zclient.create_request();
        let started = outbound
            .start(OutboundRequest {
                method: self.client.method.clone(),
                uri: self.client.uri.clone(),
                headers,
                body: self.client.body.clone(),
                more: false,
                connect_host: Some(target.connect_host.clone()),
                connect_port: Some(target.connect_port),
                ignore_policies: false,
                passthrough: None,
            })
            .await;
        if started.is_err() {
            self.client.error("remote-connection-failed");
            return WsOutcome::Failed;
        }

        // handshake response
        match outbound.next_event().await {
            Some(SessionEvent::Headers {
                code,
                reason,
                headers,
                ..
            }) => {
                if code == 101 {
                    self.inspect_extensions(&headers);
                }

                let mut client_headers = HttpHeaders::new();
                for (k, v) in headers.iter() {
                    // the grip extension is between us and the origin
                    if k.eq_ignore_ascii_case(b"Sec-WebSocket-Extensions")
                        && v.as_ref().starts_with(b"grip")
                    {
                        continue;
                    }
                    client_headers.push(k.clone(), v.clone());
                }
                let _ = self
                    .client
                    .begin_response(code, reason, client_headers, None);

                if code != 101 {
                    let _ = self.client.end_body();
                    outbound.cancel().await;
                    return WsOutcome::Finished;
                }
            }
            _ => {
                self.client.error("remote-connection-failed");
                outbound.cancel().await;
                return WsOutcome::Failed;
            }
        }

        if self.grip_enabled {
            info!(
                cid = %String::from_utf8_lossy(&self.cid),
                prefix = %String::from_utf8_lossy(&self.message_prefix),
                "grip enabled on websocket session"
            );
            let _ = self.control.send(WsControlItem::Here {
                cid: self.cid.clone(),
                uri: self.client.uri.clone(),
                channel_prefix: if self.route.prefix.is_empty() {
                    None
                } else {
                    Some(self.route.prefix.clone())
                },
                route: self.route.id.clone(),
            });
        }

        let outcome = self.relay(&mut outbound).await;
        if self.grip_enabled {
            let _ = self.control.send(WsControlItem::Gone {
                cid: self.cid.clone(),
            });
        }
        outcome
    }

    fn inspect_extensions(&mut self, headers: &HttpHeaders) {
        for member in headers.get_all_as_parameters("Sec-WebSocket-Extensions") {
            if member.principal().map(|p| p.as_ref()) == Some(b"grip".as_slice()) {
                self.grip_enabled = true;
                if let Some(prefix) = member.get("message-prefix") {
                    self.message_prefix = prefix.clone();
                }
            }
        }
    }

    async fn relay(&mut self, outbound: &mut ClientRequest) -> WsOutcome {
        let mut origin_gone = false;
        let mut refresh = tokio::time::interval(std::time::Duration::from_secs(30));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if self.grip_enabled {
                        let _ = self.control.send(WsControlItem::Here {
                            cid: self.cid.clone(),
                            uri: self.client.uri.clone(),
                            channel_prefix: if self.route.prefix.is_empty() {
                                None
                            } else {
                                Some(self.route.prefix.clone())
                            },
                            route: self.route.id.clone(),
                        });
                    }
                }
                event = outbound.next_event(), if !origin_gone => {
                    let Some(event) = event else {
                        if self.detached {
                            origin_gone = true;
                            continue;
                        }
                        self.close_client(Some(1011));
                        return WsOutcome::Failed;
                    };
                    match self.handle_origin_event(outbound, event).await {
                        Some(outcome) => return outcome,
                        None => {}
                    }
                }
                event = self.client_events.recv() => {
                    let Some(event) = event else {
                        outbound.close(Some(1001)).await.ok();
                        return WsOutcome::Finished;
                    };
                    match self.handle_client_event(outbound, event).await {
                        Some(outcome) => return outcome,
                        None => {}
                    }
                }
                item = self.handler_items.recv() => {
                    if let Some(item) = item {
                        match self.handle_handler_item(outbound, item).await {
                            Some(outcome) => return outcome,
                            None => {}
                        }
                    }
                }
            }
        }
    }

    async fn handle_origin_event(
        &mut self,
        outbound: &mut ClientRequest,
        event: SessionEvent,
    ) -> Option<WsOutcome> {
        match event {
            SessionEvent::Body {
                data, content_type, ..
            } => {
                if !self.grip_enabled {
                    let ct = content_type.unwrap_or(ContentType::Text);
                    let _ = self.client.write_ws(ct, data);
                    return None;
                }

                // grip mode: only single-frame text messages are meaningful
                if content_type != Some(ContentType::Text) {
                    debug!("dropping non-text origin frame in grip mode");
                    return None;
                }

                if data.starts_with(CONTROL_PREFIX) {
                    let payload = data.slice(CONTROL_PREFIX.len()..);
                    match serde_json::from_slice::<serde_json::Value>(&payload) {
                        Ok(json) => match WsControlMessage::from_json(&json) {
                            Ok(_) => {
                                let _ = self.control.send(WsControlItem::Grip {
                                    cid: self.cid.clone(),
                                    message: payload,
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "bad grip control message, dropping");
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "grip control frame is not JSON, dropping");
                        }
                    }
                    return None;
                }

                if data.starts_with(&self.message_prefix) {
                    let payload = data.slice(self.message_prefix.len()..);
                    let _ = self.client.write_ws(ContentType::Text, payload);
                    return None;
                }

                debug!("dropping unprefixed origin frame in grip mode");
                None
            }
            SessionEvent::Close { status } => {
                if self.detached {
                    return None;
                }
                self.close_client(status);
                outbound.close(status).await.ok();
                Some(WsOutcome::Finished)
            }
            SessionEvent::Error { .. } | SessionEvent::Cancelled => {
                if self.detached {
                    return None;
                }
                self.close_client(Some(1011));
                Some(WsOutcome::Failed)
            }
            _ => None,
        }
    }

    async fn handle_client_event(
        &mut self,
        outbound: &mut ClientRequest,
        event: SessionEvent,
    ) -> Option<WsOutcome> {
        match event {
            SessionEvent::Body {
                data, content_type, ..
            } => {
                if !self.detached {
                    let ct = content_type.unwrap_or(ContentType::Text);
                    let _ = outbound.write_ws(ct, data).await;
                }
                None
            }
            SessionEvent::Close { status } => {
                if !self.detached {
                    outbound.close(status).await.ok();
                }
                let _ = self.client.close(status);
                Some(WsOutcome::Finished)
            }
            SessionEvent::Error { .. } | SessionEvent::Cancelled => {
                if !self.detached {
                    outbound.close(Some(1001)).await.ok();
                }
                Some(WsOutcome::Finished)
            }
            _ => None,
        }
    }

    async fn handle_handler_item(
        &mut self,
        outbound: &mut ClientRequest,
        item: WsControlItem,
    ) -> Option<WsOutcome> {
        match item {
            WsControlItem::Send {
                message_type,
                content,
                ..
            } => {
                let ct = match message_type {
                    WsMessageType::Binary => ContentType::Binary,
                    _ => ContentType::Text,
                };
                let _ = self.client.write_ws(ct, content);
                None
            }
            WsControlItem::Close { code, .. } => {
                self.close_client(code);
                if !self.detached {
                    outbound.close(code).await.ok();
                }
                Some(WsOutcome::Finished)
            }
            WsControlItem::Detach { .. } => {
                debug!(cid = %String::from_utf8_lossy(&self.cid), "detaching from origin");
                self.detached = true;
                outbound.close(Some(1000)).await.ok();
                None
            }
            WsControlItem::Cancel { .. } => {
                self.client.cancel();
                if !self.detached {
                    outbound.close(Some(1001)).await.ok();
                }
                Some(WsOutcome::Failed)
            }
            _ => None,
        }
    }

    fn close_client(&mut self, status: Option<u16>) {
        let _ = self.client.close(status);
    }
}
