//! Proxy engine behavior with scripted edge, origin, and handler peers.

use bytes::Bytes;

use gripd_proxy::session::MAX_ACCEPT_REQUEST_BODY;
use gripd_proxy::{ProxyConfig, ProxyEngine, RouteTable};
use gripd_wire::accept::{AcceptData, RpcRequest, RpcResponse};
use gripd_wire::zhttp::{PacketType, ZhttpPacket};
use gripd_x::bus::{Bus, PubSocket, PullSocket, PushSocket, RouterSocket, SubSocket};
use gripd_x::stats::StatsConfig;
use gripd_x::HttpHeaders;
use gripd_zhttp::EndpointSpec;

const WAIT: std::time::Duration = std::time::Duration::from_secs(5);

struct FakeEdge {
    ident: Bytes,
    push: PushSocket,
    #[allow(dead_code)]
    router: RouterSocket,
    sub: SubSocket,
}

impl FakeEdge {
    fn new(bus: &Bus, prefix: &str) -> Self {
        let ident = Bytes::from_static(b"edge-1");
        let mut filter = ident.to_vec();
        filter.push(b' ');
        Self {
            ident: ident.clone(),
            push: bus.connect_push(&format!("{prefix}-edge-in")),
            router: bus
                .bind_router(&format!("{prefix}-edge-in-stream"), 100)
                .unwrap(),
            sub: bus.connect_sub(&format!("{prefix}-edge-out"), filter),
        }
    }

    async fn send_request(&self, id: &str, uri: &str, body: Bytes) {
        let mut headers = HttpHeaders::new();
        headers.push("Host", "example.com");
        let mut packet = ZhttpPacket::new(PacketType::Data, Bytes::copy_from_slice(id.as_bytes()));
        packet.from = self.ident.clone();
        packet.seq = Some(0);
        packet.credits = Some(100_000);
        packet.stream = true;
        packet.method = Some("GET".into());
        packet.uri = Some(uri.to_string());
        packet.headers = Some(headers);
        packet.body = Some(body);
        self.push.send(vec![packet.encode()]).await.unwrap();
    }

    async fn recv(&mut self) -> ZhttpPacket {
        loop {
            let msg = tokio::time::timeout(WAIT, self.sub.recv())
                .await
                .expect("timed out waiting for packet")
                .unwrap();
            let frame = msg[0].slice(self.ident.len() + 1..);
            let packet = ZhttpPacket::decode(&frame).unwrap();
            if packet.ptype != PacketType::KeepAlive {
                return packet;
            }
        }
    }

    /// Collect one full response's body for a given session id.
    async fn read_body(&mut self, id: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let packet = self.recv().await;
            if packet.id.as_ref() != id {
                continue;
            }
            if let Some(data) = &packet.body {
                body.extend_from_slice(data);
            }
            if !packet.more {
                return body;
            }
        }
    }
}

struct FakeOrigin {
    ident: Bytes,
    pull: PullSocket,
    #[allow(dead_code)]
    router: RouterSocket,
    publisher: PubSocket,
}

impl FakeOrigin {
    fn new(bus: &Bus, prefix: &str) -> Self {
        Self {
            ident: Bytes::from_static(b"origin-1"),
            pull: bus.bind_pull(&format!("{prefix}-origin-in"), 100).unwrap(),
            router: bus
                .bind_router(&format!("{prefix}-origin-in-stream"), 100)
                .unwrap(),
            publisher: bus.bind_pub(&format!("{prefix}-origin-out"), 100),
        }
    }

    async fn recv_request(&mut self) -> ZhttpPacket {
        let msg = tokio::time::timeout(WAIT, self.pull.recv())
            .await
            .expect("timed out waiting for origin request")
            .unwrap();
        ZhttpPacket::decode(&msg[0]).unwrap()
    }

    fn reply(&mut self, to: &Bytes, id: &Bytes, seq: u64, mut packet: ZhttpPacket) {
        packet.from = self.ident.clone();
        packet.id = id.clone();
        packet.seq = Some(seq);
        let mut frame = to.to_vec();
        frame.push(b' ');
        frame.extend_from_slice(&packet.encode());
        self.publisher.send(vec![Bytes::from(frame)]);
    }

    fn reply_error(&mut self, to: &Bytes, id: &Bytes, condition: &'static str) {
        let mut packet = ZhttpPacket::new(PacketType::Error, id.clone());
        packet.condition = Some(Bytes::from_static(condition.as_bytes()));
        self.reply(to, id, 0, packet);
    }

    fn reply_ok(&mut self, to: &Bytes, id: &Bytes, content_type: &'static str, body: &'static str) {
        let mut packet = ZhttpPacket::new(PacketType::Data, id.clone());
        packet.code = Some(200);
        packet.reason = Some(Bytes::from_static(b"OK"));
        let mut headers = HttpHeaders::new();
        headers.push("Content-Type", content_type);
        packet.headers = Some(headers);
        packet.body = Some(Bytes::from_static(body.as_bytes()));
        packet.credits = Some(100_000);
        packet.more = false;
        self.reply(to, id, 0, packet);
    }
}

struct FakeHandler {
    router: RouterSocket,
}

impl FakeHandler {
    fn new(bus: &Bus, prefix: &str) -> Self {
        Self {
            router: bus.bind_router(&format!("{prefix}-accept"), 100).unwrap(),
        }
    }

    /// Take one accept call and acknowledge it.
    async fn accept_one(&mut self) -> AcceptData {
        let (identity, msg) = tokio::time::timeout(WAIT, self.router.recv())
            .await
            .expect("timed out waiting for accept call")
            .unwrap();
        let frame = msg.into_iter().find(|f| !f.is_empty()).unwrap();
        let request = RpcRequest::decode(&frame).unwrap();
        let data = AcceptData::from_value(&request.args).unwrap();
        let reply = RpcResponse::ok(request.id, gripd_wire::TnValue::Bool(true));
        self.router
            .send_to(&identity, vec![Bytes::new(), reply.encode()])
            .await
            .unwrap();
        data
    }
}

fn start_engine(bus: &Bus, prefix: &str, routes: &[&str]) {
    let engine = ProxyEngine::new(
        bus,
        ProxyConfig {
            instance_id: Bytes::from(format!("{prefix}-proxy")),
            edge: EndpointSpec::new(format!("{prefix}-edge")),
            origin: EndpointSpec::new(format!("{prefix}-origin")),
            accept_endpoint: format!("{prefix}-accept"),
            wscontrol_in: format!("{prefix}-wsctl-in"),
            wscontrol_out: format!("{prefix}-wsctl-out"),
            stats_endpoint: format!("{prefix}-stats"),
        },
        RouteTable::from_lines(routes.iter().copied()).unwrap(),
        StatsConfig::default(),
    )
    .unwrap();
    let (_tx, rx) = tokio::sync::oneshot::channel();
    std::mem::forget(_tx);
    tokio::spawn(engine.run(rx));
}

#[tokio::test]
async fn failover_to_next_target_on_connect_error() {
    let bus = Bus::new();
    let mut edge = FakeEdge::new(&bus, "p1");
    let mut origin = FakeOrigin::new(&bus, "p1");
    let _handler = FakeHandler::new(&bus, "p1");
    start_engine(&bus, "p1", &["* 10.0.0.1:80 10.0.0.2:80"]);

    edge.send_request("r1", "http://example.com/x", Bytes::new())
        .await;

    let first = origin.recv_request().await;
    assert_eq!(first.connect_host.as_deref(), Some("10.0.0.1"));
    origin.reply_error(&first.from, &first.id, "remote-connection-failed");

    let second = origin.recv_request().await;
    assert_eq!(second.connect_host.as_deref(), Some("10.0.0.2"));
    origin.reply_ok(&second.from, &second.id, "text/plain", "recovered");

    let body = edge.read_body(b"r1").await;
    assert_eq!(body, b"recovered");
}

#[tokio::test]
async fn no_targets_left_yields_502() {
    let bus = Bus::new();
    let mut edge = FakeEdge::new(&bus, "p2");
    let mut origin = FakeOrigin::new(&bus, "p2");
    let _handler = FakeHandler::new(&bus, "p2");
    start_engine(&bus, "p2", &["* 10.0.0.1:80"]);

    edge.send_request("r1", "http://example.com/x", Bytes::new())
        .await;

    let first = origin.recv_request().await;
    origin.reply_error(&first.from, &first.id, "connection-timeout");

    let header = edge.recv().await;
    assert_eq!(header.code, Some(502));
}

#[tokio::test]
async fn length_required_maps_to_411() {
    let bus = Bus::new();
    let mut edge = FakeEdge::new(&bus, "p3");
    let mut origin = FakeOrigin::new(&bus, "p3");
    let _handler = FakeHandler::new(&bus, "p3");
    start_engine(&bus, "p3", &["* 10.0.0.1:80"]);

    edge.send_request("r1", "http://example.com/x", Bytes::new())
        .await;

    let first = origin.recv_request().await;
    origin.reply_error(&first.from, &first.id, "length-required");

    let header = edge.recv().await;
    assert_eq!(header.code, Some(411));
}

#[tokio::test]
async fn request_body_at_cap_keeps_accept_capability() {
    let bus = Bus::new();
    let mut edge = FakeEdge::new(&bus, "p4");
    let mut origin = FakeOrigin::new(&bus, "p4");
    let mut handler = FakeHandler::new(&bus, "p4");
    start_engine(&bus, "p4", &["* 10.0.0.1:80"]);

    let body = Bytes::from(vec![b'a'; MAX_ACCEPT_REQUEST_BODY]);
    edge.send_request("r1", "http://example.com/big", body.clone())
        .await;

    let first = origin.recv_request().await;
    let instruct = r#"{"hold":{"mode":"response","channels":[{"name":"c"}]},"response":{"body":"t\n"}}"#;
    origin.reply_ok(
        &first.from,
        &first.id,
        "application/grip-instruct",
        instruct,
    );

    // handoff: acknowledge the pause so the proxy can release the session
    let handoff = edge.recv().await;
    assert_eq!(handoff.ptype, PacketType::HandoffStart);
    let mut proceed = ZhttpPacket::new(PacketType::HandoffProceed, Bytes::from_static(b"r1"));
    proceed.from = edge.ident.clone();
    proceed.seq = Some(1);
    edge.router
        .send_to(
            &Bytes::from_static(b"p4-proxy"),
            vec![Bytes::new(), proceed.encode()],
        )
        .await
        .unwrap();

    let data = handler.accept_one().await;
    assert_eq!(data.request_data.body.len(), MAX_ACCEPT_REQUEST_BODY);
    assert_eq!(data.requests.len(), 1);
}

#[tokio::test]
async fn request_body_over_cap_loses_accept_capability() {
    let bus = Bus::new();
    let mut edge = FakeEdge::new(&bus, "p5");
    let mut origin = FakeOrigin::new(&bus, "p5");
    let _handler = FakeHandler::new(&bus, "p5");
    start_engine(&bus, "p5", &["* 10.0.0.1:80"]);

    let body = Bytes::from(vec![b'a'; MAX_ACCEPT_REQUEST_BODY + 1]);
    edge.send_request("r1", "http://example.com/big", body)
        .await;

    let first = origin.recv_request().await;
    let instruct = r#"{"hold":{"mode":"response","channels":[{"name":"c"}]},"response":{"body":"t\n"}}"#;
    origin.reply_ok(
        &first.from,
        &first.id,
        "application/grip-instruct",
        instruct,
    );

    // without accept capability the instruct response passes through raw
    let header = edge.recv().await;
    assert_eq!(header.code, Some(200));
    let ct = header
        .headers
        .as_ref()
        .unwrap()
        .get("Content-Type")
        .unwrap()
        .clone();
    assert_eq!(ct.as_ref(), b"application/grip-instruct");
}

#[tokio::test]
async fn identical_gets_share_one_upstream() {
    let bus = Bus::new();
    let mut edge = FakeEdge::new(&bus, "p6");
    let mut origin = FakeOrigin::new(&bus, "p6");
    let _handler = FakeHandler::new(&bus, "p6");
    start_engine(&bus, "p6", &["* 10.0.0.1:80"]);

    edge.send_request("r1", "http://example.com/shared", Bytes::new())
        .await;
    edge.send_request("r2", "http://example.com/shared", Bytes::new())
        .await;

    // only one upstream request is made
    let first = origin.recv_request().await;
    let second = tokio::time::timeout(
        std::time::Duration::from_millis(300),
        origin.recv_request(),
    )
    .await;
    assert!(second.is_err(), "second upstream request should not happen");

    origin.reply_ok(&first.from, &first.id, "text/plain", "shared-body");

    let b1 = edge.read_body(b"r1").await;
    let b2 = edge.read_body(b"r2").await;
    assert_eq!(b1, b"shared-body");
    assert_eq!(b2, b"shared-body");
}
