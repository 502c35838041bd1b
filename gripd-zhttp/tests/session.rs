//! End-to-end session behavior over the bus, with hand-rolled edge and
//! origin peers standing in for the adapters.

use bytes::Bytes;

use gripd_wire::zhttp::{PacketType, ZhttpPacket};
use gripd_x::bus::{Bus, RouterSocket, SubSocket};
use gripd_x::HttpHeaders;
use gripd_zhttp::{
    ClientManager, EndpointSpec, OutboundRequest, ServerManager, SessionEvent,
};

/// A fake edge web-server adapter: pushes first packets, owns the stream
/// router, and subscribes to worker responses.
struct FakeEdge {
    ident: Bytes,
    push: gripd_x::bus::PushSocket,
    router: RouterSocket,
    sub: SubSocket,
    out_seq: u64,
}

impl FakeEdge {
    fn new(bus: &Bus, spec: &EndpointSpec, ident: &'static str) -> Self {
        let ident = Bytes::from_static(ident.as_bytes());
        let mut prefix = ident.to_vec();
        prefix.push(b' ');
        Self {
            ident: ident.clone(),
            push: bus.connect_push(&spec.in_endpoint()),
            router: bus.bind_router(&spec.in_stream_endpoint(), 100).unwrap(),
            sub: bus.connect_sub(&spec.out_endpoint(), prefix),
            out_seq: 0,
        }
    }

    async fn send_request(&mut self, id: &str, method: &str, uri: &str, credits: u32, more: bool) {
        let mut headers = HttpHeaders::new();
        headers.push("Host", "example.com");
        let mut packet = ZhttpPacket::new(PacketType::Data, Bytes::copy_from_slice(id.as_bytes()));
        packet.from = self.ident.clone();
        packet.seq = Some(0);
        packet.credits = Some(credits);
        packet.stream = true;
        packet.more = more;
        packet.method = Some(method.to_string());
        packet.uri = Some(uri.to_string());
        packet.headers = Some(headers);
        packet.body = Some(Bytes::new());
        self.out_seq = 1;
        self.push.send(vec![packet.encode()]).await.unwrap();
    }

    async fn send_stream(&mut self, to: &Bytes, mut packet: ZhttpPacket) {
        packet.from = self.ident.clone();
        packet.seq = Some(self.out_seq);
        self.out_seq += 1;
        self.router
            .send_to(to, vec![Bytes::new(), packet.encode()])
            .await
            .unwrap();
    }

    /// Receive the next worker packet addressed to us.
    async fn recv(&mut self) -> ZhttpPacket {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), self.sub.recv())
            .await
            .expect("timed out waiting for packet")
            .unwrap();
        let frame = msg[0].slice(self.ident.len() + 1..);
        ZhttpPacket::decode(&frame).unwrap()
    }
}

/// A fake origin fetcher: pulls first packets, owns the stream router,
/// publishes responses.
struct FakeOrigin {
    ident: Bytes,
    pull: gripd_x::bus::PullSocket,
    #[allow(dead_code)]
    router: RouterSocket,
    publisher: gripd_x::bus::PubSocket,
    out_seq: u64,
}

impl FakeOrigin {
    fn new(bus: &Bus, spec: &EndpointSpec, ident: &'static str) -> Self {
        Self {
            ident: Bytes::from_static(ident.as_bytes()),
            pull: bus.bind_pull(&spec.in_endpoint(), 100).unwrap(),
            router: bus.bind_router(&spec.in_stream_endpoint(), 100).unwrap(),
            publisher: bus.bind_pub(&spec.out_endpoint(), 100),
            out_seq: 0,
        }
    }

    async fn recv_request(&mut self) -> ZhttpPacket {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), self.pull.recv())
            .await
            .expect("timed out waiting for request")
            .unwrap();
        ZhttpPacket::decode(&msg[0]).unwrap()
    }

    fn publish(&mut self, to: &Bytes, mut packet: ZhttpPacket) {
        packet.from = self.ident.clone();
        packet.seq = Some(self.out_seq);
        self.out_seq += 1;
        let mut frame = to.to_vec();
        frame.push(b' ');
        frame.extend_from_slice(&packet.encode());
        self.publisher.send(vec![Bytes::from(frame)]);
    }
}

#[tokio::test]
async fn server_accepts_and_responds() {
    let bus = Bus::new();
    let spec = EndpointSpec::new("edge-a");
    let mut edge = FakeEdge::new(&bus, &spec, "edge-1");
    let mut server = ServerManager::new(&bus, "proxy-1", &spec, true).unwrap();

    edge.send_request("r1", "GET", "http://example.com/x", 100_000, false)
        .await;

    let mut req = server.accept().await.unwrap();
    assert_eq!(req.method, "GET");
    assert_eq!(req.uri, "http://example.com/x");
    assert_eq!(req.headers.get("Host").unwrap().as_ref(), b"example.com");
    assert!(!req.more);
    assert_eq!(req.write_bytes_available(), 100_000);

    let mut headers = HttpHeaders::new();
    headers.push("Content-Type", "text/plain");
    req.begin_response(200, Bytes::from_static(b"OK"), headers, None)
        .unwrap();
    req.write_body(Bytes::from_static(b"hi"), false).unwrap();

    let header_packet = edge.recv().await;
    assert_eq!(header_packet.seq, Some(0));
    assert_eq!(header_packet.code, Some(200));
    assert_eq!(header_packet.from.as_ref(), b"proxy-1");
    assert!(header_packet.more);

    let body_packet = edge.recv().await;
    assert_eq!(body_packet.seq, Some(1));
    assert_eq!(body_packet.body.unwrap().as_ref(), b"hi");
    assert!(!body_packet.more);

    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn response_writes_respect_credit() {
    let bus = Bus::new();
    let spec = EndpointSpec::new("edge-b");
    let mut edge = FakeEdge::new(&bus, &spec, "edge-1");
    let mut server = ServerManager::new(&bus, "proxy-1", &spec, true).unwrap();

    edge.send_request("r1", "GET", "http://example.com/big", 4, false)
        .await;
    let mut req = server.accept().await.unwrap();

    req.begin_response(200, Bytes::from_static(b"OK"), HttpHeaders::new(), None)
        .unwrap();
    let _ = edge.recv().await;

    // only 4 bytes of credit: a 10-byte write must be refused
    let err = req.write_body(Bytes::from_static(b"0123456789"), true);
    assert!(err.is_err());

    req.write_body(Bytes::from_static(b"0123"), true).unwrap();
    assert_eq!(edge.recv().await.body.unwrap().as_ref(), b"0123");
    assert_eq!(req.write_bytes_available(), 0);

    // a credit grant from the edge unblocks further writes
    let proxy_addr = Bytes::from_static(b"proxy-1");
    let mut credit = ZhttpPacket::new(PacketType::Credit, Bytes::from_static(b"r1"));
    credit.credits = Some(6);
    edge.send_stream(&proxy_addr, credit).await;

    match req.next_event().await.unwrap() {
        SessionEvent::Credit(6) => {}
        other => panic!("expected credit event, got {other:?}"),
    }
    req.write_body(Bytes::from_static(b"456789"), false).unwrap();
    assert_eq!(edge.recv().await.body.unwrap().as_ref(), b"456789");
}

#[tokio::test]
async fn sequence_gap_cancels_session() {
    let bus = Bus::new();
    let spec = EndpointSpec::new("edge-c");
    let mut edge = FakeEdge::new(&bus, &spec, "edge-1");
    let mut server = ServerManager::new(&bus, "proxy-1", &spec, true).unwrap();

    edge.send_request("r1", "POST", "http://example.com/u", 1000, true)
        .await;
    let mut req = server.accept().await.unwrap();

    // skip a seq on purpose
    edge.out_seq = 5;
    let mut body = ZhttpPacket::new(PacketType::Data, Bytes::from_static(b"r1"));
    body.body = Some(Bytes::from_static(b"late"));
    body.more = false;
    edge.send_stream(&Bytes::from_static(b"proxy-1"), body).await;

    match req.next_event().await.unwrap() {
        SessionEvent::Cancelled => {}
        other => panic!("expected cancel, got {other:?}"),
    }
    let packet = edge.recv().await;
    assert_eq!(packet.ptype, PacketType::Cancel);
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn unknown_rid_response_triggers_cancel_not_error() {
    let bus = Bus::new();
    let spec = EndpointSpec::new("edge-d");
    let mut edge = FakeEdge::new(&bus, &spec, "edge-1");
    let _server = ServerManager::new(&bus, "proxy-1", &spec, true).unwrap();

    // stream packet for a rid the server never saw
    let mut body = ZhttpPacket::new(PacketType::Data, Bytes::from_static(b"ghost"));
    body.body = Some(Bytes::from_static(b"x"));
    edge.send_stream(&Bytes::from_static(b"proxy-1"), body).await;

    let packet = edge.recv().await;
    assert_eq!(packet.ptype, PacketType::Cancel);
    assert_eq!(packet.id.as_ref(), b"ghost");
}

#[tokio::test]
async fn handoff_transfers_session_between_workers() {
    let bus = Bus::new();
    let spec = EndpointSpec::new("edge-e");
    let mut edge = FakeEdge::new(&bus, &spec, "edge-1");
    let mut proxy = ServerManager::new(&bus, "proxy-1", &spec, true).unwrap();
    let handler = ServerManager::new(&bus, "handler-1", &spec, false).unwrap();

    edge.send_request("r1", "GET", "http://example.com/hold", 50_000, false)
        .await;
    let mut req = proxy.accept().await.unwrap();

    req.start_handoff().unwrap();
    let handoff = edge.recv().await;
    assert_eq!(handoff.ptype, PacketType::HandoffStart);

    let mut proceed = ZhttpPacket::new(PacketType::HandoffProceed, Bytes::from_static(b"r1"));
    proceed.from = edge.ident.clone();
    edge.send_stream(&Bytes::from_static(b"proxy-1"), proceed)
        .await;
    match req.next_event().await.unwrap() {
        SessionEvent::HandoffProceed => {}
        other => panic!("expected handoff-proceed, got {other:?}"),
    }

    let state = req.release();
    assert_eq!(state.out_seq, 1); // the handoff-start consumed seq 0
    assert_eq!(proxy.session_count(), 0);

    let mut adopted = handler.restore(state, false);
    adopted
        .begin_response(200, Bytes::from_static(b"OK"), HttpHeaders::new(), None)
        .unwrap();

    let packet = edge.recv().await;
    assert_eq!(packet.from.as_ref(), b"handler-1");
    assert_eq!(packet.seq, Some(1));
    assert_eq!(handler.session_count(), 1);
}

#[tokio::test]
async fn client_request_reaches_origin_and_response_flows_back() {
    let bus = Bus::new();
    let spec = EndpointSpec::new("origin-a");
    let mut origin = FakeOrigin::new(&bus, &spec, "origin-1");
    let client = ClientManager::new(&bus, "proxy-1", &spec);

    let mut req = client.create_request();
    let mut headers = HttpHeaders::new();
    headers.push("Host", "app.example.com");
    req.start(OutboundRequest {
        method: "GET".into(),
        uri: "http://app.example.com/feed".into(),
        headers,
        body: Bytes::new(),
        more: false,
        ..Default::default()
    })
    .await
    .unwrap();

    let first = origin.recv_request().await;
    assert_eq!(first.method.as_deref(), Some("GET"));
    assert_eq!(first.seq, Some(0));
    assert!(first.stream);
    let client_addr = first.from.clone();
    let id = first.id.clone();

    let mut response = ZhttpPacket::new(PacketType::Data, id.clone());
    response.code = Some(200);
    response.reason = Some(Bytes::from_static(b"OK"));
    let mut rheaders = HttpHeaders::new();
    rheaders.push("Content-Type", "text/plain");
    response.headers = Some(rheaders);
    response.body = Some(Bytes::from_static(b"part1"));
    response.more = true;
    response.credits = Some(1000);
    origin.publish(&client_addr, response);

    match req.next_event().await.unwrap() {
        SessionEvent::Headers {
            code, body, more, ..
        } => {
            assert_eq!(code, 200);
            assert_eq!(body.as_ref(), b"part1");
            assert!(more);
        }
        other => panic!("expected headers, got {other:?}"),
    }

    let mut tail = ZhttpPacket::new(PacketType::Data, id);
    tail.body = Some(Bytes::from_static(b"part2"));
    tail.more = false;
    origin.publish(&client_addr, tail);

    match req.next_event().await.unwrap() {
        SessionEvent::Body { data, more, .. } => {
            assert_eq!(data.as_ref(), b"part2");
            assert!(!more);
        }
        other => panic!("expected body, got {other:?}"),
    }

    assert_eq!(client.session_count(), 0);
}

#[tokio::test]
async fn client_session_expires_when_idle() {
    tokio::time::pause();

    let bus = Bus::new();
    let spec = EndpointSpec::new("origin-b");
    let mut origin = FakeOrigin::new(&bus, &spec, "origin-1");
    let client = ClientManager::new(&bus, "handler-1", &spec);

    let mut req = client.create_request();
    req.start(OutboundRequest {
        method: "GET".into(),
        uri: "http://app.example.com/next".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    let _ = origin.recv_request().await;

    tokio::time::advance(std::time::Duration::from_secs(61)).await;

    match req.next_event().await.unwrap() {
        SessionEvent::Cancelled => {}
        other => panic!("expected expiry cancel, got {other:?}"),
    }
    assert_eq!(client.session_count(), 0);
}
