//! Edge adapter behavior against a real worker-side session manager and a
//! scripted external web server.

use bytes::{Bytes, BytesMut};

use gripd_edge::packet::{EdgeControlPacket, EdgeRequestPacket, EdgeResponsePacket};
use gripd_edge::{EdgeAdapter, EdgeConfig};
use gripd_x::bus::{Bus, PubSocket, PushSocket, RouterSocket, SubSocket};
use gripd_x::{HttpHeaders, websocket};
use gripd_zhttp::{EndpointSpec, ServerManager, SessionEvent};

struct FakeExtServer {
    push: PushSocket,
    sub: SubSocket,
    #[allow(dead_code)]
    control: RouterSocket,
}

impl FakeExtServer {
    fn new(bus: &Bus, prefix: &str) -> Self {
        Self {
            push: bus.connect_push(&format!("{prefix}-ext-in")),
            sub: bus.connect_sub(&format!("{prefix}-ext-out"), "ext-1"),
            control: bus.bind_router(&format!("{prefix}-ext-control"), 100).unwrap(),
        }
    }

    async fn send(&self, packet: &EdgeRequestPacket) {
        self.push.send(vec![packet.encode()]).await.unwrap();
    }

    async fn recv_response(&mut self) -> EdgeResponsePacket {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), self.sub.recv())
            .await
            .expect("timed out waiting for external response")
            .unwrap();
        EdgeResponsePacket::decode(&msg[0]).unwrap()
    }

    /// Like `recv_response`, but skip control packets.
    async fn recv_data(&mut self) -> EdgeResponsePacket {
        loop {
            let msg = tokio::time::timeout(std::time::Duration::from_secs(5), self.sub.recv())
                .await
                .expect("timed out waiting for external response")
                .unwrap();
            if EdgeControlPacket::decode(&msg[0]).is_ok() {
                continue;
            }
            return EdgeResponsePacket::decode(&msg[0]).unwrap();
        }
    }
}

fn edge_config(prefix: &str) -> EdgeConfig {
    EdgeConfig {
        instance_id: Bytes::from(format!("edge-{prefix}")),
        ext_in: format!("{prefix}-ext-in"),
        ext_out: format!("{prefix}-ext-out"),
        ext_control: format!("{prefix}-ext-control"),
        zhttp: EndpointSpec::new(format!("{prefix}-zhttp")),
        client_buffer: 100_000,
    }
}

fn http_request(id: &'static str, method: &str, uri: &'static str) -> EdgeRequestPacket {
    let mut headers = HttpHeaders::new();
    headers.push("Host", "example.com");
    EdgeRequestPacket {
        sender: Bytes::from_static(b"ext-1"),
        id: Bytes::from_static(id.as_bytes()),
        path: Bytes::from_static(uri.as_bytes()),
        method: method.to_string(),
        version: "HTTP/1.1".into(),
        uri: Bytes::from_static(uri.as_bytes()),
        scheme: Some("http".into()),
        headers,
        body: Bytes::new(),
        remote_address: Some("10.9.8.7".into()),
        upload_offset: None,
        upload_done: false,
        is_disconnect: false,
    }
}

async fn start_edge(bus: &Bus, prefix: &str) -> tokio::sync::oneshot::Sender<()> {
    let adapter = EdgeAdapter::new(bus, edge_config(prefix)).unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(adapter.run(stop_rx));
    stop_tx
}

#[tokio::test]
async fn http_request_roundtrip() {
    let bus = Bus::new();
    let mut ext = FakeExtServer::new(&bus, "t1");
    let _stop = start_edge(&bus, "t1").await;
    let mut worker =
        ServerManager::new(&bus, "proxy-1", &EndpointSpec::new("t1-zhttp"), true).unwrap();

    ext.send(&http_request("7", "GET", "/hello")).await;

    let mut req = worker.accept().await.unwrap();
    assert_eq!(req.method, "GET");
    assert_eq!(req.uri, "http://example.com/hello");
    assert_eq!(req.peer_address.as_deref(), Some("10.9.8.7"));
    assert_eq!(req.initial_credits, 100_000);

    let mut headers = HttpHeaders::new();
    headers.push("Content-Type", "text/plain");
    headers.push("Content-Length", "2");
    req.begin_response(200, Bytes::from_static(b"OK"), headers, None)
        .unwrap();
    req.write_body(Bytes::from_static(b"hi"), false).unwrap();

    let mut data = BytesMut::new();
    // header packet, then body packet
    loop {
        let resp = ext.recv_data().await;
        assert_eq!(resp.id.as_ref(), b"7");
        data.extend_from_slice(&resp.data);
        if data.ends_with(b"hi") {
            break;
        }
    }
    let text = String::from_utf8(data.to_vec()).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Content-Type: text/plain\r\n"));
    assert!(text.ends_with("\r\n\r\nhi"));
    assert!(!text.contains("Transfer-Encoding"));
}

#[tokio::test]
async fn streamed_response_uses_chunked_encoding() {
    let bus = Bus::new();
    let mut ext = FakeExtServer::new(&bus, "t2");
    let _stop = start_edge(&bus, "t2").await;
    let mut worker =
        ServerManager::new(&bus, "proxy-1", &EndpointSpec::new("t2-zhttp"), true).unwrap();

    ext.send(&http_request("8", "GET", "/stream")).await;
    let mut req = worker.accept().await.unwrap();

    let mut headers = HttpHeaders::new();
    headers.push("Content-Type", "text/plain");
    req.begin_response(200, Bytes::from_static(b"OK"), headers, None)
        .unwrap();
    req.write_body(Bytes::from_static(b"part1\n"), true).unwrap();
    req.write_body(Bytes::from_static(b"part2\n"), true).unwrap();
    req.write_body(Bytes::new(), false).unwrap();

    let mut data = BytesMut::new();
    loop {
        let resp = ext.recv_data().await;
        data.extend_from_slice(&resp.data);
        if data.ends_with(b"0\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8(data.to_vec()).unwrap();
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(text.contains("6\r\npart1\n\r\n"));
    assert!(text.contains("6\r\npart2\n\r\n"));
    assert!(text.ends_with("0\r\n\r\n"));
}

#[tokio::test]
async fn client_disconnect_cancels_worker_session() {
    let bus = Bus::new();
    let ext = FakeExtServer::new(&bus, "t3");
    let _stop = start_edge(&bus, "t3").await;
    let mut worker =
        ServerManager::new(&bus, "proxy-1", &EndpointSpec::new("t3-zhttp"), true).unwrap();

    ext.send(&http_request("9", "GET", "/watch")).await;
    let mut req = worker.accept().await.unwrap();

    // worker must speak first so the edge learns the reply address
    req.begin_response(200, Bytes::from_static(b"OK"), HttpHeaders::new(), None)
        .unwrap();

    let mut disconnect = http_request("9", "GET", "/watch");
    disconnect.is_disconnect = true;
    ext.send(&disconnect).await;

    loop {
        match req.next_event().await.unwrap() {
            SessionEvent::Cancelled => break,
            SessionEvent::Credit(_) => continue,
            other => panic!("expected cancel, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn websocket_upgrade_and_frames() {
    let bus = Bus::new();
    let mut ext = FakeExtServer::new(&bus, "t4");
    let _stop = start_edge(&bus, "t4").await;
    let mut worker =
        ServerManager::new(&bus, "proxy-1", &EndpointSpec::new("t4-zhttp"), true).unwrap();

    let mut handshake = http_request("10", "GET", "/socket");
    handshake.headers.push("Upgrade", "websocket");
    handshake.headers.push("Sec-WebSocket-Key", "k+hash==");
    ext.send(&handshake).await;

    let mut req = worker.accept().await.unwrap();
    assert_eq!(req.uri, "ws://example.com/socket");

    let mut headers = HttpHeaders::new();
    headers.push("Upgrade", "websocket");
    headers.push("Sec-WebSocket-Accept", "token");
    req.begin_response(101, Bytes::from_static(b"Switching Protocols"), headers, None)
        .unwrap();

    let resp = ext.recv_data().await;
    let text = String::from_utf8(resp.data.to_vec()).unwrap();
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

    // worker sends a text message; the client must see a ws text frame
    req.write_ws(gripd_wire::zhttp::ContentType::Text, Bytes::from_static(b"hello"))
        .unwrap();
    let resp = ext.recv_data().await;
    let mut buf = BytesMut::from(&resp.data[..]);
    let frame = websocket::parse_frame(&mut buf, usize::MAX).unwrap().unwrap();
    assert_eq!(frame.opcode, websocket::Opcode::Text);
    assert_eq!(frame.payload.as_ref(), b"hello");

    // client sends a masked text frame via a continuation packet
    let mut frame_bytes = BytesMut::new();
    websocket::encode_frame(&websocket::Frame::text("from-client"), &mut frame_bytes);
    let mut cont = http_request("10", "", "/socket");
    cont.version = String::new();
    cont.upload_offset = Some(0);
    cont.body = frame_bytes.freeze();
    ext.send(&cont).await;

    loop {
        match req.next_event().await.unwrap() {
            SessionEvent::Body { data, content_type, .. } => {
                assert_eq!(data.as_ref(), b"from-client");
                assert_eq!(content_type, Some(gripd_wire::zhttp::ContentType::Text));
                break;
            }
            SessionEvent::Credit(_) => continue,
            other => panic!("expected ws body, got {other:?}"),
        }
    }

    // worker closes; client sees a close frame then a socket close
    req.close(Some(1000)).unwrap();
    let resp = ext.recv_data().await;
    let mut buf = BytesMut::from(&resp.data[..]);
    let frame = websocket::parse_frame(&mut buf, usize::MAX).unwrap().unwrap();
    assert_eq!(frame.opcode, websocket::Opcode::Close);
    assert_eq!(frame.close_status(), 1000);

    let resp = ext.recv_data().await;
    assert!(resp.data.is_empty());
}
