//! End-to-end tunnel behavior over loopback sockets: a real server, a real
//! client, and real remote endpoints.

use async_trait::async_trait;
use bytes::Bytes;
use muxtun_client::{ClientTunnel, FlowData};
use muxtun_core::{
    channel_packet_flow, ChannelPacketReader, ChannelPacketWriter, PacketReader, PacketWriter,
    Tunnel, TunnelDelegate, TunnelSet,
};
use muxtun_core::io::{read_exact, write_all};
use muxtun_proto::{AppFlowKind, Command, ConfigMap, FrameCodec, Message, ResultCode, Value};
use muxtun_server::{PacketFlowFactory, ServerConfig, TunnelServer};
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

struct NopDelegate;

impl TunnelDelegate for NopDelegate {}

fn pooled_config() -> ServerConfig {
    serde_json::from_str(
        r#"{
            "IPv4": {
                "Address": "10.0.0.254",
                "Netmask": "255.255.255.0",
                "Pool": { "StartAddress": "10.0.0.1", "EndAddress": "10.0.0.3" }
            },
            "DNS": { "Servers": ["10.0.0.53"] }
        }"#,
    )
    .unwrap()
}

/// Hands each IP flow a channel-backed packet interface and surfaces the
/// host-side ends to the test.
struct TestPacketFlows {
    opened: mpsc::UnboundedSender<(Ipv4Addr, ChannelPacketWriter, ChannelPacketReader)>,
}

#[async_trait]
impl PacketFlowFactory for TestPacketFlows {
    async fn open(
        &self,
        address: Ipv4Addr,
    ) -> io::Result<(Box<dyn PacketReader>, Box<dyn PacketWriter>)> {
        let (inject, relay_source) = channel_packet_flow(16);
        let (relay_sink, capture) = channel_packet_flow(16);
        self.opened
            .send((address, inject, capture))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "test gone"))?;
        Ok((Box::new(relay_source), Box::new(relay_sink)))
    }
}

async fn start_server(
    config: ServerConfig,
    factory: Option<Arc<dyn PacketFlowFactory>>,
) -> (String, Arc<TunnelSet>) {
    let mut server = TunnelServer::new(config).unwrap();
    if let Some(factory) = factory {
        server = server.with_packet_flows(factory);
    }
    let tunnels = server.tunnel_set();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });
    (addr.to_string(), tunnels)
}

async fn connect_client(server: &str) -> ClientTunnel {
    let set = TunnelSet::new();
    ClientTunnel::connect(server, Arc::new(NopDelegate), &set)
        .await
        .unwrap()
}

/// One-connection echo server; closes when the peer does.
async fn spawn_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr.to_string()
}

#[tokio::test]
async fn test_tcp_echo_through_tunnel() {
    let echo_addr = spawn_echo_server().await;
    let (host, port) = echo_addr.rsplit_once(':').unwrap();
    let (server_addr, _tunnels) = start_server(ServerConfig::default(), None).await;
    let client = connect_client(&server_addr).await;

    let mut flow = client.open_tcp_flow(host, port.parse().unwrap()).unwrap();
    assert_eq!(flow.opened().await.unwrap(), ResultCode::Success);

    assert!(flow.write(b"hello"));
    let mut echoed = Vec::new();
    while echoed.len() < 5 {
        match flow.recv().await {
            Some(FlowData::Stream(data)) => echoed.extend_from_slice(&data),
            other => panic!("expected echoed data, got {other:?}"),
        }
    }
    assert_eq!(&echoed[..], b"hello");

    // Several messages stay in order through the relay.
    for chunk in [b"one".as_slice(), b"two", b"three"] {
        assert!(flow.write(chunk));
    }
    let mut echoed = Vec::new();
    while echoed.len() < 11 {
        match flow.recv().await {
            Some(FlowData::Stream(data)) => echoed.extend_from_slice(&data),
            other => panic!("expected echoed data, got {other:?}"),
        }
    }
    assert_eq!(&echoed[..], b"onetwothree");

    flow.close(muxtun_proto::CloseDirection::All);
    client.close();
}

#[tokio::test]
async fn test_tcp_open_refused() {
    // Grab a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let (server_addr, _tunnels) = start_server(ServerConfig::default(), None).await;
    let client = connect_client(&server_addr).await;

    let mut flow = client
        .open_tcp_flow(&dead_addr.ip().to_string(), dead_addr.port())
        .unwrap();
    assert_eq!(flow.opened().await.unwrap(), ResultCode::Refused);
}

#[tokio::test]
async fn test_udp_roundtrip_through_tunnel() {
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();

    let (server_addr, _tunnels) = start_server(ServerConfig::default(), None).await;
    let client = connect_client(&server_addr).await;

    let mut flow = client.open_udp_flow().unwrap();
    assert_eq!(flow.opened().await.unwrap(), ResultCode::Success);

    assert!(flow.write_to(b"\x01\x02", &remote_addr.ip().to_string(), remote_addr.port()));

    let mut buf = [0u8; 64];
    let (n, relay_addr) = remote.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"\x01\x02");

    remote.send_to(b"\xff", relay_addr).await.unwrap();
    match flow.recv().await {
        Some(FlowData::Datagram { data, host, port }) => {
            assert_eq!(&data[..], b"\xff");
            assert_eq!(host, remote_addr.ip().to_string());
            assert_eq!(port, remote_addr.port());
        }
        other => panic!("expected datagram, got {other:?}"),
    }
}

fn assigned_address(settings: &Option<ConfigMap>) -> String {
    settings
        .as_ref()
        .and_then(|s| s.get("IPv4"))
        .and_then(Value::as_map)
        .and_then(|v4| v4.get("Address"))
        .and_then(Value::as_str)
        .expect("no assigned address in settings")
        .to_string()
}

#[tokio::test]
async fn test_address_assignment_exhaustion_and_reuse() {
    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
    let factory = Arc::new(TestPacketFlows { opened: opened_tx });
    let (server_addr, _tunnels) = start_server(pooled_config(), Some(factory)).await;
    let client = connect_client(&server_addr).await;

    let (src1_tx, src1_rx) = channel_packet_flow(4);
    let (sink1_tx, _sink1_rx) = channel_packet_flow(4);
    let mut first = client
        .open_ip_flow(Box::new(src1_rx), Box::new(sink1_tx))
        .unwrap();
    let (code, settings) = first.opened().await.unwrap();
    assert_eq!(code, ResultCode::Success);
    assert_eq!(assigned_address(&settings), "10.0.0.1");

    let mut keep = Vec::new();
    for expected_addr in ["10.0.0.2", "10.0.0.3"] {
        let (src_tx, src_rx) = channel_packet_flow(4);
        let (sink_tx, _sink_rx) = channel_packet_flow(4);
        let mut flow = client
            .open_ip_flow(Box::new(src_rx), Box::new(sink_tx))
            .unwrap();
        let (code, settings) = flow.opened().await.unwrap();
        assert_eq!(code, ResultCode::Success);
        assert_eq!(assigned_address(&settings), expected_addr);
        keep.push((flow, src_tx));
    }

    // Pool of three is now exhausted.
    let (_src4_tx, src4_rx) = channel_packet_flow(4);
    let (sink4_tx, _sink4_rx) = channel_packet_flow(4);
    let mut fourth = client
        .open_ip_flow(Box::new(src4_rx), Box::new(sink4_tx))
        .unwrap();
    let (code, _) = fourth.opened().await.unwrap();
    assert_eq!(code, ResultCode::InternalError);

    // Closing the first flow returns its address; the next open gets it.
    first.close();
    let mut reused = None;
    for _ in 0..100 {
        let (_src_tx, src_rx) = channel_packet_flow(4);
        let (sink_tx, _sink_rx) = channel_packet_flow(4);
        let mut flow = client
            .open_ip_flow(Box::new(src_rx), Box::new(sink_tx))
            .unwrap();
        let (code, settings) = flow.opened().await.unwrap();
        if code == ResultCode::Success {
            reused = Some(assigned_address(&settings));
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(reused.as_deref(), Some("10.0.0.1"));

    // The factory saw every successful lease.
    let (first_addr, _, _) = opened_rx.recv().await.unwrap();
    assert_eq!(first_addr, Ipv4Addr::new(10, 0, 0, 1));
    drop(src1_tx);
    drop(keep);
}

#[tokio::test]
async fn test_ip_packets_relay_both_ways() {
    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
    let factory = Arc::new(TestPacketFlows { opened: opened_tx });
    let (server_addr, _tunnels) = start_server(pooled_config(), Some(factory)).await;
    let client = connect_client(&server_addr).await;

    let (mut src_tx, src_rx) = channel_packet_flow(4);
    let (sink_tx, mut sink_rx) = channel_packet_flow(4);
    let mut flow = client
        .open_ip_flow(Box::new(src_rx), Box::new(sink_tx))
        .unwrap();
    let (code, _) = flow.opened().await.unwrap();
    assert_eq!(code, ResultCode::Success);

    let (_address, mut host_inject, mut host_capture) = opened_rx.recv().await.unwrap();

    // Client-originated packet reaches the host IP stack.
    src_tx
        .write_packets(&[Bytes::from_static(b"\x45\x00\x00\x14")], &[2])
        .await
        .unwrap();
    let (packets, protocols) = host_capture.read_packets().await.unwrap();
    assert_eq!(packets, vec![Bytes::from_static(b"\x45\x00\x00\x14")]);
    assert_eq!(protocols, vec![2]);

    // Host-originated packet reaches the client sink.
    host_inject
        .write_packets(&[Bytes::from_static(b"\x45\xaa")], &[2])
        .await
        .unwrap();
    let (packets, protocols) = sink_rx.read_packets().await.unwrap();
    assert_eq!(packets, vec![Bytes::from_static(b"\x45\xaa")]);
    assert_eq!(protocols, vec![2]);
}

struct CaptureDelegate {
    settings: Mutex<Option<ConfigMap>>,
}

impl TunnelDelegate for CaptureDelegate {
    fn configuration_received(&self, _tunnel: &Tunnel, settings: &ConfigMap) {
        *self.settings.lock().unwrap() = Some(settings.clone());
    }
}

#[tokio::test]
async fn test_fetch_configuration_never_exposes_pool() {
    let (server_addr, _tunnels) = start_server(pooled_config(), None).await;

    let set = TunnelSet::new();
    let delegate = Arc::new(CaptureDelegate {
        settings: Mutex::new(None),
    });
    let client = ClientTunnel::connect(&server_addr, delegate.clone(), &set)
        .await
        .unwrap();

    assert!(client.fetch_configuration());

    let mut received = None;
    for _ in 0..500 {
        if let Some(settings) = delegate.settings.lock().unwrap().take() {
            received = Some(settings);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let settings = received.expect("no configuration received");

    let v4 = settings.get("IPv4").and_then(Value::as_map).unwrap();
    assert!(v4.get("Pool").is_none());
    assert_eq!(v4.get("Netmask").and_then(Value::as_str), Some("255.255.255.0"));
    let dns = settings.get("DNS").and_then(Value::as_map).unwrap();
    assert!(dns.get("Servers").is_some());
}

async fn read_frame(io: &TcpStream) -> Message {
    let mut header = [0u8; 4];
    read_exact(io, &mut header).await.unwrap();
    let frame_len = FrameCodec::frame_len(header).unwrap();
    let mut payload = vec![0u8; frame_len - 4];
    read_exact(io, &mut payload).await.unwrap();
    FrameCodec::decode_payload(&payload).unwrap()
}

#[tokio::test]
async fn test_open_with_bad_tunnel_type_rejected() {
    use muxtun_proto::message::keys;

    let (server_addr, _tunnels) = start_server(ServerConfig::default(), None).await;
    let stream = TcpStream::connect(&server_addr).await.unwrap();

    // tunnel-type 2 is outside the wire range; the flow type alone must not
    // be enough to open a flow.
    let open = Message::new(Command::Open)
        .with(keys::IDENTIFIER, Value::from(5u32))
        .with(keys::TUNNEL_TYPE, Value::Int(2))
        .with(keys::APP_FLOW_TYPE, Value::Int(AppFlowKind::Udp as i64));
    write_all(&stream, &FrameCodec::encode(&open).unwrap())
        .await
        .unwrap();

    let reply = read_frame(&stream).await;
    assert_eq!(reply.command(), Some(Command::OpenResult));
    assert_eq!(reply.identifier(), Some(5));
    assert_eq!(reply.result_code(), Some(ResultCode::InvalidParameter));

    // Same answer when tunnel-type is omitted entirely.
    let open = Message::new(Command::Open)
        .with(keys::IDENTIFIER, Value::from(6u32))
        .with(keys::APP_FLOW_TYPE, Value::Int(AppFlowKind::Udp as i64));
    write_all(&stream, &FrameCodec::encode(&open).unwrap())
        .await
        .unwrap();

    let reply = read_frame(&stream).await;
    assert_eq!(reply.command(), Some(Command::OpenResult));
    assert_eq!(reply.identifier(), Some(6));
    assert_eq!(reply.result_code(), Some(ResultCode::InvalidParameter));

    // A well-formed open on the same tunnel still succeeds afterwards.
    let open = Message::open_udp_message(7);
    write_all(&stream, &FrameCodec::encode(&open).unwrap())
        .await
        .unwrap();

    let reply = read_frame(&stream).await;
    assert_eq!(reply.command(), Some(Command::OpenResult));
    assert_eq!(reply.identifier(), Some(7));
    assert_eq!(reply.result_code(), Some(ResultCode::Success));
}

#[tokio::test]
async fn test_server_tunnel_set_tracks_connections() {
    let (server_addr, tunnels) = start_server(ServerConfig::default(), None).await;

    let client = connect_client(&server_addr).await;
    for _ in 0..500 {
        if tunnels.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(tunnels.len(), 1);

    client.close();
    for _ in 0..500 {
        if tunnels.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(tunnels.is_empty());
}
