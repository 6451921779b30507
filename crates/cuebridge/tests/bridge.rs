//! End-to-end tests: a fake GUI talks to a running bridge over loopback.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use cuebridge::bridge::codec::{OscStreamCodec, decode_for, encode_for};
use cuebridge::bridge::protocol::OutboundEvent;
use cuebridge::engine::{Engine, EngineError};
use cuebridge::{
    Bridge, BridgeConfig, BridgeError, BridgeState, EventSender, LoopbackEngine, OscArg,
    OscMessage, PumpExit, ReleaseVersion, TransportKind,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Engine that reports every evaluation back as a runtime error.
struct FailingEngine {
    events: EventSender,
}

impl Engine for FailingEngine {
    fn eval(&self, code: &str, _workspace: Option<&str>) -> Result<(), EngineError> {
        self.events.send(OutboundEvent::Error {
            job_id: 1,
            description: Some(format!("cannot run {code}")),
            trace: vec!["eval:1".to_string()],
            line: Some(1),
        })?;
        Ok(())
    }

    fn save_buffer(&self, _buffer_id: &str, _content: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn load_buffer(&self, _buffer_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn exit(&self) -> Result<(), EngineError> {
        self.events.send(OutboundEvent::Exit)?;
        Ok(())
    }

    fn stop_jobs(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn current_version(&self) -> Result<ReleaseVersion, EngineError> {
        Ok(ReleaseVersion::new("v0.0", 0))
    }
}

fn loopback(events: EventSender) -> Result<Arc<dyn Engine>, EngineError> {
    Ok(Arc::new(LoopbackEngine::new(events)))
}

fn failing(events: EventSender) -> Result<Arc<dyn Engine>, EngineError> {
    Ok(Arc::new(FailingEngine { events }))
}

fn free_port(kind: TransportKind) -> u16 {
    match kind {
        TransportKind::Datagram => std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port(),
        TransportKind::Stream => std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port(),
    }
}

fn config(kind: TransportKind, client_port: u16) -> BridgeConfig {
    BridgeConfig {
        transport: kind,
        port: free_port(kind),
        client_port,
        bind_host: "127.0.0.1".to_string(),
        ..BridgeConfig::default()
    }
}

async fn start<F>(
    config: BridgeConfig,
    make_engine: F,
) -> JoinHandle<Result<PumpExit, BridgeError>>
where
    F: FnOnce(EventSender) -> Result<Arc<dyn Engine>, EngineError> + Send + 'static,
{
    let bridge = Bridge::new(config);
    let mut state: watch::Receiver<BridgeState> = bridge.subscribe();
    let handle = tokio::spawn(bridge.run_until(make_engine, std::future::pending()));
    tokio::time::timeout(TIMEOUT, state.wait_for(|s| *s == BridgeState::Running))
        .await
        .expect("bridge did not start")
        .unwrap();
    handle
}

fn msg(address: &str, args: &[&str]) -> OscMessage {
    OscMessage::new(address, args.iter().map(|a| OscArg::from(*a)).collect())
}

/// GUI side of a datagram session.
struct UdpGui {
    socket: UdpSocket,
    bridge_port: u16,
}

impl UdpGui {
    async fn send(&self, message: &OscMessage) {
        let bytes = encode_for(TransportKind::Datagram, message).unwrap();
        self.send_raw(&bytes).await;
    }

    async fn send_raw(&self, bytes: &[u8]) {
        self.socket
            .send_to(bytes, ("127.0.0.1", self.bridge_port))
            .await
            .unwrap();
    }

    async fn recv(&self) -> OscMessage {
        let mut buf = vec![0u8; 65_536];
        let (len, _) = tokio::time::timeout(TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .expect("no message from bridge")
            .unwrap();
        decode_for(TransportKind::Datagram, &buf[..len])
            .unwrap()
            .remove(0)
    }
}

async fn udp_session<F>(make_engine: F) -> (UdpGui, JoinHandle<Result<PumpExit, BridgeError>>)
where
    F: FnOnce(EventSender) -> Result<Arc<dyn Engine>, EngineError> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = config(TransportKind::Datagram, socket.local_addr().unwrap().port());
    let bridge_port = config.port;
    let handle = start(config, make_engine).await;
    (UdpGui { socket, bridge_port }, handle)
}

#[tokio::test]
async fn udp_ping_is_acknowledged() {
    let (gui, bridge) = udp_session(loopback).await;

    gui.send(&msg("/ping", &["sender1", "req42"])).await;
    assert_eq!(gui.recv().await, msg("/ack", &["req42"]));

    gui.send(&msg("/exit", &["sender1"])).await;
    assert_eq!(gui.recv().await, OscMessage::bare("/exited"));
    assert_eq!(bridge.await.unwrap().unwrap(), PumpExit::ExitEvent);
}

#[tokio::test]
async fn udp_survives_garbage_and_unknown_addresses() {
    let (gui, bridge) = udp_session(loopback).await;

    gui.send_raw(b"definitely not osc").await;
    gui.send(&msg("/no-such-command", &["sender1"])).await;
    gui.send(&msg("/mixer-hpf-enable", &["sender1", "high"])).await;
    gui.send(&msg("/ping", &["sender1", "still-alive"])).await;
    assert_eq!(gui.recv().await, msg("/ack", &["still-alive"]));

    gui.send(&msg("/exit", &["sender1"])).await;
    assert_eq!(gui.recv().await, OscMessage::bare("/exited"));
    bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn udp_buffers_round_trip_through_engine() {
    let (gui, bridge) = udp_session(loopback).await;

    gui.send(&msg("/save-buffer", &["sender1", "workspace_one", "play 60"]))
        .await;
    gui.send(&msg("/load-buffer", &["sender1", "workspace_one"])).await;
    let reply = gui.recv().await;
    assert_eq!(reply.address, "/replace-buffer");
    assert_eq!(reply.args[0], OscArg::from("workspace_one"));
    assert_eq!(reply.args[1], OscArg::from("play 60"));

    gui.send(&msg("/exit", &["sender1"])).await;
    assert_eq!(gui.recv().await, OscMessage::bare("/exited"));
    bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn engine_errors_reach_the_gui_escaped() {
    let (gui, bridge) = udp_session(failing).await;

    gui.send(&msg("/run-code", &["sender1", "<script>alert(1)</script>"]))
        .await;
    let error = gui.recv().await;
    assert_eq!(error.address, "/error");
    assert_eq!(
        error.args[1],
        OscArg::from("cannot run &lt;script&gt;alert(1)&lt;/script&gt;")
    );

    gui.send(&msg("/exit", &["sender1"])).await;
    assert_eq!(gui.recv().await, OscMessage::bare("/exited"));
    bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn udp_port_in_use_is_a_boot_error() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let squatter = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut config = config(TransportKind::Datagram, socket.local_addr().unwrap().port());
    config.port = squatter.local_addr().unwrap().port();
    let port = config.port;

    let err = Bridge::new(config)
        .run_until(loopback, std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Boot { .. }));

    let gui = UdpGui {
        socket,
        bridge_port: port,
    };
    let reply = gui.recv().await;
    assert_eq!(reply.address, "/exited-with-boot-error");
    assert_eq!(
        reply.args,
        vec![OscArg::from(format!(
            "Failed to open server port {port}, is the server already running?"
        ))]
    );
}

async fn next_frame(frames: &mut FramedRead<TcpStream, OscStreamCodec>) -> OscMessage {
    let frame = tokio::time::timeout(TIMEOUT, frames.next())
        .await
        .expect("no frame from bridge")
        .expect("bridge closed the connection")
        .unwrap();
    frame.unwrap().remove(0)
}

#[tokio::test]
async fn tcp_session_frames_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config(TransportKind::Stream, listener.local_addr().unwrap().port());
    let bridge_port = config.port;
    let bridge = start(config, loopback).await;

    let mut to_bridge = TcpStream::connect(("127.0.0.1", bridge_port)).await.unwrap();

    // Two frames in one write, then a frame split across writes.
    let mut batch = encode_for(TransportKind::Stream, &msg("/ping", &["s", "one"]))
        .unwrap()
        .to_vec();
    batch.extend_from_slice(&encode_for(TransportKind::Stream, &msg("/ping", &["s", "two"])).unwrap());
    to_bridge.write_all(&batch).await.unwrap();

    let split = encode_for(TransportKind::Stream, &msg("/ping", &["s", "three"])).unwrap();
    to_bridge.write_all(&split[..6]).await.unwrap();
    to_bridge.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    to_bridge.write_all(&split[6..]).await.unwrap();

    let (from_bridge, _) = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .expect("bridge never connected back")
        .unwrap();
    let mut frames = FramedRead::new(from_bridge, OscStreamCodec::new());

    assert_eq!(next_frame(&mut frames).await, msg("/ack", &["one"]));
    assert_eq!(next_frame(&mut frames).await, msg("/ack", &["two"]));
    assert_eq!(next_frame(&mut frames).await, msg("/ack", &["three"]));

    let exit = encode_for(TransportKind::Stream, &msg("/exit", &["s"])).unwrap();
    to_bridge.write_all(&exit).await.unwrap();
    assert_eq!(next_frame(&mut frames).await, OscMessage::bare("/exited"));
    assert_eq!(bridge.await.unwrap().unwrap(), PumpExit::ExitEvent);
}
