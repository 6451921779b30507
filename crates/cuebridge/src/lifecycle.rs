//! Bridge lifecycle: `Starting -> Running -> Draining -> Stopped`.
//!
//! Startup acquires the GUI client and the listening endpoint. A port that
//! cannot be opened is reported to the GUI as a boot error, sent directly
//! since the pump is not running yet. Once running, the receive loop and the
//! outbound pump run concurrently until an `Exit` event reaches the pump.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::bridge::protocol::OutboundEvent;
use crate::bridge::transport::{Endpoint, GuiClient, TransportError, TransportKind, send_blocking};
use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::engine::{Engine, EngineError};
use crate::handlers;
use crate::outbound::{EventQueue, EventSender, PumpExit, run_pump};

/// Inbound messages buffered between the transport and the dispatcher.
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Running,
    /// `Exit` dequeued; transmitting the terminal event.
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to set up GUI client")]
    Client(#[source] TransportError),

    #[error("{reason}")]
    Boot {
        reason: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub fn port_unavailable_reason(port: u16) -> String {
    format!("Failed to open server port {port}, is the server already running?")
}

/// Sends `/exited` to the GUI when dropped, unless disarmed.
///
/// Covers error returns and panics that skip the pump's own exit message.
pub struct ExitNotifier {
    target: Option<(TransportKind, SocketAddr)>,
}

impl ExitNotifier {
    pub fn arm(kind: TransportKind, addr: SocketAddr) -> Self {
        Self {
            target: Some((kind, addr)),
        }
    }

    pub fn disarm(mut self) {
        self.target = None;
    }
}

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        let Some((kind, addr)) = self.target.take() else {
            return;
        };
        match send_blocking(kind, addr, &OutboundEvent::Exit.into_message()) {
            Ok(()) => tracing::debug!(%addr, "Sent exit notification"),
            Err(e) => tracing::debug!(%addr, error = %e, "GUI not listening for exit notification"),
        }
    }
}

/// Owns a bridge run. State changes are published to subscribers.
pub struct Bridge {
    config: BridgeConfig,
    state: watch::Sender<BridgeState>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(BridgeState::Starting);
        Self { config, state }
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Run until the engine exits or the process receives SIGINT/SIGTERM.
    pub async fn run<F>(self, make_engine: F) -> Result<PumpExit, BridgeError>
    where
        F: FnOnce(EventSender) -> Result<Arc<dyn Engine>, EngineError>,
    {
        self.run_until(make_engine, shutdown_signal()).await
    }

    /// Run until an `Exit` event is pumped. `shutdown` completing enqueues one.
    ///
    /// `make_engine` receives the sender the engine reports events through.
    pub async fn run_until<F, S>(self, make_engine: F, shutdown: S) -> Result<PumpExit, BridgeError>
    where
        F: FnOnce(EventSender) -> Result<Arc<dyn Engine>, EngineError>,
        S: Future<Output = ()> + Send + 'static,
    {
        let Self { config, state } = self;
        let kind = config.transport;
        state.send_replace(BridgeState::Starting);
        tracing::info!(transport = %kind, port = config.port, "Bridge starting");

        let mut client = GuiClient::connect(kind, &config.client_host, config.client_port)
            .await
            .map_err(BridgeError::Client)?;
        let gui = client.addr();

        let endpoint = match Endpoint::bind(kind, &config.bind_host, config.port).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!(port = config.port, error = %e, "Failed to open server port");
                let reason = port_unavailable_reason(config.port);
                notify_boot_error(kind, gui, &reason).await;
                state.send_replace(BridgeState::Stopped);
                return Err(BridgeError::Boot {
                    reason,
                    source: Box::new(e),
                });
            }
        };
        let notifier = ExitNotifier::arm(kind, gui);

        let (events, mut receiver) = EventQueue::unbounded();
        let engine = match make_engine(events.clone()) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start engine");
                notifier.disarm();
                let reason = format!("Failed to start engine: {e}");
                notify_boot_error(kind, gui, &reason).await;
                state.send_replace(BridgeState::Stopped);
                return Err(BridgeError::Boot {
                    reason,
                    source: Box::new(e),
                });
            }
        };

        let mut dispatcher = Dispatcher::new(engine, events.clone());
        handlers::register_all(&mut dispatcher);
        let dispatcher = Arc::new(dispatcher);

        let local = endpoint.local_addr().ok();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let receive_task = tokio::spawn(endpoint.run(inbound_tx));
        let dispatch_task = tokio::spawn(dispatcher.run(inbound_rx));
        let signal_task = tokio::spawn(async move {
            shutdown.await;
            tracing::info!("Shutdown requested");
            if events.send(OutboundEvent::Exit).is_err() {
                tracing::debug!("Outbound queue already closed");
            }
        });

        state.send_replace(BridgeState::Running);
        tracing::info!(transport = %kind, listen = ?local, gui = %gui, "Bridge running");

        let exit = run_pump(&mut receiver, &mut client, &state).await;

        receive_task.abort();
        dispatch_task.abort();
        signal_task.abort();

        if exit == PumpExit::ExitEvent {
            notifier.disarm();
        }
        tracing::info!(?exit, "Bridge stopped");
        Ok(exit)
    }
}

/// Best-effort boot error notification, sent outside the pump.
async fn notify_boot_error(kind: TransportKind, addr: SocketAddr, reason: &str) {
    let message = OutboundEvent::BootError {
        reason: reason.to_string(),
    }
    .into_message();
    let sent = tokio::task::spawn_blocking(move || send_blocking(kind, addr, &message)).await;
    match sent {
        Ok(Ok(())) => tracing::debug!(%addr, "Sent boot error"),
        Ok(Err(e)) => tracing::info!(error = %e, "GUI not listening, exiting anyway"),
        Err(e) => tracing::warn!(error = %e, "Boot error notification did not complete"),
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::decode_for;
    use crate::bridge::osc::OscMessage;
    use crate::engine::LoopbackEngine;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    fn loopback(events: EventSender) -> Result<Arc<dyn Engine>, EngineError> {
        Ok(Arc::new(LoopbackEngine::new(events)))
    }

    async fn recv_message(gui: &UdpSocket) -> OscMessage {
        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), gui.recv_from(&mut buf))
            .await
            .expect("timed out waiting for GUI message")
            .unwrap();
        decode_for(TransportKind::Datagram, &buf[..len])
            .unwrap()
            .remove(0)
    }

    async fn gui_socket() -> (UdpSocket, BridgeConfig) {
        let gui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = BridgeConfig {
            client_port: gui.local_addr().unwrap().port(),
            bind_host: "127.0.0.1".to_string(),
            port: free_udp_port(),
            ..BridgeConfig::default()
        };
        (gui, config)
    }

    #[tokio::test]
    async fn taken_port_reports_boot_error() {
        let (gui, mut config) = gui_socket().await;
        let squatter = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        config.port = squatter.local_addr().unwrap().port();
        let port = config.port;

        let bridge = Bridge::new(config);
        let state = bridge.subscribe();
        let err = bridge
            .run_until(loopback, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Boot { .. }));
        assert_eq!(err.to_string(), port_unavailable_reason(port));
        assert_eq!(*state.borrow(), BridgeState::Stopped);

        let message = recv_message(&gui).await;
        assert_eq!(message.address, "/exited-with-boot-error");
        assert_eq!(
            message.args[0].as_str(),
            Some(port_unavailable_reason(port).as_str())
        );
    }

    #[tokio::test]
    async fn engine_failure_is_a_boot_error() {
        let (gui, config) = gui_socket().await;
        let err = Bridge::new(config)
            .run_until(
                |_| Err(EngineError::Other("no sound card".to_string())),
                std::future::pending(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to start engine: no sound card");
        let message = recv_message(&gui).await;
        assert_eq!(message.address, "/exited-with-boot-error");
    }

    #[tokio::test]
    async fn shutdown_future_drains_with_exit() {
        let (gui, config) = gui_socket().await;
        let (trigger, triggered) = tokio::sync::oneshot::channel::<()>();

        let bridge = Bridge::new(config);
        let mut state = bridge.subscribe();
        let run = tokio::spawn(bridge.run_until(loopback, async move {
            let _ = triggered.await;
        }));

        state
            .wait_for(|s| *s == BridgeState::Running)
            .await
            .unwrap();
        trigger.send(()).unwrap();

        let exit = run.await.unwrap().unwrap();
        assert_eq!(exit, PumpExit::ExitEvent);
        assert_eq!(recv_message(&gui).await, OscMessage::bare("/exited"));
        assert_eq!(*state.borrow(), BridgeState::Stopped);
    }

    #[test]
    fn armed_notifier_sends_exited_on_drop() {
        let gui = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        gui.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let addr = gui.local_addr().unwrap();

        ExitNotifier::arm(TransportKind::Datagram, addr).disarm();
        drop(ExitNotifier::arm(TransportKind::Datagram, addr));

        let mut buf = [0u8; 64];
        let len = gui.recv(&mut buf).unwrap();
        let messages = decode_for(TransportKind::Datagram, &buf[..len]).unwrap();
        assert_eq!(messages, vec![OscMessage::bare("/exited")]);

        gui.set_nonblocking(true).unwrap();
        assert!(gui.recv(&mut buf).is_err());
    }
}
