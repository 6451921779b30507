//! Outbound event queue and the pump that drains it.
//!
//! Any number of producers (inbound handlers, engine threads) enqueue
//! [`OutboundEvent`]s; a single pump owns the GUI connection and writes them
//! out in arrival order. The pump stops after transmitting [`OutboundEvent::Exit`].

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::bridge::osc::OscMessage;
use crate::bridge::protocol::OutboundEvent;
use crate::bridge::transport::{GuiClient, TransportError};
use crate::lifecycle::BridgeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("outbound queue closed")]
pub struct QueueClosed;

/// Constructor for the outbound FIFO.
pub struct EventQueue;

impl EventQueue {
    pub fn unbounded() -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, EventReceiver { rx })
    }
}

/// Producer handle. Cheap to clone; `send` never blocks and may be called
/// from any thread, inside or outside the async runtime.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl EventSender {
    pub fn send(&self, event: OutboundEvent) -> Result<(), QueueClosed> {
        self.tx.send(event).map_err(|_| QueueClosed)
    }
}

pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<OutboundEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<OutboundEvent> {
        self.rx.recv().await
    }

    /// Next queued event, without waiting.
    pub fn try_recv(&mut self) -> Option<OutboundEvent> {
        self.rx.try_recv().ok()
    }

    /// Refuse further events. Already queued events stay unread.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Destination for encoded events.
///
/// Abstracts the GUI connection so the pump can be exercised without sockets.
#[async_trait]
pub trait Outlet: Send {
    async fn deliver(&mut self, message: &OscMessage) -> Result<(), TransportError>;
}

#[async_trait]
impl Outlet for GuiClient {
    async fn deliver(&mut self, message: &OscMessage) -> Result<(), TransportError> {
        self.send(message).await
    }
}

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// An `Exit` event was dequeued and its transmission attempted.
    ExitEvent,
    /// Every sender was dropped.
    QueueClosed,
}

/// Drain `events` into `outlet` until `Exit` is dequeued.
///
/// Send failures are logged and skipped. Publishes `Draining` when the exit
/// event is dequeued and `Stopped` once the pump is done.
pub async fn run_pump<O: Outlet + ?Sized>(
    events: &mut EventReceiver,
    outlet: &mut O,
    state: &watch::Sender<BridgeState>,
) -> PumpExit {
    tracing::debug!("Outbound pump started");
    let exit = loop {
        let Some(event) = events.recv().await else {
            tracing::debug!("All event senders dropped");
            break PumpExit::QueueClosed;
        };

        let kind = event.kind();
        let is_exit = event.is_exit();
        if is_exit {
            events.close();
            state.send_replace(BridgeState::Draining);
        }

        let message = event.into_message();
        match outlet.deliver(&message).await {
            Ok(()) => tracing::trace!(kind, %message, "Sent event"),
            Err(TransportError::PeerUnreachable { .. }) if is_exit => {
                tracing::info!("GUI not listening, exiting anyway");
            }
            Err(e) => tracing::warn!(kind, error = %e, "Failed to send event to GUI"),
        }

        if is_exit {
            break PumpExit::ExitEvent;
        }
    };

    state.send_replace(BridgeState::Stopped);
    tracing::debug!(?exit, "Outbound pump stopped");
    exit
}
