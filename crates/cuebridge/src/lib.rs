//! cuebridge: OSC bridge between a live-coding GUI and its execution engine.
//!
//! The GUI sends commands as OSC messages; the bridge routes them to an
//! [`Engine`] and streams the engine's events back to the GUI in order.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod handlers;
pub mod lifecycle;
pub mod logging;
pub mod outbound;
mod version;

pub use bridge::osc::{OscArg, OscError, OscMessage};
pub use bridge::protocol::OutboundEvent;
pub use bridge::transport::{TransportError, TransportKind};
pub use config::{BridgeConfig, ConfigError};
pub use dispatch::{DispatchOutcome, Dispatcher, HandlerError, HandlerFailure};
pub use engine::{Engine, EngineError, LoopbackEngine};
pub use lifecycle::{Bridge, BridgeError, BridgeState};
pub use outbound::{EventQueue, EventReceiver, EventSender, PumpExit};
pub use version::{BRIDGE_VERSION, ReleaseVersion};
