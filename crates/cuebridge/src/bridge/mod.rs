//! Wire layer between the GUI and the bridge.
//!
//! # Architecture
//!
//! - **osc**: Message model and OSC 1.0 binary encoding
//! - **codec**: Length-prefixed framing for stream sockets
//! - **protocol**: Outbound event types and their wire mapping
//! - **transport**: UDP/TCP listening endpoint and GUI client

pub mod codec;
pub mod osc;
pub mod protocol;
pub mod transport;
