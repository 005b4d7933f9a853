//! Persistent streaming connection to the platform gateway.
//!
//! `proto` defines the packet envelope, opcodes, and close-code policy;
//! `socket` owns the websocket, the handshake and heartbeat state machines,
//! and the reconnect supervisor.

pub mod proto;
pub mod socket;

pub use proto::{classify_close, CloseAction, Hello, Packet};
pub use socket::{
    Gateway, GatewayCommand, GatewayConfig, GatewayConnection, GatewayError, GatewayNotice,
    GatewaySender,
};
