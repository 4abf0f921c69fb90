//! Signaling relay for two-party WebRTC calls.
//!
//! Browsers connect over a WebSocket, register a user id, and exchange
//! offers, answers and ICE candidates through the relay. The relay only
//! forwards those bodies; it tracks who is online and where each call
//! stands so that messages reach the right peer in a legal order.

pub mod calls;
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod websocket;

pub use error::RelayError;
pub use protocol::{ClientMessage, ConnectionId, Payload, ServerMessage, UserId};
pub use router::{Outbound, SignalingRouter};
