//! LocalBeam signaling relay.
//!
//! Clients register an id over a WebSocket, the relay keeps every registered
//! client informed of current membership and forwards offer, answer and
//! candidate frames to the client named in `targetId`. A small HTTP surface
//! answers `/discover` and `/health`, and the relay advertises itself on the
//! local network so clients can find it without a configured address.

pub mod config;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod websocket;

pub use config::Config;
pub use registry::{ClientRegistry, ConnectionHandle, Delivery, Outbound};
pub use server::{LocalBeamServer, ServerHandle};
pub use websocket::RelayState;
