//! Shared primitives for the LocalBeam signaling relay. The relay, the
//! signaling client and the debug tooling all speak these message shapes so
//! they stay in sync without copying structs across crates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod message;

pub use message::{ProtocolError, Route, SignalKind, SignalMessage};

/// Opaque identifier a client picks for itself when registering.
pub type ClientId = String;

/// Port the relay listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 5000;

/// Name the relay advertises on the local network and clients browse for.
pub const DEFAULT_SERVICE_NAME: &str = "LocalBeam Signaling Server";

/// Service type used for the advertisement.
pub const SERVICE_TYPE: &str = "http";

/// Path of the request/response discovery endpoint.
pub const DISCOVER_PATH: &str = "/discover";

/// Budget for resolving a relay address before falling back to localhost.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Body returned by the discovery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub url: String,
}

/// Relay address used when every discovery step failed.
pub fn fallback_url(port: u16) -> String {
    format!("ws://localhost:{port}")
}

/// WebSocket address for a relay reachable at `host:port`.
pub fn relay_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{host}]:{port}")
    } else {
        format!("ws://{host}:{port}")
    }
}
