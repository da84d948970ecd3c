use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

pub use memory::MemoryNetwork;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens the negotiation with an offer.
    Initiator,
    /// Answers an inbound offer.
    Responder,
}

/// Events a transport instance reports to its owner, in occurrence order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Negotiation payload for the remote side.
    Signal(Value),
    Connect,
    Data(Bytes),
    Close,
    Error(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel is not writable")]
    NotWritable,
    #[error("transport closed")]
    Closed,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// One direct channel to one remote party.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Feeds a negotiation payload produced by the remote instance.
    fn signal(&self, payload: Value) -> Result<(), TransportError>;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    fn is_writable(&self) -> bool;

    /// Tears the channel down. Must not fail and may be called repeatedly.
    fn close(&self);
}

/// A fresh transport plus the stream of its events.
pub struct TransportSession {
    pub transport: Arc<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        local_id: &str,
        peer_id: &str,
        role: Role,
    ) -> Result<TransportSession, TransportError>;
}

/// True when the payload is a trickled connectivity candidate rather than a
/// session description.
pub fn is_candidate(payload: &Value) -> bool {
    payload.get("candidate").is_some()
}
