//! Payload encoding over an established peer channel.
//!
//! [`DirectTransfer`] writes each payload as one channel message, so it is
//! limited by the transport's single-message size. Chunking strategies plug
//! in through the same [`TransferStrategy`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::{PeerTransport, TransportError};

/// Outbound application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&Value> for Payload {
    fn from(value: &Value) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::from(&value)
    }
}

/// Decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Json(Value),
    Text(String),
    Bytes(Bytes),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no channel attached")]
    NotAttached,
    #[error("channel to {peer_id} is not writable")]
    NotWritable { peer_id: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Receives `(from, payload)` for every decoded inbound message.
pub type DataCallback = Arc<dyn Fn(&str, Received) + Send + Sync>;

/// Builds one strategy per connected peer.
pub type TransferFactory = Arc<dyn Fn() -> Arc<dyn TransferStrategy> + Send + Sync>;

#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn attach(&self, channel: Arc<dyn PeerTransport>, peer_id: &str);

    async fn send(&self, payload: Payload) -> Result<(), TransferError>;

    /// Replaces the receive callback.
    fn on_data(&self, callback: DataCallback);

    /// Raw inbound bytes from the attached channel.
    fn receive(&self, data: Bytes);

    /// Drops the channel and callback. Safe to call more than once.
    fn cleanup(&self);
}

struct Attached {
    channel: Arc<dyn PeerTransport>,
    peer_id: String,
}

/// Pass-through strategy: text and bytes go out unchanged; inbound bytes
/// decode to JSON, else text, else raw bytes.
#[derive(Default)]
pub struct DirectTransfer {
    attached: Mutex<Option<Attached>>,
    callback: Mutex<Option<DataCallback>>,
}

impl DirectTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> TransferFactory {
        Arc::new(|| Arc::new(DirectTransfer::new()) as Arc<dyn TransferStrategy>)
    }
}

pub fn encode(payload: Payload) -> Bytes {
    match payload {
        Payload::Text(text) => Bytes::from(text),
        Payload::Bytes(bytes) => bytes,
    }
}

pub fn decode(data: Bytes) -> Received {
    let text = match std::str::from_utf8(&data) {
        Ok(text) => text,
        Err(_) => return Received::Bytes(data),
    };
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Received::Json(value),
        Err(_) => Received::Text(text.to_string()),
    }
}

#[async_trait]
impl TransferStrategy for DirectTransfer {
    fn attach(&self, channel: Arc<dyn PeerTransport>, peer_id: &str) {
        debug!(peer_id, "direct transfer attached");
        *self.attached.lock() = Some(Attached {
            channel,
            peer_id: peer_id.to_string(),
        });
    }

    async fn send(&self, payload: Payload) -> Result<(), TransferError> {
        let (channel, peer_id) = match self.attached.lock().as_ref() {
            Some(attached) => (attached.channel.clone(), attached.peer_id.clone()),
            None => return Err(TransferError::NotAttached),
        };
        if !channel.is_writable() {
            warn!(%peer_id, "peer channel not writable; skipping send");
            return Err(TransferError::NotWritable { peer_id });
        }
        channel.send(encode(payload)).await?;
        debug!(%peer_id, "sent data");
        Ok(())
    }

    fn on_data(&self, callback: DataCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn receive(&self, data: Bytes) {
        let Some(peer_id) = self
            .attached
            .lock()
            .as_ref()
            .map(|attached| attached.peer_id.clone())
        else {
            debug!("data after cleanup; dropping");
            return;
        };
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(&peer_id, decode(data));
        }
    }

    fn cleanup(&self) {
        self.attached.lock().take();
        self.callback.lock().take();
    }
}
