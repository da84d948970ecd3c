//! Peer connection lifecycle.
//!
//! One [`PeerManager`] owns every remote peer known to a local client. A
//! peer is `Negotiating` from the moment its transport is created (outbound
//! `create_connection` or first inbound offer), `Connected` once the transport
//! reports connect, and is removed entirely on close or error so the next
//! attempt starts fresh.
//!
//! Negotiation input is handled by a single signaling pump task. Each
//! transport instance gets its own event pump, and entries carry an instance
//! number so a late event from a torn-down transport cannot touch a newer
//! entry for the same peer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use localbeam_proto::{ClientId, SignalKind, SignalMessage};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::EventHub;
use crate::signaling::{SignalChannel, SignalingError, SignalingEvent};
use crate::transfer::{DirectTransfer, Payload, Received, TransferError, TransferFactory, TransferStrategy};
use crate::transport::{
    is_candidate, PeerTransport, Role, TransportError, TransportEvent, TransportFactory,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    PeerList(Vec<ClientId>),
    PeerConnected(ClientId),
    Data { from: ClientId, payload: Received },
    PeerClosed(ClientId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Negotiating,
    Connected,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {0} is not connected")]
    NotConnected(ClientId),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

struct PeerEntry {
    instance: u64,
    role: Role,
    state: PeerState,
    transport: Arc<dyn PeerTransport>,
    transfer: Option<Arc<dyn TransferStrategy>>,
    pump: Option<JoinHandle<()>>,
}

struct Inner {
    local_id: ClientId,
    signaling: Arc<dyn SignalChannel>,
    transports: Arc<dyn TransportFactory>,
    transfers: TransferFactory,
    peers: Mutex<HashMap<ClientId, PeerEntry>>,
    next_instance: AtomicU64,
    events: Arc<EventHub<PeerEvent>>,
}

pub struct PeerManager {
    inner: Arc<Inner>,
    signal_pump: JoinHandle<()>,
}

impl PeerManager {
    /// Must be called inside a tokio runtime.
    pub fn new(signaling: Arc<dyn SignalChannel>, transports: Arc<dyn TransportFactory>) -> Self {
        Self::with_transfer(signaling, transports, DirectTransfer::factory())
    }

    pub fn with_transfer(
        signaling: Arc<dyn SignalChannel>,
        transports: Arc<dyn TransportFactory>,
        transfers: TransferFactory,
    ) -> Self {
        let inbound = signaling.subscribe();
        let inner = Arc::new(Inner {
            local_id: signaling.client_id().to_string(),
            signaling,
            transports,
            transfers,
            peers: Mutex::new(HashMap::new()),
            next_instance: AtomicU64::new(1),
            events: Arc::new(EventHub::new()),
        });
        let signal_pump = tokio::spawn(signal_pump(inner.clone(), inbound));
        Self { inner, signal_pump }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.inner.peers.lock().get(peer_id).map(|entry| entry.state)
    }

    pub fn peers(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.inner.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Starts negotiating with `peer_id` as initiator. A no-op when the peer
    /// is already negotiating or connected.
    pub fn create_connection(&self, peer_id: &str) -> Result<(), PeerError> {
        let mut peers = self.inner.peers.lock();
        if peers.contains_key(peer_id) {
            info!(peer_id, "peer already tracked; skipping create_connection");
            return Ok(());
        }
        info!(peer_id, "creating connection");
        self.inner.open(&mut peers, peer_id, Role::Initiator)?;
        Ok(())
    }

    /// Sends through the peer's transfer strategy; fails when the peer is not
    /// connected.
    pub async fn send(&self, peer_id: &str, payload: impl Into<Payload>) -> Result<(), PeerError> {
        let transfer = self
            .inner
            .peers
            .lock()
            .get(peer_id)
            .and_then(|entry| entry.transfer.clone());
        let Some(transfer) = transfer else {
            warn!(peer_id, "no transfer bound for peer; message not sent");
            return Err(PeerError::NotConnected(peer_id.to_string()));
        };
        transfer.send(payload.into()).await?;
        Ok(())
    }

    /// Closes one peer. Returns false when it was not tracked.
    pub fn close_peer(&self, peer_id: &str) -> bool {
        let entry = self.inner.peers.lock().remove(peer_id);
        match entry {
            Some(entry) => {
                self.inner.release(peer_id, entry);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<(ClientId, PeerEntry)> = self.inner.peers.lock().drain().collect();
        let count = drained.len();
        for (peer_id, entry) in drained {
            self.inner.release(&peer_id, entry);
        }
        info!(count, "closed all peer connections");
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        self.signal_pump.abort();
        self.close_all();
    }
}

impl Inner {
    /// Creates and registers a transport for `peer_id`. The caller holds the
    /// peers lock, so nothing else can race a second instance in.
    fn open(
        self: &Arc<Self>,
        peers: &mut HashMap<ClientId, PeerEntry>,
        peer_id: &str,
        role: Role,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let session = self.transports.create(&self.local_id, peer_id, role)?;
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let pump = tokio::spawn(transport_pump(
            self.clone(),
            peer_id.to_string(),
            instance,
            session.events,
        ));
        peers.insert(
            peer_id.to_string(),
            PeerEntry {
                instance,
                role,
                state: PeerState::Negotiating,
                transport: session.transport.clone(),
                transfer: None,
                pump: Some(pump),
            },
        );
        debug!(peer_id, instance, ?role, "peer registered");
        Ok(session.transport)
    }

    fn handle_signal(self: &Arc<Self>, message: SignalMessage) {
        match message.kind {
            SignalKind::PeerList => {
                let mut seen = HashSet::new();
                let unique: Vec<ClientId> = message
                    .peers
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|id| seen.insert(id.clone()))
                    .collect();
                info!(peers = ?unique, "updated peer list");
                self.events.emit(PeerEvent::PeerList(unique));
            }
            SignalKind::Offer => self.handle_offer(message),
            SignalKind::Answer | SignalKind::Candidate => self.handle_followup(message),
            other => warn!(kind = %other, "unexpected signaling message"),
        }
    }

    fn handle_offer(self: &Arc<Self>, message: SignalMessage) {
        let Some(peer_id) = message.client_id else {
            warn!("offer missing clientId; dropping");
            return;
        };
        let mut peers = self.peers.lock();
        let existing = peers.get(&peer_id).map(|entry| entry.transport.clone());
        let transport = match existing {
            Some(transport) => {
                debug!(peer_id = %peer_id, "offer for known peer; renegotiating");
                transport
            }
            None => match self.open(&mut peers, &peer_id, Role::Responder) {
                Ok(transport) => transport,
                Err(err) => {
                    warn!(peer_id = %peer_id, error = %err, "failed to create responder transport");
                    return;
                }
            },
        };
        if let Some(payload) = message.payload {
            if let Err(err) = transport.signal(payload) {
                warn!(peer_id = %peer_id, error = %err, "offer rejected by transport");
                let removed = peers.remove(&peer_id);
                drop(peers);
                if let Some(entry) = removed {
                    self.release(&peer_id, entry);
                }
            }
        }
    }

    fn handle_followup(self: &Arc<Self>, message: SignalMessage) {
        let Some(peer_id) = message.client_id else {
            warn!(kind = %message.kind, "message missing clientId; dropping");
            return;
        };
        let mut peers = self.peers.lock();
        let Some(transport) = peers.get(&peer_id).map(|entry| entry.transport.clone()) else {
            warn!(kind = %message.kind, peer_id = %peer_id, "no peer found; dropping");
            return;
        };
        let Some(payload) = message.payload else {
            return;
        };
        if let Err(err) = transport.signal(payload) {
            warn!(kind = %message.kind, peer_id = %peer_id, error = %err, "negotiation failed");
            let removed = peers.remove(&peer_id);
            drop(peers);
            if let Some(entry) = removed {
                self.release(&peer_id, entry);
            }
        }
    }

    /// Wraps a locally generated negotiation payload for the relay.
    fn forward_negotiation(&self, peer_id: &str, instance: u64, payload: Value) {
        let role = match self.peers.lock().get(peer_id) {
            Some(entry) if entry.instance == instance => entry.role,
            _ => {
                debug!(peer_id, instance, "negotiation payload from stale transport; dropping");
                return;
            }
        };
        let message = if is_candidate(&payload) {
            SignalMessage::candidate(self.local_id.clone(), peer_id, payload)
        } else if role == Role::Initiator {
            SignalMessage::offer(self.local_id.clone(), peer_id, payload)
        } else {
            SignalMessage::answer(self.local_id.clone(), peer_id, payload)
        };
        if let Err(err) = self.signaling.send(message) {
            warn!(peer_id, error = %err, "failed to send negotiation payload");
        }
    }

    fn on_connect(&self, peer_id: &str, instance: u64) {
        {
            let mut peers = self.peers.lock();
            let Some(entry) = peers.get_mut(peer_id) else {
                return;
            };
            if entry.instance != instance || entry.state == PeerState::Connected {
                return;
            }
            let transfer = (self.transfers)();
            transfer.attach(entry.transport.clone(), peer_id);
            let events = self.events.clone();
            transfer.on_data(Arc::new(move |from, payload| {
                events.emit(PeerEvent::Data {
                    from: from.to_string(),
                    payload,
                });
            }));
            entry.transfer = Some(transfer);
            entry.state = PeerState::Connected;
        }
        info!(peer_id, "connected to peer");
        self.events.emit(PeerEvent::PeerConnected(peer_id.to_string()));
    }

    fn on_data(&self, peer_id: &str, instance: u64, data: bytes::Bytes) {
        let transfer = match self.peers.lock().get(peer_id) {
            Some(entry) if entry.instance == instance => entry.transfer.clone(),
            _ => None,
        };
        match transfer {
            Some(transfer) => transfer.receive(data),
            None => debug!(peer_id, "data before connect; dropping"),
        }
    }

    /// Removes the entry only if it still belongs to `instance`.
    fn teardown(&self, peer_id: &str, instance: u64) {
        let entry = {
            let mut peers = self.peers.lock();
            match peers.get(peer_id) {
                Some(entry) if entry.instance == instance => peers.remove(peer_id),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            self.release(peer_id, entry);
        }
    }

    /// Best-effort cleanup of an entry already removed from the map.
    fn release(&self, peer_id: &str, mut entry: PeerEntry) {
        if let Some(transfer) = entry.transfer.take() {
            transfer.cleanup();
        }
        entry.transport.close();
        if let Some(pump) = entry.pump.take() {
            pump.abort();
        }
        info!(peer_id, instance = entry.instance, "peer connection closed");
        self.events.emit(PeerEvent::PeerClosed(peer_id.to_string()));
    }
}

async fn signal_pump(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<SignalingEvent>) {
    while let Some(event) = inbound.recv().await {
        match event {
            SignalingEvent::Message(message) => inner.handle_signal(message),
            SignalingEvent::Open => debug!("signaling open"),
            SignalingEvent::Close => debug!("signaling closed"),
            SignalingEvent::Error(err) => debug!(error = %err, "signaling error"),
        }
    }
}

async fn transport_pump(
    inner: Arc<Inner>,
    peer_id: ClientId,
    instance: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Signal(payload) => inner.forward_negotiation(&peer_id, instance, payload),
            TransportEvent::Connect => inner.on_connect(&peer_id, instance),
            TransportEvent::Data(data) => inner.on_data(&peer_id, instance, data),
            TransportEvent::Close => {
                warn!(peer_id = %peer_id, "peer transport closed");
                break;
            }
            TransportEvent::Error(err) => {
                warn!(peer_id = %peer_id, error = %err, "peer transport error");
                break;
            }
        }
    }
    inner.teardown(&peer_id, instance);
}
