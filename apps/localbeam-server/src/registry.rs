use std::collections::{HashMap, HashSet};

use localbeam_proto::{ClientId, SignalMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Writer is backed up; the frame was dropped rather than queued.
    Dropped,
    Closed,
}

/// Sending side of one WebSocket connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn try_deliver(&self, frame: String) -> Delivery {
        match self.tx.try_send(Outbound::Text(frame)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Asks the writer to send a close frame. Best effort.
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }
}

/// Outcome of a `register` call.
#[derive(Debug)]
pub struct Registration {
    /// Handle previously registered under the same id, if it was a different
    /// connection. It stays open; only its registry entry is gone.
    pub replaced: Option<ConnectionHandle>,
    pub peers: Vec<ClientId>,
}

/// Maps client ids to live connections. Every mutation and the peer-list
/// broadcast it triggers happen under one lock, so each snapshot sent out
/// equals the registry at that instant.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, ConnectionHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces (last writer wins) and broadcasts the peer list to
    /// every registered client, the new one included.
    pub fn register(&self, client_id: &str, handle: ConnectionHandle) -> Registration {
        let mut clients = self.clients.lock();
        let previous = clients.insert(client_id.to_string(), handle.clone());
        let replaced = previous.filter(|old| old.id() != handle.id());
        if replaced.is_some() {
            warn!(client_id, "client id re-registered; previous connection left orphaned");
        }
        info!(client_id, connection_id = %handle.id(), "registered client");
        let peers = broadcast_locked(&clients);
        Registration { replaced, peers }
    }

    /// Drops every entry that points at `connection` and rebroadcasts when
    /// anything was removed.
    pub fn unregister_connection(&self, connection: ConnectionId) -> Vec<ClientId> {
        let mut clients = self.clients.lock();
        let removed: Vec<ClientId> = clients
            .iter()
            .filter(|(_, handle)| handle.id() == connection)
            .map(|(id, _)| id.clone())
            .collect();
        if removed.is_empty() {
            return removed;
        }
        for id in &removed {
            clients.remove(id);
            warn!(client_id = %id, "client disconnected");
        }
        broadcast_locked(&clients);
        removed
    }

    pub fn lookup(&self, client_id: &str) -> Option<ConnectionHandle> {
        self.clients.lock().get(client_id).cloned()
    }

    /// Sorted snapshot of registered ids.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broadcast_peer_list(&self) -> Vec<ClientId> {
        let clients = self.clients.lock();
        broadcast_locked(&clients)
    }

    /// Empties the registry, returning the handles that were in it.
    pub fn clear(&self) -> Vec<ConnectionHandle> {
        self.clients.lock().drain().map(|(_, handle)| handle).collect()
    }
}

fn broadcast_locked(clients: &HashMap<ClientId, ConnectionHandle>) -> Vec<ClientId> {
    let mut peers: Vec<ClientId> = clients.keys().cloned().collect();
    peers.sort();
    let frame = match SignalMessage::peer_list(peers.clone()).to_json() {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "failed to encode peer list");
            return peers;
        }
    };

    let mut notified = HashSet::new();
    for handle in clients.values() {
        if !notified.insert(handle.id()) || !handle.is_open() {
            continue;
        }
        if handle.try_deliver(frame.clone()) == Delivery::Dropped {
            warn!(connection_id = %handle.id(), "peer list dropped for slow connection");
        }
    }
    debug!(peers = ?peers, "broadcast peer list");
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionHandle::new(tx), rx)
    }

    fn last_peer_list(rx: &mut mpsc::Receiver<Outbound>) -> Option<Vec<ClientId>> {
        let mut last = None;
        while let Ok(Outbound::Text(frame)) = rx.try_recv() {
            let msg = SignalMessage::parse(&frame).expect("frame parses");
            last = msg.peers;
        }
        last
    }

    #[test]
    fn register_broadcasts_to_everyone() {
        let registry = ClientRegistry::new();
        let (a, mut a_rx) = connection();
        let (b, mut b_rx) = connection();
        registry.register("A", a);
        registry.register("B", b);

        let expected = vec!["A".to_string(), "B".to_string()];
        assert_eq!(last_peer_list(&mut a_rx), Some(expected.clone()));
        assert_eq!(last_peer_list(&mut b_rx), Some(expected));
    }

    #[test]
    fn re_register_replaces_handle() {
        let registry = ClientRegistry::new();
        let (first, _first_rx) = connection();
        let (second, _second_rx) = connection();
        let first_id = first.id();
        registry.register("A", first);
        let registration = registry.register("A", second.clone());

        assert_eq!(registration.replaced.map(|h| h.id()), Some(first_id));
        assert_eq!(registry.lookup("A").map(|h| h.id()), Some(second.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn orphaned_connection_disconnect_keeps_new_entry() {
        let registry = ClientRegistry::new();
        let (first, _first_rx) = connection();
        let (second, _second_rx) = connection();
        let first_id = first.id();
        registry.register("A", first);
        registry.register("A", second);

        assert!(registry.unregister_connection(first_id).is_empty());
        assert_eq!(registry.client_ids(), vec!["A".to_string()]);
    }

    #[test]
    fn unregister_rebroadcasts_remaining_ids() {
        let registry = ClientRegistry::new();
        let (a, mut a_rx) = connection();
        let (b, _b_rx) = connection();
        let b_id = b.id();
        registry.register("A", a);
        registry.register("B", b);
        let _ = last_peer_list(&mut a_rx);

        assert_eq!(registry.unregister_connection(b_id), vec!["B".to_string()]);
        assert_eq!(last_peer_list(&mut a_rx), Some(vec!["A".to_string()]));
    }

    #[test]
    fn closed_connections_are_skipped() {
        let registry = ClientRegistry::new();
        let (a, a_rx) = connection();
        drop(a_rx);
        let (b, mut b_rx) = connection();
        registry.register("A", a);
        registry.register("B", b);
        assert_eq!(
            last_peer_list(&mut b_rx),
            Some(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn full_writer_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(tx);
        assert_eq!(handle.try_deliver("one".into()), Delivery::Delivered);
        assert_eq!(handle.try_deliver("two".into()), Delivery::Dropped);
    }

    #[test]
    fn clear_drains_everything() {
        let registry = ClientRegistry::new();
        let (a, _a_rx) = connection();
        registry.register("A", a);
        assert_eq!(registry.clear().len(), 1);
        assert!(registry.is_empty());
        assert!(registry.clear().is_empty());
    }
}
