use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use localbeam_proto::{ProtocolError, Route, SignalMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::{ClientRegistry, ConnectionHandle, ConnectionId, Delivery, Outbound};

const DEFAULT_CONNECTION_BUFFER: usize = 64;

/// Relay state shared by every WebSocket connection.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    registry: ClientRegistry,
    /// Every open socket, registered or not, so `close` can reach all of them.
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    connection_buffer: usize,
    closed: AtomicBool,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_BUFFER)
    }
}

impl RelayState {
    pub fn new(connection_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                registry: ClientRegistry::new(),
                connections: Mutex::new(HashMap::new()),
                connection_buffer: connection_buffer.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.inner.registry
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Allocates the outbound side for a freshly accepted socket.
    pub fn open_connection(&self) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.inner.connection_buffer);
        let handle = ConnectionHandle::new(tx);
        let mut connections = self.inner.connections.lock();
        if self.is_closed() {
            handle.close();
        } else {
            connections.insert(handle.id(), handle.clone());
        }
        drop(connections);
        (handle, rx)
    }

    /// Parses and routes one text frame. Bad input is logged and dropped; it
    /// never affects the sender's connection.
    pub fn handle_message(&self, sender: &ConnectionHandle, raw: &str) {
        let message = match SignalMessage::parse(raw) {
            Ok(message) => message,
            Err(err) => {
                error!(connection_id = %sender.id(), error = %err, "failed to parse signaling message");
                return;
            }
        };

        match message.route() {
            Ok(Route::Register { client_id }) => {
                if self.is_closed() {
                    debug!(connection_id = %sender.id(), client_id, "relay closed; ignoring register");
                    return;
                }
                self.inner.registry.register(client_id, sender.clone());
                // A close that raced the register above has already cleared the registry.
                if self.is_closed() {
                    self.inner.registry.unregister_connection(sender.id());
                }
            }
            Ok(Route::Relay {
                kind,
                client_id,
                target_id,
            }) => self.relay(&message, kind.as_str(), client_id, target_id),
            Ok(Route::PeerList) => {
                warn!(connection_id = %sender.id(), "clients may not send peer-list; dropping");
            }
            Err(ProtocolError::UnknownType) => {
                warn!(connection_id = %sender.id(), frame = raw, "unknown message type");
            }
            Err(err) => {
                warn!(connection_id = %sender.id(), error = %err, "dropping invalid signaling message");
            }
        }
    }

    fn relay(&self, message: &SignalMessage, kind: &str, client_id: &str, target_id: &str) {
        let Some(target) = self.inner.registry.lookup(target_id) else {
            debug!(kind, client_id, target_id, "relay target not registered; dropping");
            return;
        };
        if !target.is_open() {
            debug!(kind, client_id, target_id, "relay target closed; dropping");
            return;
        }
        let frame = match message.forwarded().to_json() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode forwarded message");
                return;
            }
        };
        match target.try_deliver(frame) {
            Delivery::Delivered => info!(kind, client_id, target_id, "relayed message"),
            Delivery::Dropped => warn!(kind, client_id, target_id, "relay target backed up; dropping"),
            Delivery::Closed => debug!(kind, client_id, target_id, "relay target closed; dropping"),
        }
    }

    pub fn handle_disconnect(&self, connection: &ConnectionHandle) {
        self.inner.connections.lock().remove(&connection.id());
        self.inner.registry.unregister_connection(connection.id());
    }

    /// Closes every connection and clears the registry. Safe to call twice.
    pub fn close(&self) {
        let connections: Vec<ConnectionHandle> = {
            let mut open = self.inner.connections.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            open.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &connections {
            handle.close();
        }
        self.inner.registry.clear();
        info!(closed = connections.len(), "signaling relay closed");
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(relay): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, relay, remote_addr))
}

async fn handle_socket(socket: WebSocket, relay: RelayState, remote_addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut rx) = relay.open_connection();
    let connection_id = handle.id();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Text(frame) => sink.send(Message::Text(frame)).await,
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        debug!(%connection_id, "writer task finished");
    });

    info!(%connection_id, %remote_addr, "new websocket connection");

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%connection_id, error = %err, "websocket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => relay.handle_message(&handle, &text),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => relay.handle_message(&handle, text),
                Err(_) => debug!(%connection_id, len = data.len(), "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    relay.handle_disconnect(&handle);
    drop(handle);
    if tokio::time::timeout(std::time::Duration::from_secs(1), writer)
        .await
        .is_err()
    {
        debug!(%connection_id, "writer did not finish after disconnect");
    }
    info!(%connection_id, "websocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use localbeam_proto::SignalKind;
    use serde_json::json;

    fn texts(rx: &mut mpsc::Receiver<Outbound>) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Text(frame) = outbound {
                out.push(SignalMessage::parse(&frame).expect("valid frame"));
            }
        }
        out
    }

    fn register(relay: &RelayState, id: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (handle, mut rx) = relay.open_connection();
        relay.handle_message(&handle, &SignalMessage::register(id).to_json().unwrap());
        let _ = texts(&mut rx);
        (handle, rx)
    }

    #[test]
    fn offer_is_forwarded_without_target() {
        let relay = RelayState::default();
        let (a, _a_rx) = register(&relay, "A");
        let (_b, mut b_rx) = register(&relay, "B");

        let offer = SignalMessage::offer("A", "B", json!({"sdp": "v=0"}));
        relay.handle_message(&a, &offer.to_json().unwrap());

        let received = texts(&mut b_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, SignalKind::Offer);
        assert_eq!(received[0].client_id.as_deref(), Some("A"));
        assert_eq!(received[0].target_id, None);
        assert_eq!(received[0].payload, Some(json!({"sdp": "v=0"})));
    }

    #[test]
    fn offer_to_unknown_target_sends_nothing() {
        let relay = RelayState::default();
        let (a, mut a_rx) = register(&relay, "A");
        relay.handle_message(
            &a,
            &SignalMessage::offer("A", "ghost", json!({})).to_json().unwrap(),
        );
        assert!(texts(&mut a_rx).is_empty());
        assert_eq!(relay.registry().client_ids(), vec!["A".to_string()]);
    }

    #[test]
    fn malformed_and_incomplete_frames_are_dropped() {
        let relay = RelayState::default();
        let (a, mut a_rx) = register(&relay, "A");
        let (_b, mut b_rx) = register(&relay, "B");
        let _ = texts(&mut a_rx);

        relay.handle_message(&a, "{not json");
        relay.handle_message(&a, r#"{"type":"offer","clientId":"A"}"#);
        relay.handle_message(&a, r#"{"type":"register"}"#);
        relay.handle_message(&a, r#"{"type":"shout","clientId":"A"}"#);

        assert!(texts(&mut a_rx).is_empty());
        assert!(texts(&mut b_rx).is_empty());
        assert_eq!(relay.registry().len(), 2);
    }

    #[test]
    fn ordered_delivery_per_sender() {
        let relay = RelayState::default();
        let (a, _a_rx) = register(&relay, "A");
        let (_b, mut b_rx) = register(&relay, "B");
        for n in 0..5 {
            relay.handle_message(
                &a,
                &SignalMessage::candidate("A", "B", json!({ "n": n }))
                    .to_json()
                    .unwrap(),
            );
        }
        let order: Vec<_> = texts(&mut b_rx)
            .into_iter()
            .map(|m| m.payload.unwrap()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn close_is_idempotent_and_refuses_new_connections() {
        let relay = RelayState::default();
        let (_a, mut a_rx) = register(&relay, "A");
        relay.close();
        relay.close();
        assert!(relay.registry().is_empty());
        assert_eq!(a_rx.try_recv().ok(), Some(Outbound::Close));

        let (_late, mut late_rx) = relay.open_connection();
        assert_eq!(late_rx.try_recv().ok(), Some(Outbound::Close));
    }

    #[test]
    fn register_after_close_leaves_registry_empty() {
        let relay = RelayState::default();
        let (early, _early_rx) = relay.open_connection();
        relay.close();

        relay.handle_message(&early, &SignalMessage::register("A").to_json().unwrap());
        let (late, _late_rx) = relay.open_connection();
        relay.handle_message(&late, &SignalMessage::register("B").to_json().unwrap());
        assert!(relay.registry().is_empty());
    }

    #[test]
    fn close_racing_registrations_leaves_nothing_behind() {
        for _ in 0..200 {
            let relay = RelayState::default();
            let registering = {
                let relay = relay.clone();
                std::thread::spawn(move || {
                    for n in 0..20 {
                        let (handle, _rx) = relay.open_connection();
                        let frame = SignalMessage::register(format!("c{n}")).to_json().unwrap();
                        relay.handle_message(&handle, &frame);
                    }
                })
            };
            relay.close();
            registering.join().expect("registering thread");
            assert!(relay.registry().is_empty());
        }
    }
}
