use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{is_candidate, PeerTransport, Role, TransportError, TransportEvent, TransportFactory, TransportSession};

/// In-process transport: endpoints created from the same network pair up by
/// exchanging offer/answer payloads, then move bytes over channels.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    next_session: AtomicU64,
    offers: Mutex<HashMap<u64, Weak<Endpoint>>>,
    created: AtomicUsize,
}

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<EndpointState>,
}

struct EndpointState {
    role: Role,
    session: Option<u64>,
    partner: Weak<Endpoint>,
    connected: bool,
    closed: bool,
    candidates: usize,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transports created so far.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// Offers made but not yet taken by a responder.
    pub fn pending_offers(&self) -> usize {
        self.inner.offers.lock().len()
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(
        &self,
        local_id: &str,
        peer_id: &str,
        role: Role,
    ) -> Result<TransportSession, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Endpoint {
            events: tx,
            state: Mutex::new(EndpointState {
                role,
                session: None,
                partner: Weak::new(),
                connected: false,
                closed: false,
                candidates: 0,
            }),
        });
        self.inner.created.fetch_add(1, Ordering::Relaxed);

        if role == Role::Initiator {
            let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
            self.inner
                .offers
                .lock()
                .insert(session, Arc::downgrade(&endpoint));
            endpoint.state.lock().session = Some(session);
            endpoint.emit(TransportEvent::Signal(json!({ "type": "offer", "session": session })));
            endpoint.emit(TransportEvent::Signal(candidate(local_id, session)));
        }
        debug!(local_id, peer_id, ?role, "memory transport created");

        Ok(TransportSession {
            transport: Arc::new(MemoryTransport {
                local_id: local_id.to_string(),
                endpoint,
                network: self.clone(),
            }),
            events: rx,
        })
    }
}

fn candidate(local_id: &str, session: u64) -> Value {
    json!({ "candidate": format!("memory:{local_id}"), "session": session })
}

pub struct MemoryTransport {
    local_id: String,
    endpoint: Arc<Endpoint>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    fn accept_offer(&self, payload: &Value) -> Result<(), TransportError> {
        if self.endpoint.state.lock().session.is_some() {
            // Renegotiation of a linked pair; nothing to redo in memory.
            return Ok(());
        }
        let session = payload
            .get("session")
            .and_then(Value::as_u64)
            .ok_or_else(|| TransportError::Negotiation("offer without session".into()))?;
        let initiator = self
            .network
            .inner
            .offers
            .lock()
            .remove(&session)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| TransportError::Negotiation(format!("unknown session {session}")))?;

        initiator.state.lock().partner = Arc::downgrade(&self.endpoint);
        {
            let mut state = self.endpoint.state.lock();
            state.partner = Arc::downgrade(&initiator);
            state.session = Some(session);
        }
        self.endpoint
            .emit(TransportEvent::Signal(json!({ "type": "answer", "session": session })));
        self.endpoint
            .emit(TransportEvent::Signal(candidate(&self.local_id, session)));
        Ok(())
    }

    fn accept_answer(&self, payload: &Value) -> Result<(), TransportError> {
        let partner = {
            let state = self.endpoint.state.lock();
            if state.connected {
                return Ok(());
            }
            let session = payload.get("session").and_then(Value::as_u64);
            if session != state.session {
                return Err(TransportError::Negotiation("answer for another session".into()));
            }
            state
                .partner
                .upgrade()
                .ok_or_else(|| TransportError::Negotiation("answer before offer was taken".into()))?
        };

        self.endpoint.state.lock().connected = true;
        self.endpoint.emit(TransportEvent::Connect);
        let mut partner_state = partner.state.lock();
        if !partner_state.closed {
            partner_state.connected = true;
            partner.emit(TransportEvent::Connect);
        }
        Ok(())
    }

    /// Candidates received so far.
    pub fn candidates_seen(&self) -> usize {
        self.endpoint.state.lock().candidates
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn signal(&self, payload: Value) -> Result<(), TransportError> {
        let role = {
            let mut state = self.endpoint.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if is_candidate(&payload) {
                state.candidates += 1;
                return Ok(());
            }
            state.role
        };
        match (payload.get("type").and_then(Value::as_str), role) {
            (Some("offer"), Role::Responder) => self.accept_offer(&payload),
            (Some("answer"), Role::Initiator) => self.accept_answer(&payload),
            (kind, role) => Err(TransportError::Negotiation(format!(
                "unexpected {} payload for {role:?}",
                kind.unwrap_or("untyped")
            ))),
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let partner = {
            let state = self.endpoint.state.lock();
            if state.closed || !state.connected {
                return Err(TransportError::NotWritable);
            }
            state.partner.upgrade().ok_or(TransportError::NotWritable)?
        };
        if partner.state.lock().closed {
            return Err(TransportError::NotWritable);
        }
        partner.emit(TransportEvent::Data(data));
        Ok(())
    }

    fn is_writable(&self) -> bool {
        let partner = {
            let state = self.endpoint.state.lock();
            if state.closed || !state.connected {
                return false;
            }
            state.partner.clone()
        };
        // Own lock is released before touching the partner's.
        partner
            .upgrade()
            .is_some_and(|partner| !partner.state.lock().closed)
    }

    fn close(&self) {
        let (partner, session) = {
            let mut state = self.endpoint.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connected = false;
            (std::mem::take(&mut state.partner), state.session)
        };
        if let Some(session) = session {
            self.network.inner.offers.lock().remove(&session);
        }
        self.endpoint.emit(TransportEvent::Close);

        if let Some(partner) = partner.upgrade() {
            let mut state = partner.state.lock();
            if !state.closed {
                state.closed = true;
                state.connected = false;
                partner.emit(TransportEvent::Close);
            }
        }
    }
}
