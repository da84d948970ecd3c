//! WebRTC data-channel transport.
//!
//! The initiator opens one ordered data channel and sends its offer; the
//! responder answers. Session descriptions travel as `{type, sdp}` and
//! trickled ICE candidates as `{candidate, sdpMid, sdpMLineIndex}`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{is_candidate, PeerTransport, Role, TransportError, TransportEvent, TransportFactory, TransportSession};

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            data_channel_label: "localbeam".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebRtcFactory {
    config: WebRtcConfig,
}

impl WebRtcFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

struct Shared {
    events: mpsc::UnboundedSender<TransportEvent>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    closed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, err: impl std::fmt::Display) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.emit(TransportEvent::Error(err.to_string()));
        }
    }

    fn closed_remotely(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.emit(TransportEvent::Close);
        }
    }
}

impl TransportFactory for WebRtcFactory {
    fn create(
        &self,
        local_id: &str,
        peer_id: &str,
        role: Role,
    ) -> Result<TransportSession, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: events_tx,
            peer_connection: Mutex::new(None),
            data_channel: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        debug!(local_id, peer_id, ?role, "creating webrtc transport");
        let driver = tokio::spawn(drive(self.config.clone(), role, shared.clone(), signal_rx));
        Ok(TransportSession {
            transport: Arc::new(WebRtcTransport {
                shared,
                signals: signal_tx,
                driver: Mutex::new(Some(driver)),
            }),
            events: events_rx,
        })
    }
}

pub struct WebRtcTransport {
    shared: Arc<Shared>,
    signals: mpsc::UnboundedSender<Value>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn signal(&self, payload: Value) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.signals.send(payload).map_err(|_| TransportError::Closed)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let channel = self.shared.data_channel.lock().clone();
        let Some(channel) = channel else {
            return Err(TransportError::NotWritable);
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotWritable);
        }
        channel
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Backend(err.to_string()))
    }

    fn is_writable(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
            && self
                .shared
                .data_channel
                .lock()
                .as_ref()
                .is_some_and(|channel| channel.ready_state() == RTCDataChannelState::Open)
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.shared.data_channel.lock().take();
        let peer_connection = self.shared.peer_connection.lock().take();
        if let Some(peer_connection) = peer_connection {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(err) = peer_connection.close().await {
                        debug!(error = %err, "peer connection close failed");
                    }
                });
            }
        }
    }
}

async fn drive(
    config: WebRtcConfig,
    role: Role,
    shared: Arc<Shared>,
    mut signals: mpsc::UnboundedReceiver<Value>,
) {
    let peer_connection = match open_peer_connection(&config, &shared).await {
        Ok(peer_connection) => peer_connection,
        Err(err) => {
            shared.fail(err);
            return;
        }
    };

    if role == Role::Initiator {
        if let Err(err) = start_offer(&config, &shared, &peer_connection).await {
            shared.fail(err);
            return;
        }
    }

    // Candidates that arrive ahead of the remote description wait here.
    let mut pending: Vec<RTCIceCandidateInit> = Vec::new();
    while let Some(payload) = signals.recv().await {
        if let Err(err) = apply_remote(role, &shared, &peer_connection, &mut pending, payload).await {
            warn!(error = %err, "webrtc negotiation step failed");
            shared.fail(err);
            return;
        }
    }
}

async fn open_peer_connection(
    config: &WebRtcConfig,
    shared: &Arc<Shared>,
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let api = APIBuilder::new().build();
    let rtc_config = RTCConfiguration {
        ice_servers: if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        },
        ..Default::default()
    };
    let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
    *shared.peer_connection.lock() = Some(peer_connection.clone());

    let for_state = shared.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let shared = for_state.clone();
        Box::pin(async move {
            debug!(?state, "peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                shared.closed_remotely();
            }
        })
    }));

    let for_ice = shared.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let shared = for_ice.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate
                .to_json()
                .map_err(|err| err.to_string())
                .and_then(|init| serde_json::to_value(init).map_err(|err| err.to_string()))
            {
                Ok(payload) => shared.emit(TransportEvent::Signal(payload)),
                Err(err) => warn!(error = %err, "failed to encode ICE candidate"),
            }
        })
    }));

    let for_channel = shared.clone();
    peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let shared = for_channel.clone();
        Box::pin(async move {
            info!(label = channel.label(), "data channel received");
            wire_data_channel(&shared, channel);
        })
    }));

    Ok(peer_connection)
}

async fn start_offer(
    config: &WebRtcConfig,
    shared: &Arc<Shared>,
    peer_connection: &Arc<RTCPeerConnection>,
) -> Result<(), TransportError> {
    let init = RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    };
    let channel = peer_connection
        .create_data_channel(&config.data_channel_label, Some(init))
        .await
        .map_err(backend)?;
    wire_data_channel(shared, channel);

    let offer = peer_connection.create_offer(None).await.map_err(backend)?;
    peer_connection
        .set_local_description(offer.clone())
        .await
        .map_err(backend)?;
    shared.emit(TransportEvent::Signal(
        serde_json::to_value(&offer).map_err(backend)?,
    ));
    Ok(())
}

/// Only session-description failures are fatal; a bad candidate is logged
/// and skipped.
async fn apply_remote(
    role: Role,
    shared: &Arc<Shared>,
    peer_connection: &Arc<RTCPeerConnection>,
    pending: &mut Vec<RTCIceCandidateInit>,
    payload: Value,
) -> Result<(), TransportError> {
    if is_candidate(&payload) {
        let candidate: RTCIceCandidateInit = match serde_json::from_value(payload) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable ICE candidate");
                return Ok(());
            }
        };
        if peer_connection.remote_description().await.is_none() {
            debug!("queueing ICE candidate until the remote description is set");
            pending.push(candidate);
        } else {
            add_candidate(peer_connection, candidate).await;
        }
        return Ok(());
    }

    let description: RTCSessionDescription = serde_json::from_value(payload)
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    let is_offer = description.sdp_type == RTCSdpType::Offer;
    peer_connection
        .set_remote_description(description)
        .await
        .map_err(backend)?;

    if !pending.is_empty() {
        debug!(count = pending.len(), "adding queued ICE candidates");
    }
    for candidate in pending.drain(..) {
        add_candidate(peer_connection, candidate).await;
    }

    if is_offer && role == Role::Responder {
        let answer = peer_connection.create_answer(None).await.map_err(backend)?;
        peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(backend)?;
        shared.emit(TransportEvent::Signal(
            serde_json::to_value(&answer).map_err(backend)?,
        ));
    }
    Ok(())
}

async fn add_candidate(peer_connection: &RTCPeerConnection, candidate: RTCIceCandidateInit) {
    if let Err(err) = peer_connection.add_ice_candidate(candidate).await {
        warn!(error = %err, "failed to add ICE candidate");
    }
}

fn wire_data_channel(shared: &Arc<Shared>, channel: Arc<RTCDataChannel>) {
    let for_open = shared.clone();
    channel.on_open(Box::new(move || {
        let shared = for_open.clone();
        Box::pin(async move {
            info!("data channel open");
            shared.emit(TransportEvent::Connect);
        })
    }));

    let for_message = shared.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let shared = for_message.clone();
        Box::pin(async move {
            shared.emit(TransportEvent::Data(message.data));
        })
    }));

    let for_close = shared.clone();
    channel.on_close(Box::new(move || {
        let shared = for_close.clone();
        Box::pin(async move {
            shared.closed_remotely();
        })
    }));

    *shared.data_channel.lock() = Some(channel);
}

fn backend(err: impl std::fmt::Display) -> TransportError {
    TransportError::Backend(err.to_string())
}
