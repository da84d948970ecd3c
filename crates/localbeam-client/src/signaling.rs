use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use localbeam_discovery::{MulticastDiscovery, ServiceBrowser};
use localbeam_proto::{ClientId, ProtocolError, SignalMessage};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{QueuePolicy, SignalingOptions};
use crate::discovery::{Resolution, Resolver};
use crate::events::EventHub;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("outbound queue full ({capacity} messages)")]
    QueueFull { capacity: usize },
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("embedded relay failed to start: {0}")]
    Embedded(String),
}

/// Events published by the signaling client.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Open,
    Message(SignalMessage),
    Close,
    Error(String),
}

/// The slice of the signaling client the peer manager depends on.
pub trait SignalChannel: Send + Sync {
    fn client_id(&self) -> &str;

    /// Sends now when connected, queues otherwise.
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalingEvent>;
}

enum Outgoing {
    Text(String),
    Close,
}

#[derive(Default)]
struct Link {
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    queue: VecDeque<String>,
    url: Option<String>,
}

struct Inner {
    client_id: ClientId,
    options: SignalingOptions,
    browser: Arc<dyn ServiceBrowser>,
    link: Mutex<Link>,
    events: EventHub<SignalingEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(feature = "embedded-server")]
    embedded: tokio::sync::Mutex<Option<localbeam_server::ServerHandle>>,
}

/// One logical connection to a relay, with outbound buffering while the
/// connection is down.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

impl SignalingClient {
    /// Browses with multicast discovery.
    pub fn new(options: SignalingOptions) -> Self {
        Self::with_browser(options, Arc::new(MulticastDiscovery::new()))
    }

    pub fn with_browser(options: SignalingOptions, browser: Arc<dyn ServiceBrowser>) -> Self {
        let client_id = options.resolve_client_id();
        Self {
            inner: Arc::new(Inner {
                client_id,
                options,
                browser,
                link: Mutex::new(Link::default()),
                events: EventHub::new(),
                tasks: Mutex::new(Vec::new()),
                #[cfg(feature = "embedded-server")]
                embedded: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &SignalingOptions {
        &self.inner.options
    }

    pub fn is_open(&self) -> bool {
        self.inner.link.lock().writer.is_some()
    }

    /// Address of the relay of the current or last connection.
    pub fn url(&self) -> Option<String> {
        self.inner.link.lock().url.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.link.lock().queue.len()
    }

    /// Resolves a relay address, connects, registers, flushes the queue and
    /// emits `Open`.
    pub async fn connect(&self) -> Result<Resolution, SignalingError> {
        self.start_embedded().await?;

        let resolution = Resolver::new(self.inner.options.clone(), self.inner.browser.clone())
            .resolve()
            .await;
        self.connect_to(&resolution.url).await?;
        Ok(resolution)
    }

    /// Connects to a known relay address, skipping resolution.
    pub async fn connect_to(&self, url: &str) -> Result<(), SignalingError> {
        let (stream, _) = match connect_async(url).await {
            Ok(result) => result,
            Err(source) => {
                error!(%url, error = %source, "signaling connection failed");
                self.inner.events.emit(SignalingEvent::Error(source.to_string()));
                return Err(SignalingError::Connect {
                    url: url.to_string(),
                    source,
                });
            }
        };
        let (mut sink, mut stream) = stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Outgoing>();

        let own_writer = writer_tx.downgrade();
        let writer_inner = self.inner.clone();
        let writer = tokio::spawn(async move {
            while let Some(outgoing) = writer_rx.recv().await {
                let result = match outgoing {
                    Outgoing::Text(frame) => sink.send(Message::Text(frame.into())).await,
                    Outgoing::Close => {
                        let _ = sink.close().await;
                        break;
                    }
                };
                if let Err(err) = result {
                    warn!(error = %err, "signaling write failed");
                    if let Some(own) = own_writer.upgrade() {
                        writer_inner.write_failed(&own, &err.to_string());
                    }
                    break;
                }
            }
        });

        let register = SignalMessage::register(self.inner.client_id.clone()).to_json()?;
        {
            let mut link = self.inner.link.lock();
            let _ = writer_tx.send(Outgoing::Text(register));
            let flushed = link.queue.len();
            for frame in link.queue.drain(..) {
                let _ = writer_tx.send(Outgoing::Text(frame));
            }
            link.writer = Some(writer_tx.clone());
            link.url = Some(url.to_string());
            info!(%url, client_id = %self.inner.client_id, flushed, "signaling connected");
            self.inner.events.emit(SignalingEvent::Open);
        }

        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalMessage::parse(&text) {
                        Ok(message) => inner.events.emit(SignalingEvent::Message(message)),
                        Err(err) => {
                            warn!(error = %err, "ignoring unreadable signaling frame");
                            inner.events.emit(SignalingEvent::Error(err.to_string()));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "signaling connection error");
                        inner.events.emit(SignalingEvent::Error(err.to_string()));
                        break;
                    }
                }
            }
            inner.detach(&writer_tx);
            let _ = writer_tx.send(Outgoing::Close);
            warn!(client_id = %inner.client_id, "signaling connection closed");
            inner.events.emit(SignalingEvent::Close);
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(writer);
        tasks.push(reader);
        Ok(())
    }

    /// Closes the relay connection and stops the embedded relay if this
    /// client started one.
    pub async fn close(&self) {
        let writer = self.inner.link.lock().writer.take();
        if let Some(writer) = writer {
            let _ = writer.send(Outgoing::Close);
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(std::time::Duration::from_secs(2), task)
                .await
                .is_err()
            {
                debug!("signaling task did not finish in time");
            }
        }
        self.stop_embedded().await;
    }

    #[cfg(feature = "embedded-server")]
    async fn start_embedded(&self) -> Result<(), SignalingError> {
        if !self.inner.options.embedded_server {
            return Ok(());
        }
        let mut embedded = self.inner.embedded.lock().await;
        if embedded.is_some() {
            return Ok(());
        }
        let config = localbeam_server::Config {
            port: self.inner.options.port,
            service_name: self.inner.options.service_name.clone(),
            discovery_timeout: self.inner.options.discovery_timeout,
            ..localbeam_server::Config::default()
        };
        info!(port = config.port, "starting embedded relay");
        let handle = localbeam_server::LocalBeamServer::new(config)
            .start()
            .await
            .map_err(|err| SignalingError::Embedded(format!("{err:#}")))?;
        *embedded = Some(handle);
        Ok(())
    }

    #[cfg(not(feature = "embedded-server"))]
    async fn start_embedded(&self) -> Result<(), SignalingError> {
        if self.inner.options.embedded_server {
            warn!("embedded relay requested but the embedded-server feature is disabled");
        }
        Ok(())
    }

    #[cfg(feature = "embedded-server")]
    async fn stop_embedded(&self) {
        let handle = self.inner.embedded.lock().await.take();
        if let Some(mut handle) = handle {
            info!("stopping embedded relay");
            handle.stop().await;
        }
    }

    #[cfg(not(feature = "embedded-server"))]
    async fn stop_embedded(&self) {}
}

impl Inner {
    /// Drops the link's writer if it is still `writer`. Returns whether it was.
    fn detach(&self, writer: &mpsc::UnboundedSender<Outgoing>) -> bool {
        let mut link = self.link.lock();
        if link
            .writer
            .as_ref()
            .is_some_and(|current| current.same_channel(writer))
        {
            link.writer = None;
            return true;
        }
        false
    }

    /// Later sends queue until the next connect.
    fn write_failed(&self, writer: &mpsc::UnboundedSender<Outgoing>, reason: &str) {
        if self.detach(writer) {
            self.events.emit(SignalingEvent::Error(reason.to_string()));
        }
    }
}

impl SignalChannel for SignalingClient {
    fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let frame = message.to_json()?;
        let mut link = self.inner.link.lock();
        if let Some(writer) = &link.writer {
            match writer.send(Outgoing::Text(frame)) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(Outgoing::Text(frame))) => {
                    link.writer = None;
                    return enqueue(&mut link.queue, self.inner.options.queue_policy, frame);
                }
                Err(_) => return Ok(()),
            }
        }
        debug!(kind = %message.kind, "signaling not open; queueing message");
        enqueue(&mut link.queue, self.inner.options.queue_policy, frame)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalingEvent> {
        self.inner.events.subscribe()
    }
}

fn enqueue(
    queue: &mut VecDeque<String>,
    policy: QueuePolicy,
    frame: String,
) -> Result<(), SignalingError> {
    match policy {
        QueuePolicy::Unbounded => {}
        QueuePolicy::DropOldest(capacity) => {
            if capacity == 0 {
                warn!("queue capacity is zero; dropping message");
                return Ok(());
            }
            while queue.len() >= capacity {
                queue.pop_front();
                warn!(capacity, "outbound queue full; dropped oldest message");
            }
        }
        QueuePolicy::Reject(capacity) => {
            if queue.len() >= capacity {
                return Err(SignalingError::QueueFull { capacity });
            }
        }
    }
    queue.push_back(frame);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localbeam_discovery::NoDiscovery;
    use serde_json::json;

    fn client(policy: QueuePolicy) -> SignalingClient {
        SignalingClient::with_browser(
            SignalingOptions::new()
                .with_client_id("A")
                .with_queue_policy(policy),
            Arc::new(NoDiscovery),
        )
    }

    fn offer(n: u64) -> SignalMessage {
        SignalMessage::offer("A", "B", json!({ "n": n }))
    }

    #[test]
    fn sends_before_open_are_queued() {
        let client = client(QueuePolicy::Unbounded);
        for n in 0..5 {
            client.send(offer(n)).expect("queued");
        }
        assert!(!client.is_open());
        assert_eq!(client.queued_len(), 5);
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let mut queue = VecDeque::new();
        for n in 0..4 {
            enqueue(&mut queue, QueuePolicy::DropOldest(2), n.to_string()).expect("enqueue");
        }
        assert_eq!(queue, VecDeque::from(vec!["2".to_string(), "3".to_string()]));
    }

    #[test]
    fn reject_policy_surfaces_queue_full() {
        let client = client(QueuePolicy::Reject(1));
        client.send(offer(1)).expect("first fits");
        let err = client.send(offer(2)).expect_err("second rejected");
        assert!(matches!(err, SignalingError::QueueFull { capacity: 1 }));
        assert_eq!(client.queued_len(), 1);
    }

    #[tokio::test]
    async fn write_failure_closes_link_and_requeues_sends() {
        let client = client(QueuePolicy::Unbounded);
        let mut events = client.subscribe();
        let (writer, mut frames) = mpsc::unbounded_channel();
        client.inner.link.lock().writer = Some(writer.clone());
        assert!(client.is_open());

        client.inner.write_failed(&writer, "broken pipe");
        assert!(!client.is_open());
        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Error(reason)) if reason == "broken pipe"
        ));

        client.send(offer(1)).expect("queued");
        assert_eq!(client.queued_len(), 1);
        assert!(frames.try_recv().is_err());

        // A stale writer failing later leaves a newer link alone.
        let (fresh, _fresh_rx) = mpsc::unbounded_channel();
        client.inner.link.lock().writer = Some(fresh);
        client.inner.write_failed(&writer, "late");
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn failed_connect_emits_error_and_keeps_queue() {
        let client = client(QueuePolicy::Unbounded);
        let mut events = client.subscribe();
        client.send(offer(1)).expect("queued");

        let err = client
            .connect_to("ws://127.0.0.1:9")
            .await
            .expect_err("nothing listens on the discard port");
        assert!(matches!(err, SignalingError::Connect { .. }));
        assert!(matches!(events.recv().await, Some(SignalingEvent::Error(_))));
        assert_eq!(client.queued_len(), 1);
    }
}
