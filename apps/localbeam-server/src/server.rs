use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{http::header, http::Method, routing::get, Router};
use localbeam_discovery::{
    Advertisement, MulticastDiscovery, ServiceAdvertiser, ServiceBrowser, ServiceRecord,
};
use localbeam_proto::DISCOVER_PATH;
use tokio::{sync::oneshot, task::JoinHandle};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::handlers::{discover, health_check, DiscoveryState};
use crate::websocket::{websocket_handler, RelayState};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Relay, discovery endpoint and service advertisement bundled behind one
/// start/stop surface.
pub struct LocalBeamServer {
    config: Config,
    advertiser: Arc<dyn ServiceAdvertiser>,
    browser: Arc<dyn ServiceBrowser>,
}

impl LocalBeamServer {
    pub fn new(config: Config) -> Self {
        let multicast = MulticastDiscovery::new();
        Self {
            config,
            advertiser: Arc::new(multicast),
            browser: Arc::new(multicast),
        }
    }

    /// Uses one backend for both advertising and the `/discover` browse.
    pub fn with_discovery<D>(mut self, discovery: D) -> Self
    where
        D: ServiceAdvertiser + ServiceBrowser + Clone + 'static,
    {
        self.advertiser = Arc::new(discovery.clone());
        self.browser = Arc::new(discovery);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn start(self) -> Result<ServerHandle> {
        let Self {
            config,
            advertiser,
            browser,
        } = self;

        let relay = RelayState::new(config.connection_buffer);
        let listener = tokio::net::TcpListener::bind(config.bind_addr())
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read bound address")?;

        let discovery_state = DiscoveryState {
            browser,
            service_name: config.service_name.clone(),
            fallback_port: local_addr.port(),
            window: config.discovery_timeout,
        };

        let http_routes = Router::new()
            .route("/health", get(health_check))
            .route(DISCOVER_PATH, get(discover))
            .with_state(discovery_state);

        let ws_routes = Router::new()
            .route("/", get(websocket_handler))
            .route("/ws", get(websocket_handler))
            .with_state(relay.clone());

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]);

        let app = Router::new()
            .merge(http_routes)
            .merge(ws_routes)
            .layer(cors)
            .layer(TraceLayer::new_for_http());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });
        info!(%local_addr, "LocalBeam server listening");

        let advertisement = if config.advertise {
            let record = ServiceRecord::new(config.service_name.clone(), local_addr.port());
            match advertiser.publish(record).await {
                Ok(advertisement) => Some(advertisement),
                Err(err) => {
                    warn!(error = %err, "service advertisement failed; relay still reachable directly");
                    None
                }
            }
        } else {
            None
        };

        Ok(ServerHandle {
            local_addr,
            relay,
            advertisement,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Running server. Stop it with [`ServerHandle::stop`]; dropping it closes
/// the relay and signals shutdown without waiting.
pub struct ServerHandle {
    local_addr: SocketAddr,
    relay: RelayState,
    advertisement: Option<Advertisement>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket address clients on this host can use.
    pub fn url(&self) -> String {
        let host = if self.local_addr.ip().is_unspecified() {
            "localhost".to_string()
        } else {
            self.local_addr.ip().to_string()
        };
        localbeam_proto::relay_url(&host, self.local_addr.port())
    }

    pub fn relay(&self) -> &RelayState {
        &self.relay
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Withdraws the advertisement, closes the relay and shuts the listener
    /// down. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        warn!(local_addr = %self.local_addr, "stopping LocalBeam server");
        if let Some(mut advertisement) = self.advertisement.take() {
            advertisement.withdraw();
        }
        self.relay.close();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => info!("HTTP server closed"),
            Ok(Ok(Err(err))) => warn!(error = %err, "HTTP server exited with error"),
            Ok(Err(err)) => warn!(error = %err, "HTTP server task failed"),
            Err(_) => {
                warn!("HTTP server did not drain in time; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.relay.close();
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }
}
