use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::Json};
use localbeam_discovery::ServiceBrowser;
use localbeam_proto::{fallback_url, DiscoverResponse};
use serde_json::{json, Value};
use tracing::{info, warn};

/// State behind the plain HTTP routes.
#[derive(Clone)]
pub struct DiscoveryState {
    pub browser: Arc<dyn ServiceBrowser>,
    pub service_name: String,
    pub fallback_port: u16,
    pub window: Duration,
}

/// Health check endpoint
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Browses for the signaling service and answers with its address, or the
/// localhost fallback once the window elapses.
pub async fn discover(State(state): State<DiscoveryState>) -> Json<DiscoverResponse> {
    info!(service = %state.service_name, "discovery request received");
    let url = match state.browser.find(&state.service_name, state.window).await {
        Ok(Some(record)) => {
            info!(host = %record.host, port = record.port, "found signaling service");
            record.relay_url()
        }
        Ok(None) => {
            warn!("no advertised signaling service found; defaulting to localhost");
            fallback_url(state.fallback_port)
        }
        Err(err) => {
            warn!(error = %err, "service browse failed; defaulting to localhost");
            fallback_url(state.fallback_port)
        }
    };
    Json(DiscoverResponse { url })
}
