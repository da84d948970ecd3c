use std::env;
use std::time::Duration;

use localbeam_proto::{ClientId, DEFAULT_PORT, DEFAULT_SERVICE_NAME, DISCOVERY_TIMEOUT};
use rand::Rng;
use tracing::warn;
use url::Url;

/// What the signaling client does with outbound messages while the relay
/// connection is not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Keep everything until the connection opens.
    #[default]
    Unbounded,
    /// Keep at most `n` messages, evicting the oldest to make room.
    DropOldest(usize),
    /// Keep at most `n` messages; further sends fail with `QueueFull`.
    Reject(usize),
}

/// Options for [`crate::SignalingClient`].
#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub client_id: Option<ClientId>,
    /// Explicit relay host whose `/discover` endpoint is asked first.
    pub base_url: Option<Url>,
    /// Origin of the hosting page when running inside a browser-like host.
    pub page_origin: Option<Url>,
    pub port: u16,
    pub service_name: String,
    pub discovery_timeout: Duration,
    pub queue_policy: QueuePolicy,
    /// Start a relay in-process before connecting.
    pub embedded_server: bool,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            base_url: None,
            page_origin: None,
            port: DEFAULT_PORT,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            discovery_timeout: DISCOVERY_TIMEOUT,
            queue_policy: QueuePolicy::Unbounded,
            embedded_server: false,
        }
    }
}

impl SignalingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `LOCALBEAM_BASE_URL`, `LOCALBEAM_PORT` and
    /// `LOCALBEAM_SERVICE_NAME` on top of the defaults.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(raw) = env::var("LOCALBEAM_BASE_URL") {
            match Url::parse(&raw) {
                Ok(url) => options.base_url = Some(url),
                Err(err) => warn!(value = %raw, error = %err, "ignoring invalid LOCALBEAM_BASE_URL"),
            }
        }
        if let Some(port) = env::var("LOCALBEAM_PORT").ok().and_then(|p| p.parse().ok()) {
            options.port = port;
        }
        if let Ok(name) = env::var("LOCALBEAM_SERVICE_NAME") {
            options.service_name = name;
        }
        options
    }

    pub fn with_client_id(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_page_origin(mut self, origin: Url) -> Self {
        self.page_origin = Some(origin);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    pub fn with_embedded_server(mut self, enabled: bool) -> Self {
        self.embedded_server = enabled;
        self
    }

    /// The configured id, or a fresh `client-<n>` one.
    pub fn resolve_client_id(&self) -> ClientId {
        self.client_id.clone().unwrap_or_else(generate_client_id)
    }
}

pub fn generate_client_id() -> ClientId {
    let n: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("client-{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = SignalingOptions::default();
        assert_eq!(options.port, 5000);
        assert_eq!(options.service_name, "LocalBeam Signaling Server");
        assert_eq!(options.discovery_timeout, Duration::from_secs(3));
        assert_eq!(options.queue_policy, QueuePolicy::Unbounded);
        assert!(options.base_url.is_none());
        assert!(!options.embedded_server);
    }

    #[test]
    fn generated_ids_have_client_prefix() {
        for _ in 0..50 {
            let id = generate_client_id();
            let n: u32 = id
                .strip_prefix("client-")
                .expect("prefix")
                .parse()
                .expect("numeric suffix");
            assert!(n < 10_000);
        }
    }

    #[test]
    fn explicit_id_wins() {
        let options = SignalingOptions::new().with_client_id("alice");
        assert_eq!(options.resolve_client_id(), "alice");
    }
}
