//! Service advertisement and browsing used to locate a LocalBeam relay on the
//! local network. The relay publishes a [`ServiceRecord`]; clients browse for
//! one whose name matches the signaling service they expect.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod multicast;

pub use memory::MemoryDiscovery;
pub use multicast::MulticastDiscovery;

/// Errors surfaced by discovery backends.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("discovery packet encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("discovery backend unavailable: {0}")]
    Unavailable(String),
}

/// A published service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub service_type: String,
    pub host: String,
    pub port: u16,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            service_type: localbeam_proto::SERVICE_TYPE.to_string(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// WebSocket address of the relay behind this record.
    pub fn relay_url(&self) -> String {
        localbeam_proto::relay_url(&self.host, self.port)
    }
}

/// Browses the network for a named service.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Returns the first service named `name` seen within `window`, or
    /// `Ok(None)` when the window elapses without a match.
    async fn find(
        &self,
        name: &str,
        window: Duration,
    ) -> Result<Option<ServiceRecord>, DiscoveryError>;
}

/// Publishes a service until the returned [`Advertisement`] is withdrawn.
#[async_trait]
pub trait ServiceAdvertiser: Send + Sync {
    async fn publish(&self, record: ServiceRecord) -> Result<Advertisement, DiscoveryError>;
}

/// Handle for a live advertisement. Withdrawn on [`Advertisement::withdraw`]
/// or when dropped.
pub struct Advertisement {
    record: ServiceRecord,
    on_withdraw: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Advertisement {
    pub fn new(record: ServiceRecord, on_withdraw: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            record,
            on_withdraw: Some(Box::new(on_withdraw)),
        }
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    pub fn withdraw(&mut self) {
        if let Some(withdraw) = self.on_withdraw.take() {
            withdraw();
            tracing::info!(service = %self.record.name, "service advertisement withdrawn");
        }
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        self.withdraw();
    }
}

impl fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advertisement")
            .field("record", &self.record)
            .field("live", &self.on_withdraw.is_some())
            .finish()
    }
}

/// Browser that never finds anything; waits out the window so callers see
/// the same timing as a quiet network.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

#[async_trait]
impl ServiceBrowser for NoDiscovery {
    async fn find(
        &self,
        _name: &str,
        window: Duration,
    ) -> Result<Option<ServiceRecord>, DiscoveryError> {
        tokio::time::sleep(window).await;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn withdraw_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut ad = Advertisement::new(ServiceRecord::new("svc", 5000), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ad.withdraw();
        ad.withdraw();
        drop(ad);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn record_url_uses_host_and_port() {
        let record = ServiceRecord::new("svc", 5001).with_host("192.168.1.4");
        assert_eq!(record.relay_url(), "ws://192.168.1.4:5001");
        assert_eq!(record.service_type, "http");
    }

    #[tokio::test(start_paused = true)]
    async fn no_discovery_waits_out_window() {
        let started = tokio::time::Instant::now();
        let found = NoDiscovery
            .find("svc", Duration::from_secs(3))
            .await
            .expect("find");
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
