//! In-process discovery backend. Every clone shares one service table, so a
//! relay and its clients running in the same process (or in tests) can find
//! each other without touching the network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{Advertisement, DiscoveryError, ServiceAdvertiser, ServiceBrowser, ServiceRecord};

#[derive(Clone, Default)]
pub struct MemoryDiscovery {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    services: RwLock<Vec<(u64, ServiceRecord)>>,
    next_token: AtomicU64,
    changed: Notify,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently published records.
    pub fn services(&self) -> Vec<ServiceRecord> {
        self.inner
            .services
            .read()
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<ServiceRecord> {
        self.inner
            .services
            .read()
            .iter()
            .find(|(_, record)| record.name == name)
            .map(|(_, record)| record.clone())
    }
}

#[async_trait]
impl ServiceBrowser for MemoryDiscovery {
    async fn find(
        &self,
        name: &str,
        window: Duration,
    ) -> Result<Option<ServiceRecord>, DiscoveryError> {
        let deadline = Instant::now() + window;
        loop {
            // Created before the lookup so a publish in between still wakes us.
            let changed = self.inner.changed.notified();
            if let Some(record) = self.lookup(name) {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl ServiceAdvertiser for MemoryDiscovery {
    async fn publish(&self, record: ServiceRecord) -> Result<Advertisement, DiscoveryError> {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.services.write().push((token, record.clone()));
        self.inner.changed.notify_waiters();
        tracing::debug!(service = %record.name, port = record.port, "published in-memory service");

        let inner = Arc::clone(&self.inner);
        Ok(Advertisement::new(record, move || {
            inner.services.write().retain(|(t, _)| *t != token);
            inner.changed.notify_waiters();
        }))
    }
}
