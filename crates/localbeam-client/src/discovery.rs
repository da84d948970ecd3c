//! Relay address resolution.
//!
//! Steps run in order until one yields an address: the configured base URL's
//! discovery endpoint, the hosting page's discovery endpoint, a local-network
//! browse for the signaling service, and finally `ws://localhost:<port>`.
//! All steps share one deadline of `discovery_timeout`.

use std::fmt;
use std::sync::Arc;

use localbeam_discovery::ServiceBrowser;
use localbeam_proto::{fallback_url, DiscoverResponse, DISCOVER_PATH};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SignalingOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFrom {
    BaseUrl,
    PageOrigin,
    Browse,
    Fallback,
}

impl fmt::Display for ResolvedFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolvedFrom::BaseUrl => "base-url",
            ResolvedFrom::PageOrigin => "page-origin",
            ResolvedFrom::Browse => "browse",
            ResolvedFrom::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub url: String,
    pub source: ResolvedFrom,
}

#[derive(Debug, Error)]
enum StepError {
    #[error("discovery budget exhausted")]
    Expired,
    #[error("invalid discovery url: {0}")]
    Url(#[from] url::ParseError),
    #[error("discovery request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("discovery endpoint returned an empty url")]
    EmptyUrl,
    #[error("no matching service advertised")]
    NotFound,
    #[error(transparent)]
    Browse(#[from] localbeam_discovery::DiscoveryError),
}

pub struct Resolver {
    http: reqwest::Client,
    browser: Arc<dyn ServiceBrowser>,
    options: SignalingOptions,
}

impl Resolver {
    pub fn new(options: SignalingOptions, browser: Arc<dyn ServiceBrowser>) -> Self {
        Self {
            http: reqwest::Client::new(),
            browser,
            options,
        }
    }

    /// Never fails; the last step always yields the localhost address.
    pub async fn resolve(&self) -> Resolution {
        let deadline = Instant::now() + self.options.discovery_timeout;

        if let Some(base) = &self.options.base_url {
            info!(base_url = %base, "resolving relay through configured base url");
            match self.ask_endpoint(base, deadline).await {
                Ok(url) => return Resolution { url, source: ResolvedFrom::BaseUrl },
                Err(err) => warn!(base_url = %base, error = %err, "base url discovery failed"),
            }
        } else if let Some(origin) = &self.options.page_origin {
            info!(origin = %origin, "resolving relay through page discovery endpoint");
            match self.ask_endpoint(origin, deadline).await {
                Ok(url) => return Resolution { url, source: ResolvedFrom::PageOrigin },
                Err(err) => warn!(origin = %origin, error = %err, "page discovery failed"),
            }
        }

        match self.browse(deadline).await {
            Ok(url) => return Resolution { url, source: ResolvedFrom::Browse },
            Err(err) => warn!(
                service = %self.options.service_name,
                error = %err,
                "service browse failed"
            ),
        }

        let url = fallback_url(self.options.port);
        warn!(%url, "discovery failed; using localhost fallback");
        Resolution {
            url,
            source: ResolvedFrom::Fallback,
        }
    }

    async fn ask_endpoint(&self, base: &Url, deadline: Instant) -> Result<String, StepError> {
        let remaining = remaining(deadline)?;
        let endpoint = base.join(DISCOVER_PATH)?;
        debug!(%endpoint, "querying discovery endpoint");
        let body: DiscoverResponse = self
            .http
            .get(endpoint)
            .timeout(remaining)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if body.url.is_empty() {
            return Err(StepError::EmptyUrl);
        }
        Ok(body.url)
    }

    async fn browse(&self, deadline: Instant) -> Result<String, StepError> {
        let window = remaining(deadline)?;
        let record = self
            .browser
            .find(&self.options.service_name, window)
            .await?
            .ok_or(StepError::NotFound)?;
        info!(host = %record.host, port = record.port, "found advertised relay");
        Ok(record.relay_url())
    }
}

fn remaining(deadline: Instant) -> Result<std::time::Duration, StepError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(StepError::Expired)
    } else {
        Ok(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localbeam_discovery::{MemoryDiscovery, NoDiscovery, ServiceAdvertiser, ServiceRecord};
    use std::time::Duration;

    #[tokio::test]
    async fn browse_finds_advertised_relay() {
        let discovery = MemoryDiscovery::new();
        let _ad = discovery
            .publish(ServiceRecord::new("LocalBeam Signaling Server", 5100).with_host("10.1.2.3"))
            .await
            .expect("publish");
        let resolver = Resolver::new(SignalingOptions::default(), Arc::new(discovery));

        let resolution = resolver.resolve().await;
        assert_eq!(resolution.url, "ws://10.1.2.3:5100");
        assert_eq!(resolution.source, ResolvedFrom::Browse);
    }

    #[tokio::test]
    async fn other_service_names_are_ignored() {
        let discovery = MemoryDiscovery::new();
        let _ad = discovery
            .publish(ServiceRecord::new("Printer", 631))
            .await
            .expect("publish");
        let options = SignalingOptions::default()
            .with_port(5055)
            .with_discovery_timeout(Duration::from_millis(150));
        let resolver = Resolver::new(options, Arc::new(discovery));

        let resolution = resolver.resolve().await;
        assert_eq!(resolution.url, "ws://localhost:5055");
        assert_eq!(resolution.source, ResolvedFrom::Fallback);
    }

    #[tokio::test]
    async fn unreachable_base_url_falls_back_within_budget() {
        let options = SignalingOptions::default()
            .with_base_url(Url::parse("http://127.0.0.1:9").expect("url"))
            .with_discovery_timeout(Duration::from_millis(400));
        let resolver = Resolver::new(options, Arc::new(NoDiscovery));

        let started = std::time::Instant::now();
        let resolution = resolver.resolve().await;
        let elapsed = started.elapsed();

        assert_eq!(resolution.url, "ws://localhost:5000");
        assert_eq!(resolution.source, ResolvedFrom::Fallback);
        assert!(elapsed < Duration::from_millis(400) + Duration::from_millis(300), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn default_budget_is_three_seconds() {
        let resolver = Resolver::new(SignalingOptions::default(), Arc::new(MemoryDiscovery::new()));

        let started = std::time::Instant::now();
        let resolution = resolver.resolve().await;
        let elapsed = started.elapsed();

        assert_eq!(resolution.source, ResolvedFrom::Fallback);
        assert!(elapsed >= Duration::from_millis(2900), "took {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "took {elapsed:?}");
    }
}
