use std::sync::Arc;

use http::Method;

use crate::classify::{AnomalyReport, detect_anomaly};
use crate::destination::Destination;
use crate::execution::{ExecutionSettings, RequestOptions};
use crate::insights::{DomainInsights, InsightsStore};
use crate::metrics::MetricsSnapshot;
use crate::registry::PoolRegistry;
use crate::response::Response;

mod builder;
mod execute;
mod pool;
mod request;
mod transport;

pub use builder::ClientBuilder;
pub use pool::{PooledConnection, SlotPool};
pub use request::RequestBuilder;
pub use transport::TcpTransport;

/// Thread-blocking client. Cloning is cheap; clones share pools, insights
/// and metrics.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: ExecutionSettings,
    registry: PoolRegistry<SlotPool>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn new() -> crate::Result<Self> {
        Self::builder().try_build()
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    /// Runs one logical request to completion, retries included. Non-2xx
    /// statuses come back as `Ok`; only pool, configuration and final
    /// transport failures are errors.
    pub fn send_with(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        self.execute(method, url, options)
    }

    pub fn domain_insights(&self, destination: &str) -> DomainInsights {
        self.inner.settings.insights.domain_insights(destination)
    }

    pub fn insights(&self) -> &Arc<InsightsStore> {
        &self.inner.settings.insights
    }

    pub fn detect_anomaly(&self, response: &Response) -> AnomalyReport {
        detect_anomaly(response.status())
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.settings.metrics.snapshot()
    }

    pub fn registry(&self) -> &PoolRegistry<SlotPool> {
        &self.inner.registry
    }

    /// Pool the next request to `url` would use.
    pub fn pool_for(&self, url: &str) -> crate::Result<SlotPool> {
        let destination = Destination::parse(url)?;
        Ok(self
            .inner
            .registry
            .pool_for(&destination, &Default::default()))
    }

    /// Closes every pool. Requests still holding a connection finish; later
    /// ones get fresh pools.
    pub fn close(&self) {
        self.inner.registry.close_all();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("settings", &self.inner.settings)
            .field("registry", &self.inner.registry)
            .finish()
    }
}
