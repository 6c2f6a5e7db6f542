use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use crate::advisory::{AdvisoryBackend, AdvisoryConfig};
use crate::config::{DEFAULT_NUM_POOLS, PoolConfig};
use crate::error::Error;
use crate::execution::SettingsBuilder;
use crate::extensions::HstsPolicy;
use crate::insights::InsightsStore;
use crate::observe::Observer;
use crate::registry::PoolRegistry;
use crate::retry::RetryAdvisor;
use crate::transport::TransportFactory;
use crate::util::{parse_header_name, parse_header_value};

use super::{Client, ClientInner, SlotPool, TcpTransport};

pub struct ClientBuilder {
    num_pools: usize,
    pool_config: PoolConfig,
    transport: Arc<dyn TransportFactory>,
    settings: SettingsBuilder,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            num_pools: DEFAULT_NUM_POOLS,
            pool_config: PoolConfig::default(),
            transport: Arc::new(TcpTransport),
            settings: SettingsBuilder::default(),
        }
    }

    /// Upper bound on live per-destination pools; the least recently used
    /// one is closed to make room.
    pub fn num_pools(mut self, num_pools: usize) -> Self {
        self.num_pools = num_pools;
        self
    }

    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.settings.default_headers = headers;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.settings.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.settings.request_timeout = request_timeout;
        self
    }

    pub fn retry_advisor(mut self, retry_advisor: RetryAdvisor) -> Self {
        self.settings.retry_advisor = retry_advisor;
        self
    }

    pub fn ai_optimize(mut self, enabled: bool) -> Self {
        self.settings.ai_optimize = enabled;
        self
    }

    pub fn learn_from_outcome(mut self, enabled: bool) -> Self {
        self.settings.learn_from_outcome = enabled;
        self
    }

    /// Shares one insights store between clients.
    pub fn insights_store(mut self, insights: Arc<InsightsStore>) -> Self {
        self.settings.insights = Some(insights);
        self
    }

    pub fn advisory_backend(mut self, backend: Arc<dyn AdvisoryBackend>) -> Self {
        self.settings.advisory_backend = Some(backend);
        self
    }

    /// Named provider, validated by `try_build`.
    pub fn advisory(
        mut self,
        provider: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.settings.advisory_config = Some(AdvisoryConfig::new(provider, api_key, model));
        self
    }

    pub fn transport_arc(mut self, transport: Arc<dyn TransportFactory>) -> Self {
        self.transport = transport;
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: TransportFactory + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn hsts_arc(mut self, hsts: Arc<dyn HstsPolicy>) -> Self {
        self.settings.hsts = hsts;
        self
    }

    pub fn hsts<H>(self, hsts: H) -> Self
    where
        H: HstsPolicy + 'static,
    {
        self.hsts_arc(Arc::new(hsts))
    }

    pub fn observer_arc(mut self, observer: Arc<dyn Observer>) -> Self {
        self.settings.observer = Some(observer);
        self
    }

    pub fn observer<O>(self, observer: O) -> Self
    where
        O: Observer + 'static,
    {
        self.observer_arc(Arc::new(observer))
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.settings.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        if self.num_pools == 0 {
            return Err(Error::configuration("num_pools must be at least 1"));
        }
        if self.pool_config.max_size == 0 {
            return Err(Error::configuration("pool max_size must be at least 1"));
        }
        let settings = self.settings.build()?;
        let transport = self.transport;
        let registry = PoolRegistry::new(
            self.num_pools,
            self.pool_config,
            move |destination, config| {
                SlotPool::new(destination.clone(), config, Arc::clone(&transport))
            },
        );

        Ok(Client {
            inner: Arc::new(ClientInner { settings, registry }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("num_pools", &self.num_pools)
            .field("pool_config", &self.pool_config)
            .finish_non_exhaustive()
    }
}
