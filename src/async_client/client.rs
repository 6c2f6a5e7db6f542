use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, warn};

use crate::advisory::{AdvisoryBackend, AdvisoryConfig};
use crate::classify::{AnomalyReport, detect_anomaly};
use crate::config::{DEFAULT_NUM_POOLS, PoolConfig};
use crate::destination::Destination;
use crate::error::Error;
use crate::execution::{
    AttemptStep, ExecutionSettings, RequestOptions, RequestPlan, SettingsBuilder, apply_decision,
    send_error,
};
use crate::extensions::HstsPolicy;
use crate::insights::{DomainInsights, InsightsStore, baseline_headers};
use crate::metrics::MetricsSnapshot;
use crate::observe::Observer;
use crate::registry::PoolRegistry;
use crate::response::Response;
use crate::retry::RetryAdvisor;
use crate::transport::{AsyncTransportFactory, WireResponse};
use crate::util::{parse_header_name, parse_header_value};

use super::pool::AsyncSlotPool;
use super::request::AsyncRequestBuilder;
use super::transport::TokioTcpTransport;

/// Client for tokio. Cloning is cheap; clones share pools, insights and
/// metrics.
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<AsyncClientInner>,
}

struct AsyncClientInner {
    settings: ExecutionSettings,
    registry: PoolRegistry<AsyncSlotPool>,
}

pub struct AsyncClientBuilder {
    num_pools: usize,
    pool_config: PoolConfig,
    transport: Arc<dyn AsyncTransportFactory>,
    settings: SettingsBuilder,
}

impl AsyncClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            num_pools: DEFAULT_NUM_POOLS,
            pool_config: PoolConfig::default(),
            transport: Arc::new(TokioTcpTransport),
            settings: SettingsBuilder::default(),
        }
    }

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

    pub fn insights_store(mut self, insights: Arc<InsightsStore>) -> Self {
        self.settings.insights = Some(insights);
        self
    }

    pub fn advisory_backend(mut self, backend: Arc<dyn AdvisoryBackend>) -> Self {
        self.settings.advisory_backend = Some(backend);
        self
    }

    pub fn advisory(
        mut self,
        provider: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.settings.advisory_config = Some(AdvisoryConfig::new(provider, api_key, model));
        self
    }

    pub fn transport_arc(mut self, transport: Arc<dyn AsyncTransportFactory>) -> Self {
        self.transport = transport;
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: AsyncTransportFactory + 'static,
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

    pub fn try_build(self) -> crate::Result<AsyncClient> {
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
                AsyncSlotPool::new(destination.clone(), config, Arc::clone(&transport))
            },
        );

        Ok(AsyncClient {
            inner: Arc::new(AsyncClientInner { settings, registry }),
        })
    }
}

impl Default for AsyncClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AsyncClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AsyncClientBuilder")
            .field("num_pools", &self.num_pools)
            .field("pool_config", &self.pool_config)
            .finish_non_exhaustive()
    }
}

impl AsyncClient {
    pub fn builder() -> AsyncClientBuilder {
        AsyncClientBuilder::new()
    }

    pub fn new() -> crate::Result<Self> {
        Self::builder().try_build()
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> AsyncRequestBuilder<'_> {
        AsyncRequestBuilder::new(self, method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> AsyncRequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> AsyncRequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> AsyncRequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> AsyncRequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> AsyncRequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> AsyncRequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub async fn send_with(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        self.execute(method, url, options).await
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

    pub fn registry(&self) -> &PoolRegistry<AsyncSlotPool> {
        &self.inner.registry
    }

    pub fn pool_for(&self, url: &str) -> crate::Result<AsyncSlotPool> {
        let destination = Destination::parse(url)?;
        Ok(self
            .inner
            .registry
            .pool_for(&destination, &Default::default()))
    }

    pub fn close(&self) {
        self.inner.registry.close_all();
    }

    pub(super) async fn execute(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        let settings = &self.inner.settings;
        let _in_flight = settings.metrics.record_request_started();
        let result = self.execute_with_retry(method, url, options).await;
        settings.metrics.record_request_completed(&result);
        result
    }

    async fn execute_with_retry(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        let settings = &self.inner.settings;
        let plan = settings.plan(method, url, options)?;
        let suggested = self.suggested_headers(&plan).await;
        let mut headers = settings.initial_headers(&plan, suggested);

        let mut attempt = 1;
        loop {
            let span = info_span!(
                "smartreq.request",
                method = %plan.method,
                uri = %plan.redacted_url,
                attempt,
                max_attempts = plan.max_attempts
            );

            let started = Instant::now();
            let outcome = match self.dispatch(&plan, &headers).instrument(span.clone()).await {
                Err(error) if !error.is_transport() => {
                    let backoff = span.in_scope(|| {
                        settings.pool_exhausted_backoff(&plan, attempt, &error)
                    });
                    if let Some(backoff) = backoff {
                        sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
                outcome => outcome,
            };

            let step = span.in_scope(|| {
                settings.complete_attempt(&plan, attempt, outcome, started.elapsed())
            });
            match step {
                AttemptStep::Done(result) => return result,
                AttemptStep::Retry(decision) => {
                    sleep(decision.delay).await;
                    apply_decision(&mut headers, &decision, attempt);
                    attempt += 1;
                }
            }
        }
    }

    /// The advisory backend does blocking I/O, so a consult runs on the
    /// blocking pool.
    async fn suggested_headers(&self, plan: &RequestPlan) -> HeaderMap {
        let settings = &self.inner.settings;
        if !settings.suggestion_may_block(plan) {
            return settings.suggested_headers(plan);
        }
        let insights = Arc::clone(&settings.insights);
        let url = plan.url.clone();
        match tokio::task::spawn_blocking(move || insights.suggest_headers(&url)).await {
            Ok(headers) => headers,
            Err(error) => {
                warn!(error = %error, "header suggestion task failed");
                baseline_headers()
            }
        }
    }

    async fn dispatch(
        &self,
        plan: &RequestPlan,
        headers: &HeaderMap,
    ) -> Result<WireResponse, Error> {
        let pool = self
            .inner
            .registry
            .pool_for(&plan.destination, &plan.pool_overrides);
        let request = plan.wire_request(headers);
        let mut stale_budget = pool.status().max_size;

        loop {
            let mut connection = pool.acquire().await?;
            debug!(
                destination = %plan.destination,
                connection_id = connection.connection_id(),
                reused = connection.is_reused(),
                "dispatching request"
            );
            match connection.send(&request, plan.timeout).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    let reused = connection.is_reused();
                    connection.discard();
                    if reused && stale_budget > 0 {
                        stale_budget -= 1;
                        self.inner.settings.metrics.record_stale_connection();
                        debug!(
                            destination = %plan.destination,
                            error = %error,
                            "discarding stale pooled connection"
                        );
                        continue;
                    }
                    return Err(send_error(plan, error));
                }
            }
        }
    }
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AsyncClient")
            .field("settings", &self.inner.settings)
            .field("registry", &self.inner.registry)
            .finish()
    }
}
