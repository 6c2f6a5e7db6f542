use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::USER_AGENT;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tracing::{debug, warn};

use crate::advisory::{AdvisoryBackend, AdvisoryConfig};
use crate::classify::{Classification, classify};
use crate::config::{DEFAULT_REQUEST_TIMEOUT, PoolOverrides};
use crate::destination::{Destination, parse_uri, request_target};
use crate::error::Error;
use crate::extensions::{HstsPolicy, NoHsts};
use crate::insights::{InsightsStore, baseline_headers};
use crate::metrics::ClientMetrics;
use crate::observe::{AttemptContext, Observer};
use crate::response::Response;
use crate::retry::{RetryAdvisor, RetryDecision};
use crate::transport::{WireRequest, WireResponse};
use crate::util::{merge_headers, redact_uri_for_logs};

/// Per-call knobs. Anything left unset falls back to the client's settings.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
    /// Total dispatches allowed, the first one included. Capped by the
    /// client's `RetryAdvisor`.
    pub max_attempts: Option<usize>,
    pub ai_optimize: Option<bool>,
    pub learn_from_outcome: Option<bool>,
    pub body: Option<Bytes>,
    pub pool_overrides: PoolOverrides,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_ai_optimize(mut self, enabled: bool) -> Self {
        self.ai_optimize = Some(enabled);
        self
    }

    pub fn with_learn_from_outcome(mut self, enabled: bool) -> Self {
        self.learn_from_outcome = Some(enabled);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_pool_overrides(mut self, pool_overrides: PoolOverrides) -> Self {
        self.pool_overrides = pool_overrides;
        self
    }
}

/// Everything one logical request needs once its options are resolved.
#[derive(Debug)]
pub(crate) struct RequestPlan {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) redacted_url: String,
    pub(crate) destination: Destination,
    pub(crate) target: String,
    pub(crate) caller_headers: HeaderMap,
    pub(crate) body: Option<Bytes>,
    pub(crate) timeout: Duration,
    pub(crate) max_attempts: usize,
    pub(crate) ai_optimize: bool,
    pub(crate) learn_from_outcome: bool,
    pub(crate) pool_overrides: PoolOverrides,
}

impl RequestPlan {
    pub(crate) fn context(&self, attempt: usize) -> AttemptContext {
        AttemptContext {
            method: self.method.clone(),
            uri: self.redacted_url.clone(),
            attempt,
            max_attempts: self.max_attempts,
        }
    }

    pub(crate) fn wire_request(&self, headers: &HeaderMap) -> WireRequest {
        WireRequest {
            method: self.method.clone(),
            target: self.target.clone(),
            headers: headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// What the retry loop does after an attempt.
pub(crate) enum AttemptStep {
    Done(crate::Result<Response>),
    Retry(RetryDecision),
}

/// Settings and collaborators both clients drive their retry loop with.
#[derive(Clone)]
pub(crate) struct ExecutionSettings {
    pub(crate) default_headers: HeaderMap,
    pub(crate) request_timeout: Duration,
    pub(crate) retry_advisor: RetryAdvisor,
    pub(crate) ai_optimize: bool,
    pub(crate) learn_from_outcome: bool,
    pub(crate) insights: Arc<InsightsStore>,
    pub(crate) hsts: Arc<dyn HstsPolicy>,
    pub(crate) observer: Option<Arc<dyn Observer>>,
    pub(crate) metrics: ClientMetrics,
}

impl ExecutionSettings {
    pub(crate) fn plan(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<RequestPlan> {
        let url = self.hsts.secure_url(url.trim());
        let uri = parse_uri(&url)?;
        let destination = Destination::from_uri(&uri)?;
        let ceiling = self.retry_advisor.configured_max_attempts();
        let max_attempts = options.max_attempts.unwrap_or(ceiling).clamp(1, ceiling);

        Ok(RequestPlan {
            method,
            redacted_url: redact_uri_for_logs(&url),
            target: request_target(&uri),
            url,
            destination,
            caller_headers: options.headers,
            body: options.body,
            timeout: options.timeout.unwrap_or(self.request_timeout),
            max_attempts,
            ai_optimize: options.ai_optimize.unwrap_or(self.ai_optimize),
            learn_from_outcome: options
                .learn_from_outcome
                .unwrap_or(self.learn_from_outcome),
            pool_overrides: options.pool_overrides,
        })
    }

    /// Header set for the first attempt. Caller headers win over client
    /// defaults, which win over the suggested set.
    pub(crate) fn initial_headers(&self, plan: &RequestPlan, suggested: HeaderMap) -> HeaderMap {
        let base = merge_headers(&suggested, &self.default_headers);
        merge_headers(&base, &plan.caller_headers)
    }

    /// Whether header suggestion has to go through the advisory backend,
    /// which may block on network I/O.
    pub(crate) fn suggestion_may_block(&self, plan: &RequestPlan) -> bool {
        plan.ai_optimize && self.insights.has_backend()
    }

    pub(crate) fn suggested_headers(&self, plan: &RequestPlan) -> HeaderMap {
        if plan.ai_optimize {
            self.insights.suggest_headers(&plan.url)
        } else {
            baseline_headers()
        }
    }

    /// Backoff before retrying a `PoolExhausted` rejection, when configured
    /// and the attempt budget allows it.
    pub(crate) fn pool_exhausted_backoff(
        &self,
        plan: &RequestPlan,
        attempt: usize,
        error: &Error,
    ) -> Option<Duration> {
        if !matches!(error, Error::PoolExhausted { .. }) || attempt >= plan.max_attempts {
            return None;
        }
        let backoff = self.retry_advisor.pool_exhausted_backoff()?;
        warn!(
            destination = %plan.destination,
            attempt,
            delay_ms = backoff.as_millis() as u64,
            "pool exhausted; retrying after backoff"
        );
        Some(backoff)
    }

    /// Classifies one dispatch outcome, feeds insights, metrics and the
    /// observer, then decides whether the loop goes on.
    pub(crate) fn complete_attempt(
        &self,
        plan: &RequestPlan,
        attempt: usize,
        outcome: Result<WireResponse, Error>,
        elapsed: Duration,
    ) -> AttemptStep {
        let (status, classification) = match &outcome {
            Ok(response) => (
                Some(response.status),
                classify(response.status, &response.body),
            ),
            Err(_) => (None, Classification::Error),
        };

        debug!(
            status = status.map(|status| status.as_u16()),
            classification = %classification,
            elapsed_ms = elapsed.as_millis() as u64,
            "attempt completed"
        );
        self.metrics.record_attempt(status, classification, elapsed);
        let context = plan.context(attempt);
        if let Some(observer) = &self.observer {
            observer.on_attempt_complete(&context, status, classification, elapsed);
        }
        if plan.learn_from_outcome {
            self.insights
                .observe(&plan.url, status, classification, elapsed);
        }
        if let Ok(response) = &outcome {
            self.hsts.observe_response(&plan.url, &response.headers);
        }

        if plan.ai_optimize && attempt < plan.max_attempts {
            let decision = self.retry_advisor.decide(classification);
            if decision.should_retry {
                warn!(
                    attempt,
                    max_attempts = plan.max_attempts,
                    classification = %classification,
                    delay_ms = decision.delay.as_millis() as u64,
                    reason = %decision.reason,
                    "retrying request"
                );
                self.metrics.record_retry();
                if let Some(observer) = &self.observer {
                    observer.on_retry_scheduled(&context, &decision);
                }
                return AttemptStep::Retry(decision);
            }
        }

        AttemptStep::Done(outcome.map(|response| {
            Response::new(
                response.status,
                response.headers,
                response.body,
                plan.url.clone(),
                attempt,
                classification,
            )
        }))
    }
}

impl std::fmt::Debug for ExecutionSettings {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExecutionSettings")
            .field("default_headers", &self.default_headers.len())
            .field("request_timeout", &self.request_timeout)
            .field("retry_advisor", &self.retry_advisor)
            .field("ai_optimize", &self.ai_optimize)
            .field("learn_from_outcome", &self.learn_from_outcome)
            .field("insights", &self.insights)
            .finish()
    }
}

/// Builder state both client builders share.
pub(crate) struct SettingsBuilder {
    pub(crate) default_headers: HeaderMap,
    pub(crate) request_timeout: Duration,
    pub(crate) retry_advisor: RetryAdvisor,
    pub(crate) ai_optimize: bool,
    pub(crate) learn_from_outcome: bool,
    pub(crate) insights: Option<Arc<InsightsStore>>,
    pub(crate) advisory_backend: Option<Arc<dyn AdvisoryBackend>>,
    pub(crate) advisory_config: Option<AdvisoryConfig>,
    pub(crate) hsts: Arc<dyn HstsPolicy>,
    pub(crate) observer: Option<Arc<dyn Observer>>,
    pub(crate) metrics_enabled: bool,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self {
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_advisor: RetryAdvisor::standard(),
            ai_optimize: true,
            learn_from_outcome: true,
            insights: None,
            advisory_backend: None,
            advisory_config: None,
            hsts: Arc::new(NoHsts),
            observer: None,
            metrics_enabled: false,
        }
    }
}

impl SettingsBuilder {
    pub(crate) fn build(self) -> crate::Result<ExecutionSettings> {
        if self.request_timeout.is_zero() {
            return Err(Error::configuration(
                "request timeout must be greater than zero",
            ));
        }

        let backend = match (self.advisory_backend, self.advisory_config) {
            (Some(_), Some(_)) => {
                return Err(Error::configuration(
                    "configure either an advisory backend or an advisory provider, not both",
                ));
            }
            (Some(backend), None) => Some(backend),
            (None, Some(config)) => Some(config.into_backend()?),
            (None, None) => None,
        };
        let insights = match (self.insights, backend) {
            (Some(_), Some(_)) => {
                return Err(Error::configuration(
                    "a shared insights store carries its own advisory backend; \
                     build it with InsightsStore::with_backend",
                ));
            }
            (Some(store), None) => store,
            (None, Some(backend)) => Arc::new(InsightsStore::with_backend(backend)),
            (None, None) => Arc::new(InsightsStore::new()),
        };

        Ok(ExecutionSettings {
            default_headers: self.default_headers,
            request_timeout: self.request_timeout,
            retry_advisor: self.retry_advisor,
            ai_optimize: self.ai_optimize,
            learn_from_outcome: self.learn_from_outcome,
            insights,
            hsts: self.hsts,
            observer: self.observer,
            metrics: if self.metrics_enabled {
                ClientMetrics::enabled()
            } else {
                ClientMetrics::disabled()
            },
        })
    }
}

/// `User-Agent` used after the `retries`-th retry.
pub(crate) fn rotated_user_agent(retries: usize) -> HeaderValue {
    let value = format!("smartreq/{} (Retry-{retries})", env!("CARGO_PKG_VERSION"));
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("smartreq"))
}

pub(crate) fn apply_decision(headers: &mut HeaderMap, decision: &RetryDecision, retries: usize) {
    if decision.rotate_user_agent {
        headers.insert(USER_AGENT, rotated_user_agent(retries));
    }
}

/// Maps a send failure to the orchestrator's transport error.
pub(crate) fn send_error(plan: &RequestPlan, error: std::io::Error) -> Error {
    Error::transport(error, &plan.method, &plan.redacted_url)
}
