use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderValue, USER_AGENT};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use tracing::{debug, info};

use crate::advisory::{AdvisoryBackend, header_prompt, parse_advice_headers};
use crate::classify::Classification;
use crate::util::{lock_unpoisoned, merge_headers};

pub const HISTORY_LIMIT: usize = 50;
pub const INITIAL_AVG_DELAY_SECONDS: f64 = 0.5;
pub const DEFAULT_SUGGESTED_TIMEOUT: Duration = Duration::from_secs(30);

const SMOOTHING_FACTOR: f64 = 0.1;
const FAILURE_PENALTY: f64 = 1.2;

pub(crate) const BASELINE_USER_AGENT: &str =
    concat!("smartreq/", env!("CARGO_PKG_VERSION"), " (Smart)");
const BASELINE_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// `None` when the attempt failed before a status line was read.
    pub status: Option<u16>,
    pub classification: Classification,
    pub elapsed_seconds: f64,
}

/// Rolling statistics for one destination.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DestinationInsights {
    pub destination: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_requests: u64,
    pub last_status: Option<u16>,
    pub avg_delay_seconds: f64,
    pub history: VecDeque<HistoryEntry>,
}

impl DestinationInsights {
    fn new(destination: String) -> Self {
        Self {
            destination,
            success_count: 0,
            failure_count: 0,
            total_requests: 0,
            last_status: None,
            avg_delay_seconds: INITIAL_AVG_DELAY_SECONDS,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    fn record(&mut self, status: Option<StatusCode>, classification: Classification, elapsed: f64) {
        let status = status.map(|status| status.as_u16());
        self.total_requests += 1;
        self.last_status = status;
        if classification.is_success() {
            self.success_count += 1;
            self.avg_delay_seconds =
                self.avg_delay_seconds * (1.0 - SMOOTHING_FACTOR) + elapsed * SMOOTHING_FACTOR;
        } else {
            self.failure_count += 1;
            self.avg_delay_seconds *= FAILURE_PENALTY;
        }

        self.history.push_back(HistoryEntry {
            status,
            classification,
            elapsed_seconds: elapsed,
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / self.total_requests.max(1) as f64
    }

    pub fn summary(&self) -> DomainInsights {
        DomainInsights {
            success_rate: self.success_rate(),
            avg_delay_seconds: self.avg_delay_seconds,
            total_requests: self.total_requests,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DomainInsights {
    pub success_rate: f64,
    pub avg_delay_seconds: f64,
    pub total_requests: u64,
}

#[derive(Clone, Debug)]
pub struct OptimizedParams {
    pub headers: HeaderMap,
    pub timeout: Duration,
}

/// Process-wide record of how each destination has been behaving. Clients
/// share one store through `Arc`; every read-modify-write happens under a
/// single mutex.
#[derive(Default)]
pub struct InsightsStore {
    entries: Mutex<HashMap<String, DestinationInsights>>,
    backend: Option<Arc<dyn AdvisoryBackend>>,
}

impl InsightsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn AdvisoryBackend>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            backend: Some(backend),
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn observe(
        &self,
        destination: &str,
        status: Option<StatusCode>,
        classification: Classification,
        elapsed: Duration,
    ) {
        let key = insights_key(destination);
        let mut entries = lock_unpoisoned(&self.entries);
        let insights = entries
            .entry(key.clone())
            .or_insert_with(|| DestinationInsights::new(key));
        insights.record(status, classification, elapsed.as_secs_f64());
        debug!(
            destination = %insights.destination,
            classification = %classification,
            total_requests = insights.total_requests,
            avg_delay_seconds = insights.avg_delay_seconds,
            "destination insights updated"
        );
    }

    pub fn domain_insights(&self, destination: &str) -> DomainInsights {
        let key = insights_key(destination);
        let entries = lock_unpoisoned(&self.entries);
        match entries.get(&key) {
            Some(insights) => insights.summary(),
            None => DomainInsights {
                success_rate: 0.0,
                avg_delay_seconds: INITIAL_AVG_DELAY_SECONDS,
                total_requests: 0,
            },
        }
    }

    /// Full copy of the stored record, history included.
    pub fn snapshot(&self, destination: &str) -> Option<DestinationInsights> {
        let key = insights_key(destination);
        lock_unpoisoned(&self.entries).get(&key).cloned()
    }

    pub fn suggest_headers(&self, destination: &str) -> HeaderMap {
        let baseline = baseline_headers();
        let Some(backend) = &self.backend else {
            return baseline;
        };

        let key = insights_key(destination);
        let failure_count = lock_unpoisoned(&self.entries)
            .get(&key)
            .map_or(0, |insights| insights.failure_count);
        if failure_count == 0 {
            return baseline;
        }

        let Some(advice) = backend.ask(&header_prompt(&key, failure_count)) else {
            return baseline;
        };
        let advised = parse_advice_headers(&advice);
        if advised.is_empty() {
            return baseline;
        }
        info!(
            destination = %key,
            advised_headers = advised.len(),
            "applying advisory headers"
        );
        merge_headers(&baseline, &advised)
    }
}

impl std::fmt::Debug for InsightsStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InsightsStore")
            .field("destinations", &lock_unpoisoned(&self.entries).len())
            .field("has_backend", &self.backend.is_some())
            .finish()
    }
}

pub(crate) fn baseline_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BASELINE_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static(BASELINE_ACCEPT_LANGUAGE),
    );
    headers
}

/// Authority of a URL (`host[:port]`, port only when not the scheme default),
/// or the trimmed input itself when it is not an absolute URL. Always
/// lowercased, so a bare host and a full URL for it share statistics.
pub fn insights_key(destination: &str) -> String {
    let trimmed = destination.trim();
    if let Ok(url) = url::Url::parse(trimmed)
        && let Some(host) = url.host_str()
    {
        return match url.port() {
            Some(port) => format!("{host}:{port}").to_ascii_lowercase(),
            None => host.to_ascii_lowercase(),
        };
    }
    trimmed.to_ascii_lowercase()
}

/// Headers and timeout a fresh client would use for `url`.
pub fn optimize_params_for(url: &str) -> OptimizedParams {
    OptimizedParams {
        headers: InsightsStore::new().suggest_headers(url),
        timeout: DEFAULT_SUGGESTED_TIMEOUT,
    }
}
