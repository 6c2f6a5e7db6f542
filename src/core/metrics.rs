use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::StatusCode;
use serde::Serialize;

use crate::classify::Classification;
use crate::error::Error;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub transport_errors: u64,
    pub stale_connections: u64,
    pub pool_rejections: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub classification_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Option<Arc<ClientMetricsInner>>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    transport_errors: AtomicU64,
    stale_connections: AtomicU64,
    pool_rejections: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    classification_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<ClientMetricsInner>>,
}

impl ClientMetrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(ClientMetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn record_request_started(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.requests_started.fetch_add(1, Ordering::Relaxed);
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    /// One dispatch finished, with or without a response.
    pub(crate) fn record_attempt(
        &self,
        status: Option<StatusCode>,
        classification: Classification,
        latency: Duration,
    ) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.attempts.fetch_add(1, Ordering::Relaxed);
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
        match status {
            Some(status) => {
                *lock_unpoisoned(&inner.status_counts)
                    .entry(status.as_u16())
                    .or_insert(0) += 1;
            }
            None => {
                inner.transport_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        *lock_unpoisoned(&inner.classification_counts)
            .entry(classification.as_str().to_owned())
            .or_insert(0) += 1;
    }

    pub(crate) fn record_retry(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_connection(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.stale_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed<T>(&self, result: &Result<T, Error>) {
        let Some(inner) = &self.inner else {
            return;
        };
        match result {
            Ok(_) => {
                inner.requests_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                if matches!(
                    error,
                    Error::PoolExhausted { .. }
                        | Error::PoolClosed { .. }
                        | Error::AcquireTimeout { .. }
                ) {
                    inner.pool_rejections.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let Some(inner) = &self.inner else {
            return MetricsSnapshot::default();
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        MetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_completed: inner.requests_completed.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            attempts: inner.attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            transport_errors: inner.transport_errors.load(Ordering::Relaxed),
            stale_connections: inner.stale_connections.load(Ordering::Relaxed),
            pool_rejections: inner.pool_rejections.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            classification_counts: lock_unpoisoned(&inner.classification_counts).clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
