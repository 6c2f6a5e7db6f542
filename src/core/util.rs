use std::sync::Mutex;
use std::time::Duration;

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use rand::Rng;

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Later maps win on key conflicts.
pub(crate) fn merge_headers(base: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut merged = base.clone();
    for name in overrides.keys() {
        merged.remove(name);
    }
    for (name, value) in overrides {
        merged.append(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

pub(crate) fn apply_jitter(delay: Duration, jitter_ratio: f64) -> Duration {
    if jitter_ratio <= f64::EPSILON {
        return delay;
    }

    let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
    if delay_ms <= 1 {
        return delay;
    }

    let jitter_span = ((delay_ms as f64) * jitter_ratio).round().max(1.0) as u64;
    let low = delay_ms.saturating_sub(jitter_span);
    let high = delay_ms.saturating_add(jitter_span).max(low);
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(low..=high))
}
