use std::time::Duration;

use serde::Serialize;

use crate::classify::Classification;
use crate::util::apply_jitter;

pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
    pub rotate_user_agent: bool,
    pub reason: String,
}

impl RetryDecision {
    fn stop(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
            rotate_user_agent: false,
            reason: reason.into(),
        }
    }

    fn retry(delay: Duration, rotate_user_agent: bool, reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            delay,
            rotate_user_agent,
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryAdvisor {
    enabled: bool,
    max_attempts: usize,
    challenge_delay: Duration,
    block_delay: Duration,
    jitter_ratio: f64,
    pool_exhausted_backoff: Option<Duration>,
}

impl RetryAdvisor {
    pub fn standard() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            challenge_delay: Duration::from_secs(5),
            block_delay: Duration::from_secs(10),
            jitter_ratio: 0.0,
            pool_exhausted_backoff: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            ..Self::standard()
        }
    }

    /// Hard ceiling on dispatches for one logical request, the first one
    /// included.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn challenge_delay(mut self, delay: Duration) -> Self {
        self.challenge_delay = delay;
        self
    }

    pub fn block_delay(mut self, delay: Duration) -> Self {
        self.block_delay = delay;
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    /// Retry `PoolExhausted` at the request layer after `backoff` instead of
    /// surfacing it on the first rejection.
    pub fn retry_on_pool_exhausted(mut self, backoff: Duration) -> Self {
        self.pool_exhausted_backoff = Some(backoff);
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub(crate) fn pool_exhausted_backoff(&self) -> Option<Duration> {
        self.pool_exhausted_backoff
    }

    pub fn decide(&self, classification: Classification) -> RetryDecision {
        if !self.enabled {
            return RetryDecision::stop("retries disabled");
        }
        match classification {
            Classification::Challenge => RetryDecision::retry(
                apply_jitter(self.challenge_delay, self.jitter_ratio),
                true,
                "Bot challenge detected",
            ),
            Classification::Block => RetryDecision::retry(
                apply_jitter(self.block_delay, self.jitter_ratio),
                true,
                "IP or UA block",
            ),
            Classification::Success => RetryDecision::stop("request succeeded"),
            Classification::Error => RetryDecision::stop("non-retryable error"),
        }
    }
}

impl Default for RetryAdvisor {
    fn default() -> Self {
        Self::standard()
    }
}
