use std::time::Duration;

use http::{Method, StatusCode};

use crate::classify::Classification;
use crate::retry::RetryDecision;

/// Context for one dispatch of a logical request.
#[derive(Clone, Debug)]
pub struct AttemptContext {
    pub method: Method,
    pub uri: String,
    pub attempt: usize,
    pub max_attempts: usize,
}

pub trait Observer: Send + Sync {
    fn on_attempt_complete(
        &self,
        _context: &AttemptContext,
        _status: Option<StatusCode>,
        _classification: Classification,
        _elapsed: Duration,
    ) {
    }

    fn on_retry_scheduled(&self, _context: &AttemptContext, _decision: &RetryDecision) {}
}
