use std::thread::sleep;
use std::time::Instant;

use http::{HeaderMap, Method};
use tracing::{debug, info_span};

use crate::error::Error;
use crate::execution::{AttemptStep, RequestOptions, RequestPlan, apply_decision, send_error};
use crate::response::Response;
use crate::transport::WireResponse;

use super::Client;

impl Client {
    pub(super) fn execute(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        let settings = &self.inner.settings;
        let _in_flight = settings.metrics.record_request_started();
        let result = self.execute_with_retry(method, url, options);
        settings.metrics.record_request_completed(&result);
        result
    }

    fn execute_with_retry(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        let settings = &self.inner.settings;
        let plan = settings.plan(method, url, options)?;
        let mut headers = settings.initial_headers(&plan, settings.suggested_headers(&plan));

        let mut attempt = 1;
        loop {
            let span = info_span!(
                "smartreq.request",
                method = %plan.method,
                uri = %plan.redacted_url,
                attempt,
                max_attempts = plan.max_attempts
            );
            let _enter = span.enter();

            let started = Instant::now();
            let outcome = match self.dispatch(&plan, &headers) {
                Err(error) if !error.is_transport() => {
                    if let Some(backoff) = settings.pool_exhausted_backoff(&plan, attempt, &error) {
                        sleep(backoff);
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
                outcome => outcome,
            };

            match settings.complete_attempt(&plan, attempt, outcome, started.elapsed()) {
                AttemptStep::Done(result) => return result,
                AttemptStep::Retry(decision) => {
                    sleep(decision.delay);
                    apply_decision(&mut headers, &decision, attempt);
                    attempt += 1;
                }
            }
        }
    }

    /// One dispatch: checkout, send, release. A reused connection that fails
    /// is presumed stale and the send is repeated on a fresh slot, at most
    /// once per slot of the pool.
    fn dispatch(&self, plan: &RequestPlan, headers: &HeaderMap) -> Result<WireResponse, Error> {
        let pool = self
            .inner
            .registry
            .pool_for(&plan.destination, &plan.pool_overrides);
        let request = plan.wire_request(headers);
        let mut stale_budget = pool.status().max_size;

        loop {
            let mut connection = pool.acquire()?;
            debug!(
                destination = %plan.destination,
                connection_id = connection.connection_id(),
                reused = connection.is_reused(),
                "dispatching request"
            );
            match connection.send(&request, plan.timeout) {
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
