use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tokio::time::Instant;

use crate::circuit::{Admission, CircuitBreaker};
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{DeliveryFailure, EngineError};
use crate::ledger::DeliveryLedger;
use crate::rate_limit::RateLimiter;
use crate::registry::SubscriptionRegistry;
use crate::signing::{self, DELIVERY_ID_HEADER, EVENT_TYPE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::telemetry::{self, metric_inc};
use crate::types::{
    AttemptOutcome, DeliveryAttempt, DeliveryId, DeliveryJob, EventId, SigningSecret, Subscription,
};

/// Result of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    /// The record written to the ledger.
    pub attempt: DeliveryAttempt,
    /// The follow-up attempt, if the delivery is not finished.
    pub retry: Option<ScheduledRetry>,
}

impl AttemptResult {
    pub fn is_terminal(&self) -> bool {
        self.retry.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledRetry {
    pub job: DeliveryJob,
    pub ready_at: Instant,
}

/// JSON body posted to subscribers.
#[derive(Debug, Serialize)]
struct WirePayload<'a> {
    delivery_id: DeliveryId,
    event_id: &'a EventId,
    event_type: &'a str,
    occurred_at: DateTime<Utc>,
    payload: &'a serde_json::Value,
}

/// Performs one delivery attempt at a time and decides what happens next.
///
/// Per attempt:
/// - Drops jobs whose subscription is no longer active
/// - Consults the circuit breaker, then the rate limiter
/// - Signs and posts the payload
/// - Feeds the outcome back into the breaker
/// - Records the attempt in the ledger before returning
pub struct DeliveryExecutor {
    registry: Arc<SubscriptionRegistry>,
    circuit: Arc<CircuitBreaker>,
    rate_limiter: Arc<RateLimiter>,
    ledger: Arc<dyn DeliveryLedger>,
    client: reqwest::Client,
    retry: RetryPolicy,
    http_timeout: Duration,
    rate_limit_retry_delay: Duration,
}

impl DeliveryExecutor {
    pub fn new(
        config: &EngineConfig,
        registry: Arc<SubscriptionRegistry>,
        ledger: Arc<dyn DeliveryLedger>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            registry,
            circuit: Arc::new(CircuitBreaker::new(config.circuit.clone())),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            ledger,
            client,
            retry: config.retry.clone(),
            http_timeout: config.http_timeout,
            rate_limit_retry_delay: config.rate_limit.retry_delay,
        })
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn ledger(&self) -> &Arc<dyn DeliveryLedger> {
        &self.ledger
    }

    /// Run one attempt of `job`.
    ///
    /// Never fails: every outcome, including rejections before the network
    /// call, is recorded and reported in the result.
    pub async fn attempt(&self, job: DeliveryJob) -> AttemptResult {
        let subscription_id = job.subscription_id;
        let started_at = Utc::now();

        let Some((subscription, secret)) = self.registry.delivery_target(subscription_id).await else {
            tracing::debug!(
                delivery_id = %job.delivery_id,
                subscription_id = %subscription_id,
                "subscription inactive, dropping delivery"
            );
            self.circuit.forget(subscription_id).await;
            self.rate_limiter.forget(subscription_id).await;
            let mut record = DeliveryAttempt::for_job(&job, AttemptOutcome::Abandoned);
            record.failure = Some(DeliveryFailure::SubscriptionInactive);
            return self.finish(record, None).await;
        };

        let admission = self.circuit.admit(subscription_id).await;
        if !admission.is_allowed() {
            let retry_at = self
                .circuit
                .open_until(subscription_id)
                .await
                .unwrap_or_else(|| Instant::now() + self.rate_limit_retry_delay);
            metric_inc(telemetry::DELIVERY_CIRCUIT_OPEN);
            return self.suppress(job, DeliveryFailure::CircuitOpen, retry_at).await;
        }

        if !self.rate_limiter.try_acquire(subscription_id).await {
            if admission.is_probe() {
                self.circuit.release_probe(subscription_id).await;
            }
            metric_inc(telemetry::DELIVERY_RATE_LIMITED);
            let retry_at = Instant::now() + self.rate_limit_retry_delay;
            return self.suppress(job, DeliveryFailure::RateLimited, retry_at).await;
        }

        let (http_status, result) = self.deliver(&job, &subscription, &secret).await;
        self.update_circuit(&job, admission, &result).await;

        let mut record = DeliveryAttempt::for_job(&job, AttemptOutcome::Success);
        record.attempted_at = started_at;
        record.http_status = http_status;

        let failure = match result {
            Ok(()) => {
                metric_inc(telemetry::DELIVERY_SUCCESS);
                return self.finish(record, None).await;
            }
            Err(failure) => failure,
        };

        if failure.is_permanent() {
            record.outcome = AttemptOutcome::Abandoned;
            record.failure = Some(failure);
            return self.finish(record, None).await;
        }

        let failures = job.failures.saturating_add(1);
        record.failure = Some(failure);

        if !self.retry.should_retry(failures) {
            record.outcome = AttemptOutcome::Abandoned;
            return self.finish(record, None).await;
        }

        let delay = self.retry.backoff_delay(failures);
        record.outcome = AttemptOutcome::Failed;
        record.next_retry_at = wall_clock_after(delay);

        let retry = ScheduledRetry {
            job: job.next_attempt(failures),
            ready_at: Instant::now() + delay,
        };
        self.finish(record, Some(retry)).await
    }

    /// Record a rejection made before the network call and reschedule the
    /// job without touching its failure count.
    async fn suppress(
        &self,
        job: DeliveryJob,
        failure: DeliveryFailure,
        retry_at: Instant,
    ) -> AttemptResult {
        let mut record = DeliveryAttempt::for_job(&job, AttemptOutcome::Failed);
        record.failure = Some(failure);
        record.next_retry_at = wall_clock_after(retry_at.saturating_duration_since(Instant::now()));

        let retry = ScheduledRetry {
            job: job.next_attempt(job.failures),
            ready_at: retry_at,
        };
        self.finish(record, Some(retry)).await
    }

    async fn deliver(
        &self,
        job: &DeliveryJob,
        subscription: &Subscription,
        secret: &SigningSecret,
    ) -> (Option<u16>, Result<(), DeliveryFailure>) {
        let body = WirePayload {
            delivery_id: job.delivery_id,
            event_id: &job.event.id,
            event_type: &job.event.event_type,
            occurred_at: job.event.occurred_at,
            payload: &job.event.payload,
        };
        let body = match serde_json::to_vec(&body) {
            Ok(body) => body,
            Err(e) => return (None, Err(DeliveryFailure::Encoding { message: e.to_string() })),
        };

        let timestamp = Utc::now().timestamp();
        let signature = signing::sign(&body, secret, timestamp);

        let response = self
            .client
            .post(subscription.target_url.as_str())
            .timeout(self.http_timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(DELIVERY_ID_HEADER, job.delivery_id.to_string())
            .header(EVENT_TYPE_HEADER, job.event.event_type.as_str())
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                (Some(status), classify_status(status))
            }
            Err(err) if err.is_timeout() => (None, Err(DeliveryFailure::Timeout)),
            Err(err) if err.is_builder() => {
                (None, Err(DeliveryFailure::Encoding { message: err.to_string() }))
            }
            Err(err) => (None, Err(DeliveryFailure::Network { message: err.to_string() })),
        }
    }

    /// Feed an attempt that went out into the circuit breaker.
    async fn update_circuit(
        &self,
        job: &DeliveryJob,
        admission: Admission,
        result: &Result<(), DeliveryFailure>,
    ) {
        let config = self.circuit.config();
        let counts = match result {
            Ok(()) => Some(true),
            Err(DeliveryFailure::TooManyRequests) => config.count_rate_limit_responses.then_some(false),
            Err(DeliveryFailure::ClientError { .. }) => config.count_client_errors.then_some(false),
            Err(DeliveryFailure::Encoding { .. }) => None,
            Err(_) => Some(false),
        };

        let id = job.subscription_id;
        match (counts, admission.is_probe()) {
            (Some(success), true) => self.circuit.record_probe_outcome(id, success).await,
            (Some(success), false) => self.circuit.record_outcome(id, success).await,
            (None, true) => self.circuit.release_probe(id).await,
            (None, false) => {}
        }
    }

    async fn finish(&self, record: DeliveryAttempt, retry: Option<ScheduledRetry>) -> AttemptResult {
        log_attempt(&record);

        match record.outcome {
            AttemptOutcome::Abandoned => metric_inc(telemetry::DELIVERY_ABANDONED),
            AttemptOutcome::Failed if retry.is_some() => {
                metric_inc(telemetry::DELIVERY_RETRY_SCHEDULED)
            }
            _ => {}
        }

        if let Err(err) = self.ledger.record(&record).await {
            tracing::error!(
                delivery_id = %record.delivery_id,
                attempt = record.attempt_number,
                error = %err,
                "failed to record delivery attempt"
            );
        }

        AttemptResult { attempt: record, retry }
    }
}

/// Map an HTTP status to a delivery result.
///
/// 2xx succeeds, 429 is a transient failure, every other 4xx is permanent,
/// and anything else is transient.
pub fn classify_status(status: u16) -> Result<(), DeliveryFailure> {
    match status {
        200..=299 => Ok(()),
        429 => Err(DeliveryFailure::TooManyRequests),
        400..=499 => Err(DeliveryFailure::ClientError { status }),
        _ => Err(DeliveryFailure::RemoteError { status }),
    }
}

fn wall_clock_after(delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d)
}

fn log_attempt(record: &DeliveryAttempt) {
    let failure = record.failure.as_ref().map(ToString::to_string);

    match (record.outcome, &record.failure) {
        (AttemptOutcome::Success, _) => tracing::info!(
            delivery_id = %record.delivery_id,
            subscription_id = %record.subscription_id,
            event_id = %record.event_id,
            attempt = record.attempt_number,
            status = record.http_status,
            "webhook delivered"
        ),
        (AttemptOutcome::Failed, Some(f)) if f.is_suppressed() => tracing::debug!(
            delivery_id = %record.delivery_id,
            subscription_id = %record.subscription_id,
            attempt = record.attempt_number,
            reason = failure.as_deref(),
            "webhook delivery suppressed"
        ),
        (AttemptOutcome::Abandoned, _) => tracing::warn!(
            delivery_id = %record.delivery_id,
            subscription_id = %record.subscription_id,
            event_id = %record.event_id,
            attempt = record.attempt_number,
            status = record.http_status,
            reason = failure.as_deref(),
            "webhook delivery abandoned"
        ),
        _ => tracing::warn!(
            delivery_id = %record.delivery_id,
            subscription_id = %record.subscription_id,
            attempt = record.attempt_number,
            status = record.http_status,
            reason = failure.as_deref(),
            next_retry_at = ?record.next_retry_at,
            "webhook delivery failed, retry scheduled"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(classify_status(200), Ok(()));
        assert_eq!(classify_status(204), Ok(()));
        assert_eq!(classify_status(404), Err(DeliveryFailure::ClientError { status: 404 }));
        assert_eq!(classify_status(410), Err(DeliveryFailure::ClientError { status: 410 }));
        assert_eq!(classify_status(429), Err(DeliveryFailure::TooManyRequests));
        assert_eq!(classify_status(500), Err(DeliveryFailure::RemoteError { status: 500 }));
        assert_eq!(classify_status(503), Err(DeliveryFailure::RemoteError { status: 503 }));
        assert_eq!(classify_status(301), Err(DeliveryFailure::RemoteError { status: 301 }));
    }

    #[test]
    fn only_client_errors_are_permanent() {
        assert!(classify_status(400).unwrap_err().is_permanent());
        assert!(classify_status(429).unwrap_err().is_transient());
        assert!(classify_status(502).unwrap_err().is_transient());
    }
}
