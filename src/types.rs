use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeliveryFailure;

/// Unique identifier for a subscription.
///
/// Strongly typed to avoid mixing subscription ids with other identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-supplied event identifier, used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one delivery job: a sequence of attempts delivering one
/// event to one subscription. Sent to receivers as `X-Webhook-Delivery-Id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a single ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// HMAC key for a subscription.
///
/// Deliberately neither `Serialize` nor `Display`; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret([REDACTED])")
    }
}

/// A registered receiver, as visible outside the registry.
///
/// The signing secret is kept by the registry and never appears here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub target_url: String,
    pub event_types: BTreeSet<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn accepts(&self, event_type: &str) -> bool {
        self.active && self.event_types.contains(event_type)
    }
}

/// A domain occurrence to notify subscribers about.
///
/// The payload is opaque to the engine and is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Create an event that occurred now.
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId(id.into()),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Result of a dispatch: one delivery job per matching subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub event_id: EventId,
    pub delivery_ids: Vec<DeliveryId>,
}

impl DispatchReceipt {
    pub fn len(&self) -> usize {
        self.delivery_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivery_ids.is_empty()
    }
}

/// A unit of work consumed by workers.
///
/// `attempt` is the number the next ledger record will carry. `failures`
/// counts transient network failures so far and drives backoff and the
/// attempt cap; rejections before the network never advance it.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub delivery_id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event: Arc<Event>,
    pub attempt: u32,
    pub failures: u32,
}

impl DeliveryJob {
    pub fn first(subscription_id: SubscriptionId, event: Arc<Event>) -> Self {
        Self {
            delivery_id: DeliveryId::new(),
            subscription_id,
            event,
            attempt: 1,
            failures: 0,
        }
    }

    pub(crate) fn pair(&self) -> (SubscriptionId, EventId) {
        (self.subscription_id, self.event.id.clone())
    }

    pub(crate) fn next_attempt(&self, failures: u32) -> Self {
        Self {
            delivery_id: self.delivery_id,
            subscription_id: self.subscription_id,
            event: Arc::clone(&self.event),
            attempt: self.attempt + 1,
            failures,
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failed,
    Abandoned,
}

impl AttemptOutcome {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptOutcome::Success | AttemptOutcome::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-once ledger record of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: AttemptId,
    pub delivery_id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub failure: Option<DeliveryFailure>,
    pub http_status: Option<u16>,
    pub attempted_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    pub(crate) fn for_job(job: &DeliveryJob, outcome: AttemptOutcome) -> Self {
        Self {
            id: AttemptId::new(),
            delivery_id: job.delivery_id,
            subscription_id: job.subscription_id,
            event_id: job.event.id.clone(),
            attempt_number: job.attempt,
            outcome,
            failure: None,
            http_status: None,
            attempted_at: Utc::now(),
            next_retry_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SigningSecret::new("hunter2");
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn next_attempt_keeps_delivery_id() {
        let event = Arc::new(Event::new("evt_1", "invoice.created", serde_json::json!({})));
        let job = DeliveryJob::first(SubscriptionId::new(), event);
        let next = job.next_attempt(1);
        assert_eq!(next.delivery_id, job.delivery_id);
        assert_eq!(next.attempt, 2);
        assert_eq!(next.failures, 1);
    }

    #[test]
    fn inactive_subscription_accepts_nothing() {
        let mut subscription = Subscription {
            id: SubscriptionId::new(),
            target_url: "https://example.com/hook".into(),
            event_types: ["invoice.created".to_string()].into_iter().collect(),
            active: true,
            created_at: Utc::now(),
        };
        assert!(subscription.accepts("invoice.created"));
        assert!(!subscription.accepts("invoice.paid"));
        subscription.active = false;
        assert!(!subscription.accepts("invoice.created"));
    }
}
