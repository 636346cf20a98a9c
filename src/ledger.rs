use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::LedgerError;
use crate::types::{AttemptId, AttemptOutcome, DeliveryAttempt, DeliveryId, EventId, SubscriptionId};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Append-only record of every delivery attempt.
///
/// Only the executor writes to it. Records are never overwritten.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Append an attempt. Fails if the id is already recorded or the attempt
    /// number does not follow the last one recorded for the same delivery.
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), LedgerError>;

    /// Read attempts matching `query`, ordered by time then attempt number.
    async fn query(&self, query: &LedgerQuery) -> Result<LedgerPage, LedgerError>;
}

/// Filter and page over the ledger. Unset filters match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerQuery {
    pub subscription_id: Option<SubscriptionId>,
    pub event_id: Option<EventId>,
    pub delivery_id: Option<DeliveryId>,
    pub outcome: Option<AttemptOutcome>,
    /// Inclusive lower bound on `attempted_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `attempted_at`.
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for LedgerQuery {
    fn default() -> Self {
        Self {
            subscription_id: None,
            event_id: None,
            delivery_id: None,
            outcome: None,
            since: None,
            until: None,
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl LedgerQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_subscription(mut self, subscription_id: SubscriptionId) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn for_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(EventId(event_id.into()));
        self
    }

    pub fn for_delivery(mut self, delivery_id: DeliveryId) -> Self {
        self.delivery_id = Some(delivery_id);
        self
    }

    pub fn with_outcome(mut self, outcome: AttemptOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn matches(&self, attempt: &DeliveryAttempt) -> bool {
        self.subscription_id.is_none_or_eq(&attempt.subscription_id)
            && self.event_id.is_none_or_eq(&attempt.event_id)
            && self.delivery_id.is_none_or_eq(&attempt.delivery_id)
            && self.outcome.is_none_or_eq(&attempt.outcome)
            && self.since.map_or(true, |since| attempt.attempted_at >= since)
            && self.until.map_or(true, |until| attempt.attempted_at < until)
    }
}

trait OptionFilter<T> {
    fn is_none_or_eq(&self, value: &T) -> bool;
}

impl<T: PartialEq> OptionFilter<T> for Option<T> {
    fn is_none_or_eq(&self, value: &T) -> bool {
        self.as_ref().map_or(true, |expected| expected == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPage {
    pub attempts: Vec<DeliveryAttempt>,
    /// Offset of the next page, if there is one.
    pub next_offset: Option<usize>,
}

/// In-memory ledger for embedded deployments and tests.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: RwLock<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    attempts: Vec<DeliveryAttempt>,
    ids: HashSet<AttemptId>,
    last_attempt: HashMap<DeliveryId, u32>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.attempts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryLedger {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), LedgerError> {
        let mut state = self.inner.write().await;

        if state.ids.contains(&attempt.id) {
            return Err(LedgerError::DuplicateAttempt { id: attempt.id });
        }

        let last = state.last_attempt.get(&attempt.delivery_id).copied().unwrap_or(0);
        if attempt.attempt_number <= last {
            return Err(LedgerError::NonMonotonicAttempt {
                delivery_id: attempt.delivery_id,
                last,
                attempted: attempt.attempt_number,
            });
        }

        state.ids.insert(attempt.id);
        state.last_attempt.insert(attempt.delivery_id, attempt.attempt_number);
        state.attempts.push(attempt.clone());
        Ok(())
    }

    async fn query(&self, query: &LedgerQuery) -> Result<LedgerPage, LedgerError> {
        let state = self.inner.read().await;

        let mut matching: Vec<&DeliveryAttempt> =
            state.attempts.iter().filter(|a| query.matches(a)).collect();
        matching.sort_by(|a, b| {
            a.attempted_at
                .cmp(&b.attempted_at)
                .then(a.attempt_number.cmp(&b.attempt_number))
        });

        let total = matching.len();
        let attempts: Vec<DeliveryAttempt> = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();

        let end = query.offset.saturating_add(attempts.len());
        let next_offset = (end < total && !attempts.is_empty()).then_some(end);

        Ok(LedgerPage { attempts, next_offset })
    }
}
