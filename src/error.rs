use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{AttemptId, DeliveryId, SubscriptionId};

/// Malformed registration input. Rejected synchronously, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid target url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("at least one event type is required")]
    NoEventTypes,

    #[error("event types must not be blank")]
    BlankEventType,

    #[error("signing secret must not be empty")]
    EmptySecret,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("subscription not found: {id}")]
    NotFound { id: SubscriptionId },
}

/// Errors returned when dispatching fails *before* any delivery begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid event: {reason}")]
    InvalidEvent { reason: &'static str },

    #[error("dispatcher is shut down")]
    Shutdown,
}

/// Why an attempt did not succeed. Stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryFailure {
    /// Suppressed before the network call; the breaker is open.
    #[error("circuit open")]
    CircuitOpen,

    /// Suppressed before the network call; the local bucket is empty.
    #[error("rate limited")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("network error: {message}")]
    Network { message: String },

    /// Any non-2xx status other than 4xx, e.g. 5xx or an unfollowed 3xx.
    #[error("remote endpoint returned HTTP {status}")]
    RemoteError { status: u16 },

    #[error("remote endpoint returned HTTP 429")]
    TooManyRequests,

    #[error("client error HTTP {status} (non-retryable)")]
    ClientError { status: u16 },

    #[error("subscription is inactive")]
    SubscriptionInactive,

    #[error("payload encoding failed: {message}")]
    Encoding { message: String },
}

impl DeliveryFailure {
    /// Failures retried with exponential backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryFailure::Timeout
                | DeliveryFailure::Network { .. }
                | DeliveryFailure::RemoteError { .. }
                | DeliveryFailure::TooManyRequests
        )
    }

    /// Failures that end the delivery immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DeliveryFailure::ClientError { .. }
                | DeliveryFailure::SubscriptionInactive
                | DeliveryFailure::Encoding { .. }
        )
    }

    /// Rejections made without touching the network.
    pub fn is_suppressed(&self) -> bool {
        matches!(self, DeliveryFailure::CircuitOpen | DeliveryFailure::RateLimited)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("attempt {id} already recorded")]
    DuplicateAttempt { id: AttemptId },

    #[error("attempt {attempted} for delivery {delivery_id} does not follow attempt {last}")]
    NonMonotonicAttempt {
        delivery_id: DeliveryId,
        last: u32,
        attempted: u32,
    },

    #[error("ledger backend error: {message}")]
    Backend { message: String },
}

/// Errors constructing the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let all = [
            DeliveryFailure::CircuitOpen,
            DeliveryFailure::RateLimited,
            DeliveryFailure::Timeout,
            DeliveryFailure::Network { message: "reset".into() },
            DeliveryFailure::RemoteError { status: 503 },
            DeliveryFailure::TooManyRequests,
            DeliveryFailure::ClientError { status: 404 },
            DeliveryFailure::SubscriptionInactive,
        ];
        for failure in all {
            let flags = [failure.is_transient(), failure.is_permanent(), failure.is_suppressed()];
            assert_eq!(flags.iter().filter(|f| **f).count(), 1, "{failure:?}");
        }
    }

    #[test]
    fn failure_serializes_with_kind_tag() {
        let json = serde_json::to_value(DeliveryFailure::RemoteError { status: 502 }).unwrap();
        assert_eq!(json["kind"], "remote_error");
        assert_eq!(json["status"], 502);
    }
}
