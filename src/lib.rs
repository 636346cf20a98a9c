//! An in-process, reliable webhook delivery engine.
//!
//! Events handed to the [`EventDispatcher`] are matched against registered
//! subscriptions and delivered as signed HTTP POSTs, with retries,
//! per-subscription circuit breaking and rate limiting. Every attempt is
//! recorded in a [`DeliveryLedger`].
//!
//! ## Guarantees
//! - Bounded outbound concurrency (fixed worker pool)
//! - Per-subscription isolation of breaker and rate-limit state
//! - Idempotent dispatch per event id
//! - At most one attempt in flight per (subscription, event) pair
//! - Every attempt is written to the ledger
//!
//! ## Non-Guarantees
//! - Durability of pending retries across restarts
//! - Exactly-once delivery
//! - Distributed coordination
//!
//! Serving HTTP, authentication and choosing a database are left to the
//! host application.

mod circuit;
mod config;
mod dispatcher;
mod error;
mod executor;
mod ledger;
mod rate_limit;
mod registry;
mod retry;
mod signing;
mod telemetry;
mod types;

#[cfg(feature = "postgres")]
mod ledger_postgres;

pub use circuit::{Admission, CircuitBreaker, CircuitState, CircuitStatus};
pub use config::{CircuitConfig, ConfigError, EngineConfig, RateLimitConfig, RetryPolicy};
pub use dispatcher::EventDispatcher;
pub use error::{
    DeliveryFailure,
    DispatchError,
    EngineError,
    LedgerError,
    RegistryError,
    ValidationError,
};
pub use executor::{classify_status, AttemptResult, DeliveryExecutor, ScheduledRetry};
pub use ledger::{DeliveryLedger, InMemoryLedger, LedgerPage, LedgerQuery};
pub use rate_limit::{RateLimiter, RateLimiterStats, TokenBucket};
pub use registry::SubscriptionRegistry;
pub use signing::{
    compute_signature,
    is_timestamp_fresh,
    parse_signature_headers,
    sign,
    verify_signature,
    verify_webhook_request,
    ParsedSignature,
    VerificationError,
    DELIVERY_ID_HEADER,
    EVENT_TYPE_HEADER,
    SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use types::{
    AttemptId,
    AttemptOutcome,
    DeliveryAttempt,
    DeliveryId,
    DeliveryJob,
    DispatchReceipt,
    Event,
    EventId,
    SigningSecret,
    Subscription,
    SubscriptionId,
};

#[cfg(feature = "postgres")]
pub use ledger_postgres::PostgresLedger;
