//! Per-subscription circuit breaker.
//!
//! ```text
//!   closed ── threshold consecutive failures ──▶ open
//!     ▲                                           │
//!     │ probe succeeds                            │ cooldown elapses
//!     │                                           ▼
//!     └────────────────────────────────────── half-open
//!                                                 │
//!            open ◀── probe fails (cooldown x2) ──┘
//! ```
//!
//! The cooldown starts at `cooldown_base` and doubles on every trip that
//! follows without an intervening close, up to `cooldown_cap`. Only one probe
//! is in flight while half-open. State lives in memory only; after a restart
//! every circuit starts closed and re-learns from fresh attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::CircuitConfig;
use crate::types::SubscriptionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Deliveries proceed normally.
    Closed,
    /// Deliveries are rejected without a network call.
    Open,
    /// A single probe delivery is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Health of one subscription's endpoint.
#[derive(Debug, Clone)]
pub struct CircuitStatus {
    pub subscription_id: SubscriptionId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub open_until: Option<Instant>,
    /// Trips since the circuit was last closed; drives cooldown growth.
    pub trips: u32,
    pub probe_in_flight: bool,
}

impl CircuitStatus {
    fn new(subscription_id: SubscriptionId) -> Self {
        Self {
            subscription_id,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            open_until: None,
            trips: 0,
            probe_in_flight: false,
        }
    }
}

/// Answer of [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The circuit is open, or half-open with its probe already out.
    Rejected,
    /// The circuit is closed.
    Allowed,
    /// The single half-open probe. Its outcome alone decides whether the
    /// circuit closes or re-opens.
    Probe,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Rejected)
    }

    pub fn is_probe(self) -> bool {
        matches!(self, Admission::Probe)
    }
}

/// Circuit breakers for all subscriptions, one lock per subscription.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    circuits: RwLock<HashMap<SubscriptionId, Arc<Mutex<CircuitStatus>>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Whether an attempt may go out right now.
    pub async fn allow(&self, subscription_id: SubscriptionId) -> bool {
        self.admit(subscription_id).await.is_allowed()
    }

    /// Decide whether an attempt may go out, and in which role.
    ///
    /// An [`Admission::Probe`] must be followed by
    /// [`record_probe_outcome`](Self::record_probe_outcome) or
    /// [`release_probe`](Self::release_probe); an [`Admission::Allowed`]
    /// attempt reports through [`record_outcome`](Self::record_outcome).
    pub async fn admit(&self, subscription_id: SubscriptionId) -> Admission {
        let circuit = self.circuit(subscription_id).await;
        let mut circuit = circuit.lock().await;

        match circuit.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled_down = circuit
                    .open_until
                    .map_or(true, |until| Instant::now() >= until);
                if !cooled_down {
                    return Admission::Rejected;
                }
                tracing::info!(subscription_id = %subscription_id, "circuit half-open, allowing probe");
                circuit.state = CircuitState::HalfOpen;
                circuit.probe_in_flight = true;
                Admission::Probe
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Admission::Rejected
                } else {
                    circuit.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Update the circuit after an attempt admitted while closed.
    ///
    /// Only a closed circuit changes state here. Results arriving after a
    /// trip adjust the failure tally but never close or re-trip the circuit.
    pub async fn record_outcome(&self, subscription_id: SubscriptionId, success: bool) {
        let circuit = self.circuit(subscription_id).await;
        let mut circuit = circuit.lock().await;

        if success {
            circuit.consecutive_failures = 0;
            return;
        }

        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        circuit.last_failure_at = Some(Utc::now());

        if circuit.state == CircuitState::Closed
            && circuit.consecutive_failures >= self.config.failure_threshold
        {
            self.trip(&mut circuit);
        }
    }

    /// Close or re-open a half-open circuit from its probe's outcome.
    pub async fn record_probe_outcome(&self, subscription_id: SubscriptionId, success: bool) {
        let circuit = self.circuit(subscription_id).await;
        let mut circuit = circuit.lock().await;

        if circuit.state != CircuitState::HalfOpen || !circuit.probe_in_flight {
            drop(circuit);
            return self.record_outcome(subscription_id, success).await;
        }

        circuit.probe_in_flight = false;
        if success {
            tracing::info!(subscription_id = %subscription_id, "circuit closed, endpoint recovered");
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
            circuit.open_until = None;
            circuit.trips = 0;
        } else {
            circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
            circuit.last_failure_at = Some(Utc::now());
            self.trip(&mut circuit);
        }
    }

    /// Give back a half-open probe slot that was granted but not used to
    /// judge endpoint health.
    pub async fn release_probe(&self, subscription_id: SubscriptionId) {
        let circuit = self.circuit(subscription_id).await;
        let mut circuit = circuit.lock().await;
        if circuit.state == CircuitState::HalfOpen {
            circuit.probe_in_flight = false;
        }
    }

    /// When an open circuit will admit its next probe.
    pub async fn open_until(&self, subscription_id: SubscriptionId) -> Option<Instant> {
        let circuit = self.circuits.read().await.get(&subscription_id).cloned()?;
        let circuit = circuit.lock().await;
        match circuit.state {
            CircuitState::Open => circuit.open_until,
            _ => None,
        }
    }

    pub async fn status(&self, subscription_id: SubscriptionId) -> Option<CircuitStatus> {
        let circuit = self.circuits.read().await.get(&subscription_id).cloned()?;
        let status = circuit.lock().await.clone();
        Some(status)
    }

    pub async fn forget(&self, subscription_id: SubscriptionId) {
        self.circuits.write().await.remove(&subscription_id);
    }

    fn trip(&self, circuit: &mut CircuitStatus) {
        circuit.trips = circuit.trips.saturating_add(1);
        let cooldown = self.cooldown(circuit.trips);

        tracing::warn!(
            subscription_id = %circuit.subscription_id,
            consecutive_failures = circuit.consecutive_failures,
            cooldown_secs = cooldown.as_secs_f64(),
            "circuit opened"
        );

        circuit.state = CircuitState::Open;
        circuit.open_until = Some(Instant::now() + cooldown);
        circuit.probe_in_flight = false;
    }

    fn cooldown(&self, trips: u32) -> Duration {
        let exponent = trips.saturating_sub(1).min(20);
        self.config
            .cooldown_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.config.cooldown_cap)
    }

    async fn circuit(&self, subscription_id: SubscriptionId) -> Arc<Mutex<CircuitStatus>> {
        if let Some(circuit) = self.circuits.read().await.get(&subscription_id) {
            return Arc::clone(circuit);
        }

        let mut guard = self.circuits.write().await;
        let circuit = guard
            .entry(subscription_id)
            .or_insert_with(|| Arc::new(Mutex::new(CircuitStatus::new(subscription_id))));
        Arc::clone(circuit)
    }
}
