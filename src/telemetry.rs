//! Optional counters. Compiled to no-ops unless the `metrics` feature is on.

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

pub(crate) const DISPATCH_ENQUEUED: &str = "webhook.dispatch.enqueued";
pub(crate) const DISPATCH_DUPLICATE: &str = "webhook.dispatch.duplicate";
pub(crate) const DELIVERY_SUCCESS: &str = "webhook.delivery.success";
pub(crate) const DELIVERY_RETRY_SCHEDULED: &str = "webhook.delivery.retry_scheduled";
pub(crate) const DELIVERY_ABANDONED: &str = "webhook.delivery.abandoned";
pub(crate) const DELIVERY_CIRCUIT_OPEN: &str = "webhook.delivery.circuit_open";
pub(crate) const DELIVERY_RATE_LIMITED: &str = "webhook.delivery.rate_limited";
