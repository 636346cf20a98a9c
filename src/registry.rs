use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use reqwest::Url;
use tokio::sync::RwLock;

use crate::error::{RegistryError, ValidationError};
use crate::types::{SigningSecret, Subscription, SubscriptionId};

/// Registered receivers and the event-type index used to match them.
///
/// Every mutation updates the subscription table and the index under one
/// write lock, so readers always see a consistent snapshot. Subscriptions are
/// never removed; deactivation is the only way to stop deliveries.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    subscriptions: HashMap<SubscriptionId, Entry>,
    by_event_type: HashMap<String, HashSet<SubscriptionId>>,
}

#[derive(Debug)]
struct Entry {
    subscription: Arc<Subscription>,
    secret: SigningSecret,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver for the given event types.
    ///
    /// The returned [`Subscription`] does not carry the secret; the caller
    /// already holds it, and the registry never hands it out again.
    pub async fn register<I, S>(
        &self,
        target_url: &str,
        event_types: I,
        secret: impl Into<Vec<u8>>,
    ) -> Result<Subscription, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target_url = validate_url(target_url)?;
        let event_types = validate_event_types(event_types)?;
        let secret = SigningSecret::new(secret);
        if secret.is_empty() {
            return Err(ValidationError::EmptySecret.into());
        }

        let subscription = Subscription {
            id: SubscriptionId::new(),
            target_url,
            event_types,
            active: true,
            created_at: Utc::now(),
        };

        let mut state = self.inner.write().await;
        for event_type in &subscription.event_types {
            state
                .by_event_type
                .entry(event_type.clone())
                .or_default()
                .insert(subscription.id);
        }
        state.subscriptions.insert(
            subscription.id,
            Entry {
                subscription: Arc::new(subscription.clone()),
                secret,
            },
        );

        tracing::info!(
            subscription_id = %subscription.id,
            target_url = %subscription.target_url,
            event_types = ?subscription.event_types,
            "subscription registered"
        );
        Ok(subscription)
    }

    /// Stop new deliveries to a subscription. Idempotent.
    pub async fn deactivate(&self, id: SubscriptionId) -> Result<(), RegistryError> {
        let mut state = self.inner.write().await;
        let state = &mut *state;

        let entry = state
            .subscriptions
            .get_mut(&id)
            .ok_or(RegistryError::NotFound { id })?;
        if !entry.subscription.active {
            return Ok(());
        }

        let mut deactivated = Subscription::clone(&entry.subscription);
        deactivated.active = false;
        for event_type in &deactivated.event_types {
            if let Some(ids) = state.by_event_type.get_mut(event_type) {
                ids.remove(&id);
                if ids.is_empty() {
                    state.by_event_type.remove(event_type);
                }
            }
        }
        entry.subscription = Arc::new(deactivated);

        tracing::info!(subscription_id = %id, "subscription deactivated");
        Ok(())
    }

    /// All active subscriptions interested in `event_type`.
    pub async fn find_active_subscribers(&self, event_type: &str) -> Vec<Arc<Subscription>> {
        let state = self.inner.read().await;
        let Some(ids) = state.by_event_type.get(event_type) else {
            return Vec::new();
        };

        let mut subscribers: Vec<Arc<Subscription>> = ids
            .iter()
            .filter_map(|id| state.subscriptions.get(id))
            .map(|entry| Arc::clone(&entry.subscription))
            .filter(|subscription| subscription.accepts(event_type))
            .collect();
        subscribers.sort_by_key(|s| (s.created_at, s.id));
        subscribers
    }

    pub async fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        let state = self.inner.read().await;
        state
            .subscriptions
            .get(&id)
            .map(|entry| Subscription::clone(&entry.subscription))
    }

    /// Every subscription ever registered, oldest first.
    pub async fn list(&self) -> Vec<Subscription> {
        let state = self.inner.read().await;
        let mut all: Vec<Subscription> = state
            .subscriptions
            .values()
            .map(|entry| Subscription::clone(&entry.subscription))
            .collect();
        all.sort_by_key(|s| (s.created_at, s.id));
        all
    }

    /// Subscription and key needed to sign a delivery, if still active.
    pub(crate) async fn delivery_target(
        &self,
        id: SubscriptionId,
    ) -> Option<(Arc<Subscription>, SigningSecret)> {
        let state = self.inner.read().await;
        let entry = state.subscriptions.get(&id)?;
        if !entry.subscription.active {
            return None;
        }
        Some((Arc::clone(&entry.subscription), entry.secret.clone()))
    }
}

fn validate_url(raw: &str) -> Result<String, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(url.to_string())
}

fn validate_event_types<I, S>(event_types: I) -> Result<BTreeSet<String>, ValidationError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut set = BTreeSet::new();
    for event_type in event_types {
        let event_type: String = event_type.into();
        let event_type = event_type.trim();
        if event_type.is_empty() {
            return Err(ValidationError::BlankEventType);
        }
        set.insert(event_type.to_string());
    }

    if set.is_empty() {
        return Err(ValidationError::NoEventTypes);
    }
    Ok(set)
}
