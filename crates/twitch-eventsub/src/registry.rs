use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use twitch_core::{
    AdmissionError, ClientConfig, ClientEvent, Condition, CreateSubscriptionRequest,
    CreatedSubscription, HelixApi, ObserverBus, Result, SubscriptionStatus, TransportSpec,
    TwitchError,
};

/// Live subscriptions allowed per `(type, condition)`.
pub const DUPLICATE_LIMIT: usize = 3;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subscription_type: String,
    pub version: String,
    pub condition: Condition,
    pub transport_session_id: String,
    pub cost: u32,
    pub status: SubscriptionStatus,
    /// Server-side id, known once the creation is confirmed.
    pub remote_id: Option<String>,
}

impl Subscription {
    fn same_identity(&self, subscription_type: &str, condition: &Condition) -> bool {
        self.subscription_type == subscription_type && &self.condition == condition
    }

    fn request(&self) -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            subscription_type: self.subscription_type.clone(),
            version: self.version.clone(),
            condition: self.condition.clone(),
            transport: TransportSpec::websocket(self.transport_session_id.clone()),
        }
    }
}

/// Outcome of re-issuing subscriptions against a new session.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub session_id: String,
    pub migrated: Vec<SubscriptionId>,
    pub failed: Vec<(SubscriptionId, TwitchError)>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Settled {
    Retry,
    Done(Result<Subscription>),
    /// Entry vanished mid-request; carries the remote id to clean up.
    Orphaned(Option<String>),
}

#[derive(Default)]
struct RegistryState {
    session_id: Option<String>,
    entries: HashMap<SubscriptionId, Subscription>,
    total_cost: u32,
    server_total_cost: u32,
    server_max_total_cost: u32,
    next_id: SubscriptionId,
}

impl RegistryState {
    fn refund(&mut self, cost: u32) {
        self.total_cost = self.total_cost.saturating_sub(cost);
    }
}

/// Removes and refunds a `Pending` entry whose `subscribe` call was dropped
/// before the server answered.
struct PendingEntry<'a> {
    registry: &'a SubscriptionRegistry,
    id: SubscriptionId,
    settled: bool,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.registry.state.lock();
        let abandoned = matches!(
            state.entries.get(&self.id),
            Some(entry) if entry.status == SubscriptionStatus::Pending
        );
        if !abandoned {
            return;
        }
        if let Some(entry) = state.entries.remove(&self.id) {
            state.refund(entry.cost);
            debug!("Subscribe to {} abandoned, entry dropped", entry.subscription_type);
        }
    }
}

/// Tracks subscriptions for the current session and enforces the cost budget
/// and duplicate limit.
///
/// Admission checks and cost accounting happen under one lock, so concurrent
/// callers cannot both pass the budget check.
pub struct SubscriptionRegistry {
    api: Arc<dyn HelixApi>,
    budget: u32,
    warning_ratio: f64,
    state: Mutex<RegistryState>,
    migration_lock: tokio::sync::Mutex<()>,
    events: ObserverBus,
}

impl SubscriptionRegistry {
    pub fn new(api: Arc<dyn HelixApi>, budget: u32) -> Self {
        Self {
            api,
            budget,
            warning_ratio: 0.85,
            state: Mutex::new(RegistryState::default()),
            migration_lock: tokio::sync::Mutex::new(()),
            events: ObserverBus::detached(),
        }
    }

    pub fn from_config(api: Arc<dyn HelixApi>, config: &ClientConfig) -> Self {
        let mut registry = Self::new(api, config.subscription_budget);
        registry.warning_ratio = config.cost_warning_ratio;
        registry
    }

    pub fn with_event_channel(mut self, events: ObserverBus) -> Self {
        self.events = events;
        self
    }

    /// Request a subscription on the current session.
    ///
    /// Returns once the server confirmed it. A rejected request is removed
    /// again and its cost refunded.
    pub async fn subscribe(
        &self,
        subscription_type: &str,
        version: &str,
        condition: Condition,
        cost: u32,
    ) -> Result<Subscription> {
        let id = {
            let mut state = self.state.lock();
            let session_id = state.session_id.clone().ok_or(TwitchError::NotConnected)?;

            let remaining = self.budget.saturating_sub(state.total_cost);
            if cost > remaining {
                return Err(AdmissionError::OverBudget {
                    requested: cost,
                    remaining,
                }
                .into());
            }

            let live = state
                .entries
                .values()
                .filter(|s| s.status.is_live() && s.same_identity(subscription_type, &condition))
                .count();
            if live >= DUPLICATE_LIMIT {
                return Err(AdmissionError::DuplicateLimitExceeded {
                    subscription_type: subscription_type.to_string(),
                    limit: DUPLICATE_LIMIT,
                }
                .into());
            }

            state.next_id += 1;
            let id = state.next_id;
            state.entries.insert(
                id,
                Subscription {
                    id,
                    subscription_type: subscription_type.to_string(),
                    version: version.to_string(),
                    condition,
                    transport_session_id: session_id,
                    cost,
                    status: SubscriptionStatus::Pending,
                    remote_id: None,
                },
            );
            state.total_cost += cost;
            id
        };

        debug!("Subscribing to {} (cost {})", subscription_type, cost);
        let mut pending = PendingEntry {
            registry: self,
            id,
            settled: false,
        };

        loop {
            let request = self.state.lock().entries.get(&id).map(Subscription::request);
            let Some(request) = request else {
                pending.settled = true;
                return Err(TwitchError::Cancelled);
            };
            let result = self.api.create_subscription(&request).await;

            let settled = self.settle(id, &request, result);
            if !matches!(settled, Settled::Retry) {
                pending.settled = true;
            }
            match settled {
                Settled::Retry => continue,
                Settled::Done(outcome) => return outcome,
                Settled::Orphaned(remote_id) => {
                    if let Some(remote_id) = remote_id {
                        self.delete_remote(&remote_id).await;
                    }
                    return Err(TwitchError::Cancelled);
                }
            }
        }
    }

    fn settle(
        &self,
        id: SubscriptionId,
        request: &CreateSubscriptionRequest,
        result: Result<CreatedSubscription>,
    ) -> Settled {
        let mut state = self.state.lock();
        let current_session = state.session_id.clone();
        let Some(entry) = state.entries.get_mut(&id) else {
            // Unsubscribed while the request was in flight.
            return Settled::Orphaned(result.ok().map(|created| created.id));
        };

        if current_session.as_deref() != Some(request.transport.session_id.as_str()) {
            return match current_session {
                Some(next) => {
                    debug!(
                        "Session changed while subscribing to {}, re-issuing on {}",
                        entry.subscription_type, next
                    );
                    entry.transport_session_id = next;
                    Settled::Retry
                }
                None => {
                    let cost = entry.cost;
                    state.entries.remove(&id);
                    state.refund(cost);
                    Settled::Done(Err(TwitchError::NotConnected))
                }
            };
        }

        match result {
            Ok(created) => {
                entry.status = SubscriptionStatus::Enabled;
                entry.remote_id = Some(created.id.clone());
                let subscription = entry.clone();
                self.record_server_cost(&mut state, created.total_cost, created.max_total_cost);
                info!(
                    "Subscribed to {} (remote id {})",
                    subscription.subscription_type, created.id
                );
                Settled::Done(Ok(subscription))
            }
            Err(e) => {
                let cost = entry.cost;
                state.entries.remove(&id);
                state.refund(cost);
                warn!("Subscription to {} rejected: {}", request.subscription_type, e);
                Settled::Done(Err(e))
            }
        }
    }

    /// Remove a subscription. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.entries.remove(&id);
            if let Some(entry) = &removed {
                if entry.status.is_live() {
                    state.refund(entry.cost);
                }
            }
            removed
        };

        let Some(entry) = removed else {
            return Ok(());
        };
        debug!("Unsubscribed from {}", entry.subscription_type);
        if let (Some(remote_id), true) = (&entry.remote_id, entry.status.is_live()) {
            self.delete_remote(remote_id).await;
        }
        Ok(())
    }

    /// Point the registry at a new session and re-issue every enabled
    /// subscription against it. Runs once per session id; cost stays charged
    /// for subscriptions that move, and is refunded for those that fail.
    pub async fn migrate_all(&self, new_session_id: &str) -> MigrationReport {
        let _guard = self.migration_lock.lock().await;
        let mut report = MigrationReport {
            session_id: new_session_id.to_string(),
            ..Default::default()
        };

        let requests: Vec<(SubscriptionId, CreateSubscriptionRequest)> = {
            let mut state = self.state.lock();
            if state.session_id.as_deref() == Some(new_session_id) {
                return report;
            }
            state.session_id = Some(new_session_id.to_string());

            let mut requests = Vec::new();
            for entry in state.entries.values_mut() {
                match entry.status {
                    SubscriptionStatus::Enabled => {
                        entry.status = SubscriptionStatus::Pending;
                        entry.transport_session_id = new_session_id.to_string();
                        entry.remote_id = None;
                        requests.push((entry.id, entry.request()));
                    }
                    // In-flight subscribes notice the new session themselves.
                    SubscriptionStatus::Pending => {}
                    SubscriptionStatus::Failed | SubscriptionStatus::Revoked => {
                        entry.transport_session_id = new_session_id.to_string();
                    }
                }
            }
            requests
        };

        if requests.is_empty() {
            debug!("Session {} attached, nothing to migrate", new_session_id);
            return report;
        }
        info!(
            "Migrating {} subscriptions to session {}",
            requests.len(),
            new_session_id
        );

        let results = join_all(requests.into_iter().map(|(id, request)| async move {
            let result = self.api.create_subscription(&request).await;
            (id, result)
        }))
        .await;

        let mut orphans = Vec::new();
        {
            let mut state = self.state.lock();
            for (id, result) in results {
                let Some(entry) = state.entries.get_mut(&id) else {
                    if let Ok(created) = result {
                        orphans.push(created.id);
                    }
                    continue;
                };

                match result {
                    Ok(created) => {
                        entry.status = SubscriptionStatus::Enabled;
                        entry.remote_id = Some(created.id);
                        report.migrated.push(id);
                        self.record_server_cost(
                            &mut state,
                            created.total_cost,
                            created.max_total_cost,
                        );
                    }
                    // The server already has it on this session.
                    Err(TwitchError::Admission(AdmissionError::AlreadyExists(_))) => {
                        entry.status = SubscriptionStatus::Enabled;
                        report.migrated.push(id);
                    }
                    Err(e) => {
                        entry.status = SubscriptionStatus::Failed;
                        let cost = entry.cost;
                        let subscription_type = entry.subscription_type.clone();
                        let condition = entry.condition.clone();
                        state.refund(cost);
                        warn!("Failed to migrate {}: {}", subscription_type, e);
                        self.events.emit(ClientEvent::SubscriptionFailed {
                            subscription_type,
                            condition,
                            error: e.clone(),
                        });
                        report.failed.push((id, e));
                    }
                }
            }
        }

        for remote_id in orphans {
            self.delete_remote(&remote_id).await;
        }
        report
    }

    /// Apply a server revocation notice. The subscription is dropped and its
    /// cost refunded.
    pub fn mark_revoked(&self, remote_id: &str, reason: &str) -> Option<Subscription> {
        let mut revoked = {
            let mut state = self.state.lock();
            let id = state
                .entries
                .values()
                .find(|s| s.remote_id.as_deref() == Some(remote_id))
                .map(|s| s.id)?;
            let entry = state.entries.remove(&id)?;
            if entry.status.is_live() {
                state.refund(entry.cost);
            }
            entry
        };
        revoked.status = SubscriptionStatus::Revoked;

        warn!(
            "Subscription {} ({}) revoked: {}",
            revoked.subscription_type, remote_id, reason
        );
        self.events.emit(ClientEvent::SubscriptionRevoked {
            subscription_type: revoked.subscription_type.clone(),
            remote_id: remote_id.to_string(),
            reason: reason.to_string(),
        });
        Some(revoked)
    }

    /// Forget the session once a run ends. Every subscription died with it.
    pub fn retire_session(&self) -> usize {
        let mut state = self.state.lock();
        state.session_id = None;
        let dropped = state.entries.len();
        state.entries.clear();
        state.total_cost = 0;
        dropped
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn remaining_budget(&self) -> u32 {
        self.budget.saturating_sub(self.state.lock().total_cost)
    }

    pub fn total_cost(&self) -> u32 {
        self.state.lock().total_cost
    }

    /// Last `max_total_cost` reported by the server, 0 until the first creation.
    pub fn server_max_total_cost(&self) -> u32 {
        self.state.lock().server_max_total_cost
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.state.lock().entries.get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut entries: Vec<_> = self.state.lock().entries.values().cloned().collect();
        entries.sort_by_key(|s| s.id);
        entries
    }

    fn record_server_cost(&self, state: &mut RegistryState, total: u32, max: u32) {
        state.server_total_cost = total;
        state.server_max_total_cost = max;
        if max > 0 && f64::from(total) >= f64::from(max) * self.warning_ratio {
            warn!("Subscription cost at {}/{} of the server limit", total, max);
        }
    }

    async fn delete_remote(&self, remote_id: &str) {
        if let Err(e) = self.api.delete_subscription(remote_id).await {
            warn!("Failed to delete subscription {}: {}", remote_id, e);
        }
    }
}
