use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::events::{Event, ModelUnavailableStartEvent, OperationalEvent, UnavailableStartEvent};
use crate::{Credential, CredentialId, CredentialState, EventHub, UnavailableReason};

use super::model_unavailable_queue::ModelUnavailableQueue;
use super::selection::{GroupThresholds, SelectionKey};
use super::unavailable_queue::UnavailableQueue;

type ModelStateKey = (CredentialId, String);
type ModelStateValue = (Instant, UnavailableReason);

#[derive(Debug, Clone)]
pub enum AcquireError {
    ProviderUnknown,
    NoActiveCredentials,
}

/// Errors from `get_next_account`, per §4.5 steps 2/3/8/9. The pool
/// deliberately keeps the "all candidates excluded/over-concurrency"
/// case distinct from "all considered candidates were cooling down" (§9
/// open question: "preserve both branches").
#[derive(Debug, Clone, PartialEq)]
pub enum NextAccountError {
    /// Step 2: no active account has any quota row at all for this selection.
    NoActiveAccounts,
    /// Step 3: every active candidate's quota_remaining is at or below the
    /// group/model threshold.
    BelowThreshold { group_label: String, retry_after_ms: u64 },
    /// Step 6-8: every candidate considered (i.e. not excluded/over-limit)
    /// was in cooldown for this selection_key.
    AllCooldown { retry_after_ms: u64 },
    /// Step 9: every surviving candidate was excluded or over its
    /// concurrency limit before a cooldown check even applied, or its
    /// token could not be refreshed.
    NoAvailableWithValidTokens,
}

impl NextAccountError {
    pub fn message(&self) -> String {
        match self {
            NextAccountError::NoActiveAccounts => "No active accounts available".to_string(),
            NextAccountError::BelowThreshold {
                group_label,
                retry_after_ms,
            } => format!(
                "No account above required quota for {group_label}, reset after {}s",
                retry_after_ms.div_ceil(1000)
            ),
            NextAccountError::AllCooldown { retry_after_ms } => format!(
                "No capacity available, reset after {}s",
                (retry_after_ms / 1000).max(1)
            ),
            NextAccountError::NoAvailableWithValidTokens => {
                "No available accounts with valid tokens".to_string()
            }
        }
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            NextAccountError::BelowThreshold { .. } | NextAccountError::AllCooldown { .. } => {
                Some(429)
            }
            _ => None,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            NextAccountError::BelowThreshold { retry_after_ms, .. }
            | NextAccountError::AllCooldown { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingOverviewRow {
    pub selection_key: String,
    pub sticky_account_id: Option<CredentialId>,
    pub candidates: usize,
    pub in_cooldown: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct AccountPoolLimits {
    /// Concurrency lock ceiling per account. <= 0 disables locking (no-op).
    pub max_concurrent_per_account: i64,
    /// Consecutive non-capacity errors before the account flips to `error`.
    pub error_count_to_disable: u32,
    pub cooldown_floor: Duration,
    pub cooldown_ceiling: Duration,
}

impl Default for AccountPoolLimits {
    fn default() -> Self {
        Self {
            max_concurrent_per_account: 1,
            error_count_to_disable: 3,
            cooldown_floor: Duration::from_millis(1_000),
            cooldown_ceiling: Duration::from_secs(5 * 60),
        }
    }
}

pub struct CredentialPool {
    creds: RwLock<HashMap<CredentialId, Credential>>,
    by_provider: RwLock<HashMap<String, Vec<CredentialId>>>,
    states: Arc<RwLock<HashMap<CredentialId, CredentialState>>>,
    model_states: Arc<RwLock<HashMap<ModelStateKey, ModelStateValue>>>,
    events: EventHub,
    queue: Arc<UnavailableQueue>,
    model_queue: Arc<ModelUnavailableQueue>,

    // --- §4.5 account-pool selection state (additive; independent of the
    // generic `states`/`model_states` unavailable-reason tracking above,
    // which the multi-protocol dispatch path still uses for non-capacity
    // failures). Keyed by selection_key string form so group and raw-model
    // keys share one map without a second generic parameter.
    aggregate_quota: RwLock<HashMap<CredentialId, f64>>,
    model_quota: RwLock<HashMap<(CredentialId, String), f64>>,
    sticky: RwLock<HashMap<String, CredentialId>>,
    cooldowns: RwLock<HashMap<(CredentialId, String), (Instant, SystemTime, u32)>>,
    concurrency: RwLock<HashMap<CredentialId, i64>>,
    error_counts: RwLock<HashMap<CredentialId, u32>>,
}

impl CredentialPool {
    pub fn new(events: EventHub) -> Self {
        let states = Arc::new(RwLock::new(HashMap::new()));
        let model_states = Arc::new(RwLock::new(HashMap::new()));
        let queue = Arc::new(UnavailableQueue::new());
        let model_queue = Arc::new(ModelUnavailableQueue::new());
        queue
            .clone()
            .spawn_recover_task(states.clone(), events.clone());
        model_queue
            .clone()
            .spawn_recover_task(model_states.clone(), events.clone());
        Self {
            creds: RwLock::new(HashMap::new()),
            by_provider: RwLock::new(HashMap::new()),
            states,
            model_states,
            events,
            queue,
            model_queue,
            aggregate_quota: RwLock::new(HashMap::new()),
            model_quota: RwLock::new(HashMap::new()),
            sticky: RwLock::new(HashMap::new()),
            cooldowns: RwLock::new(HashMap::new()),
            concurrency: RwLock::new(HashMap::new()),
            error_counts: RwLock::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub async fn insert(&self, provider: impl Into<String>, id: CredentialId, cred: Credential) {
        let provider = provider.into();
        self.creds.write().await.insert(id, cred);
        // Avoid duplicated IDs in the provider index; insert() can be called on enable toggles.
        let mut by_provider = self.by_provider.write().await;
        let ids = by_provider.entry(provider).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        self.states
            .write()
            .await
            .entry(id)
            .or_insert(CredentialState::Active);
    }

    pub async fn update_credential(&self, id: CredentialId, cred: Credential) {
        self.creds.write().await.insert(id, cred);
    }

    pub async fn set_enabled(&self, provider: &str, id: CredentialId, enabled: bool) {
        if enabled {
            let mut by_provider = self.by_provider.write().await;
            let ids = by_provider.entry(provider.to_string()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
            drop(by_provider);

            // If the credential was never inserted before, keep state as Active.
            self.states
                .write()
                .await
                .entry(id)
                .or_insert(CredentialState::Active);
        } else {
            let mut by_provider = self.by_provider.write().await;
            if let Some(ids) = by_provider.get_mut(provider) {
                ids.retain(|x| *x != id);
            }
            let mut model_states = self.model_states.write().await;
            model_states.retain(|(cred_id, _), _| *cred_id != id);
        }
    }

    pub async fn acquire(
        &self,
        provider: &str,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        let ids = {
            let guard = self.by_provider.read().await;
            guard.get(provider).cloned()
        };
        let Some(ids) = ids else {
            return Err(AcquireError::ProviderUnknown);
        };

        let states = self.states.read().await;
        let chosen = ids
            .into_iter()
            .find(|id| matches!(states.get(id), Some(CredentialState::Active)));
        drop(states);

        let Some(id) = chosen else {
            return Err(AcquireError::NoActiveCredentials);
        };
        let cred = self
            .creds
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AcquireError::NoActiveCredentials)?;
        Ok((id, cred))
    }

    pub async fn acquire_for_model(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        let ids = {
            let guard = self.by_provider.read().await;
            guard.get(provider).cloned()
        };
        let Some(ids) = ids else {
            return Err(AcquireError::ProviderUnknown);
        };

        let states = self.states.read().await;
        let model_states = self.model_states.read().await;
        let chosen = ids.into_iter().find(|id| {
            if !matches!(states.get(id), Some(CredentialState::Active)) {
                return false;
            }
            let key = (*id, model.to_string());
            match model_states.get(&key) {
                Some((until, _reason)) => *until <= Instant::now(),
                None => true,
            }
        });
        drop(model_states);
        drop(states);

        let Some(id) = chosen else {
            return Err(AcquireError::NoActiveCredentials);
        };
        let cred = self
            .creds
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AcquireError::NoActiveCredentials)?;
        Ok((id, cred))
    }

    pub async fn mark_unavailable(
        &self,
        credential_id: CredentialId,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.states.write().await;
            guard.insert(
                credential_id,
                CredentialState::Unavailable {
                    until: until_instant,
                    reason,
                },
            );
        }
        self.queue.push(until_instant, credential_id).await;

        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::Operational(OperationalEvent::UnavailableStart(
                UnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn mark_model_unavailable(
        &self,
        credential_id: CredentialId,
        model: impl Into<String>,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let model = model.into();
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.model_states.write().await;
            guard.insert((credential_id, model.clone()), (until_instant, reason));
        }
        self.model_queue
            .push(until_instant, credential_id, model.clone())
            .await;

        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::Operational(OperationalEvent::ModelUnavailableStart(
                ModelUnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    model,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn state(&self, credential_id: CredentialId) -> Option<CredentialState> {
        self.states.read().await.get(&credential_id).cloned()
    }

    pub async fn model_states(
        &self,
        credential_id: CredentialId,
    ) -> Vec<(String, Instant, UnavailableReason)> {
        let now = Instant::now();
        let guard = self.model_states.read().await;
        let mut rows = Vec::new();
        for ((id, model), (until, reason)) in guard.iter() {
            if *id != credential_id {
                continue;
            }
            if *until <= now {
                continue;
            }
            rows.push((model.clone(), *until, *reason));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    // ---- §3/§4.5 account-pool selection API ----
    //
    // This block is independent of `acquire`/`acquire_for_model` above: those
    // serve the generic multi-protocol dispatch path (any provider, simple
    // active/inactive gating); this one implements the quota-aware, sticky,
    // cooldown-aware selection algorithm the spec describes for the
    // credential pool fronting a single upstream. `get_next_account` does
    // *not* perform token refresh itself (§4.2/§4.5 step 7's
    // `ensureValidToken` lives in the token-manager layer) — callers that
    // get a refresh failure back from the caller-supplied credential are
    // expected to add that id to `exclude` and call again, which naturally
    // reproduces "on refresh error: if sticky, clear stickiness; continue".

    /// Sets (or clears, on `None`) this account's aggregate quota fraction,
    /// clamped to [0,1] per §3 invariant I3. Called by the quota-sync
    /// component (C3) after reading the upstream model catalog.
    pub async fn set_aggregate_quota(&self, credential_id: CredentialId, fraction: f64) {
        self.aggregate_quota
            .write()
            .await
            .insert(credential_id, fraction.clamp(0.0, 1.0));
    }

    /// Sets this account's per-model quota fraction. Per §3, a missing row
    /// means "unknown" and callers must treat that as 0 for the purposes of
    /// group-keyed selection (never phantom-full) — hence no default here.
    pub async fn set_model_quota(&self, credential_id: CredentialId, model: &str, fraction: f64) {
        self.model_quota
            .write()
            .await
            .insert((credential_id, model.to_string()), fraction.clamp(0.0, 1.0));
    }

    /// Provider's currently `Active` credential ids, for use as
    /// `get_next_account`'s `candidate_ids`.
    pub async fn active_ids_for_provider(&self, provider: &str) -> Vec<CredentialId> {
        let ids = {
            let guard = self.by_provider.read().await;
            guard.get(provider).cloned().unwrap_or_default()
        };
        let states = self.states.read().await;
        ids.into_iter()
            .filter(|id| matches!(states.get(id), Some(CredentialState::Active)))
            .collect()
    }

    async fn quota_remaining(&self, credential_id: CredentialId, key: &SelectionKey, model: &str) -> Option<f64> {
        match key {
            SelectionKey::Group(_) => {
                self.model_quota
                    .read()
                    .await
                    .get(&(credential_id, model.to_string()))
                    .copied()
            }
            SelectionKey::Raw(_) => {
                let model_quota = self.model_quota.read().await;
                if let Some(q) = model_quota.get(&(credential_id, model.to_string())) {
                    return Some(*q);
                }
                drop(model_quota);
                self.aggregate_quota.read().await.get(&credential_id).copied()
            }
        }
    }

    fn cooldown_until_ms(until: Instant) -> u64 {
        until.saturating_duration_since(Instant::now()).as_millis() as u64
    }

    /// §4.5 selection algorithm, steps 1-9 (minus `ensureValidToken`, see
    /// the module doc above). `candidate_ids` are the provider's currently
    /// `Active` credential ids to consider (callers filter by provider via
    /// `by_provider`/their own registry, since this pool is provider-
    /// agnostic at the `creds` layer).
    pub async fn get_next_account(
        &self,
        candidate_ids: &[CredentialId],
        model: &str,
        exclude: &HashSet<CredentialId>,
        thresholds: &GroupThresholds,
        limits: &AccountPoolLimits,
    ) -> Result<(CredentialId, Credential), NextAccountError> {
        let (key, group) = super::selection::resolve_selection(model);
        let key_str = key.as_string();
        let threshold = thresholds.threshold_for(&key);

        if candidate_ids.is_empty() {
            return Err(NextAccountError::NoActiveAccounts);
        }

        // Steps 2-3: load quota, filter to active accounts above threshold.
        let mut eligible: Vec<(CredentialId, f64)> = Vec::new();
        for &id in candidate_ids {
            let Some(q) = self.quota_remaining(id, &key, model).await else {
                continue;
            };
            if q > threshold {
                eligible.push((id, q));
            }
        }
        if eligible.is_empty() {
            let group_label = group.map(|g| g.as_str().to_string()).unwrap_or_else(|| model.to_string());
            return Err(NextAccountError::BelowThreshold {
                group_label,
                retry_after_ms: limits.cooldown_floor.as_millis() as u64,
            });
        }

        // Step 4: sort by quota desc, id asc.
        eligible.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));

        // Step 5: prepend sticky preference if still eligible, else clear it.
        let sticky_id = self.sticky.read().await.get(&key_str).copied();
        if let Some(sticky_id) = sticky_id {
            if let Some(pos) = eligible.iter().position(|(id, _)| *id == sticky_id) {
                let entry = eligible.remove(pos);
                eligible.insert(0, entry);
            } else {
                self.sticky.write().await.remove(&key_str);
            }
        }

        // Step 6: skip excluded / over-concurrency / cooling-down candidates,
        // tracking the earliest cooldown deadline among those *considered*.
        let mut considered_any_cooldown = false;
        let mut earliest_cooldown: Option<Instant> = None;
        let concurrency_limit = limits.max_concurrent_per_account;

        for (id, _q) in &eligible {
            let id = *id;
            if exclude.contains(&id) {
                continue;
            }
            if concurrency_limit > 0 {
                let count = *self.concurrency.read().await.get(&id).unwrap_or(&0);
                if count >= concurrency_limit {
                    continue;
                }
            }
            let cooldown = self.cooldowns.read().await.get(&(id, key_str.clone())).copied();
            if let Some((until, _wall, _count)) = cooldown {
                if until > Instant::now() {
                    considered_any_cooldown = true;
                    earliest_cooldown = Some(match earliest_cooldown {
                        Some(cur) if cur <= until => cur,
                        _ => until,
                    });
                    continue;
                }
            }

            // Step 7 survivor (token refresh is the caller's job).
            if concurrency_limit > 0 {
                *self.concurrency.write().await.entry(id).or_insert(0) += 1;
            }
            self.sticky.write().await.insert(key_str.clone(), id);
            let cred = self.creds.read().await.get(&id).cloned();
            let Some(cred) = cred else {
                // Credential vanished between candidate listing and here; unlock and
                // keep looking would require restructuring this loop as recursion-
                // free iteration, which it already is, so just surface as a miss.
                return Err(NextAccountError::NoAvailableWithValidTokens);
            };
            return Ok((id, cred));
        }

        // Step 8: at least one considered candidate was in cooldown (the
        // §9 open question's "earliestCooldownUntil only among considered
        // candidates" branch) — surface the 429-with-retry-hint case even
        // if other candidates were separately excluded.
        if considered_any_cooldown {
            let retry_after_ms = earliest_cooldown.map(Self::cooldown_until_ms).unwrap_or(0);
            return Err(NextAccountError::AllCooldown { retry_after_ms });
        }

        // Step 9: nothing was in cooldown, but everything was excluded/over-limit.
        Err(NextAccountError::NoAvailableWithValidTokens)
    }

    /// Releases this account's concurrency slot (§4.5 `unlockAccount`).
    pub async fn unlock_account(&self, credential_id: CredentialId) {
        if let Some(count) = self.concurrency.write().await.get_mut(&credential_id) {
            *count = (*count - 1).max(0);
        }
    }

    /// Non-capacity error: increments the error counter, flipping the
    /// account to `error` status once `limits.error_count_to_disable` is
    /// reached (§4.5 "Error counting"). Returns `true` if this call tipped
    /// it over the threshold.
    pub async fn mark_account_error(
        &self,
        credential_id: CredentialId,
        limits: &AccountPoolLimits,
    ) -> bool {
        let count = {
            let mut guard = self.error_counts.write().await;
            let entry = guard.entry(credential_id).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= limits.error_count_to_disable {
            self.mark_unavailable(
                credential_id,
                Duration::from_secs(10 * 365 * 24 * 60 * 60),
                UnavailableReason::Unknown,
            )
            .await;
            true
        } else {
            false
        }
    }

    /// A successful dispatch clears the error counter (§4.5 "Success clears
    /// the counter").
    pub async fn mark_account_success(&self, credential_id: CredentialId) {
        self.error_counts.write().await.insert(credential_id, 0);
    }

    /// Capacity error on `credential_id` for `selection_key`. Per §4.5, a
    /// `ServerCapacityExhausted`-classified message is never cooldown'd
    /// (switching accounts would not help); otherwise applies the
    /// exponential-backoff-with-reset-hint cooldown to exactly this
    /// (account, selection_key) pair.
    pub async fn mark_capacity_limited(
        &self,
        credential_id: CredentialId,
        key: &SelectionKey,
        message: &str,
        limits: &AccountPoolLimits,
    ) -> super::selection::CapacityKind {
        let kind = super::selection::classify_capacity_message(message, None);
        if matches!(kind, super::selection::CapacityKind::ServerCapacityExhausted) {
            return kind;
        }
        let key_str = key.as_string();
        let consecutive = {
            let mut guard = self.cooldowns.write().await;
            let entry_count = guard
                .get(&(credential_id, key_str.clone()))
                .map(|(_, _, c)| *c + 1)
                .unwrap_or(1);
            entry_count
        };
        let duration = super::selection::capacity_cooldown_duration(
            message,
            consecutive,
            limits.cooldown_floor,
            limits.cooldown_ceiling,
        );
        let until = Instant::now() + duration;
        let until_wall = SystemTime::now().checked_add(duration).unwrap_or_else(SystemTime::now);
        self.cooldowns
            .write()
            .await
            .insert((credential_id, key_str), (until, until_wall, consecutive));
        kind
    }

    /// Transitions (account, selection_key) back to idle and zeroes the
    /// consecutive-error counter (§4.5 state machine: "Successful call
    /// transitions to idle and zeroes the consecutive-error counter").
    pub async fn mark_capacity_recovered(&self, credential_id: CredentialId, key: &SelectionKey) {
        self.cooldowns.write().await.remove(&(credential_id, key.as_string()));
    }

    /// Count of candidates that would currently survive steps 2-3 (active +
    /// above threshold), ignoring locks/exclude/cooldown — used by
    /// `getAvailableAccountCount`.
    pub async fn get_available_account_count(
        &self,
        candidate_ids: &[CredentialId],
        model: &str,
        thresholds: &GroupThresholds,
    ) -> usize {
        let (key, _group) = super::selection::resolve_selection(model);
        let threshold = thresholds.threshold_for(&key);
        let mut count = 0;
        for &id in candidate_ids {
            if let Some(q) = self.quota_remaining(id, &key, model).await {
                if q > threshold {
                    count += 1;
                }
            }
        }
        count
    }

    /// A snapshot of sticky routing + in-flight cooldown counts per
    /// selection_key, for the admin `getGroupRoutingOverview` surface.
    pub async fn get_group_routing_overview(&self) -> Vec<RoutingOverviewRow> {
        let sticky = self.sticky.read().await;
        let cooldowns = self.cooldowns.read().await;
        let now = Instant::now();
        let mut rows: HashMap<String, RoutingOverviewRow> = HashMap::new();
        for (key_str, &account_id) in sticky.iter() {
            rows.entry(key_str.clone()).or_insert(RoutingOverviewRow {
                selection_key: key_str.clone(),
                sticky_account_id: Some(account_id),
                candidates: 0,
                in_cooldown: 0,
            });
        }
        for ((_id, key_str), (until, _wall, _count)) in cooldowns.iter() {
            let row = rows.entry(key_str.clone()).or_insert(RoutingOverviewRow {
                selection_key: key_str.clone(),
                sticky_account_id: None,
                candidates: 0,
                in_cooldown: 0,
            });
            if *until > now {
                row.in_cooldown += 1;
            }
        }
        let mut rows: Vec<RoutingOverviewRow> = rows.into_values().collect();
        rows.sort_by(|a, b| a.selection_key.cmp(&b.selection_key));
        rows
    }
}

#[cfg(test)]
mod account_pool_tests {
    use super::*;
    use crate::credential::ApiKeyCredential;
    use crate::credential::selection::GroupThresholds;

    async fn pool_with_accounts(n: i64) -> (CredentialPool, Vec<CredentialId>) {
        let pool = CredentialPool::new(EventHub::new(16));
        let mut ids = Vec::new();
        for i in 0..n {
            let id = i + 1;
            pool.insert(
                "antigravity",
                id,
                Credential::Custom(ApiKeyCredential {
                    api_key: format!("k{id}"),
                }),
            )
            .await;
            ids.push(id);
        }
        (pool, ids)
    }

    #[tokio::test]
    async fn picks_highest_quota_candidate() {
        let (pool, ids) = pool_with_accounts(2).await;
        pool.set_aggregate_quota(ids[0], 0.3).await;
        pool.set_aggregate_quota(ids[1], 0.9).await;

        let (chosen, _) = pool
            .get_next_account(
                &ids,
                "gemini-2.5-flash",
                &HashSet::new(),
                &GroupThresholds::default(),
                &AccountPoolLimits::default(),
            )
            .await
            .expect("an eligible account");
        assert_eq!(chosen, ids[1]);
    }

    #[tokio::test]
    async fn sticky_routing_prefers_previous_account_on_tie() {
        let (pool, ids) = pool_with_accounts(2).await;
        pool.set_aggregate_quota(ids[0], 0.9).await;
        pool.set_aggregate_quota(ids[1], 0.9).await;

        let thresholds = GroupThresholds::default();
        let limits = AccountPoolLimits::default();
        let (first, _) = pool
            .get_next_account(&ids, "gemini-2.5-flash", &HashSet::new(), &thresholds, &limits)
            .await
            .unwrap();
        pool.unlock_account(first).await;

        let (second, _) = pool
            .get_next_account(&ids, "gemini-2.5-flash", &HashSet::new(), &thresholds, &limits)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn below_threshold_returns_429_style_error() {
        let (pool, ids) = pool_with_accounts(1).await;
        pool.set_aggregate_quota(ids[0], 0.1).await;

        let err = pool
            .get_next_account(
                &ids,
                "gemini-2.5-flash",
                &HashSet::new(),
                &GroupThresholds::default(),
                &AccountPoolLimits::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NextAccountError::BelowThreshold { .. }));
        assert_eq!(err.upstream_status(), Some(429));
    }

    #[tokio::test]
    async fn capacity_cooldown_excludes_account_until_expiry() {
        let (pool, ids) = pool_with_accounts(1).await;
        pool.set_aggregate_quota(ids[0], 0.9).await;
        let (key, _group) = super::super::selection::resolve_selection("gemini-2.5-flash");
        let limits = AccountPoolLimits {
            cooldown_floor: Duration::from_millis(50),
            ..AccountPoolLimits::default()
        };
        pool.mark_capacity_limited(ids[0], &key, "Resource has been exhausted", &limits)
            .await;

        let err = pool
            .get_next_account(&ids, "gemini-2.5-flash", &HashSet::new(), &GroupThresholds::default(), &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, NextAccountError::AllCooldown { .. }));

        pool.mark_capacity_recovered(ids[0], &key).await;
        let (chosen, _) = pool
            .get_next_account(&ids, "gemini-2.5-flash", &HashSet::new(), &GroupThresholds::default(), &limits)
            .await
            .unwrap();
        assert_eq!(chosen, ids[0]);
    }

    #[tokio::test]
    async fn server_capacity_exhausted_is_never_cooled_down() {
        let (pool, ids) = pool_with_accounts(1).await;
        pool.set_aggregate_quota(ids[0], 0.9).await;
        let (key, _group) = super::super::selection::resolve_selection("gemini-2.5-flash");
        let limits = AccountPoolLimits::default();
        pool.mark_capacity_limited(ids[0], &key, "Server capacity exhausted", &limits)
            .await;

        let (chosen, _) = pool
            .get_next_account(&ids, "gemini-2.5-flash", &HashSet::new(), &GroupThresholds::default(), &limits)
            .await
            .unwrap();
        assert_eq!(chosen, ids[0]);
    }

    #[tokio::test]
    async fn error_threshold_disables_account() {
        let (pool, ids) = pool_with_accounts(1).await;
        let limits = AccountPoolLimits {
            error_count_to_disable: 2,
            ..AccountPoolLimits::default()
        };
        assert!(!pool.mark_account_error(ids[0], &limits).await);
        assert!(pool.mark_account_error(ids[0], &limits).await);
        let state = pool.state(ids[0]).await.unwrap();
        assert!(matches!(state, CredentialState::Unavailable { .. }));
    }

    #[tokio::test]
    async fn concurrency_limit_skips_locked_accounts() {
        let (pool, ids) = pool_with_accounts(1).await;
        pool.set_aggregate_quota(ids[0], 0.9).await;
        let limits = AccountPoolLimits {
            max_concurrent_per_account: 1,
            ..AccountPoolLimits::default()
        };
        let thresholds = GroupThresholds::default();
        let (chosen, _) = pool
            .get_next_account(&ids, "gemini-2.5-flash", &HashSet::new(), &thresholds, &limits)
            .await
            .unwrap();
        assert_eq!(chosen, ids[0]);

        let err = pool
            .get_next_account(&ids, "gemini-2.5-flash", &HashSet::new(), &thresholds, &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, NextAccountError::NoAvailableWithValidTokens));

        pool.unlock_account(ids[0]).await;
        let (chosen_again, _) = pool
            .get_next_account(&ids, "gemini-2.5-flash", &HashSet::new(), &thresholds, &limits)
            .await
            .unwrap();
        assert_eq!(chosen_again, ids[0]);
    }
}
