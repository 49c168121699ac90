use super::backoff::exponential_delay;
use super::conflict::{ConflictPolicies, ConflictPolicy};
use super::metrics::{MutationMetrics, MutationMetricsSnapshot};
use crate::application::ports::RemoteMutator;
use crate::domain::entities::{
    MutationAction, MutationEvent, MutationOutcome, MutationPhase, PendingKey, PendingMutation,
};
use crate::domain::value_objects::{CollectionName, EntityId, RecordPayload};
use crate::shared::AppError;
use crate::shared::config::MutationConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MutationSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Upper bound for a single remote call. `None` leaves attempts unbounded
    /// and the retry cap is the only limit.
    pub attempt_timeout: Option<Duration>,
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1_000),
            attempt_timeout: None,
        }
    }
}

impl From<&MutationConfig> for MutationSettings {
    fn from(config: &MutationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            attempt_timeout: config.attempt_timeout(),
        }
    }
}

struct PendingEntry {
    mutation: PendingMutation,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ManagerState {
    pending: HashMap<PendingKey, PendingEntry>,
    // One gate per id keeps remote calls for the same id strictly sequential.
    gates: HashMap<PendingKey, Arc<AsyncMutex<()>>>,
    next_generation: u64,
}

enum FailureStep {
    Stale,
    Retry { retry_count: u32, delay: Duration },
    Exhausted { attempts: u32, retry_count: u32 },
}

type AttemptResult = Result<(RecordPayload, Option<EntityId>), AppError>;

/// Owns every in-flight local mutation of a session, keyed by
/// `(collection, id)`, and drives each one against the remote store with
/// capped exponential backoff.
///
/// A second intent for an id that is still pending replaces the first one:
/// the earlier mutation settles as `Superseded`, its scheduled retry is
/// cancelled and the result of a call already in flight is discarded. The new
/// intent only reaches the store after that call has returned.
pub struct OptimisticUpdateManager {
    mutator: Arc<dyn RemoteMutator>,
    settings: MutationSettings,
    policies: RwLock<ConflictPolicies>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<MutationEvent>,
    outcome_sinks: Mutex<Vec<mpsc::UnboundedSender<MutationEvent>>>,
    metrics: MutationMetrics,
}

impl OptimisticUpdateManager {
    pub fn new(
        mutator: Arc<dyn RemoteMutator>,
        settings: MutationSettings,
        default_policy: ConflictPolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            mutator,
            settings,
            policies: RwLock::new(ConflictPolicies::new(default_policy)),
            state: Mutex::new(ManagerState::default()),
            events,
            outcome_sinks: Mutex::new(Vec::new()),
            metrics: MutationMetrics::new(),
        })
    }

    pub fn from_config(mutator: Arc<dyn RemoteMutator>, config: &MutationConfig) -> Arc<Self> {
        Self::new(
            mutator,
            MutationSettings::from(config),
            ConflictPolicy::from(config.conflict_policy),
        )
    }

    pub fn settings(&self) -> &MutationSettings {
        &self.settings
    }

    /// Every lifecycle event. A slow receiver may lag and miss some; use
    /// [`Self::subscribe_outcomes`] where each settled mutation must be seen.
    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.events.subscribe()
    }

    /// Only `Settled` events, delivered without loss in settle order.
    pub fn subscribe_outcomes(&self) -> mpsc::UnboundedReceiver<MutationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outcome_sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Registers the mutation and dispatches it in the background. The
    /// pending set is updated before this returns, so the optimistic value is
    /// visible on the very next read.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn apply_update(
        self: &Arc<Self>,
        collection: &CollectionName,
        id: EntityId,
        action: MutationAction,
        payload: RecordPayload,
        original_snapshot: Option<RecordPayload>,
    ) {
        let key = PendingKey::new(collection.clone(), id);
        let cancel = CancellationToken::new();

        let (generation, gate, superseded) = {
            let mut state = self.lock_state();
            state.next_generation += 1;
            let generation = state.next_generation;

            let mutation = PendingMutation::new(key.clone(), action, payload, original_snapshot);
            let previous = state.pending.insert(
                key.clone(),
                PendingEntry {
                    mutation,
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = &previous {
                previous.cancel.cancel();
            }

            let gate = state
                .gates
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone();

            (generation, gate, previous.map(|entry| entry.mutation.action))
        };

        if let Some(previous_action) = superseded {
            debug!(
                target: "optimistic::manager",
                key = %key,
                previous = %previous_action,
                "pending mutation superseded by a newer intent"
            );
            self.publish(MutationEvent::Settled {
                key: key.clone(),
                action: previous_action,
                outcome: MutationOutcome::Superseded,
            });
        }

        debug!(target: "optimistic::manager", key = %key, action = %action, "optimistic update applied");
        self.publish(MutationEvent::Applied {
            key: key.clone(),
            action,
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drive(key, generation, cancel, gate).await;
        });
    }

    pub fn is_pending(&self, key: &PendingKey) -> bool {
        self.lock_state().pending.contains_key(key)
    }

    /// Copy of the whole pending set; later changes are not reflected.
    pub fn pending_updates(&self) -> HashMap<PendingKey, PendingMutation> {
        self.lock_state()
            .pending
            .iter()
            .map(|(key, entry)| (key.clone(), entry.mutation.clone()))
            .collect()
    }

    pub fn pending_for(&self, collection: &CollectionName) -> HashMap<EntityId, PendingMutation> {
        self.lock_state()
            .pending
            .iter()
            .filter(|(key, _)| &key.collection == collection)
            .map(|(key, entry)| (key.id.clone(), entry.mutation.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Drops the pending entry and any scheduled retry without reporting
    /// success or failure. A call already in flight is not aborted; its result
    /// is discarded when it arrives.
    pub fn cancel_update(&self, key: &PendingKey) -> bool {
        let removed = self.lock_state().pending.remove(key);
        match removed {
            Some(entry) => {
                self.finish_cancelled(key.clone(), entry);
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&self) -> usize {
        let drained: Vec<(PendingKey, PendingEntry)> =
            self.lock_state().pending.drain().collect();
        let count = drained.len();
        for (key, entry) in drained {
            self.finish_cancelled(key, entry);
        }
        count
    }

    pub fn clear_collection(&self, collection: &CollectionName) -> usize {
        let drained: Vec<(PendingKey, PendingEntry)> = {
            let mut state = self.lock_state();
            let keys: Vec<PendingKey> = state
                .pending
                .keys()
                .filter(|key| &key.collection == collection)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| state.pending.remove(&key).map(|entry| (key, entry)))
                .collect()
        };
        let count = drained.len();
        for (key, entry) in drained {
            self.finish_cancelled(key, entry);
        }
        count
    }

    pub fn resolve_conflict(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        server: &RecordPayload,
        client: &RecordPayload,
    ) -> RecordPayload {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        policies.policy_for(collection).resolve(id, server, client)
    }

    pub fn set_conflict_policy(&self, policy: ConflictPolicy) {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_default(policy);
    }

    pub fn set_collection_policy(&self, collection: CollectionName, policy: ConflictPolicy) {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_override(collection, policy);
    }

    pub fn metrics(&self) -> MutationMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn drive(
        self: Arc<Self>,
        key: PendingKey,
        generation: u64,
        cancel: CancellationToken,
        gate: Arc<AsyncMutex<()>>,
    ) {
        loop {
            let (action, result) = {
                let _turn = gate.lock().await;
                // Cancelled or replaced while the previous call for this id ran.
                let Some((action, payload)) = self.begin_attempt(&key, generation) else {
                    break;
                };
                self.metrics.record_attempt();
                (action, self.invoke(&key, action, payload).await)
            };

            match result {
                Ok((result, server_id)) => {
                    self.complete(&key, generation, action, result, server_id);
                    break;
                }
                Err(err) => match self.register_failure(&key, generation) {
                    FailureStep::Stale => {
                        debug!(
                            target: "optimistic::manager",
                            key = %key,
                            error = %err,
                            "discarding failure of a cancelled or superseded mutation"
                        );
                        break;
                    }
                    FailureStep::Retry { retry_count, delay } => {
                        let message = err.to_string();
                        warn!(
                            target: "optimistic::manager",
                            key = %key,
                            action = %action,
                            retry_count,
                            backoff_ms = delay.as_millis() as u64,
                            error = %message,
                            "remote mutation failed, retry scheduled"
                        );
                        self.metrics
                            .record_retry(&key, action, retry_count, delay, &message);
                        self.publish(MutationEvent::RetryScheduled {
                            key: key.clone(),
                            action,
                            retry_count,
                            delay,
                            error: message,
                        });

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    FailureStep::Exhausted {
                        attempts,
                        retry_count,
                    } => {
                        let message = err.to_string();
                        error!(
                            target: "optimistic::manager",
                            key = %key,
                            action = %action,
                            attempts,
                            error = %message,
                            "remote mutation abandoned after exhausting retries"
                        );
                        self.metrics
                            .record_abandoned(&key, action, retry_count, &message);
                        self.publish(MutationEvent::Settled {
                            key: key.clone(),
                            action,
                            outcome: MutationOutcome::Failed {
                                error: message,
                                attempts,
                            },
                        });
                        break;
                    }
                },
            }
        }

        drop(gate);
        self.release_gate(&key);
    }

    fn begin_attempt(
        &self,
        key: &PendingKey,
        generation: u64,
    ) -> Option<(MutationAction, RecordPayload)> {
        let mut state = self.lock_state();
        let entry = state
            .pending
            .get_mut(key)
            .filter(|entry| entry.generation == generation)?;
        entry.mutation.phase = MutationPhase::InFlight;
        Some((entry.mutation.action, entry.mutation.payload.clone()))
    }

    async fn invoke(
        &self,
        key: &PendingKey,
        action: MutationAction,
        payload: RecordPayload,
    ) -> AttemptResult {
        let call = self.call_remote(key, action, payload);
        match self.settings.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                AppError::Timeout(format!(
                    "{action} {key} exceeded {}ms",
                    limit.as_millis()
                ))
            })?,
            None => call.await,
        }
    }

    async fn call_remote(
        &self,
        key: &PendingKey,
        action: MutationAction,
        payload: RecordPayload,
    ) -> AttemptResult {
        match action {
            MutationAction::Create => {
                let stored = self
                    .mutator
                    .create(&key.collection, payload.clone())
                    .await?;
                let server_id = stored.id.clone();
                Ok((payload.overlay(&stored.to_record()), Some(server_id)))
            }
            MutationAction::Update => {
                self.mutator
                    .update(&key.collection, &key.id, payload.clone())
                    .await?;
                Ok((payload, None))
            }
            MutationAction::Delete => {
                self.mutator.delete(&key.collection, &key.id).await?;
                Ok((payload, None))
            }
        }
    }

    fn complete(
        &self,
        key: &PendingKey,
        generation: u64,
        action: MutationAction,
        result: RecordPayload,
        server_id: Option<EntityId>,
    ) {
        let settled = {
            let mut state = self.lock_state();
            let current = state
                .pending
                .get(key)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                state.pending.remove(key)
            } else {
                None
            }
        };

        let Some(entry) = settled else {
            debug!(
                target: "optimistic::manager",
                key = %key,
                "discarding result of a cancelled or superseded mutation"
            );
            return;
        };

        info!(
            target: "optimistic::manager",
            key = %key,
            action = %action,
            attempts = entry.mutation.attempts(),
            "remote mutation confirmed"
        );
        self.metrics
            .record_confirmed(key, action, entry.mutation.retry_count);
        self.publish(MutationEvent::Settled {
            key: key.clone(),
            action,
            outcome: MutationOutcome::Succeeded { result, server_id },
        });
    }

    fn register_failure(&self, key: &PendingKey, generation: u64) -> FailureStep {
        let mut state = self.lock_state();
        let Some(entry) = state
            .pending
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
        else {
            return FailureStep::Stale;
        };

        if entry.mutation.retry_count < self.settings.max_retries {
            entry.mutation.retry_count += 1;
            entry.mutation.phase = MutationPhase::AwaitingRetry;
            let retry_count = entry.mutation.retry_count;
            return FailureStep::Retry {
                retry_count,
                delay: exponential_delay(self.settings.retry_delay, retry_count),
            };
        }

        let attempts = entry.mutation.attempts();
        let retry_count = entry.mutation.retry_count;
        state.pending.remove(key);
        FailureStep::Exhausted {
            attempts,
            retry_count,
        }
    }

    fn finish_cancelled(&self, key: PendingKey, entry: PendingEntry) {
        entry.cancel.cancel();
        self.metrics.record_cancelled();
        debug!(target: "optimistic::manager", key = %key, "pending mutation cancelled");
        self.publish(MutationEvent::Settled {
            key,
            action: entry.mutation.action,
            outcome: MutationOutcome::Cancelled,
        });
    }

    fn release_gate(&self, key: &PendingKey) {
        let mut state = self.lock_state();
        let idle = state
            .gates
            .get(key)
            .is_some_and(|gate| Arc::strong_count(gate) == 1);
        if idle {
            state.gates.remove(key);
        }
    }

    fn publish(&self, event: MutationEvent) {
        if matches!(event, MutationEvent::Settled { .. }) {
            let mut sinks = self
                .outcome_sinks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            sinks.retain(|sink| sink.send(event.clone()).is_ok());
        }
        // No receivers is fine; the pending set is the source of truth.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
