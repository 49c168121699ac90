use crate::domain::entities::{MutationAction, PendingKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcomeStatus {
    Confirmed,
    Retrying,
    Abandoned,
}

/// The latest attempt that reached a verdict.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastAttempt {
    pub key: String,
    pub action: MutationAction,
    pub outcome: AttemptOutcomeStatus,
    pub retry_count: u32,
    pub backoff_ms: Option<u64>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MutationMetricsSnapshot {
    pub total_attempts: u64,
    pub total_confirmed: u64,
    pub total_abandoned: u64,
    pub total_retries: u64,
    pub total_cancelled: u64,
    /// Failed attempts since the last confirmation, across every id.
    pub failure_streak: u64,
    pub last_confirmed_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_attempt: Option<LastAttempt>,
}

#[derive(Default)]
struct Timeline {
    last_confirmed_at: Option<DateTime<Utc>>,
    last_failed_at: Option<DateTime<Utc>>,
    last_attempt: Option<LastAttempt>,
}

/// Counters for one manager instance.
#[derive(Default)]
pub struct MutationMetrics {
    attempts: AtomicU64,
    confirmed: AtomicU64,
    abandoned: AtomicU64,
    retries: AtomicU64,
    cancelled: AtomicU64,
    failure_streak: AtomicU64,
    timeline: Mutex<Timeline>,
}

impl MutationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_confirmed(&self, key: &PendingKey, action: MutationAction, retry_count: u32) {
        self.confirmed.fetch_add(1, Ordering::Relaxed);
        self.failure_streak.store(0, Ordering::Relaxed);

        let attempt = LastAttempt {
            key: key.to_string(),
            action,
            outcome: AttemptOutcomeStatus::Confirmed,
            retry_count,
            backoff_ms: None,
            error: None,
            at: Utc::now(),
        };
        let mut timeline = self.lock_timeline();
        timeline.last_confirmed_at = Some(attempt.at);
        timeline.last_attempt = Some(attempt);
    }

    pub fn record_retry(
        &self,
        key: &PendingKey,
        action: MutationAction,
        retry_count: u32,
        backoff: Duration,
        error: &str,
    ) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.note_failure(LastAttempt {
            key: key.to_string(),
            action,
            outcome: AttemptOutcomeStatus::Retrying,
            retry_count,
            backoff_ms: Some(backoff.as_millis() as u64),
            error: Some(error.to_string()),
            at: Utc::now(),
        });
    }

    pub fn record_abandoned(
        &self,
        key: &PendingKey,
        action: MutationAction,
        retry_count: u32,
        error: &str,
    ) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        self.note_failure(LastAttempt {
            key: key.to_string(),
            action,
            outcome: AttemptOutcomeStatus::Abandoned,
            retry_count,
            backoff_ms: None,
            error: Some(error.to_string()),
            at: Utc::now(),
        });
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MutationMetricsSnapshot {
        let timeline = self.lock_timeline();
        MutationMetricsSnapshot {
            total_attempts: self.attempts.load(Ordering::Relaxed),
            total_confirmed: self.confirmed.load(Ordering::Relaxed),
            total_abandoned: self.abandoned.load(Ordering::Relaxed),
            total_retries: self.retries.load(Ordering::Relaxed),
            total_cancelled: self.cancelled.load(Ordering::Relaxed),
            failure_streak: self.failure_streak.load(Ordering::Relaxed),
            last_confirmed_at: timeline.last_confirmed_at,
            last_failed_at: timeline.last_failed_at,
            last_attempt: timeline.last_attempt.clone(),
        }
    }

    fn note_failure(&self, attempt: LastAttempt) {
        self.failure_streak.fetch_add(1, Ordering::Relaxed);
        let mut timeline = self.lock_timeline();
        timeline.last_failed_at = Some(attempt.at);
        timeline.last_attempt = Some(attempt);
    }

    fn lock_timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
