//! Durable queue interfaces.
//!
//! - [`JobRecord`] - the row the outbox writes inside the mutation's transaction
//! - [`JobStore`] - claiming and finalizing queued jobs
//! - [`ClaimedJob`] - a job leased by a worker
//! - [`FailureKind`] - retry classification
//! - [`DeserializationError`] - why a job could not become an envelope
//!
//! Every envelope becomes one record of kind [`DISPATCH_JOB_KIND`]; the
//! dispatch worker is the only consumer of that kind. Retry backoff and
//! dead-lettering are the store's business.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::payload::Envelope;

/// Job kind of every dispatch record.
pub const DISPATCH_JOB_KIND: &str = "mutation-dispatch";

/// Attempts before a failing job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 25;

/// Longest delay between retries.
pub const MAX_RETRY_DELAY_SECS: i64 = 3600;

/// A job ready to be written to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    pub args: Value,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build the dispatch record for `envelope` on `queue`.
    pub fn dispatch(envelope: &Envelope, queue: impl Into<String>) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::now_v7(),
            kind: DISPATCH_JOB_KIND.to_string(),
            queue: queue.into(),
            args: envelope.to_args()?,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: Utc::now(),
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Trait for claiming jobs from a persistent store.
///
/// The store decides what "ready" means (scheduling, retry delay, lease
/// expiry). Workers stay dumb and poll.
///
/// # Implementer Notes
///
/// - Claim atomically (`FOR UPDATE SKIP LOCKED` on PostgreSQL)
/// - Increment the attempt counter on claim
/// - Set a lease so a crashed worker's jobs become claimable again
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim up to `limit` ready jobs on `queue`.
    async fn claim_ready(&self, worker_id: &str, queue: &str, limit: i64) -> Result<Vec<ClaimedJob>>;

    /// Complete a job `worker_id` still holds.
    ///
    /// This and the other lease-scoped methods return `Ok(false)` when the
    /// job is no longer running under `worker_id` (the lease expired and
    /// another worker re-claimed it, or it was already finalized). The job
    /// is left untouched in that case.
    async fn mark_succeeded(&self, job_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Record a failure.
    ///
    /// Retryable failures with attempts left are rescheduled after
    /// [`retry_delay`]; everything else is dead-lettered.
    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        kind: FailureKind,
    ) -> Result<bool>;

    /// Extend the lease of a running job.
    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool>;
}

/// Classification of job failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Failure may be transient (listener error, timeout).
    Retryable,

    /// Failure is permanent (undecodable payload, unknown kind).
    NonRetryable,
}

/// A job leased by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    pub args: Value,
    /// 1-based attempt number of this execution.
    pub attempt: i32,
    pub max_attempts: i32,
}

impl ClaimedJob {
    /// Decode the envelope this job carries.
    pub fn envelope(&self) -> Result<Envelope, DeserializationError> {
        if self.kind != DISPATCH_JOB_KIND {
            return Err(DeserializationError::UnknownJobKind(self.kind.clone()));
        }
        Envelope::from_args(&self.args).map_err(DeserializationError::InvalidPayload)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A queued job that cannot be dispatched. Never retryable.
#[derive(Debug, thiserror::Error)]
pub enum DeserializationError {
    /// The job is not a dispatch job.
    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    /// The args do not decode into an envelope.
    #[error("invalid envelope payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

impl DeserializationError {
    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::NonRetryable
    }
}

/// Exponential backoff for the `attempt`-th failure, capped at one hour.
pub fn retry_delay(attempt: i32) -> chrono::Duration {
    let exponent = attempt.clamp(0, 12) as u32;
    chrono::Duration::seconds(2i64.pow(exponent).min(MAX_RETRY_DELAY_SECS))
}
