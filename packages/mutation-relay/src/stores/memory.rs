//! In-memory transactional store for tests, local development and the
//! `in_memory` dispatch mode.
//!
//! Entity writes and outbox records are staged on a [`MemoryTransaction`] and
//! become visible together on [`MemoryTransaction::commit`]. Dropping or
//! rolling back the transaction discards both.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::extract::EntitySnapshot;
use crate::job::{retry_delay, ClaimedJob, FailureKind, JobRecord, JobStore};
use crate::outbox::OutboxWriter;

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Available,
    Running,
    Retryable,
    Completed,
    /// Dead-lettered.
    Discarded,
}

/// A job as stored, with its bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredJob {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    pub args: Value,
    pub state: JobState,
    pub attempt: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub errors: Vec<String>,
    /// When the job reached `Completed` or `Discarded`.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl StoredJob {
    fn from_record(record: JobRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            queue: record.queue,
            args: record.args,
            state: JobState::Available,
            attempt: 0,
            max_attempts: record.max_attempts,
            scheduled_at: record.scheduled_at,
            lease_expires_at: None,
            worker_id: None,
            errors: Vec::new(),
            finalized_at: None,
        }
    }

    fn is_claimable(&self, queue: &str, now: DateTime<Utc>) -> bool {
        if self.queue != queue {
            return false;
        }
        match self.state {
            JobState::Available | JobState::Retryable => self.scheduled_at <= now,
            JobState::Running => self.lease_expires_at.is_some_and(|lease| lease < now),
            JobState::Completed | JobState::Discarded => false,
        }
    }

    /// Whether a worker still has something to do with this job.
    fn is_outstanding(&self) -> bool {
        matches!(
            self.state,
            JobState::Available | JobState::Running | JobState::Retryable
        )
    }

    /// Whether `worker_id` still holds the lease on this job.
    fn is_held_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Running && self.worker_id.as_deref() == Some(worker_id)
    }

    fn finalize(&mut self, state: JobState) {
        self.state = state;
        self.lease_expires_at = None;
        self.finalized_at = Some(Utc::now());
    }
}

/// Finalized jobs kept for inspection before the oldest are pruned.
pub const DEFAULT_FINALIZED_RETENTION: usize = 1_000;

#[derive(Default)]
struct MemoryState {
    entities: HashMap<(String, String), EntitySnapshot>,
    jobs: Vec<StoredJob>,
}

/// Shared in-memory database. Clones share state.
///
/// Completed and discarded jobs are kept up to a retention cap, after which
/// the oldest finalized jobs are dropped. Outstanding jobs are never pruned.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    lease: chrono::Duration,
    finalized_retention: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            lease: chrono::Duration::seconds(60),
            finalized_retention: DEFAULT_FINALIZED_RETENTION,
        }
    }

    /// Use a custom lease for claimed jobs.
    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Keep at most `max` completed or discarded jobs.
    pub fn with_finalized_retention(mut self, max: usize) -> Self {
        self.finalized_retention = max;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("memory store lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("memory store lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Start a transaction.
    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            store: self.clone(),
            entities: Vec::new(),
            jobs: Vec::new(),
            fail_enqueue: false,
        }
    }

    /// Committed state of an entity.
    pub fn entity(&self, entity_type: &str, id: &str) -> Option<EntitySnapshot> {
        self.read()
            .entities
            .get(&(entity_type.to_string(), id.to_string()))
            .cloned()
    }

    pub fn jobs(&self) -> Vec<StoredJob> {
        self.read().jobs.clone()
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<StoredJob> {
        self.read()
            .jobs
            .iter()
            .filter(|job| job.state == state)
            .cloned()
            .collect()
    }

    pub fn job(&self, id: Uuid) -> Option<StoredJob> {
        self.read().jobs.iter().find(|job| job.id == id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.read().jobs.len()
    }

    /// Jobs that still need a worker (available, running or awaiting retry).
    pub fn outstanding_count(&self) -> usize {
        self.read()
            .jobs
            .iter()
            .filter(|job| job.is_outstanding())
            .count()
    }

    /// Make every retryable job due now, skipping its backoff.
    pub fn expedite_retries(&self) {
        let now = Utc::now();
        for job in self.write().jobs.iter_mut() {
            if job.state == JobState::Retryable {
                job.scheduled_at = now;
            }
        }
    }

    /// Wait until no job is outstanding.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let outstanding = self.outstanding_count();
            if outstanding == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("{} jobs still outstanding after {:?}", outstanding, timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn apply(&self, entities: Vec<((String, String), EntitySnapshot)>, jobs: Vec<JobRecord>) {
        let mut state = self.write();
        for (key, snapshot) in entities {
            state.entities.insert(key, snapshot);
        }
        state
            .jobs
            .extend(jobs.into_iter().map(StoredJob::from_record));
    }

    /// Apply `f` to a job `worker_id` still holds.
    ///
    /// Returns `false` without touching the job when the lease was lost,
    /// i.e. the job was re-claimed by another worker or already finalized.
    fn update_held_job<F>(&self, job_id: Uuid, worker_id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut StoredJob),
    {
        let mut state = self.write();
        let job = state
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| anyhow::anyhow!("job {} not found", job_id))?;
        if !job.is_held_by(worker_id) {
            return Ok(false);
        }
        f(job);
        Self::prune_finalized(&mut state.jobs, self.finalized_retention);
        Ok(true)
    }

    fn prune_finalized(jobs: &mut Vec<StoredJob>, retention: usize) {
        let mut finalized: Vec<DateTime<Utc>> =
            jobs.iter().filter_map(|job| job.finalized_at).collect();
        if finalized.len() <= retention {
            return;
        }
        let excess = finalized.len() - retention;
        finalized.sort_unstable();
        let cutoff = finalized[excess - 1];

        let mut dropped = 0;
        jobs.retain(|job| match job.finalized_at {
            Some(at) if dropped < excess && at <= cutoff => {
                dropped += 1;
                false
            }
            _ => true,
        });
        debug!(dropped, retention, "pruned finalized jobs");
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("MemoryStore")
            .field("entities", &state.entities.len())
            .field("jobs", &state.jobs.len())
            .finish()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn claim_ready(&self, worker_id: &str, queue: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let lease = self.lease;
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut state = self.write();
        let claimed: Vec<ClaimedJob> = state
            .jobs
            .iter_mut()
            .filter(|job| job.is_claimable(queue, now))
            .take(limit)
            .map(|job| {
                job.state = JobState::Running;
                job.attempt += 1;
                job.lease_expires_at = Some(now + lease);
                job.worker_id = Some(worker_id.to_string());
                ClaimedJob {
                    id: job.id,
                    kind: job.kind.clone(),
                    queue: job.queue.clone(),
                    args: job.args.clone(),
                    attempt: job.attempt,
                    max_attempts: job.max_attempts,
                }
            })
            .collect();

        Ok(claimed)
    }

    async fn mark_succeeded(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        self.update_held_job(job_id, worker_id, |job| job.finalize(JobState::Completed))
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        kind: FailureKind,
    ) -> Result<bool> {
        self.update_held_job(job_id, worker_id, |job| {
            job.errors.push(error.to_string());
            if kind == FailureKind::Retryable && job.attempt < job.max_attempts {
                job.state = JobState::Retryable;
                job.lease_expires_at = None;
                job.scheduled_at = Utc::now() + retry_delay(job.attempt);
            } else {
                debug!(job_id = %job.id, attempt = job.attempt, "job discarded");
                job.finalize(JobState::Discarded);
            }
        })
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let lease = self.lease;
        self.update_held_job(job_id, worker_id, |job| {
            job.lease_expires_at = Some(Utc::now() + lease);
        })
    }
}

/// Staged writes against a [`MemoryStore`].
pub struct MemoryTransaction {
    store: MemoryStore,
    entities: Vec<((String, String), EntitySnapshot)>,
    jobs: Vec<JobRecord>,
    fail_enqueue: bool,
}

impl MemoryTransaction {
    /// Stage an entity write.
    pub fn put_entity(&mut self, entity_type: &str, id: &str, snapshot: EntitySnapshot) {
        self.entities
            .push(((entity_type.to_string(), id.to_string()), snapshot));
    }

    /// Entity as seen inside this transaction (staged writes first).
    pub fn entity(&self, entity_type: &str, id: &str) -> Option<EntitySnapshot> {
        self.entities
            .iter()
            .rev()
            .find(|((t, i), _)| t == entity_type && i == id)
            .map(|(_, snapshot)| snapshot.clone())
            .or_else(|| self.store.entity(entity_type, id))
    }

    /// Make every subsequent outbox write fail.
    pub fn fail_enqueue(&mut self) {
        self.fail_enqueue = true;
    }

    pub fn staged_jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    /// Apply staged writes atomically.
    pub fn commit(self) {
        debug!(
            entities = self.entities.len(),
            jobs = self.jobs.len(),
            "memory transaction committed"
        );
        self.store.apply(self.entities, self.jobs);
    }

    /// Discard staged writes.
    pub fn rollback(self) {
        debug!(
            entities = self.entities.len(),
            jobs = self.jobs.len(),
            "memory transaction rolled back"
        );
    }
}

#[async_trait]
impl OutboxWriter for MemoryTransaction {
    async fn enqueue(&mut self, record: JobRecord) -> Result<()> {
        if self.fail_enqueue {
            anyhow::bail!("outbox table unavailable");
        }
        self.jobs.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Operation, TopicName};
    use crate::payload::{Envelope, MutationPayload};
    use serde_json::json;

    fn record(queue: &str) -> JobRecord {
        let envelope = Envelope::new(
            TopicName::for_entity("Control"),
            MutationPayload::new("Control", Operation::Create).with_entity_id("c-1"),
        );
        JobRecord::dispatch(&envelope, queue).unwrap().with_max_attempts(2)
    }

    #[tokio::test]
    async fn test_commit_publishes_entities_and_jobs_together() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.put_entity("Control", "c-1", EntitySnapshot::new().with("status", json!("DRAFT")));
        tx.enqueue(record("events")).await.unwrap();

        assert_eq!(store.job_count(), 0);
        assert!(store.entity("Control", "c-1").is_none());
        assert!(tx.entity("Control", "c-1").is_some());

        tx.commit();
        assert_eq!(store.job_count(), 1);
        assert!(store.entity("Control", "c-1").is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.put_entity("Control", "c-1", EntitySnapshot::new());
        tx.enqueue(record("events")).await.unwrap();
        tx.rollback();

        assert_eq!(store.job_count(), 0);
        assert!(store.entity("Control", "c-1").is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_queue_and_increments_attempt() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.enqueue(record("events")).await.unwrap();
        tx.enqueue(record("workflow")).await.unwrap();
        tx.commit();

        let claimed = store.claim_ready("w1", "events", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].queue, "events");

        // Running jobs are not claimable until the lease expires.
        assert!(store.claim_ready("w2", "events", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_discard() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.enqueue(record("events")).await.unwrap();
        tx.commit();

        let job = store.claim_ready("w1", "events", 1).await.unwrap().remove(0);
        store
            .mark_failed(job.id, "w1", "listener failed", FailureKind::Retryable)
            .await
            .unwrap();
        assert_eq!(store.job(job.id).unwrap().state, JobState::Retryable);

        // Backoff holds the job back until expedited.
        assert!(store.claim_ready("w1", "events", 1).await.unwrap().is_empty());
        store.expedite_retries();

        let job = store.claim_ready("w1", "events", 1).await.unwrap().remove(0);
        assert_eq!(job.attempt, 2);
        store
            .mark_failed(job.id, "w1", "listener failed again", FailureKind::Retryable)
            .await
            .unwrap();

        let stored = store.job(job.id).unwrap();
        assert_eq!(stored.state, JobState::Discarded);
        assert_eq!(stored.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_discards_immediately() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.enqueue(record("events")).await.unwrap();
        tx.commit();

        let job = store.claim_ready("w1", "events", 1).await.unwrap().remove(0);
        store
            .mark_failed(job.id, "w1", "bad payload", FailureKind::NonRetryable)
            .await
            .unwrap();
        assert_eq!(store.jobs_in_state(JobState::Discarded).len(), 1);
        assert_eq!(store.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = MemoryStore::new().with_lease(chrono::Duration::milliseconds(-1));
        let mut tx = store.begin();
        tx.enqueue(record("events")).await.unwrap();
        tx.commit();

        let first = store.claim_ready("w1", "events", 1).await.unwrap();
        let second = store.claim_ready("w2", "events", 1).await.unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_finalize_reclaimed_job() {
        let store = MemoryStore::new().with_lease(chrono::Duration::milliseconds(-1));
        let mut tx = store.begin();
        tx.enqueue(record("events")).await.unwrap();
        tx.commit();

        let stale = store.claim_ready("w1", "events", 1).await.unwrap().remove(0);
        let fresh = store.claim_ready("w2", "events", 1).await.unwrap().remove(0);
        assert_eq!(stale.id, fresh.id);

        assert!(!store.heartbeat(stale.id, "w1").await.unwrap());
        assert!(!store
            .mark_failed(stale.id, "w1", "lease expired", FailureKind::Retryable)
            .await
            .unwrap());
        let stored = store.job(stale.id).unwrap();
        assert_eq!(stored.state, JobState::Running);
        assert_eq!(stored.worker_id.as_deref(), Some("w2"));
        assert!(stored.errors.is_empty());

        assert!(store.mark_succeeded(fresh.id, "w2").await.unwrap());
        // A completed job cannot be pushed back to retryable.
        assert!(!store
            .mark_failed(stale.id, "w1", "late failure", FailureKind::Retryable)
            .await
            .unwrap());
        assert!(!store.mark_succeeded(fresh.id, "w2").await.unwrap());
        assert_eq!(store.job(fresh.id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_finalized_jobs_are_pruned_oldest_first() {
        let store = MemoryStore::new().with_finalized_retention(2);
        let mut tx = store.begin();
        for _ in 0..4 {
            tx.enqueue(record("events")).await.unwrap();
        }
        tx.enqueue(record("workflow")).await.unwrap();
        tx.commit();

        let mut finished = Vec::new();
        for _ in 0..4 {
            let job = store.claim_ready("w1", "events", 1).await.unwrap().remove(0);
            assert!(store.mark_succeeded(job.id, "w1").await.unwrap());
            finished.push(job.id);
        }

        assert_eq!(store.job_count(), 3);
        assert_eq!(store.jobs_in_state(JobState::Completed).len(), 2);
        assert!(store.job(finished[0]).is_none());
        assert!(store.job(finished[1]).is_none());
        assert!(store.job(finished[3]).is_some());
        // The unclaimed job on another queue is never pruned.
        assert_eq!(store.outstanding_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_enqueue() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.fail_enqueue();
        assert!(tx.enqueue(record("events")).await.is_err());
        assert!(tx.staged_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle_times_out_with_outstanding_jobs() {
        let store = MemoryStore::new();
        assert!(store.wait_idle(Duration::from_millis(20)).await.is_ok());

        let mut tx = store.begin();
        tx.enqueue(record("events")).await.unwrap();
        tx.commit();
        assert!(store.wait_idle(Duration::from_millis(30)).await.is_err());
    }
}
