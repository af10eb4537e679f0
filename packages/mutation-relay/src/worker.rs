//! Dispatch worker: replays durable envelopes.
//!
//! The `DispatchWorker` is a long-running service that:
//! - Polls each configured queue for ready jobs via `JobStore`
//! - Decodes the envelope carried by each job
//! - Acknowledges jobs nobody listens to any more (vacuous success)
//! - Dispatches through the same `dispatch_envelope` the inline bus uses
//! - Marks jobs succeeded or failed; retry and dead-lettering belong to the store
//!
//! # Architecture
//!
//! ```text
//! DispatchWorker
//!     │
//!     ├─► per queue: claim up to `workers` jobs (JobStore::claim_ready)
//!     ├─► decode envelope (ClaimedJob::envelope)
//!     ├─► interested_in(topic, op)? ── no ──► mark_succeeded
//!     ├─► dispatch_envelope(registry, envelope, ctx, ledger)
//!     └─► mark_succeeded / mark_failed(Retryable | NonRetryable)
//! ```
//!
//! Delivery is at-least-once. Envelopes for the same entity processed by
//! different workers are not ordered relative to each other.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::{dispatch_envelope, DispatchOutcome};
use crate::error::RelayError;
use crate::job::{ClaimedJob, FailureKind, JobStore};
use crate::ledger::DeliveryLedger;
use crate::listener::{ClientHandle, Delivery, HandlerContext};
use crate::registry::Registry;

/// A queue and how many jobs the worker runs from it concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub workers: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers: workers.max(1),
        }
    }
}

/// Configuration for the dispatch worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues to drain
    pub queues: Vec<QueueConfig>,
    /// How long to wait when a queue is empty
    pub poll_interval: Duration,
    /// Pause between fetches when a queue is busy
    pub fetch_cooldown: Duration,
    /// How often to send heartbeats for running jobs
    pub heartbeat_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![QueueConfig::new("events", 1)],
            poll_interval: Duration::from_secs(1),
            fetch_cooldown: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_queues(mut self, queues: Vec<QueueConfig>) -> Self {
        self.queues = queues;
        self
    }
}

/// Consumer of dispatch jobs.
pub struct DispatchWorker<S: JobStore> {
    store: Arc<S>,
    registry: Arc<Registry>,
    ledger: Arc<DeliveryLedger>,
    client: Option<ClientHandle>,
    config: WorkerConfig,
}

impl<S: JobStore + 'static> DispatchWorker<S> {
    pub fn new(store: Arc<S>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            ledger: Arc::new(DeliveryLedger::new()),
            client: None,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Fresh read handle given to every durable listener.
    pub fn with_client(mut self, client: ClientHandle) -> Self {
        self.client = Some(client);
        self
    }

    /// Share a ledger, e.g. between several workers of one process.
    pub fn with_ledger(mut self, ledger: Arc<DeliveryLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<DeliveryLedger> {
        &self.ledger
    }

    /// Dispatch the envelope carried by `job`.
    ///
    /// Jobs whose `(topic, operation)` no longer has listeners succeed
    /// without doing anything.
    pub async fn work(
        &self,
        job: &ClaimedJob,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, RelayError> {
        let envelope = job.envelope()?;

        if !self
            .registry
            .interested_in(&envelope.topic, envelope.operation())
        {
            debug!(
                job_id = %job.id,
                event_id = %envelope.id,
                topic = %envelope.topic,
                operation = %envelope.operation(),
                "no listener interested, acknowledging job"
            );
            return Ok(DispatchOutcome::default());
        }

        let ctx = HandlerContext::for_envelope(
            &envelope,
            Delivery::Durable {
                attempt: job.attempt,
            },
        )
        .with_client(self.client.clone())
        .with_cancellation(cancel.clone());

        let outcome = dispatch_envelope(&self.registry, &envelope, &ctx, Some(&self.ledger)).await?;
        Ok(outcome)
    }

    /// Process a single claimed job and record its result.
    async fn process_job(&self, job: ClaimedJob, shutdown: &CancellationToken) {
        let job_id = job.id;
        let job_cancel = shutdown.child_token();
        let event_id = job.envelope().ok().map(|envelope| envelope.id);
        let worker_id = self.config.worker_id.as_str();

        let result = self.execute_with_heartbeat(&job, job_cancel.clone()).await;

        match result {
            Ok(outcome) => {
                debug!(job_id = %job_id, invoked = outcome.invoked, "job succeeded");
                match self.store.mark_succeeded(job_id, worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "lease lost before completion, result dropped");
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
                    }
                }
                // Released even when the store rejected the completion.
                if let Some(event_id) = event_id {
                    self.ledger.forget(event_id);
                }
            }
            Err(e) => {
                let kind = if e.is_retryable() {
                    FailureKind::Retryable
                } else {
                    FailureKind::NonRetryable
                };
                if kind == FailureKind::NonRetryable {
                    error!(job_id = %job_id, error = %e, "job cannot be dispatched");
                } else {
                    warn!(
                        job_id = %job_id,
                        attempt = job.attempt,
                        max_attempts = job.max_attempts,
                        error = %e,
                        "job failed"
                    );
                }
                match self
                    .store
                    .mark_failed(job_id, worker_id, &e.to_string(), kind)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "lease lost before failure was recorded");
                        return;
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                        return;
                    }
                }
                if let Some(event_id) = event_id {
                    if kind == FailureKind::NonRetryable || job.is_last_attempt() {
                        self.ledger.forget(event_id);
                    }
                }
            }
        }
    }

    /// Run a job with periodic lease heartbeats.
    async fn execute_with_heartbeat(
        &self,
        job: &ClaimedJob,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, RelayError> {
        let store = self.store.clone();
        let job_id = job.id;
        let worker_id = self.config.worker_id.clone();
        let heartbeat_interval = self.config.heartbeat_interval;

        let heartbeat_stop = CancellationToken::new();
        let stop = heartbeat_stop.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        match store.heartbeat(job_id, &worker_id).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(job_id = %job_id, "lease lost, stopping heartbeats");
                                break;
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        });

        let result = self.work(job, &cancel).await;

        heartbeat_stop.cancel();
        let _ = heartbeat_handle.await;

        result
    }

    /// Claim and process jobs from `queue` until none are ready.
    ///
    /// Returns the number of jobs processed. Used by tests and by the
    /// in-memory dispatch mode.
    pub async fn drain(&self, queue: &str) -> Result<usize, RelayError> {
        let shutdown = CancellationToken::new();
        let limit = self
            .config
            .queues
            .iter()
            .find(|q| q.name == queue)
            .map_or(1, |q| q.workers) as i64;

        let mut processed = 0;
        loop {
            let jobs = self
                .store
                .claim_ready(&self.config.worker_id, queue, limit)
                .await
                .map_err(RelayError::Store)?;
            if jobs.is_empty() {
                return Ok(processed);
            }
            processed += jobs.len();
            join_all(jobs.into_iter().map(|job| self.process_job(job, &shutdown))).await;
        }
    }

    /// Drain every configured queue once.
    pub async fn drain_all(&self) -> Result<usize, RelayError> {
        let mut processed = 0;
        for queue in &self.config.queues {
            processed += self.drain(&queue.name).await?;
        }
        Ok(processed)
    }

    /// Poll every configured queue until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            "dispatch worker starting"
        );

        let handles: Vec<_> = self
            .config
            .queues
            .clone()
            .into_iter()
            .map(|queue| {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.poll_queue(queue, shutdown).await })
            })
            .collect();

        for handle in join_all(handles).await {
            if let Err(e) = handle {
                error!(error = %e, "queue poller panicked");
            }
        }

        info!(worker_id = %self.config.worker_id, "dispatch worker stopped");
        Ok(())
    }

    async fn poll_queue(&self, queue: QueueConfig, shutdown: CancellationToken) {
        debug!(queue = %queue.name, workers = queue.workers, "queue poller started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let jobs = match self
                .store
                .claim_ready(&self.config.worker_id, &queue.name, queue.workers as i64)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    let e = RelayError::Store(e);
                    error!(queue = %queue.name, error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(queue = %queue.name, count = jobs.len(), "claimed jobs");
            join_all(jobs.into_iter().map(|job| self.process_job(job, &shutdown))).await;

            if !self.config.fetch_cooldown.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.fetch_cooldown) => {}
                }
            }
        }

        debug!(queue = %queue.name, "queue poller stopped");
    }
}

impl<S: JobStore> std::fmt::Debug for DispatchWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchWorker")
            .field("worker_id", &self.config.worker_id)
            .field("queues", &self.config.queues)
            .field("registry", &self.registry)
            .finish()
    }
}
