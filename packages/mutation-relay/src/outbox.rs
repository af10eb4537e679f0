//! Transactional outbox.
//!
//! The outbox writes the dispatch record through the mutation's own
//! transaction, so the envelope and the mutation commit or roll back
//! together:
//!
//! ```text
//! BEGIN
//!   UPDATE trust_centers SET visibility = ...      (the mutation)
//!   INSERT INTO relay_jobs (kind, queue, args ...)  (OutboxWriter::enqueue)
//! COMMIT  ──► worker claims the job
//! ROLLBACK ─► no job exists
//! ```
//!
//! Enqueue failures follow [`OutboxFailureMode`]: fail-closed returns the
//! error so the caller rolls back; fail-open logs at `warn` and lets the
//! mutation commit without its side effects.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{OutboxFailureMode, TopicPolicy};
use crate::error::RelayError;
use crate::job::JobRecord;
use crate::payload::Envelope;

/// A transactional resource able to persist queue records.
///
/// Implemented by the caller's transaction handle; writes must become
/// visible to workers only when that transaction commits.
#[async_trait]
pub trait OutboxWriter: Send {
    async fn enqueue(&mut self, record: JobRecord) -> Result<()>;
}

/// Outbox settings shared by every durable topic.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Queue used by [`QueueClass::General`](crate::QueueClass::General).
    pub default_queue: String,
    pub max_attempts: i32,
    /// Failure handling for topics whose policy does not choose one.
    pub failure_mode: OutboxFailureMode,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            default_queue: "events".to_string(),
            max_attempts: crate::job::DEFAULT_MAX_ATTEMPTS,
            failure_mode: OutboxFailureMode::FailClosed,
        }
    }
}

/// Result of one outbox write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { job_id: Uuid, queue: String },
    /// Fail-open topic whose write failed; the mutation proceeds without it.
    Dropped { error: String },
}

/// Writes envelopes of durable topics to the outbox.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    config: OutboxConfig,
}

impl Outbox {
    pub fn new(config: OutboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Persist `envelope` through `tx` according to the topic's policy.
    pub async fn enqueue(
        &self,
        tx: &mut dyn OutboxWriter,
        envelope: &Envelope,
        policy: &TopicPolicy,
    ) -> Result<EnqueueOutcome, RelayError> {
        let queue = policy
            .queue_class
            .queue_name(&self.config.default_queue)
            .to_string();
        let mode = policy.failure_mode.unwrap_or(self.config.failure_mode);

        let record = JobRecord::dispatch(envelope, queue.clone())
            .map_err(|source| RelayError::Encode {
                topic: envelope.topic.clone(),
                source,
            })?
            .with_max_attempts(self.config.max_attempts);
        let job_id = record.id;

        match tx.enqueue(record).await {
            Ok(()) => {
                debug!(
                    event_id = %envelope.id,
                    topic = %envelope.topic,
                    job_id = %job_id,
                    queue = %queue,
                    "envelope enqueued"
                );
                Ok(EnqueueOutcome::Enqueued { job_id, queue })
            }
            Err(source) => match mode {
                OutboxFailureMode::FailClosed => Err(RelayError::Enqueue {
                    topic: envelope.topic.clone(),
                    source,
                }),
                OutboxFailureMode::FailOpen => {
                    warn!(
                        event_id = %envelope.id,
                        topic = %envelope.topic,
                        error = %source,
                        "outbox enqueue failed, continuing without durable delivery"
                    );
                    Ok(EnqueueOutcome::Dropped {
                        error: source.to_string(),
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Operation, QueueClass, TopicName};
    use crate::job::DISPATCH_JOB_KIND;
    use crate::payload::MutationPayload;

    #[derive(Default)]
    struct VecWriter {
        records: Vec<JobRecord>,
        fail: bool,
    }

    #[async_trait]
    impl OutboxWriter for VecWriter {
        async fn enqueue(&mut self, record: JobRecord) -> Result<()> {
            if self.fail {
                anyhow::bail!("connection reset");
            }
            self.records.push(record);
            Ok(())
        }
    }

    fn envelope() -> Envelope {
        Envelope::new(
            TopicName::for_concern("Control", "workflow"),
            MutationPayload::new("Control", Operation::UpdateOne).with_entity_id("c-1"),
        )
    }

    #[tokio::test]
    async fn test_enqueue_routes_queue_class() {
        let outbox = Outbox::default();
        let mut writer = VecWriter::default();

        let outcome = outbox
            .enqueue(&mut writer, &envelope(), &TopicPolicy::durable(QueueClass::Workflow))
            .await
            .unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Enqueued { ref queue, .. } if queue == "workflow"));
        assert_eq!(writer.records.len(), 1);
        assert_eq!(writer.records[0].kind, DISPATCH_JOB_KIND);
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_error() {
        let outbox = Outbox::default();
        let mut writer = VecWriter {
            fail: true,
            ..Default::default()
        };

        let err = outbox
            .enqueue(&mut writer, &envelope(), &TopicPolicy::durable(QueueClass::General))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Enqueue { .. }));
    }

    #[tokio::test]
    async fn test_fail_open_drops_and_continues() {
        let outbox = Outbox::default();
        let mut writer = VecWriter {
            fail: true,
            ..Default::default()
        };
        let policy = TopicPolicy::durable(QueueClass::General)
            .with_failure_mode(OutboxFailureMode::FailOpen);

        let outcome = outbox
            .enqueue(&mut writer, &envelope(), &policy)
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Dropped { .. }));
        assert!(writer.records.is_empty());
    }

    #[tokio::test]
    async fn test_relay_default_failure_mode_applies() {
        let outbox = Outbox::new(OutboxConfig {
            failure_mode: OutboxFailureMode::FailOpen,
            ..Default::default()
        });
        let mut writer = VecWriter {
            fail: true,
            ..Default::default()
        };

        let outcome = outbox
            .enqueue(&mut writer, &envelope(), &TopicPolicy::durable(QueueClass::General))
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Dropped { .. }));
    }
}
