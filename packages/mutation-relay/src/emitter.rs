//! The mutation hook pipeline.
//!
//! ```text
//! mutation write succeeded
//!     │
//!     ▼
//! ChangeExtractor ──► cleared entries ──► RequestContext.accumulator
//!     │
//!     ▼ payload
//! Registry::interested_topics(entity, op)     (no interest → nothing to do)
//!     │
//!     ├─► Inline topic  ──► InlineBus::emit        (error fails the mutation)
//!     └─► Durable topic ──► Outbox::enqueue(tx)    (same transaction as the write)
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::accumulator::ClearedAccumulator;
use crate::bus::InlineBus;
use crate::core::{EmitMode, EventId, Headers, TopicName, TopicPolicy};
use crate::error::RelayError;
use crate::extract::{ChangeExtractor, MutationSource};
use crate::listener::ClientHandle;
use crate::outbox::{EnqueueOutcome, Outbox, OutboxConfig, OutboxWriter};
use crate::payload::{Envelope, MutationPayload};
use crate::registry::Registry;

/// Per-request state threaded through every mutation of one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Cleared relation entries of this request's mutations.
    pub accumulator: Arc<ClearedAccumulator>,
    /// Read handle passed to inline listeners.
    pub client: Option<ClientHandle>,
    /// Cancellation of the request, observed by inline listeners.
    pub cancel: CancellationToken,
    /// Properties attached to every envelope emitted by the request.
    pub headers: Headers,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: ClientHandle) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of emitting one envelope on one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitReceipt {
    pub event_id: EventId,
    pub topic: TopicName,
    pub mode: EmitMode,
    /// Whether delivery is assured (inline listeners ran, or the envelope is
    /// in the outbox). `false` only for fail-open enqueue failures.
    pub accepted: bool,
    /// Queue record id for durable emissions.
    pub job_id: Option<Uuid>,
    pub error: Option<String>,
}

/// Entry point called from the persistence layer's mutation hook.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    bus: InlineBus,
    outbox: Outbox,
    extractor: ChangeExtractor,
}

impl Relay {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            bus: InlineBus::new(registry.clone()),
            registry,
            outbox: Outbox::default(),
            extractor: ChangeExtractor::default(),
        }
    }

    pub fn with_outbox_config(mut self, config: OutboxConfig) -> Self {
        self.outbox = Outbox::new(config);
        self
    }

    pub fn with_extractor(mut self, extractor: ChangeExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn bus(&self) -> &InlineBus {
        &self.bus
    }

    /// Process one completed mutation.
    ///
    /// Called after the write succeeded and before the transaction commits.
    /// An error means the caller must roll back `tx`.
    pub async fn on_mutation(
        &self,
        source: &dyn MutationSource,
        tx: &mut dyn OutboxWriter,
        request: &RequestContext,
    ) -> Result<Vec<EmitReceipt>, RelayError> {
        let extraction = self.extractor.extract(source).await;
        if let Some(cleared) = extraction.cleared {
            request.accumulator.record(cleared);
        }

        let payload = extraction.payload;
        let topics = self
            .registry
            .interested_topics(&payload.mutation_type, payload.operation);
        if topics.is_empty() {
            debug!(
                entity_type = %payload.mutation_type,
                operation = %payload.operation,
                "no interested topics, emission skipped"
            );
            return Ok(Vec::new());
        }

        let mut headers = request.headers.clone();
        headers.merge(&extraction.headers);

        let mut receipts = Vec::with_capacity(topics.len());
        for (topic, policy) in topics {
            let receipt = self
                .emit_with_headers(topic, &policy, payload.clone(), headers.clone(), tx, request)
                .await?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }

    /// Emit `payload` on `topic` following `policy`.
    pub async fn emit_with_headers(
        &self,
        topic: TopicName,
        policy: &TopicPolicy,
        payload: MutationPayload,
        headers: Headers,
        tx: &mut dyn OutboxWriter,
        request: &RequestContext,
    ) -> Result<EmitReceipt, RelayError> {
        let envelope = Envelope::new(topic, payload).with_headers(headers);

        match policy.emit_mode {
            EmitMode::Inline => {
                self.bus
                    .emit(&envelope, request.client.clone(), request.cancel.clone())
                    .await?;
                Ok(EmitReceipt {
                    event_id: envelope.id,
                    topic: envelope.topic,
                    mode: EmitMode::Inline,
                    accepted: true,
                    job_id: None,
                    error: None,
                })
            }
            EmitMode::Durable => {
                let (accepted, job_id, error) =
                    match self.outbox.enqueue(tx, &envelope, policy).await? {
                        EnqueueOutcome::Enqueued { job_id, .. } => (true, Some(job_id), None),
                        EnqueueOutcome::Dropped { error } => (false, None, Some(error)),
                    };
                Ok(EmitReceipt {
                    event_id: envelope.id,
                    topic: envelope.topic,
                    mode: EmitMode::Durable,
                    accepted,
                    job_id,
                    error,
                })
            }
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("registry", &self.registry)
            .field("outbox", self.outbox.config())
            .finish()
    }
}
