//! In-process bus for inline topics.
//!
//! The bus runs listeners on the caller's task before the mutation returns.
//! It adds no concurrency of its own and never aborts a running handler;
//! listeners observe the request's cancellation through their context.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{Operation, TopicName};
use crate::dispatch::{dispatch_envelope, DispatchOutcome};
use crate::error::RelayError;
use crate::listener::{ClientHandle, Delivery, HandlerContext};
use crate::payload::Envelope;
use crate::registry::Registry;

/// Synchronous publish/subscribe over the shared [`Registry`].
#[derive(Clone)]
pub struct InlineBus {
    registry: Arc<Registry>,
}

impl InlineBus {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Gate for emission: whether any listener cares about `(topic, op)`.
    ///
    /// Emitters must call this rather than guess; a false negative would
    /// silently drop a side effect.
    pub fn emit_event_on(&self, topic: &TopicName, op: Operation) -> bool {
        self.registry.interested_in(topic, op)
    }

    /// Run the listeners of `envelope` inline.
    ///
    /// A handler error is returned to the caller, which treats it as fatal
    /// to the mutation.
    pub async fn emit(
        &self,
        envelope: &Envelope,
        client: Option<ClientHandle>,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, RelayError> {
        if !self.emit_event_on(&envelope.topic, envelope.operation()) {
            debug!(
                topic = %envelope.topic,
                operation = %envelope.operation(),
                "no interest, inline emit skipped"
            );
            return Ok(DispatchOutcome::default());
        }

        let ctx = HandlerContext::for_envelope(envelope, Delivery::Inline)
            .with_client(client)
            .with_cancellation(cancel);
        dispatch_envelope(&self.registry, envelope, &ctx, None).await
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl std::fmt::Debug for InlineBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineBus")
            .field("registry", &self.registry)
            .finish()
    }
}
