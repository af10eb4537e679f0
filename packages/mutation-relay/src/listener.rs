//! Listener interface and the narrow context handed to it.
//!
//! Listeners see exactly two things: the [`MutationPayload`] and a
//! [`HandlerContext`]. They cannot tell, beyond [`HandlerContext::delivery`],
//! whether they run inline or from the durable queue.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{EventId, Headers, Operation, TopicName};
use crate::payload::{Envelope, MutationPayload};

/// A side effect triggered by mutations on a topic.
///
/// Implementations must tolerate redelivery: the durable path is
/// at-least-once. Effects that cannot be made idempotent should key
/// de-duplication on [`HandlerContext::event_id`]
/// (see [`DeliveryLedger::first_delivery`](crate::DeliveryLedger::first_delivery)).
///
/// The same trait serves pre-hooks and post-hooks.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn handle(&self, ctx: &HandlerContext, payload: &MutationPayload) -> Result<()>;
}

/// Adapter turning an async closure into a [`Listener`].
pub struct FnListener<F> {
    f: F,
}

/// Wrap an async closure as a listener.
///
/// ```ignore
/// let listener = listener_fn(|ctx, payload| async move {
///     tracing::info!(event_id = %ctx.event_id, entity = ?payload.entity_id, "seen");
///     Ok(())
/// });
/// ```
pub fn listener_fn<F, Fut>(f: F) -> FnListener<F>
where
    F: Fn(HandlerContext, MutationPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnListener { f }
}

#[async_trait]
impl<F, Fut> Listener for FnListener<F>
where
    F: Fn(HandlerContext, MutationPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext, payload: &MutationPayload) -> Result<()> {
        (self.f)(ctx.clone(), payload.clone()).await
    }
}

/// Type-erased read handle (database client, transaction view, service bundle).
///
/// Inline listeners receive the caller's handle; durable listeners receive
/// the worker's fresh one.
#[derive(Clone)]
pub struct ClientHandle(Arc<dyn Any + Send + Sync>);

impl ClientHandle {
    pub fn new<T: Any + Send + Sync>(client: T) -> Self {
        Self(Arc::new(client))
    }

    pub fn from_arc<T: Any + Send + Sync>(client: Arc<T>) -> Self {
        Self(client)
    }

    /// The handle as `T`, if that is what it holds.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientHandle(..)")
    }
}

/// How an envelope reached the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Inside the originating request.
    Inline,
    /// From the durable queue; `attempt` is 1-based.
    Durable { attempt: i32 },
}

/// Everything a listener may use besides the payload.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub event_id: EventId,
    pub topic: TopicName,
    pub operation: Operation,
    pub headers: Headers,
    pub delivery: Delivery,
    client: Option<ClientHandle>,
    cancel: CancellationToken,
}

impl HandlerContext {
    pub fn for_envelope(envelope: &Envelope, delivery: Delivery) -> Self {
        Self {
            event_id: envelope.id,
            topic: envelope.topic.clone(),
            operation: envelope.operation(),
            headers: envelope.headers.clone(),
            delivery,
            client: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_client(mut self, client: Option<ClientHandle>) -> Self {
        self.client = client;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn client(&self) -> Option<&ClientHandle> {
        self.client.as_ref()
    }

    /// The read handle downcast to `T`.
    pub fn client_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.client.as_ref().and_then(ClientHandle::downcast::<T>)
    }

    /// Header property shortcut.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.headers.property(key)
    }

    /// Cancellation of the originating request (inline) or of the worker (durable).
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.delivery, Delivery::Durable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Db {
        name: &'static str,
    }

    fn envelope() -> Envelope {
        Envelope::new(
            TopicName::for_entity("Control"),
            MutationPayload::new("Control", Operation::Create).with_entity_id("c-1"),
        )
        .with_headers(Headers::new().with_property("owner_id", "org-1"))
    }

    #[test]
    fn test_client_downcast() {
        let ctx = HandlerContext::for_envelope(&envelope(), Delivery::Inline)
            .with_client(Some(ClientHandle::new(Db { name: "primary" })));

        let db = ctx.client_as::<Db>().unwrap();
        assert_eq!(db.name, "primary");
        assert!(ctx.client_as::<String>().is_none());
    }

    #[test]
    fn test_context_copies_envelope_identity() {
        let env = envelope();
        let ctx = HandlerContext::for_envelope(&env, Delivery::Durable { attempt: 2 });

        assert_eq!(ctx.event_id, env.id);
        assert_eq!(ctx.operation, Operation::Create);
        assert_eq!(ctx.property("owner_id"), Some("org-1"));
        assert!(ctx.is_durable());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_listener_fn_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let listener = listener_fn(move |_ctx, payload| {
            let counter = counter.clone();
            async move {
                assert_eq!(payload.entity_id.as_deref(), Some("c-1"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let env = envelope();
        let ctx = HandlerContext::for_envelope(&env, Delivery::Inline);
        listener.handle(&ctx, &env.payload).await.unwrap();
        listener.handle(&ctx, &env.payload).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
