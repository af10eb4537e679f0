//! The single dispatch path shared by the inline bus and the durable worker.
//!
//! ```text
//! InlineBus::emit ──────┐
//!                       ├─► dispatch_envelope(registry, envelope, ctx)
//! DispatchWorker::work ─┘        │
//!                                ├─► listeners_for(topic, op)   (registration order)
//!                                │
//!                                └─► per registration:
//!                                      pre-hooks ─ fail ─► skip this registration
//!                                      handler   ─ fail ─► stop, return ListenerError
//!                                      post-hooks ─ fail ─► log, continue
//! ```
//!
//! Because both paths call the same function with the same payload, a
//! listener observes identical inputs whichever way it was routed.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::{ListenerError, RelayError};
use crate::ledger::DeliveryLedger;
use crate::listener::{HandlerContext, Listener};
use crate::payload::Envelope;
use crate::registry::{ListenerDefinition, Registry};

/// What one dispatch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers that ran to completion.
    pub invoked: usize,
    /// Registrations skipped because a pre-hook failed.
    pub skipped: usize,
    /// Registrations skipped because they already succeeded for this envelope.
    pub already_delivered: usize,
}

impl DispatchOutcome {
    pub fn is_vacuous(&self) -> bool {
        self.invoked == 0 && self.skipped == 0 && self.already_delivered == 0
    }
}

/// Invoke every listener interested in `envelope`.
///
/// Listeners run sequentially in registration order on the caller's task.
/// The first handler failure (returned error or panic) stops dispatch and is
/// returned; registrations that already succeeded are recorded in `ledger`
/// when one is supplied, so a retry resumes after them.
pub async fn dispatch_envelope(
    registry: &Registry,
    envelope: &Envelope,
    ctx: &HandlerContext,
    ledger: Option<&DeliveryLedger>,
) -> Result<DispatchOutcome, RelayError> {
    let op = envelope.operation();
    let listeners = registry.listeners_for(&envelope.topic, op);
    let mut outcome = DispatchOutcome::default();

    if listeners.is_empty() {
        debug!(
            event_id = %envelope.id,
            topic = %envelope.topic,
            operation = %op,
            "no listeners for envelope"
        );
        return Ok(outcome);
    }

    for definition in listeners {
        if ledger.is_some_and(|l| l.is_delivered(envelope.id, &definition.name)) {
            debug!(
                event_id = %envelope.id,
                listener = %definition.name,
                "listener already succeeded for envelope, skipping"
            );
            outcome.already_delivered += 1;
            continue;
        }

        if let Err(err) = run_hooks(&definition.pre_hooks, &definition, envelope, ctx).await {
            warn!(
                event_id = %envelope.id,
                listener = %definition.name,
                error = %err,
                "pre-hook failed, skipping listener"
            );
            outcome.skipped += 1;
            continue;
        }

        invoke(definition.handler.as_ref(), &definition, envelope, ctx).await?;
        outcome.invoked += 1;

        if let Some(ledger) = ledger {
            ledger.mark_delivered(envelope.id, &definition.name);
        }

        if let Err(err) = run_hooks(&definition.post_hooks, &definition, envelope, ctx).await {
            warn!(
                event_id = %envelope.id,
                listener = %definition.name,
                error = %err,
                "post-hook failed"
            );
        }
    }

    debug!(
        event_id = %envelope.id,
        topic = %envelope.topic,
        invoked = outcome.invoked,
        skipped = outcome.skipped,
        "envelope dispatched"
    );
    Ok(outcome)
}

async fn run_hooks(
    hooks: &[std::sync::Arc<dyn Listener>],
    definition: &ListenerDefinition,
    envelope: &Envelope,
    ctx: &HandlerContext,
) -> Result<(), ListenerError> {
    for hook in hooks {
        invoke(hook.as_ref(), definition, envelope, ctx).await?;
    }
    Ok(())
}

/// Run one listener, converting panics into [`ListenerError`]s.
async fn invoke(
    listener: &dyn Listener,
    definition: &ListenerDefinition,
    envelope: &Envelope,
    ctx: &HandlerContext,
) -> Result<(), ListenerError> {
    let result = AssertUnwindSafe(listener.handle(ctx, &envelope.payload))
        .catch_unwind()
        .await;

    let (panicked, cause) = match result {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(cause)) => (false, cause),
        Err(panic_info) => {
            let panic_msg = extract_panic_message(&panic_info);
            error!(
                event_id = %envelope.id,
                listener = %definition.name,
                panic = %panic_msg,
                "listener panicked"
            );
            (true, anyhow::anyhow!("listener panicked: {}", panic_msg))
        }
    };

    Err(ListenerError {
        listener: definition.name.clone(),
        topic: envelope.topic.clone(),
        operation: envelope.operation(),
        panicked,
        cause,
    })
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Operation, TopicName, TopicPolicy};
    use crate::listener::{listener_fn, Delivery};
    use crate::payload::MutationPayload;
    use std::sync::{Arc, Mutex};

    type Trace = Arc<Mutex<Vec<String>>>;

    fn recorder(trace: &Trace, label: &'static str) -> impl Listener {
        let trace = trace.clone();
        listener_fn(move |_, _| {
            let trace = trace.clone();
            async move {
                trace.lock().unwrap().push(label.to_string());
                Ok(())
            }
        })
    }

    fn failing(label: &'static str) -> impl Listener {
        listener_fn(move |_, _| async move { Err(anyhow::anyhow!("{label} failed")) })
    }

    fn setup() -> (Registry, Envelope) {
        let registry = Registry::new();
        registry
            .register_topic("Control", TopicPolicy::inline())
            .unwrap();
        let envelope = Envelope::new(
            TopicName::for_entity("Control"),
            MutationPayload::new("Control", Operation::UpdateOne).with_entity_id("c-1"),
        );
        (registry, envelope)
    }

    fn ctx(envelope: &Envelope) -> HandlerContext {
        HandlerContext::for_envelope(envelope, Delivery::Inline)
    }

    #[tokio::test]
    async fn test_runs_in_registration_order_with_hooks() {
        let (registry, envelope) = setup();
        let trace: Trace = Arc::default();

        registry
            .add_listener(
                ListenerDefinition::new("first", "Control", recorder(&trace, "first"))
                    .with_pre_hook(recorder(&trace, "first:pre"))
                    .with_post_hook(recorder(&trace, "first:post")),
            )
            .unwrap();
        registry
            .add_listener(ListenerDefinition::new("second", "Control", recorder(&trace, "second")))
            .unwrap();

        let outcome = dispatch_envelope(&registry, &envelope, &ctx(&envelope), None)
            .await
            .unwrap();

        assert_eq!(outcome.invoked, 2);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["first:pre", "first", "first:post", "second"]
        );
    }

    #[tokio::test]
    async fn test_pre_hook_failure_skips_only_its_registration() {
        let (registry, envelope) = setup();
        let trace: Trace = Arc::default();

        registry
            .add_listener(
                ListenerDefinition::new("gated", "Control", recorder(&trace, "gated"))
                    .with_pre_hook(failing("gate"))
                    .with_post_hook(recorder(&trace, "gated:post")),
            )
            .unwrap();
        registry
            .add_listener(ListenerDefinition::new("open", "Control", recorder(&trace, "open")))
            .unwrap();

        let outcome = dispatch_envelope(&registry, &envelope, &ctx(&envelope), None)
            .await
            .unwrap();

        assert_eq!(outcome.invoked, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(*trace.lock().unwrap(), vec!["open"]);
    }

    #[tokio::test]
    async fn test_handler_error_stops_dispatch() {
        let (registry, envelope) = setup();
        let trace: Trace = Arc::default();

        registry
            .add_listener(ListenerDefinition::new("broken", "Control", failing("broken")))
            .unwrap();
        registry
            .add_listener(ListenerDefinition::new("after", "Control", recorder(&trace, "after")))
            .unwrap();

        let err = dispatch_envelope(&registry, &envelope, &ctx(&envelope), None)
            .await
            .unwrap_err();

        let listener_err = err.listener_error().unwrap();
        assert_eq!(listener_err.listener, "broken");
        assert!(!listener_err.panicked);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let (registry, envelope) = setup();
        registry
            .add_listener(ListenerDefinition::new(
                "panicky",
                "Control",
                listener_fn(|_, payload| async move {
                    if payload.entity_id.is_some() {
                        panic!("kaboom");
                    }
                    Ok(())
                }),
            ))
            .unwrap();

        let err = dispatch_envelope(&registry, &envelope, &ctx(&envelope), None)
            .await
            .unwrap_err();

        let listener_err = err.listener_error().unwrap();
        assert!(listener_err.panicked);
        assert!(listener_err.cause.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_ledger_skips_already_delivered() {
        let (registry, envelope) = setup();
        let trace: Trace = Arc::default();
        let fail_once = Arc::new(Mutex::new(true));

        registry
            .add_listener(ListenerDefinition::new("cache", "Control", recorder(&trace, "cache")))
            .unwrap();
        let flag = fail_once.clone();
        registry
            .add_listener(ListenerDefinition::new(
                "flaky",
                "Control",
                listener_fn(move |_, _| {
                    let flag = flag.clone();
                    async move {
                        let mut first = flag.lock().unwrap();
                        if *first {
                            *first = false;
                            anyhow::bail!("transient");
                        }
                        Ok(())
                    }
                }),
            ))
            .unwrap();

        let ledger = DeliveryLedger::new();
        let context = ctx(&envelope);
        assert!(dispatch_envelope(&registry, &envelope, &context, Some(&ledger))
            .await
            .is_err());

        let outcome = dispatch_envelope(&registry, &envelope, &context, Some(&ledger))
            .await
            .unwrap();
        assert_eq!(outcome.already_delivered, 1);
        assert_eq!(outcome.invoked, 1);
        assert_eq!(*trace.lock().unwrap(), vec!["cache"]);
    }

    #[tokio::test]
    async fn test_no_listeners_is_vacuous() {
        let (registry, envelope) = setup();
        let outcome = dispatch_envelope(&registry, &envelope, &ctx(&envelope), None)
            .await
            .unwrap();
        assert!(outcome.is_vacuous());
    }
}
