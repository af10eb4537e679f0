//! # Mutation Relay
//!
//! Turns successful data mutations into side effects (cache refreshes,
//! search-index updates, notifications) without coupling the write path to
//! the listeners.
//!
//! ## Core Concepts
//!
//! - [`MutationPayload`] = what changed (entity, operation, fields, edges)
//! - [`Envelope`] = a payload addressed to a topic, with a stable [`EventId`]
//! - [`Registry`] = which listeners care about which `(topic, operation)`
//! - [`TopicPolicy`] = whether a topic runs inline or through the durable queue
//!
//! The key principle: **no interest, no work**. Nothing is enqueued or
//! dispatched for a mutation no listener asked for. Cleared relation
//! entries are still recorded on the request's [`ClearedAccumulator`].
//!
//! ## Architecture
//!
//! ```text
//! persistence hook
//!     │
//!     ▼ on_mutation()
//! Relay ─► ChangeExtractor ─► cleared entries ─► ClearedAccumulator
//!     │
//!     ▼ interested_topics(entity, op)
//!     │
//!     ├─► Inline topic ──► InlineBus ──────────┐
//!     │                                        │
//!     └─► Durable topic ─► Outbox (same tx)    │
//!                             │                │
//!                             ▼ commit         │
//!                          JobStore            │
//!                             │                │
//!                             ▼ claim_ready    │
//!                          DispatchWorker ─────┤
//!                                              ▼
//!                                     dispatch_envelope()
//!                                              │
//!                                 pre-hooks ─► handler ─► post-hooks
//! ```
//!
//! ## Guarantees
//!
//! - **Inline**: listeners run before the mutation returns; a failure fails
//!   the mutation
//! - **Durable**: the envelope commits with the mutation and is delivered
//!   at least once; a rolled-back mutation emits nothing
//! - **Parity**: both paths hand listeners the same payload through
//!   [`dispatch_envelope`]
//! - **No ordering** across envelopes of the same entity on the durable path
//!
//! Listeners with non-idempotent effects should de-duplicate on
//! [`HandlerContext::event_id`], e.g. with
//! [`DeliveryLedger::first_delivery`](crate::DeliveryLedger::first_delivery).
//!
//! ## Example
//!
//! ```ignore
//! use mutation_relay::{
//!     listener_fn, ListenerDefinition, Operation, QueueClass, Registry, Relay,
//!     RequestContext, TopicPolicy,
//! };
//! use std::sync::Arc;
//!
//! let registry = Arc::new(Registry::new());
//! registry.register_topic("TrustCenter", TopicPolicy::durable(QueueClass::General))?;
//! registry.add_listener(
//!     ListenerDefinition::new(
//!         "trust-center-cache",
//!         "TrustCenter",
//!         listener_fn(|ctx, payload| async move {
//!             refresh_cache(ctx.client(), payload.entity_id.as_deref()).await
//!         }),
//!     )
//!     .on(Operation::UpdateOne),
//! )?;
//!
//! let relay = Relay::new(registry.clone());
//!
//! // inside the mutation's transaction
//! relay.on_mutation(&mutation, &mut tx, &RequestContext::new()).await?;
//! ```

// Core modules
mod accumulator;
mod bus;
mod cleared;
mod config;
mod core;
mod dispatch;
mod emitter;
mod error;
mod extract;
mod ledger;
mod listener;
mod outbox;
mod payload;
mod registry;
mod runtime;
mod worker;

// Queue interfaces
pub mod job;

// Storage backends
pub mod stores;

// Scripted mutation sources for tests
pub mod testing;


// Re-export core types
pub use crate::core::{
    EmitMode, EventId, Headers, Operation, OperationSet, OutboxFailureMode, QueueClass, TopicName,
    TopicPolicy, UnknownOperation,
};

pub use accumulator::ClearedAccumulator;
pub use bus::InlineBus;
pub use cleared::{
    is_file_relation_name, is_id_like_field, normalize_entries, normalize_ids, ClearedMutation,
    ClearedRelationEntry, RelationAction, RelationKind,
};
pub use config::{DispatchMode, RelayConfig};
pub use dispatch::{dispatch_envelope, DispatchOutcome};
pub use emitter::{EmitReceipt, Relay, RequestContext};
pub use error::{ListenerError, RegistryError, RelayError};
pub use extract::{
    build_payload, collect_cleared_relation_entries, ChangeExtractor, EntityFields,
    EntitySnapshot, Extraction, MutationSource,
};
pub use job::{ClaimedJob, DeserializationError, FailureKind, JobRecord, JobStore};
pub use ledger::{DeliveryLedger, DEFAULT_ONE_SHOT_RETENTION};
pub use listener::{listener_fn, ClientHandle, Delivery, FnListener, HandlerContext, Listener};
pub use outbox::{EnqueueOutcome, Outbox, OutboxConfig, OutboxWriter};
pub use payload::{Envelope, MutationPayload};
pub use registry::{ListenerDefinition, Registry};
pub use runtime::RelayRuntime;
pub use worker::{DispatchWorker, QueueConfig, WorkerConfig};

// Re-export async_trait for implementing Listener / MutationSource
pub use async_trait::async_trait;
