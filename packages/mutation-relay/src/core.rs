//! Core vocabulary shared by every part of the relay.
//!
//! - [`Operation`] - what kind of write happened
//! - [`OperationSet`] - a listener's operation filter (constant-time membership)
//! - [`TopicName`] - routing key derived from the entity type
//! - [`TopicPolicy`] - per-topic delivery policy (inline vs durable, queue class)
//! - [`EventId`] - identity of one emitted envelope
//! - [`Headers`] - free-form string properties carried alongside a payload

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Operation
// =============================================================================

/// The kind of write a mutation performed.
///
/// `Update`/`Delete` are bulk operations that may touch many rows and carry no
/// single entity id. `UpdateOne`/`DeleteOne` target exactly one entity.
/// `SoftDelete` is an `UpdateOne` that flagged the row as deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Operation {
    #[default]
    Create,
    Update,
    UpdateOne,
    Delete,
    DeleteOne,
    SoftDelete,
}

impl Operation {
    /// All operations, in declaration order.
    pub const ALL: [Operation; 6] = [
        Operation::Create,
        Operation::Update,
        Operation::UpdateOne,
        Operation::Delete,
        Operation::DeleteOne,
        Operation::SoftDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "Create",
            Operation::Update => "Update",
            Operation::UpdateOne => "UpdateOne",
            Operation::Delete => "Delete",
            Operation::DeleteOne => "DeleteOne",
            Operation::SoftDelete => "SoftDelete",
        }
    }

    /// Whether this operation can clear or replace relations, and so should
    /// run cleared-relation capture. A soft delete is an update underneath.
    pub fn captures_cleared_relations(&self) -> bool {
        !matches!(self, Operation::Create)
    }

    /// Whether this operation removes the entity (hard or soft).
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Operation::Delete | Operation::DeleteOne | Operation::SoftDelete
        )
    }

    fn bit(&self) -> u8 {
        match self {
            Operation::Create => 1 << 0,
            Operation::Update => 1 << 1,
            Operation::UpdateOne => 1 << 2,
            Operation::Delete => 1 << 3,
            Operation::DeleteOne => 1 << 4,
            Operation::SoftDelete => 1 << 5,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown operation name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// A set of operations stored as a bitmask.
///
/// An empty filter passed to a listener registration means "every operation";
/// use [`OperationSet::all`] to make that explicit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OperationSet(u8);

impl OperationSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Operation::ALL.into_iter().collect()
    }

    pub fn with(mut self, op: Operation) -> Self {
        self.insert(op);
        self
    }

    pub fn insert(&mut self, op: Operation) {
        self.0 |= op.bit();
    }

    pub fn union(self, other: OperationSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(&self, op: Operation) -> bool {
        self.0 & op.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Operation> {
        let bits = *self;
        Operation::ALL
            .into_iter()
            .filter(move |op| bits.contains(*op))
    }
}

impl FromIterator<Operation> for OperationSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        let mut set = OperationSet::empty();
        for op in iter {
            set.insert(op);
        }
        set
    }
}

impl From<Operation> for OperationSet {
    fn from(op: Operation) -> Self {
        OperationSet::empty().with(op)
    }
}

impl<const N: usize> From<[Operation; N]> for OperationSet {
    fn from(ops: [Operation; N]) -> Self {
        ops.into_iter().collect()
    }
}

impl fmt::Debug for OperationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// Topics
// =============================================================================

/// Routing key for emitted mutations.
///
/// The base topic of an entity type is the entity type itself
/// (`TrustCenter`). A concern suffix narrows the audience
/// (`TrustCenter.workflow`, `TrustCenter.notification`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicName(String);

impl TopicName {
    /// Separator between the entity type and a concern.
    pub const CONCERN_SEPARATOR: char = '.';

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Base topic for mutations of `entity_type`.
    pub fn for_entity(entity_type: &str) -> Self {
        Self(entity_type.to_string())
    }

    /// Topic for mutations of `entity_type` scoped to one concern.
    pub fn for_concern(entity_type: &str, concern: &str) -> Self {
        Self(format!(
            "{}{}{}",
            entity_type,
            Self::CONCERN_SEPARATOR,
            concern
        ))
    }

    /// The entity type this topic routes.
    pub fn entity_type(&self) -> &str {
        self.0
            .split_once(Self::CONCERN_SEPARATOR)
            .map_or(self.0.as_str(), |(entity, _)| entity)
    }

    pub fn concern(&self) -> Option<&str> {
        self.0
            .split_once(Self::CONCERN_SEPARATOR)
            .map(|(_, concern)| concern)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TopicName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether a topic's listeners run inside the request or from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmitMode {
    /// Run listeners before the mutation returns, on the caller's task.
    Inline,
    /// Persist an envelope in the mutation's transaction; a worker runs the
    /// listeners after commit.
    #[default]
    Durable,
}

/// Queue a durable topic's envelopes are written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    /// The configured default queue.
    #[default]
    General,
    Workflow,
    Notification,
    Billing,
    /// Any other named queue.
    Named(String),
}

impl QueueClass {
    /// Resolve the queue name, using `default_queue` for [`QueueClass::General`].
    pub fn queue_name<'a>(&'a self, default_queue: &'a str) -> &'a str {
        match self {
            QueueClass::General => default_queue,
            QueueClass::Workflow => "workflow",
            QueueClass::Notification => "notification",
            QueueClass::Billing => "billing",
            QueueClass::Named(name) => name,
        }
    }
}

/// What happens when the outbox cannot persist an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutboxFailureMode {
    /// The enqueue error fails the mutation and its transaction rolls back.
    #[default]
    FailClosed,
    /// The enqueue error is logged and the mutation commits without an envelope.
    FailOpen,
}

impl FromStr for OutboxFailureMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_closed" | "closed" => Ok(OutboxFailureMode::FailClosed),
            "fail_open" | "open" => Ok(OutboxFailureMode::FailOpen),
            other => Err(anyhow::anyhow!("unknown outbox failure mode: {}", other)),
        }
    }
}

/// Delivery policy of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct TopicPolicy {
    pub emit_mode: EmitMode,
    pub queue_class: QueueClass,
    /// Outbox failure handling; `None` defers to the relay's default.
    #[serde(default)]
    pub failure_mode: Option<OutboxFailureMode>,
}

impl TopicPolicy {
    pub fn inline() -> Self {
        Self {
            emit_mode: EmitMode::Inline,
            ..Default::default()
        }
    }

    pub fn durable(queue_class: QueueClass) -> Self {
        Self {
            emit_mode: EmitMode::Durable,
            queue_class,
            failure_mode: None,
        }
    }

    pub fn with_failure_mode(mut self, mode: OutboxFailureMode) -> Self {
        self.failure_mode = Some(mode);
        self
    }
}

// =============================================================================
// Identity and headers
// =============================================================================

/// Identity of one emitted envelope.
///
/// Listeners that are not naturally idempotent key their de-duplication on
/// this id; redeliveries of an envelope always carry the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// String properties carried alongside a payload.
///
/// Used for small scalars resolved at emit time (an email address, a parent
/// entity id read from the elevated snapshot) that listeners need without
/// another lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Headers {
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a property. Blank keys and values are ignored.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if key.trim().is_empty() || value.trim().is_empty() {
            return;
        }
        self.properties.insert(key, value);
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Merge `other` into `self`; existing keys are kept.
    pub fn merge(&mut self, other: &Headers) {
        for (key, value) in &other.properties {
            self.properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
