//! Topic/interest registry.
//!
//! The registry is a constructed object: build one at start-up, register
//! topics and listeners, then share it by `Arc` with the emitter, the inline
//! bus and the dispatch worker. There is no process-wide instance.
//!
//! Reads ([`Registry::interested_in`], [`Registry::listeners_for`]) take a
//! shared lock and do constant-time lookups. Registration takes the exclusive
//! lock, so concurrent start-up registration never loses entries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::core::{Operation, OperationSet, TopicName, TopicPolicy};
use crate::error::RegistryError;
use crate::listener::Listener;

// =============================================================================
// Listener definitions
// =============================================================================

/// A listener bound to a topic with an operation filter and optional hooks.
///
/// Pre-hooks run before the handler; if one fails, this registration's
/// handler and post-hooks are skipped. Post-hooks run after a successful
/// handler.
#[derive(Clone)]
pub struct ListenerDefinition {
    pub name: String,
    pub topic: TopicName,
    pub operations: OperationSet,
    pub handler: Arc<dyn Listener>,
    pub pre_hooks: Vec<Arc<dyn Listener>>,
    pub post_hooks: Vec<Arc<dyn Listener>>,
}

impl ListenerDefinition {
    /// Listen to every operation on `topic`; narrow with [`Self::on`].
    pub fn new(name: impl Into<String>, topic: impl Into<TopicName>, handler: impl Listener) -> Self {
        Self::from_arc(name, topic, Arc::new(handler))
    }

    pub fn from_arc(
        name: impl Into<String>,
        topic: impl Into<TopicName>,
        handler: Arc<dyn Listener>,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            operations: OperationSet::empty(),
            handler,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    /// Add `op` to the operation filter.
    pub fn on(mut self, op: Operation) -> Self {
        self.operations.insert(op);
        self
    }

    pub fn on_operations(mut self, ops: impl Into<OperationSet>) -> Self {
        self.operations = self.operations.union(ops.into());
        self
    }

    pub fn with_pre_hook(mut self, hook: impl Listener) -> Self {
        self.pre_hooks.push(Arc::new(hook));
        self
    }

    pub fn with_post_hook(mut self, hook: impl Listener) -> Self {
        self.post_hooks.push(Arc::new(hook));
        self
    }

    /// Operations this listener reacts to; an empty filter means all of them.
    pub fn effective_operations(&self) -> OperationSet {
        if self.operations.is_empty() {
            OperationSet::all()
        } else {
            self.operations
        }
    }

    pub fn accepts(&self, op: Operation) -> bool {
        self.effective_operations().contains(op)
    }
}

impl std::fmt::Debug for ListenerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerDefinition")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("operations", &self.effective_operations())
            .field("pre_hooks", &self.pre_hooks.len())
            .field("post_hooks", &self.post_hooks.len())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    policies: HashMap<TopicName, TopicPolicy>,
    /// Entity type -> topics routing it, in declaration order.
    entity_topics: HashMap<String, Vec<TopicName>>,
    /// Listeners per topic, in registration order.
    listeners: HashMap<TopicName, Vec<Arc<ListenerDefinition>>>,
    /// Union of every listener's operations per topic.
    interest: HashMap<TopicName, OperationSet>,
}

/// Maps topics to policies and listeners and answers interest queries.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Declare a topic and its delivery policy.
    ///
    /// Re-declaring a topic with an identical policy is a no-op. A different
    /// policy is rejected with [`RegistryError::TopicAlreadyRegistered`].
    pub fn register_topic(
        &self,
        topic: impl Into<TopicName>,
        policy: TopicPolicy,
    ) -> Result<(), RegistryError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(RegistryError::TopicNameRequired);
        }

        let mut inner = self.write();
        if let Some(existing) = inner.policies.get(&topic) {
            if *existing == policy {
                return Ok(());
            }
            return Err(RegistryError::TopicAlreadyRegistered {
                topic,
                existing: existing.clone(),
                requested: policy,
            });
        }

        debug!(topic = %topic, emit_mode = ?policy.emit_mode, "topic registered");
        inner
            .entity_topics
            .entry(topic.entity_type().to_string())
            .or_default()
            .push(topic.clone());
        inner.policies.insert(topic, policy);
        Ok(())
    }

    /// Declare a topic, replacing any existing policy.
    ///
    /// Intended for tests that rebuild routing between cases.
    pub fn register_topic_replace(
        &self,
        topic: impl Into<TopicName>,
        policy: TopicPolicy,
    ) -> Result<(), RegistryError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(RegistryError::TopicNameRequired);
        }

        let mut inner = self.write();
        if inner.policies.insert(topic.clone(), policy).is_none() {
            inner
                .entity_topics
                .entry(topic.entity_type().to_string())
                .or_default()
                .push(topic);
        }
        Ok(())
    }

    /// Bind a listener to a declared topic.
    pub fn add_listener(&self, definition: ListenerDefinition) -> Result<(), RegistryError> {
        if definition.name.trim().is_empty() {
            return Err(RegistryError::ListenerNameRequired);
        }
        if definition.topic.is_empty() {
            return Err(RegistryError::TopicNameRequired);
        }

        let mut inner = self.write();
        if !inner.policies.contains_key(&definition.topic) {
            return Err(RegistryError::TopicNotRegistered {
                listener: definition.name,
                topic: definition.topic,
            });
        }

        let topic = definition.topic.clone();
        let listeners = inner.listeners.entry(topic.clone()).or_default();
        if listeners.iter().any(|l| l.name == definition.name) {
            return Err(RegistryError::DuplicateListener {
                topic,
                listener: definition.name,
            });
        }

        let operations = definition.effective_operations();
        debug!(
            topic = %topic,
            listener = %definition.name,
            operations = ?operations,
            "listener registered"
        );
        listeners.push(Arc::new(definition));

        let interest = inner.interest.entry(topic).or_default();
        *interest = interest.union(operations);
        Ok(())
    }

    /// Whether any listener on `topic` reacts to `op`.
    pub fn interested_in(&self, topic: &TopicName, op: Operation) -> bool {
        self.read()
            .interest
            .get(topic)
            .is_some_and(|ops| ops.contains(op))
    }

    /// Listeners on `topic` accepting `op`, in registration order.
    pub fn listeners_for(&self, topic: &TopicName, op: Operation) -> Vec<Arc<ListenerDefinition>> {
        self.read()
            .listeners
            .get(topic)
            .map(|listeners| {
                listeners
                    .iter()
                    .filter(|l| l.accepts(op))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn topic_policy(&self, topic: &TopicName) -> Option<TopicPolicy> {
        self.read().policies.get(topic).cloned()
    }

    /// Topics routing `entity_type`, in declaration order.
    pub fn topics_for_entity(&self, entity_type: &str) -> Vec<TopicName> {
        self.read()
            .entity_topics
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Topics of `entity_type` with at least one listener for `op`, with their policies.
    pub fn interested_topics(&self, entity_type: &str, op: Operation) -> Vec<(TopicName, TopicPolicy)> {
        let inner = self.read();
        let Some(topics) = inner.entity_topics.get(entity_type) else {
            return Vec::new();
        };

        topics
            .iter()
            .filter(|topic| inner.interest.get(*topic).is_some_and(|ops| ops.contains(op)))
            .filter_map(|topic| {
                inner
                    .policies
                    .get(topic)
                    .map(|policy| (topic.clone(), policy.clone()))
            })
            .collect()
    }

    pub fn has_topic(&self, topic: &TopicName) -> bool {
        self.read().policies.contains_key(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.read().policies.len()
    }

    pub fn listener_count(&self) -> usize {
        self.read().listeners.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("topics", &self.topic_count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
