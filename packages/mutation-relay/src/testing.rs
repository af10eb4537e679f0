//! Test doubles for code that feeds mutations into the relay.
//!
//! [`RecordedMutation`] is an in-memory [`MutationSource`] built fluently:
//!
//! ```ignore
//! let mutation = RecordedMutation::update_one("TrustCenter", "tc-1")
//!     .with_old("custom_domain_id", json!("cd-1"))
//!     .set("visibility", json!("PUBLICLY_VISIBLE"))
//!     .clear("custom_domain_id");
//! ```

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::Operation;
use crate::extract::{EntitySnapshot, MutationSource};

/// A mutation described entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordedMutation {
    entity_type: String,
    operation: Operation,
    entity_id: Option<String>,
    soft_delete: bool,
    changed: Vec<(String, Value)>,
    cleared: Vec<String>,
    added: BTreeMap<String, Vec<String>>,
    removed: BTreeMap<String, Vec<String>>,
    cleared_edges: Vec<String>,
    old: BTreeMap<String, Value>,
    snapshot: Option<EntitySnapshot>,
    snapshot_error: Option<String>,
}

impl RecordedMutation {
    pub fn new(entity_type: impl Into<String>, operation: Operation, entity_id: Option<&str>) -> Self {
        Self {
            entity_type: entity_type.into(),
            operation,
            entity_id: entity_id.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn create(entity_type: impl Into<String>, id: &str) -> Self {
        Self::new(entity_type, Operation::Create, Some(id))
    }

    /// Bulk update: no entity id, no old-value lookups.
    pub fn update(entity_type: impl Into<String>) -> Self {
        Self::new(entity_type, Operation::Update, None)
    }

    pub fn update_one(entity_type: impl Into<String>, id: &str) -> Self {
        Self::new(entity_type, Operation::UpdateOne, Some(id))
    }

    pub fn delete(entity_type: impl Into<String>) -> Self {
        Self::new(entity_type, Operation::Delete, None)
    }

    pub fn delete_one(entity_type: impl Into<String>, id: &str) -> Self {
        Self::new(entity_type, Operation::DeleteOne, Some(id))
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.changed.push((field.into(), value));
        self
    }

    pub fn clear(mut self, field: impl Into<String>) -> Self {
        self.cleared.push(field.into());
        self
    }

    pub fn add_ids(mut self, edge: impl Into<String>, ids: &[&str]) -> Self {
        self.added
            .entry(edge.into())
            .or_default()
            .extend(ids.iter().map(|id| id.to_string()));
        self
    }

    pub fn remove_ids(mut self, edge: impl Into<String>, ids: &[&str]) -> Self {
        self.removed
            .entry(edge.into())
            .or_default()
            .extend(ids.iter().map(|id| id.to_string()));
        self
    }

    pub fn clear_edge(mut self, edge: impl Into<String>) -> Self {
        self.cleared_edges.push(edge.into());
        self
    }

    /// Value `field` held before the mutation.
    pub fn with_old(mut self, field: impl Into<String>, value: Value) -> Self {
        self.old.insert(field.into(), value);
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    pub fn with_snapshot(mut self, snapshot: EntitySnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Make the elevated snapshot load fail.
    pub fn with_snapshot_error(mut self, message: impl Into<String>) -> Self {
        self.snapshot_error = Some(message.into());
        self
    }
}

#[async_trait]
impl MutationSource for RecordedMutation {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn entity_id(&self) -> Option<String> {
        self.entity_id.clone()
    }

    fn is_soft_delete(&self) -> bool {
        self.soft_delete
    }

    fn changed_fields(&self) -> Vec<String> {
        self.changed.iter().map(|(name, _)| name.clone()).collect()
    }

    fn cleared_fields(&self) -> Vec<String> {
        self.cleared.clone()
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.changed
            .iter()
            .rev()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.clone())
    }

    fn added_edges(&self) -> Vec<String> {
        self.added.keys().cloned().collect()
    }

    fn added_ids(&self, edge: &str) -> Vec<String> {
        self.added.get(edge).cloned().unwrap_or_default()
    }

    fn removed_edges(&self) -> Vec<String> {
        self.removed.keys().cloned().collect()
    }

    fn removed_ids(&self, edge: &str) -> Vec<String> {
        self.removed.get(edge).cloned().unwrap_or_default()
    }

    fn cleared_edges(&self) -> Vec<String> {
        self.cleared_edges.clone()
    }

    async fn old_field(&self, name: &str) -> Result<Option<Value>> {
        if !matches!(self.operation, Operation::UpdateOne | Operation::DeleteOne) {
            anyhow::bail!(
                "old value of {} unavailable for {} operations",
                name,
                self.operation
            );
        }
        Ok(self.old.get(name).cloned())
    }

    async fn elevated_snapshot(&self) -> Result<Option<EntitySnapshot>> {
        if let Some(message) = &self.snapshot_error {
            anyhow::bail!("{}", message);
        }
        Ok(self.snapshot.clone())
    }
}
