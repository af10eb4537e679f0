//! Change extraction: turning a completed mutation into a [`MutationPayload`]
//! plus its cleared relation entries.
//!
//! The persistence layer exposes each mutation through the
//! [`MutationSource`] capability trait. Field access goes through
//! [`EntityFields`] (`field` / `set_field`) rather than runtime type
//! inspection.
//!
//! Extraction never fails a mutation. A failed old-value lookup or elevated
//! snapshot load is logged at `debug` and the affected field is skipped.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::cleared::{
    is_id_like_field, normalize_ids, ClearedMutation, ClearedRelationEntry, RelationAction,
    RelationKind,
};
use crate::core::{Headers, Operation};
use crate::payload::MutationPayload;

// =============================================================================
// Capability traits
// =============================================================================

/// Named field access on an entity.
pub trait EntityFields: Send + Sync {
    fn field(&self, name: &str) -> Option<Value>;

    fn set_field(&mut self, name: &str, value: Value) -> Result<()>;
}

/// A field map implementing [`EntityFields`]; the shape elevated snapshots
/// are returned in.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EntitySnapshot {
    fields: BTreeMap<String, Value>,
}

impl EntitySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Apply a payload's proposed changes and cleared fields.
    pub fn apply(&mut self, payload: &MutationPayload) -> Result<()> {
        for (name, value) in &payload.proposed_changes {
            self.set_field(name, value.clone())?;
        }
        for name in &payload.cleared_fields {
            if !payload.proposed_changes.contains_key(name) {
                self.set_field(name, Value::Null)?;
            }
        }
        Ok(())
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}

impl EntityFields for EntitySnapshot {
    fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        if name.trim().is_empty() {
            anyhow::bail!("field name is required");
        }
        self.fields.insert(name.to_string(), value);
        Ok(())
    }
}

/// A completed mutation, as seen by the relay.
///
/// Implemented by the persistence layer's mutation handle. Accessors reflect
/// the state after the write succeeded; [`MutationSource::old_field`] reads
/// the value before it.
#[async_trait]
pub trait MutationSource: Send + Sync {
    /// Entity/schema name, e.g. `TrustCenter`.
    fn entity_type(&self) -> &str;

    fn operation(&self) -> Operation;

    /// Id of the single affected entity; `None` for bulk writes.
    fn entity_id(&self) -> Option<String>;

    /// Whether this `UpdateOne` was a soft delete.
    fn is_soft_delete(&self) -> bool {
        false
    }

    /// Fields set by the mutation, in mutation order.
    fn changed_fields(&self) -> Vec<String>;

    /// Fields reset to their zero value.
    fn cleared_fields(&self) -> Vec<String>;

    /// New value of a set field.
    fn field(&self, name: &str) -> Option<Value>;

    fn added_edges(&self) -> Vec<String>;

    fn added_ids(&self, edge: &str) -> Vec<String>;

    fn removed_edges(&self) -> Vec<String>;

    fn removed_ids(&self, edge: &str) -> Vec<String>;

    /// Edges cleared wholesale.
    fn cleared_edges(&self) -> Vec<String>;

    /// Previous value of `name`. Only single-entity mutations support this.
    async fn old_field(&self, name: &str) -> Result<Option<Value>>;

    /// Re-read the entity under an elevated audit-only scope, bypassing the
    /// caller's privacy filters. `Ok(None)` when unsupported or not found.
    async fn elevated_snapshot(&self) -> Result<Option<EntitySnapshot>> {
        Ok(None)
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// What [`ChangeExtractor::extract`] produces for one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub payload: MutationPayload,
    /// Properties read from the elevated snapshot.
    pub headers: Headers,
    /// Cleared relation entries; `None` for operations that do not capture them.
    pub cleared: Option<ClearedMutation>,
}

/// Builds payloads from [`MutationSource`]s.
#[derive(Debug, Clone, Default)]
pub struct ChangeExtractor {
    header_fields: Vec<String>,
}

impl ChangeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `field` from the elevated snapshot into the envelope headers.
    pub fn with_header_field(mut self, field: impl Into<String>) -> Self {
        self.header_fields.push(field.into());
        self
    }

    pub async fn extract(&self, source: &dyn MutationSource) -> Extraction {
        let payload = build_payload(source);

        let cleared = if payload.operation.captures_cleared_relations() {
            let entries = collect_cleared_relation_entries(source).await;
            Some(ClearedMutation::new(
                payload.mutation_type.clone(),
                payload.operation,
                payload.entity_id.clone(),
                entries,
            ))
        } else {
            None
        };

        let headers = self.snapshot_headers(source).await;

        Extraction {
            payload,
            headers,
            cleared,
        }
    }

    async fn snapshot_headers(&self, source: &dyn MutationSource) -> Headers {
        let mut headers = Headers::new();
        if self.header_fields.is_empty() || source.entity_id().is_none() {
            return headers;
        }

        let snapshot = match source.elevated_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return headers,
            Err(e) => {
                debug!(
                    entity_type = source.entity_type(),
                    error = %e,
                    "elevated snapshot unavailable, headers skipped"
                );
                return headers;
            }
        };

        for name in &self.header_fields {
            if let Some(value) = snapshot.field(name).as_ref().and_then(scalar_string) {
                headers.insert(name.clone(), value);
            }
        }
        headers
    }
}

/// Build the payload for `source`.
///
/// Field values of changed fields become `proposed_changes`; cleared fields
/// get no entry. `UpdateOne` soft deletes are reported as
/// [`Operation::SoftDelete`].
pub fn build_payload(source: &dyn MutationSource) -> MutationPayload {
    let operation = match source.operation() {
        Operation::UpdateOne if source.is_soft_delete() => Operation::SoftDelete,
        op => op,
    };

    let mut payload = MutationPayload::new(source.entity_type(), operation);
    payload.entity_id = source.entity_id().filter(|id| !id.trim().is_empty());

    let cleared: BTreeSet<String> = source.cleared_fields().into_iter().collect();
    for name in source.changed_fields() {
        if cleared.contains(&name) {
            continue;
        }
        match source.field(&name) {
            Some(value) => payload = payload.with_change(name, value),
            None => {
                if !payload.changed_fields.contains(&name) {
                    payload.changed_fields.push(name);
                }
            }
        }
    }
    for name in source.cleared_fields() {
        payload = payload.with_cleared(name);
    }

    for edge in source.added_edges() {
        let ids = normalize_ids(source.added_ids(&edge));
        payload = payload.with_added_ids(edge, ids);
    }
    for edge in source.removed_edges() {
        let ids = normalize_ids(source.removed_ids(&edge));
        payload = payload.with_removed_ids(edge, ids);
    }
    for edge in source.cleared_edges() {
        if !payload.changed_edges.contains(&edge) {
            payload.changed_edges.push(edge);
        }
    }

    payload
}

/// Compute the cleared relation entries of `source`, normalized.
///
/// - explicit edge removals become [`RelationAction::EdgeRemoved`] with the removed ids
/// - wholesale edge clears become [`RelationAction::EdgeCleared`] without enumerating ids
/// - cleared id-shaped fields become [`RelationAction::FieldCleared`] with the old value
/// - overwritten id-shaped fields become [`RelationAction::FieldReplaced`] with the ids
///   present before and absent after
pub async fn collect_cleared_relation_entries(
    source: &dyn MutationSource,
) -> Vec<ClearedRelationEntry> {
    let mut entries = Vec::new();

    for edge in source.removed_edges() {
        let ids = normalize_ids(source.removed_ids(&edge));
        if ids.is_empty() {
            continue;
        }
        entries.push(ClearedRelationEntry::new(
            edge,
            RelationKind::Edge,
            RelationAction::EdgeRemoved,
            ids,
        ));
    }

    for edge in source.cleared_edges() {
        entries.push(ClearedRelationEntry::new(
            edge,
            RelationKind::Edge,
            RelationAction::EdgeCleared,
            Vec::new(),
        ));
    }

    let cleared_fields = source.cleared_fields();
    for name in cleared_fields.iter().filter(|f| is_id_like_field(f)) {
        let Some(old) = old_value(source, name).await else {
            continue;
        };
        let ids = value_ids(&old);
        if ids.is_empty() {
            continue;
        }
        entries.push(ClearedRelationEntry::new(
            name.clone(),
            RelationKind::Field,
            RelationAction::FieldCleared,
            ids,
        ));
    }

    for name in source
        .changed_fields()
        .iter()
        .filter(|f| is_id_like_field(f) && !cleared_fields.contains(*f))
    {
        let Some(old) = old_value(source, name).await else {
            continue;
        };
        let new_ids: BTreeSet<String> = source
            .field(name)
            .map(|v| value_ids(&v))
            .unwrap_or_default()
            .into_iter()
            .collect();
        let removed: Vec<String> = value_ids(&old)
            .into_iter()
            .filter(|id| !new_ids.contains(id))
            .collect();
        if removed.is_empty() {
            continue;
        }
        entries.push(ClearedRelationEntry::new(
            name.clone(),
            RelationKind::Field,
            RelationAction::FieldReplaced,
            removed,
        ));
    }

    crate::cleared::normalize_entries(entries)
}

async fn old_value(source: &dyn MutationSource, name: &str) -> Option<Value> {
    match source.old_field(name).await {
        Ok(value) => value,
        Err(e) => {
            debug!(
                entity_type = source.entity_type(),
                field = name,
                error = %e,
                "old value lookup failed, skipping field"
            );
            None
        }
    }
}

/// Ids held by an id-shaped value: a string, a number, or an array of either.
fn value_ids(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => normalize_ids(items.iter().filter_map(scalar_string)),
        other => normalize_ids(scalar_string(other)),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
