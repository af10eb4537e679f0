//! The value objects handed to listeners and written to the outbox.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{EventId, Headers, Operation, TopicName};

/// Structured snapshot of what one mutation did.
///
/// Every listener receives the same payload whether it runs inline or from
/// the durable queue.
///
/// `proposed_changes` keys are always a subset of
/// `changed_fields ∪ cleared_fields`. A cleared field without a
/// `proposed_changes` entry was set to its zero value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MutationPayload {
    /// Logical entity/schema name, e.g. `TrustCenter`.
    pub mutation_type: String,
    pub operation: Operation,
    /// Primary id; absent for bulk operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub cleared_fields: Vec<String>,
    /// Relation names touched by the mutation.
    #[serde(default)]
    pub changed_edges: Vec<String>,
    #[serde(default)]
    pub added_ids: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub removed_ids: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub proposed_changes: BTreeMap<String, Value>,
}

/// A `proposed_changes` key that is neither changed nor cleared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("proposed change for {field} is not a changed or cleared field")]
pub struct StrayProposedChange {
    pub field: String,
}

impl MutationPayload {
    pub fn new(mutation_type: impl Into<String>, operation: Operation) -> Self {
        Self {
            mutation_type: mutation_type.into(),
            operation,
            ..Default::default()
        }
    }

    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    /// Record a field change and its new value.
    pub fn with_change(mut self, field: impl Into<String>, value: Value) -> Self {
        let field = field.into();
        push_unique(&mut self.changed_fields, &field);
        self.proposed_changes.insert(field, value);
        self
    }

    /// Record a field set to its zero value.
    pub fn with_cleared(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        push_unique(&mut self.cleared_fields, &field);
        self
    }

    pub fn with_added_ids(mut self, edge: impl Into<String>, ids: Vec<String>) -> Self {
        let edge = edge.into();
        push_unique(&mut self.changed_edges, &edge);
        self.added_ids.insert(edge, ids);
        self
    }

    pub fn with_removed_ids(mut self, edge: impl Into<String>, ids: Vec<String>) -> Self {
        let edge = edge.into();
        push_unique(&mut self.changed_edges, &edge);
        self.removed_ids.insert(edge, ids);
        self
    }

    /// Whether `field` was changed or cleared.
    pub fn touches(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|f| f == field)
            || self.cleared_fields.iter().any(|f| f == field)
    }

    /// New value of `field`.
    ///
    /// Cleared fields without a proposed value read as `Value::Null`;
    /// untouched fields read as `None`.
    pub fn new_value(&self, field: &str) -> Option<Value> {
        match self.proposed_changes.get(field) {
            Some(value) => Some(value.clone()),
            None if self.cleared_fields.iter().any(|f| f == field) => Some(Value::Null),
            None => None,
        }
    }

    /// New value of `field` as a string, when it is one.
    pub fn new_str(&self, field: &str) -> Option<&str> {
        self.proposed_changes.get(field).and_then(Value::as_str)
    }

    /// Check the `proposed_changes ⊆ changed ∪ cleared` invariant.
    pub fn check_proposed_changes(&self) -> Result<(), StrayProposedChange> {
        let touched: BTreeSet<&str> = self
            .changed_fields
            .iter()
            .chain(self.cleared_fields.iter())
            .map(String::as_str)
            .collect();

        match self
            .proposed_changes
            .keys()
            .find(|key| !touched.contains(key.as_str()))
        {
            Some(field) => Err(StrayProposedChange {
                field: field.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

/// One emission of a payload on a topic.
///
/// Built once by the emitter, written by the outbox inside the mutation's
/// transaction, and decoded by the dispatch worker. Never mutated after
/// it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EventId,
    pub topic: TopicName,
    pub payload: MutationPayload,
    #[serde(default)]
    pub headers: Headers,
    pub occurred_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(topic: TopicName, payload: MutationPayload) -> Self {
        Self {
            id: EventId::new(),
            topic,
            payload,
            headers: Headers::default(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn operation(&self) -> Operation {
        self.payload.operation
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.payload.entity_id.as_deref()
    }

    /// Serialize for a queue record's `args` column.
    pub fn to_args(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_args(args: &Value) -> serde_json::Result<Self> {
        Envelope::deserialize(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_keeps_invariant() {
        let payload = MutationPayload::new("TrustCenter", Operation::UpdateOne)
            .with_entity_id("tc-1")
            .with_change("visibility", json!("PUBLICLY_VISIBLE"))
            .with_cleared("custom_domain_id");

        assert!(payload.check_proposed_changes().is_ok());
        assert_eq!(payload.changed_fields, vec!["visibility"]);
        assert_eq!(payload.new_str("visibility"), Some("PUBLICLY_VISIBLE"));
        assert_eq!(payload.new_value("custom_domain_id"), Some(Value::Null));
        assert_eq!(payload.new_value("name"), None);
    }

    #[test]
    fn test_stray_proposed_change_detected() {
        let mut payload = MutationPayload::new("TrustCenter", Operation::UpdateOne);
        payload
            .proposed_changes
            .insert("name".to_string(), json!("x"));

        let err = payload.check_proposed_changes().unwrap_err();
        assert_eq!(err.field, "name");
    }

    #[test]
    fn test_duplicate_changes_not_repeated() {
        let payload = MutationPayload::new("Control", Operation::UpdateOne)
            .with_change("status", json!("APPROVED"))
            .with_change("status", json!("ARCHIVED"));

        assert_eq!(payload.changed_fields, vec!["status"]);
        assert_eq!(payload.new_str("status"), Some("ARCHIVED"));
    }

    #[test]
    fn test_envelope_args_decode() {
        let envelope = Envelope::new(
            TopicName::for_entity("Control"),
            MutationPayload::new("Control", Operation::Create).with_entity_id("c-1"),
        )
        .with_headers(Headers::new().with_property("owner_id", "org-1"));

        let args = envelope.to_args().unwrap();
        assert_eq!(args["payload"]["operation"], json!("Create"));

        let decoded = Envelope::from_args(&args).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.entity_id(), Some("c-1"));
    }
}
