//! Cleared relation entries: which relations a mutation removed, cleared,
//! or replaced, and which ids it dropped along the way.
//!
//! Entries are normalized before they leave this module: ids are sorted and
//! de-duplicated, empty ids are dropped, entries sharing a
//! `(kind, name, action)` key are merged, and the list is sorted by that key.
//! Normalizing the same input twice yields byte-identical output.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Operation;

/// Whether a cleared relation was an edge or an id-shaped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Edge,
    Field,
}

/// What happened to the relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationAction {
    /// An edge was cleared wholesale.
    EdgeCleared,
    /// Specific ids were removed from an edge.
    EdgeRemoved,
    /// An id-shaped field was set to its zero value.
    FieldCleared,
    /// An id-shaped field was overwritten; `ids` holds the ids no longer referenced.
    FieldReplaced,
}

impl RelationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationAction::EdgeRemoved => "edge_removed",
            RelationAction::EdgeCleared => "edge_cleared",
            RelationAction::FieldCleared => "field_cleared",
            RelationAction::FieldReplaced => "field_replaced",
        }
    }
}

impl fmt::Display for RelationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relation a mutation detached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedRelationEntry {
    pub name: String,
    pub kind: RelationKind,
    pub action: RelationAction,
    #[serde(default)]
    pub ids: Vec<String>,
}

impl ClearedRelationEntry {
    pub fn new(
        name: impl Into<String>,
        kind: RelationKind,
        action: RelationAction,
        ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            action,
            ids: ids.into_iter().collect(),
        }
    }

    fn sort_key(&self) -> (RelationKind, &str, RelationAction) {
        (self.kind, self.name.as_str(), self.action)
    }
}

/// Sort, merge and clean a list of entries.
pub fn normalize_entries(entries: Vec<ClearedRelationEntry>) -> Vec<ClearedRelationEntry> {
    let mut merged: BTreeMap<(RelationKind, String, RelationAction), Vec<String>> =
        BTreeMap::new();

    for entry in entries {
        if entry.name.trim().is_empty() {
            continue;
        }
        merged
            .entry((entry.kind, entry.name, entry.action))
            .or_default()
            .extend(entry.ids);
    }

    let normalized: Vec<ClearedRelationEntry> = merged
        .into_iter()
        .map(|((kind, name, action), ids)| ClearedRelationEntry {
            name,
            kind,
            action,
            ids: normalize_ids(ids),
        })
        .collect();

    debug_assert!(normalized
        .windows(2)
        .all(|pair| pair[0].sort_key() < pair[1].sort_key()));

    normalized
}

/// Sort and de-duplicate ids, dropping blanks.
pub fn normalize_ids(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut ids: Vec<String> = ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Whether a field name looks like it holds one or more entity ids.
pub fn is_id_like_field(name: &str) -> bool {
    name.ends_with("_id") || name.ends_with("_ids")
}

/// Whether a relation name refers to file attachments.
pub fn is_file_relation_name(name: &str) -> bool {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return false;
    }

    name == "file"
        || name == "files"
        || name.contains("_file_")
        || name.contains("file_id")
        || name.ends_with("_file")
        || name.ends_with("_files")
        || name.starts_with("file_")
        || name.starts_with("files_")
}

/// Cleared relation entries computed for one mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedMutation {
    pub mutation_type: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub entries: Vec<ClearedRelationEntry>,
}

impl ClearedMutation {
    pub fn new(
        mutation_type: impl Into<String>,
        operation: Operation,
        entity_id: Option<String>,
        entries: Vec<ClearedRelationEntry>,
    ) -> Self {
        Self {
            mutation_type: mutation_type.into(),
            operation,
            entity_id,
            entries: normalize_entries(entries),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry detached a file relation.
    pub fn has_file_relations(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| is_file_relation_name(&entry.name))
    }

    /// Ids detached from file relations, in entry order.
    pub fn file_ids(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|entry| is_file_relation_name(&entry.name))
            .flat_map(|entry| entry.ids.iter().map(String::as_str))
    }
}
