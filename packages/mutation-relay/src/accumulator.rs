//! Per-request buffer of cleared relation entries.
//!
//! One [`ClearedAccumulator`] is created per request and threaded through the
//! mutation pipeline explicitly. Each mutation's [`ClearedMutation`] is
//! recorded as it is extracted; the request handler drains the buffer once
//! with [`ClearedAccumulator::consume`] after the transaction commits.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use crate::cleared::{normalize_ids, ClearedMutation};

#[derive(Default)]
pub struct ClearedAccumulator {
    buffer: Mutex<Vec<ClearedMutation>>,
}

impl ClearedAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ClearedMutation>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("cleared accumulator lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Append a mutation's entries. Mutations with no entries are ignored.
    pub fn record(&self, cleared: ClearedMutation) {
        if cleared.is_empty() {
            return;
        }
        self.lock().push(cleared);
    }

    /// Copy of the buffered mutations, leaving the buffer intact.
    pub fn cleared_mutations(&self) -> Vec<ClearedMutation> {
        self.lock().clone()
    }

    /// Return every buffered mutation and empty the buffer.
    ///
    /// Draining is atomic: a second call returns an empty list unless new
    /// mutations were recorded in between.
    pub fn consume(&self) -> Vec<ClearedMutation> {
        std::mem::take(&mut *self.lock())
    }

    pub fn has_cleared_file_relations(&self) -> bool {
        self.lock().iter().any(ClearedMutation::has_file_relations)
    }

    /// Ids detached from file relations across every buffered mutation,
    /// sorted and de-duplicated.
    pub fn cleared_file_ids(&self) -> Vec<String> {
        let ids: Vec<String> = self
            .lock()
            .iter()
            .flat_map(|cleared| cleared.file_ids().map(str::to_string).collect::<Vec<_>>())
            .collect();
        normalize_ids(ids)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for ClearedAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearedAccumulator")
            .field("buffered", &self.len())
            .finish()
    }
}
