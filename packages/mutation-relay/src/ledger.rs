//! Redelivery de-duplication keyed on envelope ids.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::core::EventId;

/// One-shot keys older than this are dropped on the next [`DeliveryLedger::forget`].
pub const DEFAULT_ONE_SHOT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Remembers which `(envelope, listener)` pairs already succeeded.
///
/// The dispatch worker consults it so a redelivered envelope skips the
/// listeners that completed on an earlier attempt. Listeners with
/// non-idempotent effects can also claim a one-shot key through
/// [`DeliveryLedger::first_delivery`].
///
/// Listener entries are dropped when their job is finalized. One-shot keys
/// live in their own map and outlive the job, since a late redelivery of a
/// finished job must still see them; they expire after a retention window.
///
/// The ledger is process-local; a durable deployment that needs
/// de-duplication across worker restarts keys an external store on
/// [`EventId`] instead.
#[derive(Debug)]
pub struct DeliveryLedger {
    delivered: DashMap<(EventId, String), ()>,
    one_shot: DashMap<(EventId, String), Instant>,
    one_shot_retention: Duration,
}

impl Default for DeliveryLedger {
    fn default() -> Self {
        Self::with_one_shot_retention(DEFAULT_ONE_SHOT_RETENTION)
    }
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_one_shot_retention(retention: Duration) -> Self {
        Self {
            delivered: DashMap::new(),
            one_shot: DashMap::new(),
            one_shot_retention: retention,
        }
    }

    pub fn is_delivered(&self, event_id: EventId, listener: &str) -> bool {
        self.delivered.contains_key(&(event_id, listener.to_string()))
    }

    pub fn mark_delivered(&self, event_id: EventId, listener: &str) {
        self.delivered.insert((event_id, listener.to_string()), ());
    }

    /// Returns `true` exactly once per `(event_id, key)` within the
    /// retention window.
    pub fn first_delivery(&self, event_id: EventId, key: &str) -> bool {
        match self.one_shot.entry((event_id, key.to_string())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    /// Forget the listener entries of `event_id` once its job is finalized.
    ///
    /// One-shot keys are kept; only those past their retention are pruned.
    pub fn forget(&self, event_id: EventId) {
        self.delivered.retain(|(id, _), _| *id != event_id);
        let retention = self.one_shot_retention;
        self.one_shot
            .retain(|_, claimed_at| claimed_at.elapsed() < retention);
    }

    /// Number of listener entries.
    pub fn len(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }

    pub fn one_shot_len(&self) -> usize {
        self.one_shot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mark_and_check() {
        let ledger = DeliveryLedger::new();
        let id = EventId::new();

        assert!(!ledger.is_delivered(id, "cache"));
        ledger.mark_delivered(id, "cache");
        assert!(ledger.is_delivered(id, "cache"));
        assert!(!ledger.is_delivered(id, "slack"));
        assert!(!ledger.is_delivered(EventId::new(), "cache"));
    }

    #[test]
    fn test_first_delivery_once_under_contention() {
        let ledger = Arc::new(DeliveryLedger::new());
        let id = EventId::new();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.first_delivery(id, "email"))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_forget_only_drops_one_event() {
        let ledger = DeliveryLedger::new();
        let a = EventId::new();
        let b = EventId::new();
        ledger.mark_delivered(a, "cache");
        ledger.mark_delivered(b, "cache");

        ledger.forget(a);
        assert!(!ledger.is_delivered(a, "cache"));
        assert!(ledger.is_delivered(b, "cache"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_forget_keeps_one_shot_keys() {
        let ledger = DeliveryLedger::new();
        let id = EventId::new();
        ledger.mark_delivered(id, "cache");
        assert!(ledger.first_delivery(id, "send-email"));

        ledger.forget(id);
        assert!(ledger.is_empty());
        assert_eq!(ledger.one_shot_len(), 1);
        // A redelivery after the job finished must not repeat the effect.
        assert!(!ledger.first_delivery(id, "send-email"));
    }

    #[test]
    fn test_expired_one_shot_keys_are_pruned() {
        let ledger = DeliveryLedger::with_one_shot_retention(Duration::ZERO);
        let id = EventId::new();
        assert!(ledger.first_delivery(id, "send-email"));

        ledger.forget(EventId::new());
        assert_eq!(ledger.one_shot_len(), 0);
    }
}
