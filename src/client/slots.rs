//! Pending-result slots for out-of-band transports.
//!
//! The dispatcher creates a slot before handing a request to the submitter;
//! the submitter's callback later completes it by correlation id. Both sides
//! go through a `parking_lot` mutex whose critical section is a single map
//! lookup/update, so the registry is safe on a multi-threaded runtime.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use super::request::CorrelationId;

/// Raw result delivered for a slot, tagged with who issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCompletion {
    /// Raw JSON body handed to the callback
    pub raw_json: String,
    /// Address that issued the request
    pub issued_by: String,
}

struct Slot {
    token: u64,
    issued_by: String,
    sender: oneshot::Sender<SlotCompletion>,
}

/// Registry of in-flight out-of-band requests keyed by correlation id.
#[derive(Default)]
pub struct SlotRegistry {
    slots: Mutex<HashMap<CorrelationId, Slot>>,
    next_token: AtomicU64,
}

impl SlotRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `id`, retiring any slot already tracked under it.
    ///
    /// The returned guard removes the slot when dropped unless a newer
    /// attempt has replaced it in the meantime.
    pub fn create(
        &self,
        id: CorrelationId,
        issued_by: impl Into<String>,
    ) -> (SlotGuard<'_>, oneshot::Receiver<SlotCompletion>) {
        let (sender, receiver) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            token,
            issued_by: issued_by.into(),
            sender,
        };

        let retired = self.slots.lock().insert(id.clone(), slot);
        if retired.is_some() {
            debug!(correlation_id = %id, "retired previous pending slot");
        }

        let guard = SlotGuard {
            registry: self,
            id,
            token,
        };
        (guard, receiver)
    }

    /// Complete the slot for `id`. Returns `false` if nothing is waiting.
    pub fn try_complete(&self, id: &CorrelationId, raw_json: impl Into<String>) -> bool {
        let Some(slot) = self.slots.lock().remove(id) else {
            return false;
        };

        slot.sender
            .send(SlotCompletion {
                raw_json: raw_json.into(),
                issued_by: slot.issued_by,
            })
            .is_ok()
    }

    /// Remove the slot for `id` if it is still the one identified by `token`.
    pub fn remove(&self, id: &CorrelationId, token: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(id) {
            Some(slot) if slot.token == token => {
                slots.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Drop every slot; waiting receivers observe a closed channel.
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let count = slots.len();
        slots.clear();
        count
    }

    /// Whether a slot is tracked for `id`
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.slots.lock().contains_key(id)
    }

    /// Number of tracked slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True when no slots are tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its slot on drop (cancellation, failure or success).
pub struct SlotGuard<'a> {
    registry: &'a SlotRegistry,
    id: CorrelationId,
    token: u64,
}

impl SlotGuard<'_> {
    /// Correlation id this guard tracks
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_resolves_receiver() {
        let registry = SlotRegistry::new();
        let id = CorrelationId::from_string("req-1");
        let (_guard, receiver) = registry.create(id.clone(), "alice");

        assert!(registry.try_complete(&id, r#"{"Messages":[]}"#));
        let completion = receiver.await.expect("completion");
        assert_eq!(completion.issued_by, "alice");
        assert_eq!(completion.raw_json, r#"{"Messages":[]}"#);
        assert!(!registry.try_complete(&id, "late"));
    }

    #[tokio::test]
    async fn test_new_attempt_retires_previous() {
        let registry = SlotRegistry::new();
        let id = CorrelationId::from_string("req-1");
        let (old_guard, old_receiver) = registry.create(id.clone(), "alice");
        let (_new_guard, new_receiver) = registry.create(id.clone(), "alice");

        assert!(old_receiver.await.is_err(), "old slot should be retired");
        drop(old_guard);
        assert!(registry.contains(&id), "old guard must not remove the new slot");

        assert!(registry.try_complete(&id, "{}"));
        assert!(new_receiver.await.is_ok());
    }

    #[test]
    fn test_guard_drop_removes_slot() {
        let registry = SlotRegistry::new();
        let id = CorrelationId::from_string("req-2");
        {
            let (_guard, _receiver) = registry.create(id.clone(), "bob");
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
