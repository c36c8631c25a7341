//! Retransmission guard
//!
//! Devices resend events they did not see acknowledged, so the same
//! identity triple can arrive more than once. Two checks run before an
//! event reaches the write buffer:
//!
//! 1. a bounded FIFO set of recently admitted identities (covers events
//!    still sitting in the buffer)
//! 2. an existence lookup in the durable store
//!
//! The store's uniqueness constraint remains the authority; these checks
//! only keep duplicates out of the buffer and away from observers.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::storage::{EventIdentity, EventStore};

/// Result of a duplicate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Fresh,
    /// Already admitted recently
    RecentDuplicate,
    /// Already persisted
    StoredDuplicate,
}

impl Verdict {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Verdict::Fresh)
    }
}

#[derive(Default)]
struct RecentSet {
    order: VecDeque<EventIdentity>,
    members: HashSet<EventIdentity>,
}

pub struct Deduplicator {
    store: Arc<dyn EventStore>,
    recent: Mutex<RecentSet>,
    capacity: usize,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn EventStore>, capacity: usize) -> Self {
        Self {
            store,
            recent: Mutex::new(RecentSet::default()),
            capacity: capacity.max(1),
        }
    }

    fn recent(&self) -> MutexGuard<'_, RecentSet> {
        self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check an identity and admit it if fresh
    ///
    /// A failed store lookup admits the event; the insert-if-absent write
    /// still keeps the store free of copies.
    pub async fn check(&self, identity: EventIdentity) -> Verdict {
        if !self.admit(identity) {
            tracing::debug!(identity = %identity, "Duplicate of a recent event");
            return Verdict::RecentDuplicate;
        }

        match self.store.contains_event(&identity).await {
            Ok(true) => {
                tracing::debug!(identity = %identity, "Duplicate of a stored event");
                Verdict::StoredDuplicate
            }
            Ok(false) => Verdict::Fresh,
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Duplicate lookup failed, admitting event");
                Verdict::Fresh
            }
        }
    }

    /// Insert into the recent set; false if it was already there
    fn admit(&self, identity: EventIdentity) -> bool {
        let mut guard = self.recent();
        let recent = &mut *guard;
        if !recent.members.insert(identity) {
            return false;
        }
        recent.order.push_back(identity);

        while recent.order.len() > self.capacity {
            if let Some(evicted) = recent.order.pop_front() {
                recent.members.remove(&evicted);
            }
        }
        true
    }

    /// Drop identities from the recent set so a redelivery is admitted
    ///
    /// Used when the write buffer gives up on a batch.
    pub fn forget<'a>(&self, identities: impl IntoIterator<Item = &'a EventIdentity>) {
        let mut guard = self.recent();
        let recent = &mut *guard;
        let mut forgotten = HashSet::new();
        for identity in identities {
            if recent.members.remove(identity) {
                forgotten.insert(*identity);
            }
        }
        if !forgotten.is_empty() {
            recent.order.retain(|id| !forgotten.contains(id));
            tracing::debug!(count = forgotten.len(), "Forgot identities of dropped batch");
        }
    }

    /// Identities currently held in memory
    pub fn recent_len(&self) -> usize {
        self.recent().members.len()
    }
}
