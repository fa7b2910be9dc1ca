use std::collections::HashSet;

/// Item ids currently held by an active sync batch.
///
/// A record whose item is in the set is never drained into a second batch
/// until the owning batch finishes downstream processing.
#[derive(Debug, Default)]
pub struct InFlightItems {
    ids: HashSet<u64>,
}

impl InFlightItems {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, item_id: u64) -> bool {
        self.ids.contains(&item_id)
    }

    /// Returns false if the item was already in flight.
    pub fn insert(&mut self, item_id: u64) -> bool {
        self.ids.insert(item_id)
    }

    pub fn remove_all<I: IntoIterator<Item = u64>>(&mut self, ids: I) {
        for id in ids {
            self.ids.remove(&id);
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
