//! Table of requests awaiting a response.
//!
//! Keyed by [`RequestId`] and iterated in ascending id order. The table has
//! no lock of its own: it lives inside the session state and every access
//! happens under the session mutex.

use std::collections::BTreeMap;

use crate::request::{RequestDescriptor, RequestId};

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: BTreeMap<RequestId, RequestDescriptor>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor. Returns it back if its id is already taken.
    pub(crate) fn insert(
        &mut self,
        descriptor: RequestDescriptor,
    ) -> Result<(), RequestDescriptor> {
        if self.entries.contains_key(&descriptor.id) {
            return Err(descriptor);
        }
        self.entries.insert(descriptor.id, descriptor);
        Ok(())
    }

    /// Looks up and removes in one step.
    pub(crate) fn take(&mut self, id: RequestId) -> Option<RequestDescriptor> {
        self.entries.remove(&id)
    }

    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending ids in ascending order.
    pub(crate) fn ids(&self) -> Vec<RequestId> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestKind;

    fn write_descriptor(id: RequestId) -> RequestDescriptor {
        RequestDescriptor::new(id, RequestKind::Write { extents: Vec::new() })
    }

    #[test]
    fn take_removes_exactly_once() {
        let mut table = PendingTable::new();
        assert!(table.insert(write_descriptor(1)).is_ok());
        assert!(table.insert(write_descriptor(2)).is_ok());

        assert_eq!(table.take(1).map(|d| d.id), Some(1));
        assert!(table.take(1).is_none());
        assert!(!table.contains(1));
        assert!(table.contains(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let mut table = PendingTable::new();
        assert!(table.insert(write_descriptor(5)).is_ok());
        let rejected = table.insert(write_descriptor(5)).err().map(|d| d.id);
        assert_eq!(rejected, Some(5));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ids_are_ordered() {
        let mut table = PendingTable::new();
        for id in [9, 3, 6] {
            assert!(table.insert(write_descriptor(id)).is_ok());
        }
        assert_eq!(table.ids(), vec![3, 6, 9]);
        assert!(!table.is_empty());
    }
}
