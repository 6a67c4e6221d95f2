//! Per-process open tracking.
//!
//! Every process (client id) holding an open handle on a device gets one
//! entry: a reference count driven by open/release, and a bitmap of the
//! queues that process currently has enabled. The bitmap lets process-exit
//! cleanup disable exactly that process's queues without trusting a scan of
//! global queue state.
//!
//! The table is owned by the device aggregate and guarded by the device
//! state lock; the cleanup cascade itself lives in [`crate::queue`] because
//! it walks queue state.

use alloc::collections::BTreeMap;

use crate::framework::ClientId;
use crate::MAX_QUEUE_CTXS;

const BITMAP_BYTES: usize = MAX_QUEUE_CTXS / 8;

/// One tracked client: reference count plus enabled-queue bitmap.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub tgid: ClientId,
    open_count: u32,
    enabled_queues: [u8; BITMAP_BYTES],
}

impl ClientEntry {
    fn new(tgid: ClientId) -> Self {
        ClientEntry {
            tgid,
            open_count: 1,
            enabled_queues: [0; BITMAP_BYTES],
        }
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn queue_is_enabled(&self, queue_idx: usize) -> bool {
        let byte = queue_idx / 8;
        let bit = 1 << (queue_idx % 8);
        self.enabled_queues[byte] & bit != 0
    }

    pub fn queue_add(&mut self, queue_idx: usize) {
        let byte = queue_idx / 8;
        let bit = 1 << (queue_idx % 8);
        self.enabled_queues[byte] |= bit;
    }

    pub fn queue_remove(&mut self, queue_idx: usize) {
        let byte = queue_idx / 8;
        let bit = 1 << (queue_idx % 8);
        self.enabled_queues[byte] &= !bit;
    }

    pub fn clear_queues(&mut self) {
        self.enabled_queues = [0; BITMAP_BYTES];
    }
}

/// Outcome of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// No entry for that client.
    NotFound,
    /// References remain; nothing to clean up.
    StillOpen,
    /// That was the last reference: the caller must run the cleanup
    /// cascade and then remove the entry.
    LastReference,
}

/// Client-id keyed table of open tracking entries.
#[derive(Debug, Default)]
pub struct ClientTable {
    entries: BTreeMap<ClientId, ClientEntry>,
}

impl ClientTable {
    pub fn new() -> Self {
        ClientTable {
            entries: BTreeMap::new(),
        }
    }

    pub fn find(&self, tgid: ClientId) -> Option<&ClientEntry> {
        self.entries.get(&tgid)
    }

    pub fn find_mut(&mut self, tgid: ClientId) -> Option<&mut ClientEntry> {
        self.entries.get_mut(&tgid)
    }

    /// Take a reference for `tgid`, creating a fresh zeroed entry on the
    /// first open.
    pub fn get_or_create(&mut self, tgid: ClientId) -> &mut ClientEntry {
        use alloc::collections::btree_map::Entry;

        match self.entries.entry(tgid) {
            Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                entry.open_count += 1;
                entry
            }
            Entry::Vacant(slot) => slot.insert(ClientEntry::new(tgid)),
        }
    }

    /// Drop one reference for `tgid`. At zero the entry stays in the table
    /// until [`ClientTable::remove`] so the cleanup cascade can still read
    /// its bitmap.
    pub fn put(&mut self, tgid: ClientId) -> PutResult {
        match self.entries.get_mut(&tgid) {
            None => PutResult::NotFound,
            Some(entry) => {
                entry.open_count = entry.open_count.saturating_sub(1);
                if entry.open_count == 0 {
                    PutResult::LastReference
                } else {
                    PutResult::StillOpen
                }
            }
        }
    }

    pub fn remove(&mut self, tgid: ClientId) {
        self.entries.remove(&tgid);
    }

    pub fn tgids(&self) -> alloc::vec::Vec<ClientId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_counts_references() {
        let mut table = ClientTable::new();
        table.get_or_create(10);
        assert_eq!(table.find(10).unwrap().open_count(), 1);

        table.get_or_create(10);
        assert_eq!(table.find(10).unwrap().open_count(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_put_reaches_last_reference() {
        let mut table = ClientTable::new();
        table.get_or_create(7);
        table.get_or_create(7);

        assert_eq!(table.put(7), PutResult::StillOpen);
        assert_eq!(table.put(7), PutResult::LastReference);
        // Entry survives until the cascade removes it.
        assert!(table.find(7).is_some());
        table.remove(7);
        assert!(table.find(7).is_none());
    }

    #[test]
    fn test_put_unknown_client() {
        let mut table = ClientTable::new();
        assert_eq!(table.put(99), PutResult::NotFound);
    }

    #[test]
    fn test_enabled_queue_bitmap() {
        let mut table = ClientTable::new();
        let entry = table.get_or_create(3);

        assert!(!entry.queue_is_enabled(0));
        entry.queue_add(0);
        entry.queue_add(63);
        entry.queue_add(127);
        assert!(entry.queue_is_enabled(0));
        assert!(entry.queue_is_enabled(63));
        assert!(entry.queue_is_enabled(127));
        assert!(!entry.queue_is_enabled(64));

        entry.queue_remove(63);
        assert!(!entry.queue_is_enabled(63));
        assert!(entry.queue_is_enabled(127));

        entry.clear_queues();
        assert!(!entry.queue_is_enabled(0));
        assert!(!entry.queue_is_enabled(127));
    }
}
