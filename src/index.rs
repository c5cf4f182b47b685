//! In-memory index: key -> entry, plus the reverse lookup tables the
//! compactor needs to retarget a moved record or slot, and the expiry heap.

use std::collections::{BTreeMap, HashMap};

use crate::heap::ExpiryHeap;

/// Everything the engine tracks in memory about one live key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub key_id: u64,
    pub bucket: u8,
    pub slot_idx: u64,
    pub length: u32,
    /// Unix-milliseconds; 0 means no expiry.
    pub expiry: i64,
    pub cas: u64,
}

/// Ordered key index plus the reverse maps needed to support compaction and
/// TTL expiry without a linear scan.
#[derive(Default)]
pub struct Index {
    by_key: BTreeMap<Vec<u8>, IndexEntry>,
    by_key_id: HashMap<u64, Vec<u8>>,
    by_slot: HashMap<(u8, u64), Vec<u8>>,
    pub heap: ExpiryHeap,
}

impl Index {
    pub fn new() -> Self {
        Self {
            by_key: BTreeMap::new(),
            by_key_id: HashMap::new(),
            by_slot: HashMap::new(),
            heap: ExpiryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.by_key.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut IndexEntry> {
        self.by_key.get_mut(key)
    }

    pub fn key_by_key_id(&self, key_id: u64) -> Option<Vec<u8>> {
        self.by_key_id.get(&key_id).cloned()
    }

    pub fn key_by_slot(&self, bucket: u8, slot_idx: u64) -> Option<Vec<u8>> {
        self.by_slot.get(&(bucket, slot_idx)).cloned()
    }

    /// Iterates over every live entry in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &IndexEntry)> {
        self.by_key.iter()
    }

    /// Creates or overwrites the entry for `key`, refreshing every reverse
    /// map and the expiry heap to match. Used whenever an entry's full set
    /// of fields (bucket, slot, cas, expiry) is freshly known, i.e. on
    /// create and on same-bucket overwrite -- callers that only relocate a
    /// slot or keyId should use `relocate_slot`/`relocate_key_id` instead so
    /// they don't have to reconstruct the rest of the entry.
    pub fn upsert(&mut self, key: Vec<u8>, entry: IndexEntry) -> Option<IndexEntry> {
        self.by_key_id.insert(entry.key_id, key.clone());
        self.by_slot.insert((entry.bucket, entry.slot_idx), key.clone());
        if entry.expiry > 0 {
            self.heap.insert_or_update(entry.key_id, entry.expiry);
        } else {
            self.heap.remove(entry.key_id);
        }
        self.by_key.insert(key, entry)
    }

    /// Fully removes `key` from every index structure. Must run before the
    /// compactor moves any tail record/slot so a redirected update can never
    /// be misrouted back to the entry being destroyed.
    pub fn remove(&mut self, key: &[u8]) -> Option<IndexEntry> {
        let entry = self.by_key.remove(key)?;
        self.by_key_id.remove(&entry.key_id);
        self.by_slot.remove(&(entry.bucket, entry.slot_idx));
        self.heap.remove(entry.key_id);
        Some(entry)
    }

    /// Drops the `(bucket, slot_idx) -> key` mapping without touching
    /// anything else, used when a slot is freed without the whole entry
    /// being destroyed (a same-key rebucketing overwrite).
    pub fn forget_slot(&mut self, bucket: u8, slot_idx: u64) {
        self.by_slot.remove(&(bucket, slot_idx));
    }

    /// Moves the owner of `(bucket, old_slot)` to `(bucket, new_slot)`,
    /// updating both the reverse map and the entry's `slot_idx`. Returns the
    /// key that moved, so the caller can persist the updated `KeyRecord`.
    pub fn relocate_slot(&mut self, bucket: u8, old_slot: u64, new_slot: u64) -> Option<Vec<u8>> {
        let key = self.by_slot.remove(&(bucket, old_slot))?;
        self.by_slot.insert((bucket, new_slot), key.clone());
        if let Some(entry) = self.by_key.get_mut(&key) {
            entry.slot_idx = new_slot;
        }
        Some(key)
    }

    /// Moves the owner of `old_key_id` to `new_key_id`, updating the reverse
    /// map, the entry's `key_id`, and re-keying the expiry heap. Returns the
    /// key that moved.
    pub fn relocate_key_id(&mut self, old_key_id: u64, new_key_id: u64) -> Option<Vec<u8>> {
        let key = self.by_key_id.remove(&old_key_id)?;
        self.by_key_id.insert(new_key_id, key.clone());
        if let Some(entry) = self.by_key.get_mut(&key) {
            entry.key_id = new_key_id;
        }
        self.heap.rekey(old_key_id, new_key_id);
        Some(key)
    }

    /// Drops every entry and reverse mapping, used by `FLUSH_ALL`.
    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_key_id.clear();
        self.by_slot.clear();
        self.heap = ExpiryHeap::new();
    }
}
