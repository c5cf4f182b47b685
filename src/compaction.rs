//! Continuous defragmentation: every delete, rebucket, or expiry immediately
//! moves the tail slot/record into the hole it left behind and truncates,
//! so data and key files never carry dead space between operations.

use crate::error::Result;
use crate::index::Index;
use crate::record::KeyRecord;
use crate::storage::StorageSet;

/// Frees `slot_idx` in `bucket`'s data file by moving the last slot into it
/// (unless the freed slot already is the last one), then truncating the
/// file by one slot. `index` must no longer have a forward entry pointing
/// at `(bucket, slot_idx)` -- the caller deletes/relocates that first.
pub fn compact_data_slot(
    storage: &mut StorageSet,
    index: &mut Index,
    bucket: u8,
    slot_idx: u64,
) -> Result<()> {
    let count = storage.slot_count(bucket)?;
    debug_assert!(slot_idx < count, "freed slot must have existed");
    let tail = count - 1;

    if slot_idx != tail {
        let payload = storage.read_slot(bucket, tail)?;
        storage.write_slot(bucket, slot_idx, &payload)?;

        if let Some(key) = index.relocate_slot(bucket, tail, slot_idx) {
            let entry = index
                .get(&key)
                .expect("relocate_slot just confirmed this entry exists");
            let record = KeyRecord {
                key: key.clone(),
                cas: entry.cas,
                expiry: entry.expiry,
                bucket,
                slot_idx: slot_idx as i64,
            };
            storage.write_key_record(entry.key_id, &record)?;
        }
    }

    storage.truncate_data(bucket, tail)
}

/// Frees key-file slot `key_id` by moving the last `KeyRecord` into it
/// (unless it already is the last one), then truncating the key file by
/// one record. `index` must no longer have a forward entry pointing at
/// `key_id` -- the caller deletes/relocates that first.
pub fn compact_key_slot(storage: &mut StorageSet, index: &mut Index, key_id: u64) -> Result<()> {
    let count = storage.key_record_count()?;
    debug_assert!(key_id < count, "freed key slot must have existed");
    let tail = count - 1;

    if key_id != tail {
        let record = storage.read_key_record(tail)?;
        storage.write_key_record(key_id, &record)?;
        index.relocate_key_id(tail, key_id);
    }

    storage.truncate_keys(tail)
}

/// Fully destroys a live entry: removes it from the index first (so a
/// concurrent lookup can never observe half-destroyed state), then frees
/// its data slot and its key-file slot in that order.
pub fn destroy(storage: &mut StorageSet, index: &mut Index, key: &[u8]) -> Result<()> {
    let Some(entry) = index.remove(key) else {
        return Ok(());
    };
    compact_data_slot(storage, index, entry.bucket, entry.slot_idx)?;
    compact_key_slot(storage, index, entry.key_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Durability;
    use crate::index::IndexEntry;
    use std::time::Duration;
    use tempfile::tempdir;

    fn put(
        storage: &mut StorageSet,
        index: &mut Index,
        key_id: u64,
        key: &[u8],
        bucket: u8,
        slot_idx: u64,
        payload: &[u8],
    ) {
        storage.write_slot(bucket, slot_idx, payload).unwrap();
        storage
            .write_key_record(
                key_id,
                &KeyRecord {
                    key: key.to_vec(),
                    cas: 1,
                    expiry: 0,
                    bucket,
                    slot_idx: slot_idx as i64,
                },
            )
            .unwrap();
        index.upsert(
            key.to_vec(),
            IndexEntry {
                key_id,
                bucket,
                slot_idx,
                length: payload.len() as u32,
                expiry: 0,
                cas: 1,
            },
        );
    }

    #[test]
    fn destroy_middle_entry_moves_tail_into_hole() {
        let dir = tempdir().unwrap();
        let mut storage =
            StorageSet::open(dir.path(), Durability::None, Duration::from_secs(1), None).unwrap();
        let mut index = Index::new();

        put(&mut storage, &mut index, 0, b"a", 0, 0, b"AAAA");
        put(&mut storage, &mut index, 1, b"b", 0, 1, b"BBBB");
        put(&mut storage, &mut index, 2, b"c", 0, 2, b"CCCC");

        destroy(&mut storage, &mut index, b"a").unwrap();

        assert!(index.get(b"a").is_none());
        assert_eq!(storage.slot_count(0).unwrap(), 2);
        assert_eq!(storage.key_record_count().unwrap(), 2);

        // "c" (previously the tail) now occupies the freed slot and keyId.
        let c = index.get(b"c").unwrap();
        assert_eq!(c.slot_idx, 0);
        assert_eq!(c.key_id, 0);
        assert_eq!(storage.read_slot(0, 0).unwrap(), b"CCCC");
        let record = storage.read_key_record(0).unwrap();
        assert_eq!(record.key, b"c");
        assert_eq!(record.slot_idx, 0);

        // "b" is untouched.
        let b = index.get(b"b").unwrap();
        assert_eq!(b.slot_idx, 1);
        assert_eq!(b.key_id, 1);
    }

    #[test]
    fn destroy_tail_entry_just_truncates() {
        let dir = tempdir().unwrap();
        let mut storage =
            StorageSet::open(dir.path(), Durability::None, Duration::from_secs(1), None).unwrap();
        let mut index = Index::new();

        put(&mut storage, &mut index, 0, b"a", 0, 0, b"AAAA");
        put(&mut storage, &mut index, 1, b"b", 0, 1, b"BBBB");

        destroy(&mut storage, &mut index, b"b").unwrap();

        assert!(index.get(b"b").is_none());
        assert_eq!(storage.slot_count(0).unwrap(), 1);
        assert_eq!(storage.key_record_count().unwrap(), 1);
        let a = index.get(b"a").unwrap();
        assert_eq!(a.slot_idx, 0);
        assert_eq!(a.key_id, 0);
    }

    #[test]
    fn destroy_only_entry_empties_files() {
        let dir = tempdir().unwrap();
        let mut storage =
            StorageSet::open(dir.path(), Durability::None, Duration::from_secs(1), None).unwrap();
        let mut index = Index::new();

        put(&mut storage, &mut index, 0, b"a", 0, 0, b"AAAA");
        destroy(&mut storage, &mut index, b"a").unwrap();

        assert!(index.is_empty());
        assert_eq!(storage.slot_count(0).unwrap(), 0);
        assert_eq!(storage.key_record_count().unwrap(), 0);
    }

    #[test]
    fn rebucket_frees_old_slot_without_destroying_entry() {
        let dir = tempdir().unwrap();
        let mut storage =
            StorageSet::open(dir.path(), Durability::None, Duration::from_secs(1), None).unwrap();
        let mut index = Index::new();

        put(&mut storage, &mut index, 0, b"a", 0, 0, b"AAAA");
        put(&mut storage, &mut index, 1, b"b", 0, 1, b"BBBB");

        // "a" grows into bucket 1; its old bucket-0 slot 0 is freed in place,
        // the entry itself survives with new bucket/slot coordinates.
        index.forget_slot(0, 0);
        storage.write_slot(1, 0, b"A bigger value now").unwrap();
        {
            let entry = index.get_mut(b"a").unwrap();
            entry.bucket = 1;
            entry.slot_idx = 0;
        }
        storage
            .write_key_record(
                0,
                &KeyRecord {
                    key: b"a".to_vec(),
                    cas: 2,
                    expiry: 0,
                    bucket: 1,
                    slot_idx: 0,
                },
            )
            .unwrap();
        compact_data_slot(&mut storage, &mut index, 0, 0).unwrap();

        assert_eq!(storage.slot_count(0).unwrap(), 1);
        let b = index.get(b"b").unwrap();
        assert_eq!(b.bucket, 0);
        assert_eq!(b.slot_idx, 0);
        assert_eq!(storage.read_slot(0, 0).unwrap(), b"BBBB");
        let a = index.get(b"a").unwrap();
        assert_eq!(a.bucket, 1);
        assert_eq!(a.slot_idx, 0);
    }
}
