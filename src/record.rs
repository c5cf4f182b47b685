//! Fixed on-disk record layouts: key records and size-bucketed data slots.

use crate::error::{EngineError, Result};

/// Maximum key length in bytes.
pub const KEY_MAX_LEN: usize = 1024;

/// On-disk size of a `KeyRecord`: 2 (keyLen) + 1024 (key) + 8 (cas) + 8 (expiry)
/// + 1 (bucket) + 8 (slotIdx).
pub const KEY_RECORD_SIZE: usize = 2 + KEY_MAX_LEN + 8 + 8 + 1 + 8;

/// Number of size buckets, indexed 0..15.
pub const NUM_BUCKETS: u8 = 16;

/// Smallest bucket covers `2^BUCKET_BASE_SHIFT` bytes (1 KiB).
const BUCKET_BASE_SHIFT: u32 = 10;

/// Capacity in bytes of the given bucket: `2^(10+bucket)`.
///
/// Bucket 15 tops out at `2^25` (32 MiB); see the discrepancy note in
/// DESIGN.md about the 64 MiB figure quoted elsewhere.
pub const fn bucket_size(bucket: u8) -> usize {
    1usize << (BUCKET_BASE_SHIFT + bucket as u32)
}

/// Largest value this engine can ever store.
pub const fn max_value_size() -> usize {
    bucket_size(NUM_BUCKETS - 1)
}

/// On-disk size of a data slot in the given bucket: 4 (length) + payload.
pub const fn slot_size(bucket: u8) -> usize {
    4 + bucket_size(bucket)
}

/// Returns the smallest bucket whose capacity is `>= size`, or `ValueTooLarge`
/// if no bucket is big enough.
pub fn bucket_for_size(size: usize) -> Result<u8> {
    for b in 0..NUM_BUCKETS {
        if bucket_size(b) >= size {
            return Ok(b);
        }
    }
    Err(EngineError::ValueTooLarge)
}

/// A decoded `KeyRecord`: everything the index needs to know about a live key,
/// as it is mirrored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRecord {
    pub key: Vec<u8>,
    pub cas: u64,
    /// Unix-milliseconds; 0 means no expiry.
    pub expiry: i64,
    pub bucket: u8,
    pub slot_idx: i64,
}

impl KeyRecord {
    /// Encodes this record into a freshly allocated, fixed-size buffer.
    pub fn encode(&self) -> Result<[u8; KEY_RECORD_SIZE]> {
        if self.key.len() > KEY_MAX_LEN {
            return Err(EngineError::KeyTooLarge);
        }
        let mut buf = [0u8; KEY_RECORD_SIZE];
        let key_len = self.key.len() as u16;
        buf[0..2].copy_from_slice(&key_len.to_le_bytes());
        buf[2..2 + self.key.len()].copy_from_slice(&self.key);
        // buf[2 + key.len() .. 1026] stays zero-padded.
        buf[1026..1034].copy_from_slice(&self.cas.to_le_bytes());
        buf[1034..1042].copy_from_slice(&self.expiry.to_le_bytes());
        buf[1042] = self.bucket;
        buf[1043..1051].copy_from_slice(&self.slot_idx.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a record from a fixed-size buffer previously produced by `encode`.
    pub fn decode(buf: &[u8; KEY_RECORD_SIZE]) -> Result<Self> {
        let key_len = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
        if key_len > KEY_MAX_LEN {
            return Err(EngineError::Corrupt("keyLen exceeds 1024"));
        }
        let key = buf[2..2 + key_len].to_vec();
        let cas = u64::from_le_bytes(buf[1026..1034].try_into().unwrap());
        let expiry = i64::from_le_bytes(buf[1034..1042].try_into().unwrap());
        let bucket = buf[1042];
        let slot_idx = i64::from_le_bytes(buf[1043..1051].try_into().unwrap());
        Ok(KeyRecord {
            key,
            cas,
            expiry,
            bucket,
            slot_idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_sizes_double_from_1kib() {
        assert_eq!(bucket_size(0), 1024);
        assert_eq!(bucket_size(1), 2048);
        assert_eq!(bucket_size(15), 1024 * 1024 * 32);
    }

    #[test]
    fn bucket_for_size_picks_smallest_fit() {
        assert_eq!(bucket_for_size(1).unwrap(), 0);
        assert_eq!(bucket_for_size(1024).unwrap(), 0);
        assert_eq!(bucket_for_size(1025).unwrap(), 1);
        assert!(bucket_for_size(max_value_size() + 1).is_err());
    }

    #[test]
    fn key_record_round_trips() {
        let rec = KeyRecord {
            key: b"hello".to_vec(),
            cas: 42,
            expiry: 9001,
            bucket: 3,
            slot_idx: 7,
        };
        let encoded = rec.encode().unwrap();
        assert_eq!(encoded.len(), KEY_RECORD_SIZE);
        let decoded = KeyRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn key_record_rejects_oversized_key() {
        let rec = KeyRecord {
            key: vec![0u8; KEY_MAX_LEN + 1],
            cas: 0,
            expiry: 0,
            bucket: 0,
            slot_idx: 0,
        };
        assert!(matches!(rec.encode(), Err(EngineError::KeyTooLarge)));
    }
}
