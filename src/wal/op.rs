//! The operation record shared by the WAL and the write buffer

use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Maximum record key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Maximum bucket name length in bytes.
pub const MAX_BUCKET_LEN: usize = 255;

/// Operation discriminants are part of the WAL format. The wire encoding is
/// the variant index, so the declaration order here must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Put = 0,
    Delete = 1,
    IndexDirty = 2,
}

/// One unit of the write path. `IndexDirty` markers carry an empty value in
/// the WAL and the buffer; the flush serializes the live tree instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub epoch: u64,
}

impl Operation {
    pub fn put(bucket: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>, value: Vec<u8>) -> Self {
        Self {
            kind: OpKind::Put,
            bucket: bucket.into(),
            key: key.into(),
            value,
            epoch: 0,
        }
    }

    pub fn delete(bucket: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OpKind::Delete,
            bucket: bucket.into(),
            key: key.into(),
            value: Vec::new(),
            epoch: 0,
        }
    }

    /// Marker that the on-disk image for `index_key` is stale.
    pub fn index_dirty(index_bucket: &[u8], index_key: &str) -> Self {
        Self {
            kind: OpKind::IndexDirty,
            bucket: index_bucket.to_vec(),
            key: index_key.as_bytes().to_vec(),
            value: Vec::new(),
            epoch: 0,
        }
    }

    /// Buffer address: `bucket ++ 0x00 ++ key`. The separator cannot occur in
    /// a bucket name, so addresses never collide across buckets.
    pub fn buffer_key(&self) -> Vec<u8> {
        let mut addr = Vec::with_capacity(self.bucket.len() + 1 + self.key.len());
        addr.extend_from_slice(&self.bucket);
        addr.push(0);
        addr.extend_from_slice(&self.key);
        addr
    }
}

/// Record keys are non-empty and bounded. Checked before any state change.
pub fn validate_record_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key is empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key is {} bytes, maximum is {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Bucket names are non-empty, bounded, and free of NUL, '/' and '\\'.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidBucketName("name is empty".into()));
    }
    if name.len() > MAX_BUCKET_LEN {
        return Err(StoreError::InvalidBucketName(format!(
            "name is {} bytes, maximum is {}",
            name.len(),
            MAX_BUCKET_LEN
        )));
    }
    if name.bytes().any(|b| b == 0 || b == b'/' || b == b'\\') {
        return Err(StoreError::InvalidBucketName(format!(
            "name {:?} contains a reserved character",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_are_stable_on_the_wire() {
        // The first encoded u32 of a bincode'd Operation is the OpKind
        // variant index; replaying old logs depends on these values.
        for (op, ordinal) in [
            (Operation::put(b"b".to_vec(), b"k".to_vec(), vec![1]), 0u32),
            (Operation::delete(b"b".to_vec(), b"k".to_vec()), 1u32),
            (Operation::index_dirty(b"__btree_indexes", "users:Name"), 2u32),
        ] {
            let bytes = bincode::serialize(&op).unwrap();
            let tag = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            assert_eq!(tag, ordinal);
        }
    }

    #[test]
    fn test_buffer_key_separates_bucket_and_key() {
        let a = Operation::put(b"ab".to_vec(), b"c".to_vec(), vec![]);
        let b = Operation::put(b"a".to_vec(), b"bc".to_vec(), vec![]);
        assert_ne!(a.buffer_key(), b.buffer_key());
    }

    #[test]
    fn test_record_key_bounds() {
        assert!(validate_record_key("k").is_ok());
        assert!(validate_record_key("").is_err());
        assert!(validate_record_key(&"x".repeat(MAX_KEY_LEN)).is_ok());
        assert!(validate_record_key(&"x".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_bucket_name_rules() {
        assert!(validate_bucket_name("users").is_ok());
        assert!(validate_bucket_name("").is_err());
        assert!(validate_bucket_name(&"b".repeat(MAX_BUCKET_LEN + 1)).is_err());
        assert!(validate_bucket_name("a/b").is_err());
        assert!(validate_bucket_name("a\\b").is_err());
        assert!(validate_bucket_name("a\0b").is_err());
    }

    #[test]
    fn test_roundtrip_through_bincode() {
        let op = Operation {
            kind: OpKind::Put,
            bucket: b"users".to_vec(),
            key: b"u1".to_vec(),
            value: vec![9, 9, 9],
            epoch: 7,
        };
        let bytes = bincode::serialize(&op).unwrap();
        let back: Operation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(op, back);
    }
}
