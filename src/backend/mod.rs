//! Backing store contract
//!
//! The engine below this layer: named buckets of byte-keyed entries with ACID
//! `update` (write) and `view` (read) transactions, cursor iteration in key
//! order, and a whole-database snapshot. Index trees, the write buffer and the
//! WAL all sit on top of this interface; `FileBackend` is the implementation
//! shipped with the crate.

mod file;

pub use file::FileBackend;

use crate::Result;
use std::path::Path;

/// Read transaction: a consistent snapshot of all buckets.
pub trait ReadTx {
    /// Look up `key` in `bucket`. `Err(BucketNotFound)` if the bucket was
    /// never created.
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn bucket_exists(&self, bucket: &[u8]) -> bool;

    /// Visit every entry of `bucket` in ascending key order.
    /// `Err(BucketNotFound)` if the bucket was never created.
    fn for_each(
        &self,
        bucket: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()>;
}

/// Write transaction: staged mutations that commit atomically or not at all.
pub trait WriteTx: ReadTx {
    fn create_bucket_if_not_exists(&mut self, bucket: &[u8]) -> Result<()>;

    /// `Err(BucketNotFound)` if the bucket was never created.
    fn put(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()>;

    /// Deleting a missing key is a no-op. `Err(BucketNotFound)` if the bucket
    /// was never created.
    fn delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<()>;
}

pub trait Backend: Send + Sync {
    /// Run `f` against a read snapshot.
    fn view(&self, f: &mut dyn FnMut(&dyn ReadTx) -> Result<()>) -> Result<()>;

    /// Run `f` against a staged copy; commit durably iff `f` returns `Ok`.
    fn update(&self, f: &mut dyn FnMut(&mut dyn WriteTx) -> Result<()>) -> Result<()>;

    /// Write a consistent snapshot of the whole database to `dest`.
    fn write_to(&self, dest: &Path) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Convenience wrapper: single-key read through a view transaction.
pub fn view_get(backend: &dyn Backend, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut out = None;
    let mut found: Result<Option<Vec<u8>>> = Ok(None);
    backend.view(&mut |tx| {
        found = tx.get(bucket, key);
        if let Ok(value) = &found {
            out = value.clone();
        }
        Ok(())
    })?;
    found?;
    Ok(out)
}

/// Convenience wrapper: collect every entry of a bucket in key order.
pub fn view_collect(backend: &dyn Backend, bucket: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut status: Result<()> = Ok(());
    backend.view(&mut |tx| {
        if !tx.bucket_exists(bucket) {
            return Ok(());
        }
        status = tx.for_each(bucket, &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(())
        });
        Ok(())
    })?;
    status?;
    Ok(out)
}
