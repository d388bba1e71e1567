//! Snapshot-on-commit file backend
//!
//! Buckets live in memory as ordered maps; every committed update transaction
//! rewrites a bincode snapshot of the whole database through a temp file and
//! an atomic rename. Update transactions stage a copy of the state, so a
//! failed closure leaves both memory and disk untouched. Suited to the small
//! databases this crate targets; larger deployments substitute a page-oriented
//! engine behind the same `Backend` trait.

use super::{Backend, ReadTx, WriteTx};
use crate::{Result, StoreError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// ASCII "BRWS" (burrow snapshot).
const SNAPSHOT_MAGIC: u32 = 0x42525753;
const SNAPSHOT_VERSION: u32 = 1;

type Buckets = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    magic: u32,
    version: u32,
    buckets: Buckets,
}

pub struct FileBackend {
    path: PathBuf,
    buckets: RwLock<Buckets>,
    /// Serializes update transactions; readers are never blocked by staging.
    update_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileBackend {
    /// Open the database at `path`, creating an empty one if absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let buckets = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| StoreError::io("read", &path, e))?;
            if bytes.is_empty() {
                Buckets::new()
            } else {
                let snapshot: Snapshot = bincode::deserialize(&bytes)?;
                if snapshot.magic != SNAPSHOT_MAGIC {
                    return Err(StoreError::Corruption(format!(
                        "bad snapshot magic in {}: {:#010x}",
                        path.display(),
                        snapshot.magic
                    )));
                }
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(StoreError::Corruption(format!(
                        "unsupported snapshot version {} in {}",
                        snapshot.version,
                        path.display()
                    )));
                }
                snapshot.buckets
            }
        } else {
            Buckets::new()
        };

        let backend = Self {
            path,
            buckets: RwLock::new(buckets),
            update_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        if !backend.path.exists() {
            backend.persist(&backend.buckets.read())?;
        }
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn persist(&self, buckets: &Buckets) -> Result<()> {
        Self::write_snapshot(&self.path, buckets)
    }

    fn write_snapshot(dest: &Path, buckets: &Buckets) -> Result<()> {
        let snapshot = Snapshot {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            buckets: buckets.clone(),
        };
        let bytes = bincode::serialize(&snapshot)?;

        let tmp = dest.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| StoreError::io("open", &tmp, e))?;
            file.write_all(&bytes)
                .map_err(|e| StoreError::io("write", &tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io("sync", &tmp, e))?;
        }
        std::fs::rename(&tmp, dest).map_err(|e| StoreError::io("rename", dest, e))?;
        Ok(())
    }
}

impl Backend for FileBackend {
    fn view(&self, f: &mut dyn FnMut(&dyn ReadTx) -> Result<()>) -> Result<()> {
        self.ensure_open()?;
        let guard = self.buckets.read();
        let tx = SnapshotTx { buckets: &guard };
        f(&tx)
    }

    fn update(&self, f: &mut dyn FnMut(&mut dyn WriteTx) -> Result<()>) -> Result<()> {
        self.ensure_open()?;
        let _serial = self.update_lock.lock();

        let mut staged = self.buckets.read().clone();
        let mut tx = StagedTx {
            buckets: &mut staged,
        };
        f(&mut tx)?;

        // Durable first, visible second: a persist failure aborts the commit.
        self.persist(&staged)?;
        *self.buckets.write() = staged;
        Ok(())
    }

    fn write_to(&self, dest: &Path) -> Result<()> {
        self.ensure_open()?;
        let _serial = self.update_lock.lock();
        let guard = self.buckets.read();
        Self::write_snapshot(dest, &guard)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.persist(&self.buckets.read())
    }
}

struct SnapshotTx<'a> {
    buckets: &'a Buckets,
}

fn bucket_not_found(bucket: &[u8]) -> StoreError {
    StoreError::BucketNotFound(String::from_utf8_lossy(bucket).into_owned())
}

impl ReadTx for SnapshotTx<'_> {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        Ok(entries.get(key).cloned())
    }

    fn bucket_exists(&self, bucket: &[u8]) -> bool {
        self.buckets.contains_key(bucket)
    }

    fn for_each(
        &self,
        bucket: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let entries = self.buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        for (key, value) in entries {
            f(key, value)?;
        }
        Ok(())
    }
}

struct StagedTx<'a> {
    buckets: &'a mut Buckets,
}

impl ReadTx for StagedTx<'_> {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        Ok(entries.get(key).cloned())
    }

    fn bucket_exists(&self, bucket: &[u8]) -> bool {
        self.buckets.contains_key(bucket)
    }

    fn for_each(
        &self,
        bucket: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let entries = self.buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        for (key, value) in entries {
            f(key, value)?;
        }
        Ok(())
    }
}

impl WriteTx for StagedTx<'_> {
    fn create_bucket_if_not_exists(&mut self, bucket: &[u8]) -> Result<()> {
        self.buckets.entry(bucket.to_vec()).or_default();
        Ok(())
    }

    fn put(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        let entries = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<()> {
        let entries = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        entries.remove(key);
        Ok(())
    }
}
