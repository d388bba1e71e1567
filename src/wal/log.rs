//! Append-only write-ahead log
//!
//! One file, a concatenation of framed entries: a u32 little-endian length
//! prefix followed by the bincode encoding of `{operation, checksum}`. The
//! checksum is CRC32-IEEE over the bincode encoding of the operation alone,
//! recomputed from a re-encode on every read, so the framing must round-trip
//! byte-identically -- bincode guarantees that for these types.

use super::op::{OpKind, Operation};
use crate::backend::Backend;
use crate::logger::Logger;
use crate::{Result, StoreError};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(serde::Serialize, serde::Deserialize)]
struct WalEntry {
    operation: Operation,
    checksum: u32,
}

fn checksum(op_bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(op_bytes);
    hasher.finalize()
}

fn frame(op: &Operation) -> Result<Vec<u8>> {
    let op_bytes = bincode::serialize(op)?;
    let entry = WalEntry {
        operation: op.clone(),
        checksum: checksum(&op_bytes),
    };
    let encoded = bincode::serialize(&entry)?;
    let mut framed = Vec::with_capacity(4 + encoded.len());
    framed.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    framed.extend_from_slice(&encoded);
    Ok(framed)
}

/// Decode as many valid entries as possible from `bytes`. Returns the ops and
/// whether a corrupt tail was hit (decode error or checksum mismatch).
fn decode_all(bytes: &[u8]) -> (Vec<Operation>, bool) {
    let mut ops = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < 4 {
            return (ops, true);
        }
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        offset += 4;
        if bytes.len() - offset < len {
            return (ops, true);
        }
        let entry: WalEntry = match bincode::deserialize(&bytes[offset..offset + len]) {
            Ok(entry) => entry,
            Err(_) => return (ops, true),
        };
        offset += len;

        let op_bytes = match bincode::serialize(&entry.operation) {
            Ok(bytes) => bytes,
            Err(_) => return (ops, true),
        };
        if checksum(&op_bytes) != entry.checksum {
            return (ops, true);
        }
        ops.push(entry.operation);
    }
    (ops, false)
}

pub(crate) struct Wal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Wal {
    /// Open (creating if needed) the WAL for appending. Call after
    /// `Wal::replay` has consumed and removed any previous log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = Self::open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|e| StoreError::io("open", path, e))
    }

    /// Current size in bytes.
    pub fn size(&self) -> Result<u64> {
        let file = self.file.lock();
        let meta = file
            .metadata()
            .map_err(|e| StoreError::io("stat", &self.path, e))?;
        Ok(meta.len())
    }

    /// Append every op of one logical mutation contiguously, then flush to
    /// the OS. This is the linearization point of a mutation; the buffer
    /// merge happens after a successful return.
    pub fn append(&self, ops: &[Operation]) -> Result<()> {
        let mut batch = Vec::new();
        for op in ops {
            batch.extend_from_slice(&frame(op)?);
        }
        let mut file = self.file.lock();
        file.write_all(&batch)
            .map_err(|e| StoreError::io("append", &self.path, e))?;
        file.flush()
            .map_err(|e| StoreError::io("flush", &self.path, e))?;
        Ok(())
    }

    /// Replay the log at `path` into the backing store, then delete it.
    ///
    /// A decode error or checksum mismatch means the tail is corrupt: the
    /// valid prefix is applied, the rest is discarded, and no error surfaces
    /// -- the pre-WAL state of the backing store is consistent by assumption.
    /// `IndexDirty` markers go to `rebuild` without touching the store.
    pub fn replay(
        path: &Path,
        backend: &dyn Backend,
        rebuild: &DashSet<String>,
        logger: &Arc<dyn Logger>,
    ) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(path).map_err(|e| StoreError::io("read", path, e))?;
        let (ops, corrupt) = decode_all(&bytes);
        if corrupt {
            logger.warn(&format!(
                "WAL {}: corrupt tail after {} valid entries, discarding the rest",
                path.display(),
                ops.len()
            ));
        }

        let mut dirty_keys = Vec::new();
        let mut mutations = Vec::new();
        for op in ops {
            match op.kind {
                OpKind::IndexDirty => {
                    dirty_keys.push(String::from_utf8_lossy(&op.key).into_owned())
                }
                OpKind::Put | OpKind::Delete => mutations.push(op),
            }
        }

        if !mutations.is_empty() {
            let mut failed_at = 0usize;
            let applied = backend.update(&mut |tx| {
                for (index, op) in mutations.iter().enumerate() {
                    failed_at = index;
                    tx.create_bucket_if_not_exists(&op.bucket)?;
                    match op.kind {
                        OpKind::Put => tx.put(&op.bucket, &op.key, &op.value)?,
                        OpKind::Delete => tx.delete(&op.bucket, &op.key)?,
                        OpKind::IndexDirty => unreachable!("filtered above"),
                    }
                }
                Ok(())
            });
            if let Err(err) = applied {
                return Err(StoreError::WalReplay {
                    path: path.to_path_buf(),
                    index: failed_at,
                    reason: err.to_string(),
                });
            }
            logger.info(&format!(
                "WAL {}: replayed {} operations",
                path.display(),
                mutations.len()
            ));
        }

        for key in dirty_keys {
            rebuild.insert(key);
        }

        std::fs::remove_file(path).map_err(|e| StoreError::io("remove", path, e))?;
        Ok(())
    }

    /// Drop every entry with `epoch <= committed_epoch` and rewrite the file
    /// atomically (temp file, rename, reopen in append mode). Entries behind
    /// a decode or checksum failure are dropped with the rest of the file. A
    /// write failure leaves the log as it was.
    pub fn truncate(&self, committed_epoch: u64, logger: &Arc<dyn Logger>) -> Result<()> {
        let mut file = self.file.lock();

        let bytes = std::fs::read(&self.path).map_err(|e| StoreError::io("read", &self.path, e))?;
        let (ops, corrupt) = decode_all(&bytes);
        if corrupt {
            logger.warn(&format!(
                "WAL {}: corrupt tail found during truncation, dropping it",
                self.path.display()
            ));
        }

        let mut kept = Vec::new();
        for op in &ops {
            if op.epoch > committed_epoch {
                kept.extend_from_slice(&frame(op)?);
            }
        }

        let tmp = self.path.with_extension("wal.tmp");
        let write_result = (|| -> Result<()> {
            let mut out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| StoreError::io("open", &tmp, e))?;
            out.write_all(&kept)
                .map_err(|e| StoreError::io("write", &tmp, e))?;
            out.flush().map_err(|e| StoreError::io("flush", &tmp, e))?;
            std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::io("rename", &self.path, e))
        })();

        match write_result {
            Ok(()) => {
                *file = Self::open_append(&self.path)?;
                Ok(())
            }
            Err(err) => {
                // The original file was never touched; keep appending to it.
                let _ = std::fs::remove_file(&tmp);
                *file = Self::open_append(&self.path)?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{view_get, FileBackend};
    use crate::logger::NullLogger;
    use tempfile::TempDir;

    fn null_logger() -> Arc<dyn Logger> {
        Arc::new(NullLogger)
    }

    fn sample_ops(epoch: u64) -> Vec<Operation> {
        let mut put = Operation::put(b"users".to_vec(), b"u1".to_vec(), b"alice".to_vec());
        put.epoch = epoch;
        let mut del = Operation::delete(b"users".to_vec(), b"u2".to_vec());
        del.epoch = epoch;
        vec![put, del]
    }

    #[test]
    fn test_append_then_decode_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        let ops = sample_ops(3);
        wal.append(&ops).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (decoded, corrupt) = decode_all(&bytes);
        assert!(!corrupt);
        assert_eq!(decoded, ops);
    }

    #[test]
    fn test_every_entry_checksum_verifies() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        for i in 0..20u64 {
            let mut op = Operation::put(
                b"b".to_vec(),
                format!("k{}", i).into_bytes(),
                vec![0u8; i as usize],
            );
            op.epoch = i;
            wal.append(&[op]).unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        let (ops, corrupt) = decode_all(&bytes);
        assert!(!corrupt);
        assert_eq!(ops.len(), 20);
    }

    #[test]
    fn test_corrupt_tail_keeps_valid_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        wal.append(&sample_ops(1)).unwrap();
        drop(wal);

        // Chop the file mid-entry.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let reread = std::fs::read(&path).unwrap();
        let (ops, corrupt) = decode_all(&reread);
        assert!(corrupt);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        wal.append(&sample_ops(1)).unwrap();
        drop(wal);

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reread = std::fs::read(&path).unwrap();
        let (_ops, corrupt) = decode_all(&reread);
        assert!(corrupt);
    }

    #[test]
    fn test_replay_applies_and_removes_log() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");
        let backend = FileBackend::open(dir.path().join("test.db")).unwrap();

        {
            let wal = Wal::open(&wal_path).unwrap();
            wal.append(&[Operation::put(
                b"users".to_vec(),
                b"u1".to_vec(),
                b"alice".to_vec(),
            )])
            .unwrap();
            wal.append(&[Operation::index_dirty(b"__btree_indexes", "users:Name")])
                .unwrap();
        }

        let rebuild = DashSet::new();
        Wal::replay(&wal_path, &backend, &rebuild, &null_logger()).unwrap();

        assert!(!wal_path.exists());
        assert_eq!(
            view_get(&backend, b"users", b"u1").unwrap(),
            Some(b"alice".to_vec())
        );
        assert!(rebuild.contains("users:Name"));
    }

    #[test]
    fn test_replay_missing_file_is_noop() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path().join("test.db")).unwrap();
        let rebuild = DashSet::new();
        Wal::replay(
            &dir.path().join("absent.wal"),
            &backend,
            &rebuild,
            &null_logger(),
        )
        .unwrap();
        assert!(rebuild.is_empty());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");
        let backend = FileBackend::open(dir.path().join("test.db")).unwrap();

        {
            let wal = Wal::open(&wal_path).unwrap();
            wal.append(&sample_ops(1)).unwrap();
        }
        let rebuild = DashSet::new();
        Wal::replay(&wal_path, &backend, &rebuild, &null_logger()).unwrap();
        // Second replay sees no file and changes nothing.
        Wal::replay(&wal_path, &backend, &rebuild, &null_logger()).unwrap();
        assert_eq!(
            view_get(&backend, b"users", b"u1").unwrap(),
            Some(b"alice".to_vec())
        );
    }

    #[test]
    fn test_truncate_keeps_only_later_epochs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        wal.append(&sample_ops(1)).unwrap();
        wal.append(&sample_ops(2)).unwrap();
        wal.append(&sample_ops(3)).unwrap();

        wal.truncate(2, &null_logger()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (ops, corrupt) = decode_all(&bytes);
        assert!(!corrupt);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.epoch == 3));
    }

    #[test]
    fn test_truncate_to_empty_leaves_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        wal.append(&sample_ops(1)).unwrap();
        assert!(wal.size().unwrap() > 0);

        wal.truncate(1, &null_logger()).unwrap();
        assert!(path.exists());
        assert_eq!(wal.size().unwrap(), 0);

        // The reopened handle still appends.
        wal.append(&sample_ops(2)).unwrap();
        assert!(wal.size().unwrap() > 0);
    }
}
