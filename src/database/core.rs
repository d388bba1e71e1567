//! Database handle: wiring for the backend, WAL, buffer and flusher
//!
//! `Database` owns the shared machinery; typed access goes through
//! `Database::store`. Opening replays any WAL left by a crash before the
//! flusher starts, so the backing store is consistent by the time stores load
//! their indexes.

use crate::backend::{Backend, FileBackend};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::index::BTreeIndex;
use crate::logger::{Logger, StderrLogger};
use crate::wal::{BufferStats, FlushEngine, FlushWorker, Operation, Wal, WriteBuffer};
use crate::{Result, StoreError};
use crossbeam::channel::bounded;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub buffer: BufferStats,
    pub registered_indexes: usize,
    pub pending_rebuilds: usize,
    pub wal_bytes: u64,
}

pub(crate) struct DbInner {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) buffer: Arc<WriteBuffer>,
    pub(crate) engine: Arc<FlushEngine>,
    pub(crate) indexes: Arc<DashMap<String, Arc<BTreeIndex>>>,
    pub(crate) rebuild_needed: Arc<DashSet<String>>,
    pub(crate) logger: Arc<dyn Logger>,
    worker: Mutex<Option<FlushWorker>>,
    closed: AtomicBool,
}

impl DbInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Append one logical mutation's ops to the WAL, then merge them into the
    /// buffer. The WAL append is the linearization point; once it succeeds
    /// the mutation is durable enough to survive a crash.
    pub(crate) fn write_operations(
        &self,
        token: &CancelToken,
        mut ops: Vec<Operation>,
    ) -> Result<()> {
        token.check()?;
        self.ensure_open()?;
        self.buffer.tag_current_epoch(&mut ops);
        self.wal.append(&ops)?;
        self.buffer.merge(ops);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Final flush while the backend is still open.
        let flush_result = self.engine.flush_once();
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
        let close_result = self.backend.close();
        flush_result.and(close_result)
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            self.logger.error(&format!("close on drop: {}", err));
        }
    }
}

/// An open database. Cheap to clone; all clones share one handle.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    /// Open the database at `path` with defaults.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, Config::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        Self::open_with_logger(path, config, Arc::new(StderrLogger))
    }

    pub fn open_with_logger(
        path: impl AsRef<Path>,
        config: Config,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let backend: Arc<dyn Backend> = Arc::new(FileBackend::open(path)?);
        let wal_path = config.wal_path_for(path);
        Self::with_backend(backend, wal_path, config, logger)
    }

    /// Open on an externally supplied backing store. `wal_path` must name a
    /// location the process can create and rewrite files at.
    pub fn with_backend(
        backend: Arc<dyn Backend>,
        wal_path: PathBuf,
        config: Config,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        config.validate()?;

        let rebuild_needed = Arc::new(DashSet::new());
        Wal::replay(&wal_path, backend.as_ref(), &rebuild_needed, &logger)?;
        let wal = Arc::new(Wal::open(wal_path)?);

        let (signal_tx, signal_rx) = bounded(config.flush_channel_size);
        let buffer = Arc::new(WriteBuffer::new(config.max_buffer_bytes, signal_tx));
        let indexes: Arc<DashMap<String, Arc<BTreeIndex>>> = Arc::new(DashMap::new());

        let engine = Arc::new(FlushEngine::new(
            Arc::clone(&backend),
            Arc::clone(&wal),
            Arc::clone(&buffer),
            Arc::clone(&indexes),
            Arc::clone(&logger),
        ));
        let worker = FlushWorker::spawn(Arc::clone(&engine), config.flush_interval, signal_rx);

        Ok(Self {
            inner: Arc::new(DbInner {
                backend,
                wal,
                buffer,
                engine,
                indexes,
                rebuild_needed,
                logger,
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Drain the buffer into the backing store now and truncate the WAL.
    pub fn flush(&self, token: &CancelToken) -> Result<()> {
        token.check()?;
        self.inner.ensure_open()?;
        self.inner.engine.flush_once()
    }

    /// Final flush, stop the flusher, close the backing store. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Write a consistent snapshot of the backing store to `dest`. Refuses
    /// to overwrite an existing file.
    pub fn export(&self, token: &CancelToken, dest: impl AsRef<Path>) -> Result<()> {
        token.check()?;
        self.inner.ensure_open()?;
        let dest = dest.as_ref();
        if dest.exists() {
            return Err(StoreError::io(
                "export",
                dest,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "destination already exists",
                ),
            ));
        }
        self.inner.engine.flush_once()?;
        token.check()?;
        self.inner.backend.write_to(dest)
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            buffer: self.inner.buffer.stats(),
            registered_indexes: self.inner.indexes.len(),
            pending_rebuilds: self.inner.rebuild_needed.len(),
            wal_bytes: self.inner.wal.size().unwrap_or(0),
        }
    }

    /// Index keys seen as dirty during WAL replay and not yet reconciled by
    /// an opened store. Markers for stores that are never opened stay here
    /// until the process exits.
    pub fn pending_rebuilds(&self) -> Vec<String> {
        self.inner
            .rebuild_needed
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}
