//! Flush engine and worker
//!
//! One long-lived worker drains the write buffer into the backing store: on a
//! periodic tick, on a buffer-threshold signal, or on demand through
//! `Database::flush`. A flush swaps the buffer, applies the captured ops in a
//! single backing-store transaction, and truncates the WAL up to the
//! committed epoch.

use super::buffer::WriteBuffer;
use super::log::Wal;
use super::op::OpKind;
use crate::backend::Backend;
use crate::index::BTreeIndex;
use crate::logger::Logger;
use crate::{Result, StoreError};
use crossbeam::channel::{bounded, tick, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct FlushEngine {
    backend: Arc<dyn Backend>,
    wal: Arc<Wal>,
    buffer: Arc<WriteBuffer>,
    indexes: Arc<DashMap<String, Arc<BTreeIndex>>>,
    logger: Arc<dyn Logger>,
    /// Serializes flushes from the worker and explicit callers.
    flush_lock: Mutex<()>,
}

impl FlushEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        wal: Arc<Wal>,
        buffer: Arc<WriteBuffer>,
        indexes: Arc<DashMap<String, Arc<BTreeIndex>>>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            backend,
            wal,
            buffer,
            indexes,
            logger,
            flush_lock: Mutex::new(()),
        }
    }

    /// Drain the buffer into the backing store once.
    ///
    /// The buffer is swapped out before the transaction runs; if the
    /// transaction then fails, the swapped ops are gone from memory and only
    /// recoverable from the WAL at the next open. That failure is logged and
    /// swallowed here, matching the storage contract of the write path.
    pub fn flush_once(&self) -> Result<()> {
        let _serial = self.flush_lock.lock();

        let (ops, epoch) = self.buffer.swap_for_flush();
        if ops.is_empty() {
            return Ok(());
        }

        // Tree versions captured at serialization time, so a tree mutated
        // mid-flush is not wrongly marked clean afterwards.
        let mut serialized_versions: Vec<(String, u64)> = Vec::new();

        let applied = self.backend.update(&mut |tx| {
            serialized_versions.clear();
            for op in &ops {
                match op.kind {
                    OpKind::Put => {
                        tx.create_bucket_if_not_exists(&op.bucket)?;
                        tx.put(&op.bucket, &op.key, &op.value)?;
                    }
                    OpKind::Delete => {
                        tx.create_bucket_if_not_exists(&op.bucket)?;
                        tx.delete(&op.bucket, &op.key)?;
                    }
                    OpKind::IndexDirty => {
                        let index_key = String::from_utf8_lossy(&op.key).into_owned();
                        if let Some(tree) = self.indexes.get(&index_key) {
                            let version = tree.version();
                            let image = tree.serialize()?;
                            tx.create_bucket_if_not_exists(&op.bucket)?;
                            tx.put(&op.bucket, &op.key, &image)?;
                            serialized_versions.push((index_key, version));
                        }
                    }
                }
            }
            Ok(())
        });

        match applied {
            Ok(()) => {
                for (index_key, version) in serialized_versions {
                    if let Some(tree) = self.indexes.get(&index_key) {
                        tree.mark_clean_if(version);
                    }
                }
                self.wal.truncate(epoch, &self.logger)
            }
            Err(err) => {
                let flush_err = StoreError::Flush {
                    pending: ops.len(),
                    reason: err.to_string(),
                };
                self.logger.error(&flush_err.to_string());
                Ok(())
            }
        }
    }
}

/// The dedicated flusher thread. Lives until `stop` or drop.
pub(crate) struct FlushWorker {
    handle: Option<JoinHandle<()>>,
    close_tx: Sender<()>,
}

impl FlushWorker {
    pub fn spawn(engine: Arc<FlushEngine>, interval: Duration, signal_rx: Receiver<()>) -> Self {
        let (close_tx, close_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("burrow-flusher".into())
            .spawn(move || Self::run(engine, interval, signal_rx, close_rx))
            .expect("failed to spawn flusher thread");
        Self {
            handle: Some(handle),
            close_tx,
        }
    }

    fn run(
        engine: Arc<FlushEngine>,
        interval: Duration,
        signal_rx: Receiver<()>,
        close_rx: Receiver<()>,
    ) {
        let mut ticker = tick(interval);
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => {
                    if let Err(err) = engine.flush_once() {
                        engine.logger.error(&format!("periodic flush: {}", err));
                    }
                }
                recv(signal_rx) -> msg => {
                    if msg.is_err() {
                        // All senders gone; the database is shutting down.
                        break;
                    }
                    if let Err(err) = engine.flush_once() {
                        engine.logger.error(&format!("signalled flush: {}", err));
                    }
                    // Restart the period so a signal-triggered flush is not
                    // immediately followed by a timer-triggered one.
                    ticker = tick(interval);
                }
                recv(close_rx) -> _ => break,
            }
        }
    }

    pub fn stop(&mut self) {
        let _ = self.close_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
