//! Deduplicating write buffer and epoch counter
//!
//! Pending operations are keyed by `(bucket, key)`; a newer op for the same
//! address overwrites the older one in place, keeping the slot's original
//! position so a flush applies operations in arrival order. The buffer tracks
//! the bytes of buffered record values and pokes the flush channel when the
//! configured ceiling is reached.

use super::op::Operation;
use ahash::AHashMap;
use crossbeam::channel::Sender;
use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    pub pending_ops: usize,
    pub buffered_bytes: usize,
    pub current_epoch: u64,
}

#[derive(Default)]
struct Inner {
    /// Buffer address -> slot position.
    index: AHashMap<Vec<u8>, usize>,
    /// Operations in first-arrival order.
    slots: Vec<Operation>,
    /// Total `value` bytes currently buffered.
    bytes: usize,
}

pub struct WriteBuffer {
    inner: Mutex<Inner>,
    epoch: Mutex<u64>,
    max_bytes: usize,
    flush_tx: Sender<()>,
}

impl WriteBuffer {
    pub fn new(max_bytes: usize, flush_tx: Sender<()>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            epoch: Mutex::new(0),
            max_bytes,
            flush_tx,
        }
    }

    /// Stamp each op with the epoch it is being written under.
    pub fn tag_current_epoch(&self, ops: &mut [Operation]) {
        let epoch = self.epoch.lock();
        for op in ops {
            op.epoch = *epoch;
        }
    }

    pub fn current_epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Merge one mutation's ops under a single lock acquisition, so other
    /// mutators never observe a half-merged batch. Signals the flusher when
    /// the byte ceiling is reached; a full channel is fine, the signal is
    /// idempotent.
    pub fn merge(&self, ops: Vec<Operation>) {
        let should_signal = {
            let mut inner = self.inner.lock();
            for op in ops {
                match inner.index.get(&op.buffer_key()).copied() {
                    Some(slot) => {
                        inner.bytes -= inner.slots[slot].value.len();
                        inner.bytes += op.value.len();
                        inner.slots[slot] = op;
                    }
                    None => {
                        let slot = inner.slots.len();
                        inner.index.insert(op.buffer_key(), slot);
                        inner.bytes += op.value.len();
                        inner.slots.push(op);
                    }
                }
            }
            inner.bytes >= self.max_bytes
        };
        if should_signal {
            let _ = self.flush_tx.try_send(());
        }
    }

    /// Latest buffered op for an address, so readers see their own writes.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Option<Operation> {
        let mut addr = Vec::with_capacity(bucket.len() + 1 + key.len());
        addr.extend_from_slice(bucket);
        addr.push(0);
        addr.extend_from_slice(key);

        let inner = self.inner.lock();
        inner.index.get(&addr).map(|&slot| inner.slots[slot].clone())
    }

    /// Every buffered op addressing `bucket`, in arrival order.
    pub fn scan_bucket(&self, bucket: &[u8]) -> Vec<Operation> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|op| op.bucket == bucket)
            .cloned()
            .collect()
    }

    /// Swap the buffer for an empty one and advance the epoch, atomically.
    /// The captured ops are re-tagged with the captured epoch; mutations that
    /// race the flush land in the fresh buffer under the next epoch, which is
    /// what lets WAL truncation keep them.
    pub fn swap_for_flush(&self) -> (Vec<Operation>, u64) {
        let mut epoch = self.epoch.lock();
        let captured_epoch = *epoch;
        let mut ops = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut *inner).slots
        };
        *epoch = captured_epoch + 1;
        drop(epoch);

        for op in &mut ops {
            op.epoch = captured_epoch;
        }
        (ops, captured_epoch)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            pending_ops: inner.slots.len(),
            buffered_bytes: inner.bytes,
            current_epoch: *self.epoch.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::op::OpKind;
    use crossbeam::channel::bounded;

    fn buffer(max_bytes: usize) -> (WriteBuffer, crossbeam::channel::Receiver<()>) {
        let (tx, rx) = bounded(4);
        (WriteBuffer::new(max_bytes, tx), rx)
    }

    fn put(key: &str, value: &[u8]) -> Operation {
        Operation::put(b"b".to_vec(), key.as_bytes().to_vec(), value.to_vec())
    }

    #[test]
    fn test_overwrite_is_last_writer_wins_in_place() {
        let (buffer, _rx) = buffer(1 << 20);
        buffer.merge(vec![put("k1", b"old"), put("k2", b"x")]);
        buffer.merge(vec![put("k1", b"newer")]);

        assert_eq!(buffer.len(), 2);
        let got = buffer.get(b"b", b"k1").unwrap();
        assert_eq!(got.value, b"newer");

        // k1 keeps its original slot ahead of k2.
        let ops = buffer.scan_bucket(b"b");
        assert_eq!(ops[0].key, b"k1");
        assert_eq!(ops[1].key, b"k2");
    }

    #[test]
    fn test_bytes_track_overwrites() {
        let (buffer, _rx) = buffer(1 << 20);
        buffer.merge(vec![put("k", b"12345678")]);
        assert_eq!(buffer.bytes(), 8);
        buffer.merge(vec![put("k", b"12")]);
        assert_eq!(buffer.bytes(), 2);
    }

    #[test]
    fn test_delete_overwrites_put_at_same_address() {
        let (buffer, _rx) = buffer(1 << 20);
        buffer.merge(vec![put("k", b"value")]);
        buffer.merge(vec![Operation::delete(b"b".to_vec(), b"k".to_vec())]);

        let got = buffer.get(b"b", b"k").unwrap();
        assert_eq!(got.kind, OpKind::Delete);
        assert_eq!(buffer.bytes(), 0);
    }

    #[test]
    fn test_threshold_signals_flush_channel() {
        let (buffer, rx) = buffer(4);
        buffer.merge(vec![put("k", b"ab")]);
        assert!(rx.try_recv().is_err());
        buffer.merge(vec![put("k2", b"cd")]);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_signal_overflow_is_safe() {
        let (tx, rx) = bounded(1);
        let buffer = WriteBuffer::new(1, tx);
        for i in 0..10 {
            buffer.merge(vec![put(&format!("k{}", i), b"xx")]);
        }
        assert!(rx.try_recv().is_ok());
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_swap_advances_epoch_and_tags_ops() {
        let (buffer, _rx) = buffer(1 << 20);
        let mut ops = vec![put("k", b"v")];
        buffer.tag_current_epoch(&mut ops);
        assert_eq!(ops[0].epoch, 0);
        buffer.merge(ops);

        let (captured, epoch) = buffer.swap_for_flush();
        assert_eq!(epoch, 0);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].epoch, 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.current_epoch(), 1);

        let mut late = vec![put("k2", b"v2")];
        buffer.tag_current_epoch(&mut late);
        assert_eq!(late[0].epoch, 1);
    }

    #[test]
    fn test_scan_bucket_filters_other_buckets() {
        let (buffer, _rx) = buffer(1 << 20);
        buffer.merge(vec![
            Operation::put(b"a".to_vec(), b"k".to_vec(), vec![1]),
            Operation::put(b"b".to_vec(), b"k".to_vec(), vec![2]),
        ]);
        let ops = buffer.scan_bucket(b"a");
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].bucket, b"a");
    }
}
