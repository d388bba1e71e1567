//! Write path: operations, the deduplicating buffer, the WAL and the flusher
//!
//! Every record mutation becomes a batch of `Operation`s (one record op plus
//! one dirty marker per touched index). The batch is appended to the WAL,
//! merged into the buffer, and eventually drained into the backing store by
//! the flush engine, after which the WAL is truncated up to the committed
//! epoch.

mod buffer;
mod flusher;
mod log;
mod op;

pub use buffer::{BufferStats, WriteBuffer};
pub use op::{validate_bucket_name, validate_record_key, OpKind, Operation, MAX_BUCKET_LEN, MAX_KEY_LEN};

pub(crate) use flusher::{FlushEngine, FlushWorker};
pub(crate) use log::Wal;
