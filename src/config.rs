//! Database configuration
//!
//! Controls flush cadence and buffering thresholds. Everything else (fsync
//! policy, page layout) belongs to the backing store and is configured there.

use crate::{Result, StoreError};
use std::path::PathBuf;
use std::time::Duration;

/// Default interval between periodic flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Default buffered-bytes threshold that signals an early flush.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Default capacity of the flush signal channel.
pub const DEFAULT_FLUSH_CHANNEL_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct Config {
    /// Duration between periodic flushes. Must be > 0.
    pub flush_interval: Duration,

    /// Total bytes of buffered record values that trigger a flush signal.
    /// Must be > 0.
    pub max_buffer_bytes: usize,

    /// Override for the WAL file path. Defaults to `<db_path>.wal`.
    pub wal_path: Option<PathBuf>,

    /// Capacity of the bounded flush-signal channel. Overflow is safe:
    /// signals are idempotent.
    pub flush_channel_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            wal_path: None,
            flush_channel_size: DEFAULT_FLUSH_CHANNEL_SIZE,
        }
    }
}

impl Config {
    /// Short flush interval and a small buffer, for tests that want to
    /// exercise the flush path without waiting.
    pub fn for_testing() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            max_buffer_bytes: 64 * 1024,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "flush_interval must be greater than zero".into(),
            ));
        }
        if self.max_buffer_bytes == 0 {
            return Err(StoreError::InvalidConfig(
                "max_buffer_bytes must be greater than zero".into(),
            ));
        }
        if let Some(path) = &self.wal_path {
            if path.as_os_str().is_empty() {
                return Err(StoreError::InvalidConfig("wal_path must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Resolve the WAL path for a database stored at `db_path`.
    pub fn wal_path_for(&self, db_path: &std::path::Path) -> PathBuf {
        match &self.wal_path {
            Some(path) => path.clone(),
            None => {
                let mut os = db_path.as_os_str().to_os_string();
                os.push(".wal");
                PathBuf::from(os)
            }
        }
    }
}
