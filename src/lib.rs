//! burrow: an embedded, typed key-value store
//!
//! Records live in buckets of an ACID backing store; ordered secondary
//! indexes (plus a primary-key index) are kept in memory as B-trees and
//! serialized alongside the data. Mutations are absorbed by a checksummed
//! write-ahead log and a deduplicating buffer, then coalesced into periodic
//! epoch flushes.
//!
//! ## Architecture
//! - Index layer: in-memory B-tree multimaps, one per index, RW-locked
//! - Write path: WAL append -> buffer merge -> epoch flush -> WAL truncate
//! - Storage: any bucketed ACID engine behind the `Backend` trait
//!   (`FileBackend` ships with the crate)
//!
//! ## Example
//! ```no_run
//! use burrow::{CancelToken, Config, Database, FieldKind, Record, RecordSchema, Result};
//! use ahash::AHashMap;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     uuid: String,
//!     name: String,
//! }
//!
//! impl Record for User {
//!     fn schema() -> RecordSchema {
//!         RecordSchema {
//!             key_field: "uuid",
//!             key_kind: FieldKind::Text,
//!             indexed: &[("name", FieldKind::Text)],
//!         }
//!     }
//!     fn key(&self) -> String {
//!         self.uuid.clone()
//!     }
//!     fn indexed_values(&self) -> AHashMap<String, String> {
//!         AHashMap::from_iter([("name".to_string(), self.name.clone())])
//!     }
//!     fn encode(&self) -> Result<Vec<u8>> {
//!         Ok(bincode::serialize(self)?)
//!     }
//!     fn decode(bytes: &[u8]) -> Result<Self> {
//!         Ok(bincode::deserialize(bytes)?)
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let db = Database::open_with_config("users.db", Config::default())?;
//!     let store = db.store::<User>("users")?;
//!     let token = CancelToken::new();
//!     store.put(&token, &User { uuid: "u1".into(), name: "Alice".into() })?;
//!     let user = store.get(&token, "u1")?;
//!     assert_eq!(user.name, "Alice");
//!     db.close()
//! }
//! ```

pub mod backend;
pub mod cancel;
pub mod config;
pub mod database;
pub mod index;
pub mod logger;
pub mod wal;

mod error;

pub use backend::{Backend, FileBackend, ReadTx, WriteTx};
pub use cancel::CancelToken;
pub use config::Config;
pub use database::record::{FieldKind, Record, RecordSchema};
pub use database::{Database, DatabaseStats, Store};
pub use error::{Result, StoreError};
pub use index::{BTreeIndex, TreeStats, INDEX_BUCKET, PRIMARY_KEY_INDEX};
pub use logger::{Level, Logger, NullLogger, StderrLogger};
pub use wal::{OpKind, Operation};
