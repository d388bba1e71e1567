//! Ordered in-memory indexes
//!
//! Each secondary index (and the primary-key index) is a B-tree multimap from
//! an indexed string value to the list of record keys carrying that value.
//! Trees serialize to a versioned blob stored in the `__btree_indexes` bucket
//! of the backing store.

mod btree;
mod iter;
mod node;

pub use btree::{BTreeIndex, TreeStats, DEFAULT_BRANCHING};

/// Name of the bucket holding serialized index images.
pub const INDEX_BUCKET: &[u8] = b"__btree_indexes";

/// Index name reserved for the primary-key tree of every store.
pub const PRIMARY_KEY_INDEX: &str = "__primary_key";

/// Registry key for one index: `<bucket>:<index_name>`.
pub fn index_key(bucket: &str, index: &str) -> String {
    format!("{}:{}", bucket, index)
}
