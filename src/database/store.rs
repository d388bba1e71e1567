//! Typed store over one bucket
//!
//! A `Store<R>` keeps the primary-key tree and one tree per indexed field in
//! memory, loading serialized images from the backing store at construction
//! and rebuilding from the records bucket when an image is missing, corrupt,
//! or flagged by a replayed dirty marker. Every mutation updates the trees,
//! then hands the record op plus one dirty marker per touched index to the
//! write path in a single batch.

use super::core::{Database, DbInner};
use super::record::Record;
use crate::backend::view_get;
use crate::cancel::CancelToken;
use crate::index::{index_key, BTreeIndex, TreeStats, INDEX_BUCKET, PRIMARY_KEY_INDEX};
use crate::wal::{validate_bucket_name, validate_record_key, OpKind, Operation};
use crate::{Result, StoreError};
use ahash::AHashMap;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

pub struct Store<R: Record> {
    db: Arc<DbInner>,
    bucket: String,
    /// Index field name (or `__primary_key`) -> registry key.
    registry_keys: AHashMap<&'static str, String>,
    _record: PhantomData<fn() -> R>,
}

impl Database {
    /// Open the typed store for `bucket`, loading or rebuilding its indexes.
    pub fn store<R: Record>(&self, bucket: &str) -> Result<Store<R>> {
        Store::open(Arc::clone(&self.inner), bucket)
    }
}

impl<R: Record> Store<R> {
    fn open(db: Arc<DbInner>, bucket: &str) -> Result<Self> {
        db.ensure_open()?;
        validate_bucket_name(bucket)?;
        let schema = R::schema();
        schema.validate()?;

        let mut registry_keys: AHashMap<&'static str, String> = AHashMap::new();
        registry_keys.insert(PRIMARY_KEY_INDEX, index_key(bucket, PRIMARY_KEY_INDEX));
        for field in schema.indexed_field_names() {
            registry_keys.insert(field, index_key(bucket, field));
        }

        let store = Self {
            db,
            bucket: bucket.to_string(),
            registry_keys,
            _record: PhantomData,
        };

        let mut rebuilt = Vec::new();
        for (field, registry_key) in &store.registry_keys {
            let marked_dirty = store.db.rebuild_needed.contains(registry_key);
            let tree = if marked_dirty {
                None
            } else {
                store.load_index_image(registry_key)
            };
            let tree = match tree {
                Some(tree) => tree,
                None => {
                    rebuilt.push(registry_key.clone());
                    store.rebuild_from_bucket(field)?
                }
            };
            store.db.indexes.insert(registry_key.clone(), Arc::new(tree));
            if marked_dirty {
                store.db.rebuild_needed.remove(registry_key);
            }
        }

        // Rebuilt trees differ from whatever image is on disk; queue markers
        // so the next flush persists them.
        if !rebuilt.is_empty() {
            let ops = rebuilt
                .iter()
                .map(|registry_key| Operation::index_dirty(INDEX_BUCKET, registry_key))
                .collect();
            store.db.write_operations(&CancelToken::new(), ops)?;
        }

        Ok(store)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Image from `__btree_indexes`, if present and it deserializes cleanly.
    fn load_index_image(&self, registry_key: &str) -> Option<BTreeIndex> {
        let bytes = match view_get(
            self.db.backend.as_ref(),
            INDEX_BUCKET,
            registry_key.as_bytes(),
        ) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(StoreError::BucketNotFound(_)) => return None,
            Err(err) => {
                self.db
                    .logger
                    .warn(&format!("index {}: load failed: {}", registry_key, err));
                return None;
            }
        };
        match BTreeIndex::deserialize(&bytes) {
            Ok(tree) => Some(tree),
            Err(err) => {
                self.db.logger.warn(&format!(
                    "index {}: corrupt image, rebuilding: {}",
                    registry_key, err
                ));
                None
            }
        }
    }

    /// Build one index from scratch: the records bucket merged with any
    /// buffered, not-yet-flushed mutations. Records that fail to decode are
    /// skipped with a log line; the index stays best-effort for corrupt rows.
    fn rebuild_from_bucket(&self, field: &str) -> Result<BTreeIndex> {
        let mut live: std::collections::BTreeMap<Vec<u8>, Vec<u8>> =
            match crate::backend::view_collect(self.db.backend.as_ref(), self.bucket.as_bytes()) {
                Ok(entries) => entries.into_iter().collect(),
                Err(StoreError::BucketNotFound(_)) => Default::default(),
                Err(err) => return Err(err),
            };
        for op in self.db.buffer.scan_bucket(self.bucket.as_bytes()) {
            match op.kind {
                OpKind::Put => {
                    live.insert(op.key, op.value);
                }
                OpKind::Delete => {
                    live.remove(&op.key);
                }
                OpKind::IndexDirty => {}
            }
        }

        let tree = BTreeIndex::default();
        let mut skipped = 0usize;
        for (key_bytes, value_bytes) in live {
            let key = String::from_utf8_lossy(&key_bytes).into_owned();
            if field == PRIMARY_KEY_INDEX {
                tree.insert(&key, &key);
                continue;
            }
            let record = match R::decode(&value_bytes) {
                Ok(record) => record,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            let values = record.indexed_values();
            if let Some(value) = values.get(field) {
                if !value.is_empty() {
                    tree.insert(value, &key);
                }
            }
        }

        if skipped > 0 {
            self.db.logger.warn(&format!(
                "bucket {}: skipped {} undecodable records while rebuilding index {}",
                self.bucket, skipped, field
            ));
        }
        Ok(tree)
    }

    fn tree(&self, field: &str) -> Result<Arc<BTreeIndex>> {
        let registry_key = self.registry_keys.get(field).ok_or_else(|| {
            StoreError::InvalidConfig(format!(
                "no index named {:?} on bucket {:?}",
                field, self.bucket
            ))
        })?;
        self.db
            .indexes
            .get(registry_key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                StoreError::InvalidConfig(format!("index {:?} is not registered", registry_key))
            })
    }

    fn primary_tree(&self) -> Result<Arc<BTreeIndex>> {
        self.tree(PRIMARY_KEY_INDEX)
    }

    /// Latest view of a record before this mutation: the buffer first, then
    /// the backing store.
    fn fetch_current(&self, key: &str) -> Result<Option<R>> {
        if let Some(op) = self.db.buffer.get(self.bucket.as_bytes(), key.as_bytes()) {
            return match op.kind {
                OpKind::Put => Ok(Some(R::decode(&op.value)?)),
                OpKind::Delete => Ok(None),
                OpKind::IndexDirty => Ok(None),
            };
        }
        match view_get(self.db.backend.as_ref(), self.bucket.as_bytes(), key.as_bytes()) {
            Ok(Some(bytes)) => Ok(Some(R::decode(&bytes)?)),
            Ok(None) => Ok(None),
            Err(StoreError::BucketNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Insert or overwrite a record.
    pub fn put(&self, token: &CancelToken, record: &R) -> Result<()> {
        token.check()?;
        self.db.ensure_open()?;

        let key = record.key();
        validate_record_key(&key)?;

        let old = self.fetch_current(&key)?;
        let old_values = old
            .as_ref()
            .map(|record| record.indexed_values())
            .unwrap_or_default();
        let new_values = record.indexed_values();

        let mut touched: Vec<String> = Vec::new();

        // Primary index gains an entry only for a brand-new key, but the
        // marker is always included so the flushed image tracks the tree.
        let primary = self.primary_tree()?;
        if old.is_none() {
            primary.insert(&key, &key);
        }
        touched.push(self.registry_keys[PRIMARY_KEY_INDEX].clone());

        for field in R::schema().indexed_field_names() {
            let old_value = old_values.get(field).map(String::as_str).unwrap_or("");
            let new_value = new_values.get(field).map(String::as_str).unwrap_or("");
            if old_value == new_value {
                continue;
            }
            let tree = self.tree(field)?;
            if !old_value.is_empty() {
                tree.delete(old_value, &key);
            }
            if !new_value.is_empty() {
                tree.insert(new_value, &key);
            }
            touched.push(self.registry_keys[field].clone());
        }

        let value_bytes = record.encode()?;
        let mut ops = Vec::with_capacity(1 + touched.len());
        ops.push(Operation::put(
            self.bucket.as_bytes().to_vec(),
            key.into_bytes(),
            value_bytes,
        ));
        for registry_key in touched {
            ops.push(Operation::index_dirty(INDEX_BUCKET, &registry_key));
        }
        self.db.write_operations(token, ops)
    }

    /// Read a record. Buffered writes win over the backing store, so a put
    /// is visible to the same process immediately.
    pub fn get(&self, token: &CancelToken, key: &str) -> Result<R> {
        token.check()?;
        self.db.ensure_open()?;
        match self.fetch_current(key)? {
            Some(record) => Ok(record),
            None => Err(StoreError::KeyNotFound(key.to_string())),
        }
    }

    /// Batch read. Either every key resolves or the per-key failures are
    /// collected into one `PartialBatch` error.
    pub fn get_many(&self, token: &CancelToken, keys: &[&str]) -> Result<Vec<R>> {
        token.check()?;
        self.db.ensure_open()?;

        let mut records = Vec::with_capacity(keys.len());
        let mut errors = Vec::new();
        for key in keys {
            match self.get(token, key) {
                Ok(record) => records.push(record),
                Err(err) => errors.push((key.to_string(), err)),
            }
        }
        if errors.is_empty() {
            Ok(records)
        } else {
            Err(StoreError::PartialBatch { errors })
        }
    }

    /// Remove a record. A miss in the primary-key index short-circuits
    /// before any state changes.
    pub fn delete(&self, token: &CancelToken, key: &str) -> Result<()> {
        token.check()?;
        self.db.ensure_open()?;
        validate_record_key(key)?;

        let primary = self.primary_tree()?;
        if primary.search(key).is_empty() {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }

        let old = self.fetch_current(key)?;
        let old_values = old
            .as_ref()
            .map(|record| record.indexed_values())
            .unwrap_or_default();

        let mut touched: Vec<String> = Vec::new();
        primary.delete(key, key);
        touched.push(self.registry_keys[PRIMARY_KEY_INDEX].clone());

        for field in R::schema().indexed_field_names() {
            let value = old_values.get(field).map(String::as_str).unwrap_or("");
            if value.is_empty() {
                continue;
            }
            let tree = self.tree(field)?;
            if tree.delete(value, key) {
                touched.push(self.registry_keys[field].clone());
            }
        }

        let mut ops = Vec::with_capacity(1 + touched.len());
        ops.push(Operation::delete(
            self.bucket.as_bytes().to_vec(),
            key.as_bytes().to_vec(),
        ));
        for registry_key in touched {
            ops.push(Operation::index_dirty(INDEX_BUCKET, &registry_key));
        }
        self.db.write_operations(token, ops)
    }

    /// Record keys whose indexed `field` equals `value`, insertion order.
    pub fn search(&self, token: &CancelToken, field: &str, value: &str) -> Result<Vec<String>> {
        token.check()?;
        self.db.ensure_open()?;
        Ok(self.tree(field)?.search(value))
    }

    /// Record keys whose indexed `field` falls inside the range, ascending
    /// by indexed value. Empty bounds are unbounded.
    pub fn range_search(
        &self,
        token: &CancelToken,
        field: &str,
        min: &str,
        max: &str,
        include_min: bool,
        include_max: bool,
    ) -> Result<Vec<String>> {
        token.check()?;
        self.db.ensure_open()?;
        Ok(self
            .tree(field)?
            .range_search(min, max, include_min, include_max))
    }

    /// Number of live records: the backing store's view of the bucket merged
    /// with the buffered, not-yet-flushed mutations.
    pub fn count(&self, token: &CancelToken) -> Result<usize> {
        token.check()?;
        self.db.ensure_open()?;

        let mut keys: BTreeSet<Vec<u8>> =
            match crate::backend::view_collect(self.db.backend.as_ref(), self.bucket.as_bytes()) {
                Ok(entries) => entries.into_iter().map(|(key, _)| key).collect(),
                Err(StoreError::BucketNotFound(_)) => BTreeSet::new(),
                Err(err) => return Err(err),
            };
        for op in self.db.buffer.scan_bucket(self.bucket.as_bytes()) {
            match op.kind {
                OpKind::Put => {
                    keys.insert(op.key);
                }
                OpKind::Delete => {
                    keys.remove(&op.key);
                }
                OpKind::IndexDirty => {}
            }
        }
        Ok(keys.len())
    }

    /// Store each record in turn. Per-record failures do not stop the batch;
    /// they are collected into one `PartialBatch` error at the end.
    pub fn put_many(&self, token: &CancelToken, records: &[R]) -> Result<()> {
        token.check()?;
        self.db.ensure_open()?;

        let mut errors = Vec::new();
        for record in records {
            if let Err(err) = self.put(token, record) {
                errors.push((record.key(), err));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::PartialBatch { errors })
        }
    }

    /// Delete each key in turn, collecting per-key failures.
    pub fn delete_many(&self, token: &CancelToken, keys: &[&str]) -> Result<()> {
        token.check()?;
        self.db.ensure_open()?;

        let mut errors = Vec::new();
        for key in keys {
            if let Err(err) = self.delete(token, key) {
                errors.push((key.to_string(), err));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::PartialBatch { errors })
        }
    }

    /// All live records in ascending key order, buffered mutations included.
    /// Records that fail to decode are skipped with a log line.
    pub fn scan(&self, token: &CancelToken) -> Result<Vec<R>> {
        token.check()?;
        self.db.ensure_open()?;

        let mut live: std::collections::BTreeMap<Vec<u8>, Vec<u8>> =
            match crate::backend::view_collect(self.db.backend.as_ref(), self.bucket.as_bytes()) {
                Ok(entries) => entries.into_iter().collect(),
                Err(StoreError::BucketNotFound(_)) => Default::default(),
                Err(err) => return Err(err),
            };
        for op in self.db.buffer.scan_bucket(self.bucket.as_bytes()) {
            match op.kind {
                OpKind::Put => {
                    live.insert(op.key, op.value);
                }
                OpKind::Delete => {
                    live.remove(&op.key);
                }
                OpKind::IndexDirty => {}
            }
        }

        let mut records = Vec::with_capacity(live.len());
        let mut skipped = 0usize;
        for value_bytes in live.values() {
            match R::decode(value_bytes) {
                Ok(record) => records.push(record),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            self.db.logger.warn(&format!(
                "bucket {}: skipped {} undecodable records during scan",
                self.bucket, skipped
            ));
        }
        Ok(records)
    }

    /// Counters for one index tree.
    pub fn index_stats(&self, token: &CancelToken, field: &str) -> Result<TreeStats> {
        token.check()?;
        self.db.ensure_open()?;
        Ok(self.tree(field)?.stats())
    }

    /// Rebuild one index from the records bucket and queue its image for the
    /// next flush.
    pub fn rebuild_index(&self, token: &CancelToken, field: &str) -> Result<()> {
        token.check()?;
        self.db.ensure_open()?;

        let registry_key = self
            .registry_keys
            .get(field)
            .cloned()
            .ok_or_else(|| {
                StoreError::InvalidConfig(format!(
                    "no index named {:?} on bucket {:?}",
                    field, self.bucket
                ))
            })?;

        let tree = self.rebuild_from_bucket(field)?;
        self.db.indexes.insert(registry_key.clone(), Arc::new(tree));
        self.db.write_operations(
            token,
            vec![Operation::index_dirty(INDEX_BUCKET, &registry_key)],
        )
    }
}
