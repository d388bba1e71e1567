//! B-tree multimap: indexed value -> record keys
//!
//! One tree backs one index. All mutation goes through the write half of a
//! coarse per-tree RW lock; searches and iteration share the read half.
//! Serialization produces a versioned image checked on the way back in.

use super::iter::RangeIter;
use super::node::Node;
use crate::{Result, StoreError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default branching factor: a node holds at most 2t-1 = 63 keys.
pub const DEFAULT_BRANCHING: usize = 32;

const IMAGE_VERSION: u32 = 1;

/// Self-describing serialized form of a tree.
#[derive(Serialize, Deserialize)]
struct TreeImage {
    version: u32,
    branching: u64,
    root: Node,
}

struct Core {
    root: Node,
    dirty: bool,
    version: u64,
}

/// Point-in-time counters for one tree.
#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    pub unique_values: usize,
    pub record_keys: usize,
    pub dirty: bool,
    pub branching: usize,
    pub version: u64,
}

pub struct BTreeIndex {
    t: usize,
    inner: RwLock<Core>,
}

enum ValueRemoval {
    /// V is not in the tree.
    ValueAbsent,
    /// V exists but K is not in its list.
    KeyAbsent,
    Removed,
    /// K was the last entry for V; the whole key must go.
    Emptied,
}

impl Default for BTreeIndex {
    fn default() -> Self {
        Self::new(DEFAULT_BRANCHING).expect("default branching is valid")
    }
}

impl BTreeIndex {
    pub fn new(branching: usize) -> Result<Self> {
        if branching < 2 {
            return Err(StoreError::InvalidConfig(format!(
                "branching factor must be at least 2, got {}",
                branching
            )));
        }
        Ok(Self {
            t: branching,
            inner: RwLock::new(Core {
                root: Node::new_leaf(),
                dirty: false,
                version: 0,
            }),
        })
    }

    pub fn branching(&self) -> usize {
        self.t
    }

    /// Add `record_key` under `value`. Grows a new root first when the old
    /// one is full.
    pub fn insert(&self, value: &str, record_key: &str) {
        let mut core = self.inner.write();
        Self::insert_locked(&mut core, self.t, value, record_key);
    }

    fn insert_locked(core: &mut Core, t: usize, value: &str, record_key: &str) {
        if core.root.is_full(t) {
            let old_root = std::mem::take(&mut core.root);
            core.root = Node {
                keys: Vec::new(),
                values: Vec::new(),
                children: vec![old_root],
                is_leaf: false,
            };
            core.root.split_child(t, 0);
        }
        core.root.insert_non_full(t, value, record_key);
        core.dirty = true;
        core.version += 1;
    }

    /// Record keys stored under `value`, in insertion order. Empty when the
    /// value is absent.
    pub fn search(&self, value: &str) -> Vec<String> {
        let core = self.inner.read();
        let mut node = &core.root;
        loop {
            match node.keys.binary_search_by(|k| k.as_str().cmp(value)) {
                Ok(i) => return node.values[i].clone(),
                Err(_) if node.is_leaf => return Vec::new(),
                Err(i) => node = &node.children[i],
            }
        }
    }

    /// Record keys for every value in the given range, ascending by value.
    /// An empty `min` (`max`) leaves the range unbounded below (above).
    pub fn range_search(
        &self,
        min: &str,
        max: &str,
        include_min: bool,
        include_max: bool,
    ) -> Vec<String> {
        let mut out = Vec::new();
        self.scan_range(min, max, include_min, include_max, |_value, record_key| {
            out.push(record_key.to_string());
        });
        out
    }

    /// Stream the range through `f` while holding the read lock.
    pub fn scan_range<F>(&self, min: &str, max: &str, include_min: bool, include_max: bool, mut f: F)
    where
        F: FnMut(&str, &str),
    {
        let core = self.inner.read();
        for (value, record_key) in RangeIter::new(&core.root, min, max, include_min, include_max) {
            f(value, record_key);
        }
    }

    /// Remove one occurrence of `record_key` from the list at `value`.
    /// Deletes the whole entry, rebalancing the tree, once the list empties.
    /// Returns whether anything was removed.
    pub fn delete(&self, value: &str, record_key: &str) -> bool {
        let mut core = self.inner.write();
        Self::delete_locked(&mut core, self.t, value, record_key)
    }

    fn delete_locked(core: &mut Core, t: usize, value: &str, record_key: &str) -> bool {
        match remove_value(&mut core.root, value, record_key) {
            ValueRemoval::ValueAbsent | ValueRemoval::KeyAbsent => false,
            ValueRemoval::Removed => {
                core.dirty = true;
                core.version += 1;
                true
            }
            ValueRemoval::Emptied => {
                delete_key(&mut core.root, t, value);
                if !core.root.is_leaf && core.root.keys.is_empty() && core.root.children.len() == 1
                {
                    core.root = core.root.children.pop().expect("single child present");
                }
                core.dirty = true;
                core.version += 1;
                true
            }
        }
    }

    /// Sort by value, then apply under one write lock.
    pub fn bulk_insert(&self, mut items: Vec<(String, String)>) {
        items.sort_by(|a, b| a.0.cmp(&b.0));
        let mut core = self.inner.write();
        for (value, record_key) in &items {
            Self::insert_locked(&mut core, self.t, value, record_key);
        }
    }

    /// Sort by value, then apply under one write lock.
    pub fn bulk_delete(&self, mut items: Vec<(String, String)>) {
        items.sort_by(|a, b| a.0.cmp(&b.0));
        let mut core = self.inner.write();
        for (value, record_key) in &items {
            Self::delete_locked(&mut core, self.t, value, record_key);
        }
    }

    /// Total number of record keys across all values.
    pub fn count_keys(&self) -> usize {
        fn count(node: &Node) -> usize {
            let own: usize = node.values.iter().map(Vec::len).sum();
            own + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.inner.read().root)
    }

    /// Number of distinct indexed values.
    pub fn count_unique_values(&self) -> usize {
        fn count(node: &Node) -> usize {
            node.keys.len() + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.inner.read().root)
    }

    /// All record keys in ascending value order.
    pub fn get_all_keys(&self) -> Vec<String> {
        self.range_search("", "", true, true)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Called once a serialized image of the tree has been committed.
    pub fn mark_clean(&self) {
        self.inner.write().dirty = false;
    }

    /// Clear the dirty flag only if the tree has not moved past `version`
    /// since the image was taken.
    pub fn mark_clean_if(&self, version: u64) {
        let mut core = self.inner.write();
        if core.version == version {
            core.dirty = false;
        }
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Counters under one read lock, so the numbers are mutually consistent.
    pub fn stats(&self) -> TreeStats {
        fn count(node: &Node) -> (usize, usize) {
            let mut unique = node.keys.len();
            let mut records: usize = node.values.iter().map(Vec::len).sum();
            for child in &node.children {
                let (u, r) = count(child);
                unique += u;
                records += r;
            }
            (unique, records)
        }
        let core = self.inner.read();
        let (unique_values, record_keys) = count(&core.root);
        TreeStats {
            unique_values,
            record_keys,
            dirty: core.dirty,
            branching: self.t,
            version: core.version,
        }
    }

    /// Versioned image of the whole tree.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let core = self.inner.read();
        let image = TreeImage {
            version: IMAGE_VERSION,
            branching: self.t as u64,
            root: core.root.clone(),
        };
        Ok(bincode::serialize(&image)?)
    }

    /// Restore a tree from `serialize` output. The result is not dirty.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let image: TreeImage = bincode::deserialize(bytes)?;
        if image.version != IMAGE_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported index image version {}",
                image.version
            )));
        }
        let t = image.branching as usize;
        if t < 2 {
            return Err(StoreError::Corruption(format!(
                "index image carries invalid branching factor {}",
                image.branching
            )));
        }
        Ok(Self {
            t,
            inner: RwLock::new(Core {
                root: image.root,
                dirty: false,
                version: 0,
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn validate(&self) {
        let core = self.inner.read();
        core.root.validate(self.t, true);
    }
}

fn remove_value(node: &mut Node, value: &str, record_key: &str) -> ValueRemoval {
    match node.keys.binary_search_by(|k| k.as_str().cmp(value)) {
        Ok(i) => {
            let list = &mut node.values[i];
            match list.iter().position(|k| k == record_key) {
                Some(pos) => {
                    list.remove(pos);
                    if list.is_empty() {
                        ValueRemoval::Emptied
                    } else {
                        ValueRemoval::Removed
                    }
                }
                None => ValueRemoval::KeyAbsent,
            }
        }
        Err(_) if node.is_leaf => ValueRemoval::ValueAbsent,
        Err(i) => remove_value(&mut node.children[i], value, record_key),
    }
}

/// Standard B-tree key deletion: remove from a leaf directly; in an internal
/// node, replace with the in-order predecessor and recurse. Underflow on the
/// way back up is fixed by borrowing from a sibling with spare keys, else by
/// merging (preferring the left sibling).
fn delete_key(node: &mut Node, t: usize, value: &str) {
    match node.keys.binary_search_by(|k| k.as_str().cmp(value)) {
        Ok(i) => {
            if node.is_leaf {
                node.keys.remove(i);
                node.values.remove(i);
            } else {
                let (pred_key, pred_values) = {
                    let (k, v) = node.children[i].max_entry();
                    (k.clone(), v.clone())
                };
                node.keys[i] = pred_key.clone();
                node.values[i] = pred_values;
                delete_key(&mut node.children[i], t, &pred_key);
                fix_underflow(node, t, i);
            }
        }
        Err(_) if node.is_leaf => {}
        Err(i) => {
            delete_key(&mut node.children[i], t, value);
            fix_underflow(node, t, i);
        }
    }
}

fn fix_underflow(node: &mut Node, t: usize, i: usize) {
    if node.children[i].keys.len() >= t - 1 {
        return;
    }
    if i > 0 && node.children[i - 1].keys.len() > t - 1 {
        borrow_from_left(node, i);
    } else if i + 1 < node.children.len() && node.children[i + 1].keys.len() > t - 1 {
        borrow_from_right(node, i);
    } else if i > 0 {
        merge_children(node, i - 1);
    } else {
        merge_children(node, i);
    }
}

/// Rotate the separator down into child `i` and the left sibling's last
/// entry up into the separator slot.
fn borrow_from_left(node: &mut Node, i: usize) {
    let (left_part, right_part) = node.children.split_at_mut(i);
    let left = left_part.last_mut().expect("left sibling exists");
    let child = &mut right_part[0];

    let moved_key = left.keys.pop().expect("left sibling has a spare key");
    let moved_values = left.values.pop().expect("left sibling has spare values");
    let sep_key = std::mem::replace(&mut node.keys[i - 1], moved_key);
    let sep_values = std::mem::replace(&mut node.values[i - 1], moved_values);
    child.keys.insert(0, sep_key);
    child.values.insert(0, sep_values);
    if !child.is_leaf {
        let grandchild = left.children.pop().expect("left sibling has a spare child");
        child.children.insert(0, grandchild);
    }
}

fn borrow_from_right(node: &mut Node, i: usize) {
    let (left_part, right_part) = node.children.split_at_mut(i + 1);
    let child = left_part.last_mut().expect("child exists");
    let right = &mut right_part[0];

    let moved_key = right.keys.remove(0);
    let moved_values = right.values.remove(0);
    let sep_key = std::mem::replace(&mut node.keys[i], moved_key);
    let sep_values = std::mem::replace(&mut node.values[i], moved_values);
    child.keys.push(sep_key);
    child.values.push(sep_values);
    if !child.is_leaf {
        child.children.push(right.children.remove(0));
    }
}

/// Fold the separator at `i` and child `i + 1` into child `i`.
fn merge_children(node: &mut Node, i: usize) {
    let right = std::mem::take(&mut node.children[i + 1]);
    let sep_key = std::mem::take(&mut node.keys[i]);
    let sep_values = std::mem::take(&mut node.values[i]);
    node.remove_key(i);

    let left = &mut node.children[i];
    left.keys.push(sep_key);
    left.values.push(sep_values);
    left.keys.extend(right.keys);
    left.values.extend(right.values);
    left.children.extend(right.children);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::collections::BTreeMap;

    fn record(i: usize) -> String {
        format!("rec-{:04}", i)
    }

    #[test]
    fn test_branching_lower_bound() {
        assert!(BTreeIndex::new(1).is_err());
        assert!(BTreeIndex::new(2).is_ok());
    }

    #[test]
    fn test_insert_search_single() {
        let tree = BTreeIndex::new(2).unwrap();
        tree.insert("alice", "u1");
        assert_eq!(tree.search("alice"), vec!["u1"]);
        assert!(tree.search("bob").is_empty());
    }

    #[test]
    fn test_insert_many_triggers_splits() {
        let tree = BTreeIndex::new(2).unwrap();
        for i in 0..500 {
            tree.insert(&format!("v{:04}", i), &record(i));
        }
        tree.validate();
        for i in 0..500 {
            assert_eq!(tree.search(&format!("v{:04}", i)), vec![record(i)]);
        }
        assert_eq!(tree.count_keys(), 500);
        assert_eq!(tree.count_unique_values(), 500);
    }

    #[test]
    fn test_duplicate_records_under_one_value() {
        let tree = BTreeIndex::new(2).unwrap();
        tree.insert("smith", "u1");
        tree.insert("smith", "u2");
        tree.insert("smith", "u1");
        assert_eq!(tree.search("smith"), vec!["u1", "u2", "u1"]);
        assert_eq!(tree.count_keys(), 3);
        assert_eq!(tree.count_unique_values(), 1);
    }

    #[test]
    fn test_delete_single_occurrence() {
        let tree = BTreeIndex::new(2).unwrap();
        tree.insert("smith", "u1");
        tree.insert("smith", "u2");
        assert!(tree.delete("smith", "u1"));
        assert_eq!(tree.search("smith"), vec!["u2"]);
        assert!(!tree.delete("smith", "missing"));
        assert!(!tree.delete("ghost", "u1"));
    }

    #[test]
    fn test_delete_last_occurrence_removes_entry() {
        let tree = BTreeIndex::new(2).unwrap();
        tree.insert("a", "u1");
        tree.insert("b", "u2");
        assert!(tree.delete("a", "u1"));
        assert!(tree.search("a").is_empty());
        assert_eq!(tree.count_unique_values(), 1);
        tree.validate();
    }

    #[test]
    fn test_delete_everything_in_order() {
        let tree = BTreeIndex::new(2).unwrap();
        let n = 300;
        for i in 0..n {
            tree.insert(&format!("v{:04}", i), &record(i));
        }
        for i in 0..n {
            assert!(tree.delete(&format!("v{:04}", i), &record(i)), "i={}", i);
            tree.validate();
        }
        assert_eq!(tree.count_keys(), 0);
        assert!(tree.get_all_keys().is_empty());
    }

    #[test]
    fn test_delete_everything_reverse_order() {
        let tree = BTreeIndex::new(3).unwrap();
        let n = 300;
        for i in 0..n {
            tree.insert(&format!("v{:04}", i), &record(i));
        }
        for i in (0..n).rev() {
            assert!(tree.delete(&format!("v{:04}", i), &record(i)));
            tree.validate();
        }
        assert_eq!(tree.count_unique_values(), 0);
    }

    #[test]
    fn test_root_collapses_after_merge() {
        let tree = BTreeIndex::new(2).unwrap();
        // Force a split (root becomes internal), then empty the tree again.
        for key in ["a", "b", "c", "d", "e"] {
            tree.insert(key, &format!("r-{}", key));
        }
        for key in ["a", "b", "c", "d", "e"] {
            assert!(tree.delete(key, &format!("r-{}", key)));
            tree.validate();
        }
        assert_eq!(tree.count_unique_values(), 0);
        // A fresh insert works against the collapsed root.
        tree.insert("z", "r-z");
        assert_eq!(tree.search("z"), vec!["r-z"]);
    }

    #[test]
    fn test_borrow_paths_during_interleaved_deletes() {
        // Deleting from alternating ends forces both borrow directions and
        // merges at several depths.
        let tree = BTreeIndex::new(2).unwrap();
        let n = 200;
        for i in 0..n {
            tree.insert(&format!("v{:04}", i), &record(i));
        }
        let mut low = 0;
        let mut high = n - 1;
        while low <= high {
            assert!(tree.delete(&format!("v{:04}", low), &record(low)));
            if high != low {
                assert!(tree.delete(&format!("v{:04}", high), &record(high)));
            }
            tree.validate();
            low += 1;
            high = high.saturating_sub(1);
            if high == 0 && low > 0 {
                break;
            }
        }
        // Whatever remains is still consistent and searchable.
        for key in tree.get_all_keys() {
            assert!(!key.is_empty());
        }
        tree.validate();
    }

    #[test]
    fn test_random_insert_delete_matches_model() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let tree = BTreeIndex::new(2).unwrap();
        let mut model: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for step in 0..4000 {
            let value = format!("v{:02}", rng.gen_range(0..60));
            let key = record(rng.gen_range(0..200));
            if rng.gen_bool(0.6) {
                tree.insert(&value, &key);
                model.entry(value).or_default().push(key);
            } else {
                let removed = tree.delete(&value, &key);
                let expected = match model.get_mut(&value) {
                    Some(list) => match list.iter().position(|k| *k == key) {
                        Some(pos) => {
                            list.remove(pos);
                            if list.is_empty() {
                                model.remove(&value);
                            }
                            true
                        }
                        None => false,
                    },
                    None => false,
                };
                assert_eq!(removed, expected, "step {}", step);
            }
            if step % 500 == 0 {
                tree.validate();
            }
        }

        tree.validate();
        for (value, list) in &model {
            assert_eq!(&tree.search(value), list, "value {}", value);
        }
        assert_eq!(
            tree.count_keys(),
            model.values().map(Vec::len).sum::<usize>()
        );
        assert_eq!(tree.count_unique_values(), model.len());
    }

    #[test]
    fn test_range_matches_search_concatenation() {
        let mut rng = StdRng::seed_from_u64(7);
        let tree = BTreeIndex::new(2).unwrap();
        let mut values: Vec<String> = (0..80).map(|i| format!("v{:03}", i)).collect();
        values.shuffle(&mut rng);
        for (i, value) in values.iter().enumerate() {
            tree.insert(value, &record(i));
            tree.insert(value, &record(i + 1000));
        }

        let got = tree.range_search("v010", "v020", true, false);
        let mut want = Vec::new();
        for i in 10..20 {
            want.extend(tree.search(&format!("v{:03}", i)));
        }
        assert_eq!(got, want);
    }

    #[test]
    fn test_bulk_insert_and_delete() {
        let tree = BTreeIndex::new(2).unwrap();
        let items: Vec<(String, String)> = (0..100)
            .rev()
            .map(|i| (format!("v{:03}", i), record(i)))
            .collect();
        tree.bulk_insert(items.clone());
        tree.validate();
        assert_eq!(tree.count_keys(), 100);

        tree.bulk_delete(items);
        assert_eq!(tree.count_keys(), 0);
    }

    #[test]
    fn test_serialize_roundtrip_preserves_traversal_and_clears_dirty() {
        let tree = BTreeIndex::new(2).unwrap();
        for i in 0..200 {
            tree.insert(&format!("v{:03}", i % 40), &record(i));
        }
        assert!(tree.is_dirty());

        let image = tree.serialize().unwrap();
        let restored = BTreeIndex::deserialize(&image).unwrap();

        assert!(!restored.is_dirty());
        assert_eq!(restored.branching(), tree.branching());
        assert_eq!(restored.get_all_keys(), tree.get_all_keys());
        restored.validate();
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(BTreeIndex::deserialize(b"not an image").is_err());
    }

    #[test]
    fn test_dirty_tracking() {
        let tree = BTreeIndex::new(2).unwrap();
        assert!(!tree.is_dirty());
        tree.insert("a", "u1");
        assert!(tree.is_dirty());
        tree.mark_clean();
        assert!(!tree.is_dirty());
        tree.delete("a", "u1");
        assert!(tree.is_dirty());
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let tree = BTreeIndex::new(2).unwrap();
        let v0 = tree.version();
        tree.insert("a", "u1");
        assert!(tree.version() > v0);
    }

    #[test]
    fn test_concurrent_mutators_keep_shape() {
        use std::sync::Arc;
        let tree = Arc::new(BTreeIndex::new(2).unwrap());
        let mut handles = Vec::new();
        for worker in 0..4 {
            let tree = Arc::clone(&tree);
            handles.push(std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                for i in 0..500 {
                    let value = format!("w{}-v{:02}", worker, rng.gen_range(0..40));
                    let key = format!("w{}-r{:03}", worker, i);
                    tree.insert(&value, &key);
                    if rng.gen_bool(0.3) {
                        tree.delete(&value, &key);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        tree.validate();

        // Every surviving key is findable through search.
        let all = tree.get_all_keys();
        assert_eq!(all.len(), tree.count_keys());
    }
}
