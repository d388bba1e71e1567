//! B-tree node and node-level operations
//!
//! A node holds between t-1 and 2t-1 keys (the root may hold fewer), each key
//! paired with the non-empty list of record keys inserted under it. Children
//! are owned directly; parents are never linked back.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Node {
    /// Indexed values, strictly ascending.
    pub keys: Vec<String>,
    /// `values[i]` is the record-key list for `keys[i]`, in insertion order.
    pub values: Vec<Vec<String>>,
    /// Empty for leaves; `keys.len() + 1` entries otherwise.
    pub children: Vec<Node>,
    pub is_leaf: bool,
}

impl Default for Node {
    fn default() -> Self {
        Node::new_leaf()
    }
}

impl Node {
    pub fn new_leaf() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            is_leaf: true,
        }
    }

    pub fn is_full(&self, t: usize) -> bool {
        self.keys.len() >= 2 * t - 1
    }

    pub fn is_underfilled(&self, t: usize, is_root: bool) -> bool {
        !is_root && self.keys.len() < t - 1
    }

    /// Split the full child at `i` around its median entry. The median moves
    /// up into `self` at position `i`; the new right sibling lands at `i + 1`.
    /// Both halves end up with exactly t-1 keys.
    pub fn split_child(&mut self, t: usize, i: usize) {
        let child = &mut self.children[i];
        debug_assert!(child.is_full(t), "split_child on a non-full child");

        let right_keys = child.keys.split_off(t);
        let right_values = child.values.split_off(t);
        let right_children = if child.is_leaf {
            Vec::new()
        } else {
            child.children.split_off(t)
        };

        let median_key = child.keys.pop().expect("median key present after split_off");
        let median_values = child
            .values
            .pop()
            .expect("median values present after split_off");

        let right = Node {
            keys: right_keys,
            values: right_values,
            children: right_children,
            is_leaf: child.is_leaf,
        };

        self.keys.insert(i, median_key);
        self.values.insert(i, median_values);
        self.children.insert(i + 1, right);
    }

    /// Insert into a node known to be non-full, splitting full children on
    /// the way down. Structural violations here are bugs, hence the panics.
    pub fn insert_non_full(&mut self, t: usize, key: &str, value: &str) {
        assert!(!self.is_full(t), "insert_non_full on a full node");
        assert_eq!(
            self.keys.len(),
            self.values.len(),
            "key/value count mismatch"
        );
        if !self.is_leaf {
            assert_eq!(
                self.children.len(),
                self.keys.len() + 1,
                "internal node child count mismatch"
            );
        }

        match self.keys.binary_search_by(|k| k.as_str().cmp(key)) {
            Ok(i) => {
                // Same indexed value again: append to its record-key list.
                // Duplicates within one list are permitted.
                self.values[i].push(value.to_string());
            }
            Err(i) if self.is_leaf => {
                self.keys.insert(i, key.to_string());
                self.values.insert(i, vec![value.to_string()]);
            }
            Err(mut i) => {
                if self.children[i].is_full(t) {
                    self.split_child(t, i);
                    match key.cmp(self.keys[i].as_str()) {
                        std::cmp::Ordering::Greater => i += 1,
                        std::cmp::Ordering::Equal => {
                            // The promoted median is the key being inserted.
                            self.values[i].push(value.to_string());
                            return;
                        }
                        std::cmp::Ordering::Less => {}
                    }
                }
                self.children[i].insert_non_full(t, key, value);
            }
        }
    }

    /// Erase entry `i` and, in an internal node, the child after it.
    pub fn remove_key(&mut self, i: usize) {
        self.keys.remove(i);
        self.values.remove(i);
        if !self.is_leaf {
            self.children.remove(i + 1);
        }
    }

    /// Rightmost entry of the subtree rooted here.
    pub fn max_entry(&self) -> (&String, &Vec<String>) {
        let mut node = self;
        while !node.is_leaf {
            node = node.children.last().expect("internal node has children");
        }
        let last = node.keys.len() - 1;
        (&node.keys[last], &node.values[last])
    }

    /// Shape check used by tests: key/value parity, child counts, strict key
    /// order, and fill bounds for non-root nodes.
    #[cfg(test)]
    pub fn validate(&self, t: usize, is_root: bool) {
        assert_eq!(self.keys.len(), self.values.len());
        assert!(self.keys.len() <= 2 * t - 1, "node over-full");
        if !is_root {
            assert!(self.keys.len() >= t - 1, "non-root node under-filled");
        }
        for window in self.keys.windows(2) {
            assert!(window[0] < window[1], "keys not strictly ascending");
        }
        for list in &self.values {
            assert!(!list.is_empty(), "empty record-key list kept in tree");
        }
        if self.is_leaf {
            assert!(self.children.is_empty());
        } else {
            assert_eq!(self.children.len(), self.keys.len() + 1);
            for child in &self.children {
                child.validate(t, false);
            }
        }
    }
}
