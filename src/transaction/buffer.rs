// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::ops::Bound;
use std::ops::RangeBounds;

use crate::store::Mutation;
use crate::store::MutationOp;
use crate::Key;
use crate::KvPair;
use crate::Value;

/// Buffered writes of a transaction.
///
/// Keys keep the position of their first write; a later write to the same key replaces the
/// earlier one. The first key written is the primary.
#[derive(Default, Debug, Clone)]
pub(crate) struct Buffer {
    order: Vec<Key>,
    entries: HashMap<Key, MutationOp>,
}

impl Buffer {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn primary_key(&self) -> Option<&Key> {
        self.order.first()
    }

    pub fn put(&mut self, key: Key, value: Value) {
        self.insert_op(key, MutationOp::Put(value));
    }

    pub fn insert(&mut self, key: Key, value: Value) {
        self.insert_op(key, MutationOp::Insert(value));
    }

    pub fn delete(&mut self, key: Key) {
        self.insert_op(key, MutationOp::Delete);
    }

    fn insert_op(&mut self, key: Key, op: MutationOp) {
        if self.entries.insert(key.clone(), op).is_none() {
            self.order.push(key);
        }
    }

    /// `Some(None)` when the key is buffered as deleted, `None` when it is not buffered at all.
    pub fn get(&self, key: &Key) -> Option<Option<Value>> {
        self.entries.get(key).map(|op| match op {
            MutationOp::Put(v) | MutationOp::Insert(v) => Some(v.clone()),
            MutationOp::Delete => None,
        })
    }

    /// Buffered entries inside `range`, sorted by key. Deletes carry `None`.
    pub fn scan(&self, range: &impl RangeBounds<Key>) -> Vec<(Key, Option<Value>)> {
        let mut found: Vec<_> = self
            .entries
            .keys()
            .filter(|k| in_range(range, k))
            .map(|k| (k.clone(), self.get(k).flatten()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Bytes of keys and values, as used by the lock TTL policy.
    pub fn write_size(&self) -> u64 {
        self.mutations().iter().map(|m| m.size() as u64).sum()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.order.clone()
    }

    /// Mutations in first-write order.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.order
            .iter()
            .filter_map(|k| {
                self.entries
                    .get(k)
                    .map(|op| Mutation::new(k.clone(), op.clone()))
            })
            .collect()
    }

    /// Overlay buffered writes on `pairs` read from a snapshot. Returns sorted pairs.
    pub fn merge_scan(&self, range: &impl RangeBounds<Key>, pairs: Vec<KvPair>) -> Vec<KvPair> {
        let mut merged: std::collections::BTreeMap<Key, Value> = pairs
            .into_iter()
            .map(|p| (p.key, p.value))
            .collect();
        for (key, value) in self.scan(range) {
            match value {
                Some(v) => {
                    merged.insert(key, v);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }
        merged.into_iter().map(KvPair::from).collect()
    }
}

fn in_range(range: &impl RangeBounds<Key>, key: &Key) -> bool {
    let after_start = match range.start_bound() {
        Bound::Included(s) => key >= s,
        Bound::Excluded(s) => key > s,
        Bound::Unbounded => true,
    };
    let before_end = match range.end_bound() {
        Bound::Included(e) => key <= e,
        Bound::Excluded(e) => key < e,
        Bound::Unbounded => true,
    };
    after_start && before_end
}
