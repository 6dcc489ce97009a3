// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt;
use std::str;

use super::HexRepr;
use super::Key;
use super::Value;

/// A key/value pair read at some snapshot version.
///
/// # Examples
/// ```rust
/// # use percolator_client::{Key, KvPair};
/// let pair = KvPair::new("key", b"value".to_vec());
/// assert_eq!(pair.key(), &Key::from("key"));
/// assert_eq!(KvPair::from((Key::from("key"), b"value".to_vec())), pair);
/// ```
#[derive(Default, Clone, Eq, PartialEq, Hash)]
pub struct KvPair {
    pub key: Key,
    pub value: Value,
}

impl KvPair {
    #[inline]
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        KvPair {
            key: key.into(),
            value: value.into(),
        }
    }

    #[inline]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[inline]
    pub fn into_key(self) -> Key {
        self.key
    }

    #[inline]
    pub fn into_value(self) -> Value {
        self.value
    }
}

impl<K, V> From<(K, V)> for KvPair
where
    K: Into<Key>,
    V: Into<Value>,
{
    fn from((k, v): (K, V)) -> Self {
        KvPair::new(k, v)
    }
}

impl From<KvPair> for (Key, Value) {
    fn from(pair: KvPair) -> Self {
        (pair.key, pair.value)
    }
}

impl fmt::Debug for KvPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match str::from_utf8(&self.value) {
            Ok(s) => write!(f, "KvPair({:?}, {:?})", self.key, s),
            Err(_) => write!(f, "KvPair({:?}, {})", self.key, HexRepr(&self.value)),
        }
    }
}
