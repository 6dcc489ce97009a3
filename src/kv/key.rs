// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt;

use super::HexRepr;

/// The key part of a key/value pair.
///
/// Keys are an ordered sequence of bytes; `UTF-8` is not required. Regions partition the key space
/// by this ordering, so `Key` orders lexicographically by its bytes.
///
/// # Examples
/// ```rust
/// use percolator_client::Key;
///
/// let from_str = Key::from("k1");
/// let from_vec = Key::from(b"k1".to_vec());
/// assert_eq!(from_str, from_vec);
/// assert!(Key::from("k1") < Key::from("k2"));
/// ```
#[derive(Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Key(pub(crate) Vec<u8>);

impl Key {
    /// The empty key.
    pub const EMPTY: Self = Key(Vec::new());

    /// Return whether the key is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Push a zero to the end of the key.
    ///
    /// Extending a zero makes the new key the smallest key that is greater than than the original one.
    #[inline]
    #[must_use]
    pub(crate) fn next_key(mut self) -> Self {
        self.0.push(0);
        self
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key(v)
    }
}

impl From<String> for Key {
    fn from(v: String) -> Key {
        Key(v.into_bytes())
    }
}

impl From<&'static str> for Key {
    fn from(v: &'static str) -> Key {
        Key(v.as_bytes().to_vec())
    }
}

impl From<Key> for Vec<u8> {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl<'a> From<&'a Key> for &'a [u8] {
    fn from(key: &'a Key) -> Self {
        &key.0
    }
}

impl AsRef<Key> for Key {
    fn as_ref(&self) -> &Key {
        self
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => write!(f, "Key({s:?})"),
            _ => write!(f, "Key({})", HexRepr(&self.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_key_is_smallest_successor() {
        let k = Key::from("a");
        let next = k.clone().next_key();
        assert!(next > k);
        assert!(next < Key::from("a\x01".to_owned()));
        assert!(next < Key::from("b"));
    }

    #[test]
    fn debug_falls_back_to_hex() {
        assert_eq!(format!("{:?}", Key::from("abc")), "Key(\"abc\")");
        assert_eq!(format!("{:?}", Key::from(vec![0xAA, 0x01])), "Key(AA01)");
    }
}
