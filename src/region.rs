// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use derive_new::new;

use crate::Key;

pub type RegionId = u64;

/// Identifies a region *across time*: a split, merge or membership change bumps the epoch, so
/// the same `id` may map to different key ranges under different `RegionVerId`s.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Default, Debug, new)]
pub struct RegionVerId {
    pub id: RegionId,
    pub conf_ver: u64,
    pub ver: u64,
}

/// A contiguous key range `[start_key, end_key)` with the address of its current leader.
///
/// An empty `end_key` means the range is unbounded above.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub ver_id: RegionVerId,
    pub start_key: Key,
    pub end_key: Key,
    pub leader: String,
}

impl Region {
    pub fn new(ver_id: RegionVerId, start_key: Key, end_key: Key, leader: impl Into<String>) -> Self {
        Region {
            ver_id,
            start_key,
            end_key,
            leader: leader.into(),
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.start_key && (self.end_key.is_empty() || *key < self.end_key)
    }

    pub fn id(&self) -> RegionId {
        self.ver_id.id
    }

    pub fn ver_id(&self) -> RegionVerId {
        self.ver_id.clone()
    }

    pub fn start_key(&self) -> Key {
        self.start_key.clone()
    }

    pub fn end_key(&self) -> Key {
        self.end_key.clone()
    }

    pub fn leader_addr(&self) -> &str {
        &self.leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_respects_half_open_range() {
        let region = Region::new(RegionVerId::new(1, 1, 1), "b".into(), "d".into(), "store1");
        assert!(!region.contains(&"a".into()));
        assert!(region.contains(&"b".into()));
        assert!(region.contains(&Key::from(vec![b'c', 0xff])));
        assert!(!region.contains(&"d".into()));

        let last = Region::new(RegionVerId::new(2, 1, 1), "d".into(), Key::EMPTY, "store1");
        assert!(last.contains(&"zzzz".into()));
    }
}
