// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;

use crate::region::Region;
use crate::region::RegionVerId;
use crate::region_cache::RegionRouter;
use crate::Key;
use crate::Result;

/// Keys of one request attempt against one region.
///
/// Only valid for a single attempt: after a region error the keys are grouped again against
/// fresh routing data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchKeys {
    pub region: Region,
    pub keys: Vec<Key>,
    /// How many keys of the operation fall into `region`. `u64::MAX` once the keys were
    /// regrouped and the count is unknown.
    pub txn_size: u64,
}

impl BatchKeys {
    pub fn new(region: Region, keys: Vec<Key>) -> Self {
        let txn_size = keys.len() as u64;
        BatchKeys {
            region,
            keys,
            txn_size,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Group `keys` by the region each of them currently belongs to, in first-seen order.
pub(crate) async fn group_keys_by_region(
    router: &dyn RegionRouter,
    keys: impl IntoIterator<Item = Key>,
) -> Result<Vec<BatchKeys>> {
    let mut groups: Vec<BatchKeys> = Vec::new();
    let mut index: HashMap<RegionVerId, usize> = HashMap::new();
    for key in keys {
        // Sorted input mostly stays in the previous region.
        if let Some(last) = groups.last_mut() {
            if last.region.contains(&key) {
                last.keys.push(key);
                continue;
            }
        }
        let region = router.locate(&key).await?;
        match index.get(&region.ver_id) {
            Some(&i) => groups[i].keys.push(key),
            None => {
                index.insert(region.ver_id(), groups.len());
                groups.push(BatchKeys::new(region, vec![key]));
            }
        }
    }
    for group in &mut groups {
        group.txn_size = group.keys.len() as u64;
    }
    Ok(groups)
}

/// Split each region group into batches of at most `limit` bytes as measured by `size_of`.
/// A batch always holds at least one key. The batch holding `primary` comes first.
pub(crate) fn split_by_size(
    groups: Vec<BatchKeys>,
    limit: u64,
    size_of: impl Fn(&Key) -> usize,
    primary: Option<&Key>,
) -> Vec<BatchKeys> {
    let mut batches = Vec::new();
    for group in groups {
        let BatchKeys {
            region,
            keys,
            txn_size,
        } = group;
        let mut current = Vec::new();
        let mut current_size = 0u64;
        for key in keys {
            let size = size_of(&key) as u64;
            if !current.is_empty() && current_size + size > limit {
                batches.push(BatchKeys {
                    region: region.clone(),
                    keys: std::mem::take(&mut current),
                    txn_size,
                });
                current_size = 0;
            }
            current_size += size;
            current.push(key);
        }
        if !current.is_empty() {
            batches.push(BatchKeys {
                region,
                keys: current,
                txn_size,
            });
        }
    }

    if let Some(primary) = primary {
        if let Some(pos) = batches.iter().position(|b| b.contains(primary)) {
            let first = batches.remove(pos);
            batches.insert(0, first);
        }
    }
    batches
}
