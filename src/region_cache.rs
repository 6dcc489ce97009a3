// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use tokio::sync::RwLock;

use crate::pd::PdClient;
use crate::region::Region;
use crate::region::RegionId;
use crate::region::RegionVerId;
use crate::Key;
use crate::Result;

/// Maps keys to regions.
///
/// Lookups may be served from a cache; `invalidate` drops exactly one region version, so a
/// concurrent batch that already refreshed the entry is not thrown back to a stale miss.
#[async_trait]
pub trait RegionRouter: Send + Sync + 'static {
    async fn locate(&self, key: &Key) -> Result<Region>;

    async fn invalidate(&self, ver_id: &RegionVerId);

    /// Point a cached region at a new leader reported by a not-leader error.
    async fn update_leader(&self, ver_id: &RegionVerId, leader: String) {
        let _ = leader;
        self.invalidate(ver_id).await;
    }
}

/// The cached region entry along with its expiration timestamp.
///
/// `ttl_epoch_sec` is an epoch timestamp in seconds. It is refreshed on access to approximate an
/// "idle TTL" (hot regions stay cached).
struct CachedRegion {
    region: Region,
    ttl_epoch_sec: AtomicI64,
}

#[derive(Clone, Copy, Debug)]
struct RegionCacheTtl {
    base_sec: i64,
    jitter_sec: i64,
}

impl RegionCacheTtl {
    fn new(base: Duration, jitter: Duration) -> RegionCacheTtl {
        RegionCacheTtl {
            base_sec: i64::try_from(base.as_secs()).unwrap_or(i64::MAX),
            jitter_sec: i64::try_from(jitter.as_secs()).unwrap_or(i64::MAX),
        }
    }

    fn next_ttl(self, now_epoch_sec: i64) -> i64 {
        if self.base_sec <= 0 {
            return i64::MAX;
        }
        let jitter = if self.jitter_sec > 0 {
            rand::thread_rng().gen_range(0..self.jitter_sec)
        } else {
            0
        };
        now_epoch_sec
            .saturating_add(self.base_sec)
            .saturating_add(jitter)
    }

    /// Returns `true` if the TTL is still valid, pushing it forward when it is about to lapse.
    fn check_and_refresh(self, ttl_epoch_sec: &AtomicI64, now_epoch_sec: i64) -> bool {
        let ttl = ttl_epoch_sec.load(Ordering::Relaxed);
        if now_epoch_sec > ttl {
            return false;
        }
        if ttl <= now_epoch_sec.saturating_add(self.base_sec) {
            // Losing this race only means another reader refreshed it first.
            let _ = ttl_epoch_sec.compare_exchange(
                ttl,
                self.next_ttl(now_epoch_sec),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
        true
    }
}

fn now_epoch_sec() -> i64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;

    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    )
    .unwrap_or(0)
}

#[derive(Default)]
struct RegionCacheMap {
    /// RegionVerID -> Region.
    ver_id_to_region: HashMap<RegionVerId, CachedRegion>,
    /// Start_key -> RegionVerID
    ///
    /// Invariant: there are no intersecting regions in the map at any time.
    key_to_ver_id: BTreeMap<Key, RegionVerId>,
    /// RegionID -> RegionVerID of the newest cached version.
    id_to_ver_id: HashMap<RegionId, RegionVerId>,
}

/// A read-mostly region cache in front of a [`PdClient`].
pub struct RegionCache<P: PdClient> {
    region_cache: RwLock<RegionCacheMap>,
    pd: Arc<P>,
    ttl: RegionCacheTtl,
}

impl<P: PdClient> RegionCache<P> {
    pub fn new(pd: Arc<P>, region_cache_ttl: Duration, region_cache_ttl_jitter: Duration) -> Self {
        RegionCache {
            region_cache: RwLock::new(RegionCacheMap::default()),
            pd,
            ttl: RegionCacheTtl::new(region_cache_ttl, region_cache_ttl_jitter),
        }
    }

    // Retrieve cache entry by key. If there's no entry, query PD and update cache.
    pub async fn get_region_by_key(&self, key: &Key) -> Result<Region> {
        let now = now_epoch_sec();
        {
            let cache = self.region_cache.read().await;
            if let Some((_, ver_id)) = cache.key_to_ver_id.range(..=key).next_back() {
                if let Some(cached) = cache.ver_id_to_region.get(ver_id) {
                    if cached.region.contains(key)
                        && self.ttl.check_and_refresh(&cached.ttl_epoch_sec, now)
                    {
                        return Ok(cached.region.clone());
                    }
                }
            }
        }
        self.read_through_region_by_key(key).await
    }

    /// Force read through (query from PD) and update cache
    pub async fn read_through_region_by_key(&self, key: &Key) -> Result<Region> {
        let region = self.pd.get_region(key).await?;
        self.add_region(region.clone()).await;
        Ok(region)
    }

    pub async fn add_region(&self, region: Region) {
        let mut cache = self.region_cache.write().await;
        let ttl_epoch_sec = self.ttl.next_ttl(now_epoch_sec());

        let mut to_be_removed = Vec::new();
        if let Some(ver_id) = cache.id_to_ver_id.get(&region.id()) {
            if *ver_id != region.ver_id {
                to_be_removed.push(ver_id.clone());
            }
        }

        // Scan backwards from the new region's end key and drop every overlapping entry.
        {
            let range = if region.end_key.is_empty() {
                cache.key_to_ver_id.range(..)
            } else {
                cache.key_to_ver_id.range(..region.end_key.clone())
            };
            for (_, ver_id) in range.rev() {
                let overlaps = cache.ver_id_to_region.get(ver_id).map_or(true, |cached| {
                    cached.region.end_key.is_empty() || cached.region.end_key > region.start_key
                });
                if !overlaps {
                    break;
                }
                to_be_removed.push(ver_id.clone());
            }
        }

        for ver_id in to_be_removed {
            if let Some(removed) = cache.ver_id_to_region.remove(&ver_id) {
                if cache.key_to_ver_id.get(&removed.region.start_key) == Some(&ver_id) {
                    cache.key_to_ver_id.remove(&removed.region.start_key);
                }
                if cache.id_to_ver_id.get(&removed.region.id()) == Some(&ver_id) {
                    cache.id_to_ver_id.remove(&removed.region.id());
                }
            }
        }

        let ver_id = region.ver_id();
        cache
            .key_to_ver_id
            .insert(region.start_key(), ver_id.clone());
        cache.id_to_ver_id.insert(region.id(), ver_id.clone());
        cache.ver_id_to_region.insert(
            ver_id,
            CachedRegion {
                region,
                ttl_epoch_sec: AtomicI64::new(ttl_epoch_sec),
            },
        );
    }

    pub async fn invalidate_region_cache(&self, ver_id: &RegionVerId) {
        let mut cache = self.region_cache.write().await;
        if let Some(removed) = cache.ver_id_to_region.remove(ver_id) {
            debug!("invalidate region cache, region: {:?}", ver_id);
            if cache.key_to_ver_id.get(&removed.region.start_key) == Some(ver_id) {
                cache.key_to_ver_id.remove(&removed.region.start_key);
            }
            if cache.id_to_ver_id.get(&ver_id.id) == Some(ver_id) {
                cache.id_to_ver_id.remove(&ver_id.id);
            }
        }
    }

    pub async fn update_leader(&self, ver_id: &RegionVerId, leader: String) {
        let mut cache = self.region_cache.write().await;
        if let Some(cached) = cache.ver_id_to_region.get_mut(ver_id) {
            cached.region.leader = leader;
            cached
                .ttl_epoch_sec
                .store(self.ttl.next_ttl(now_epoch_sec()), Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl<P: PdClient> RegionRouter for RegionCache<P> {
    async fn locate(&self, key: &Key) -> Result<Region> {
        self.get_region_by_key(key).await
    }

    async fn invalidate(&self, ver_id: &RegionVerId) {
        self.invalidate_region_cache(ver_id).await
    }

    async fn update_leader(&self, ver_id: &RegionVerId, leader: String) {
        RegionCache::update_leader(self, ver_id, leader).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Mutex;

    use super::*;
    use crate::internal_err;

    #[derive(Default)]
    struct MockPd {
        regions: Mutex<Vec<Region>>,
        get_region_count: AtomicU64,
    }

    #[async_trait]
    impl PdClient for MockPd {
        async fn get_region(&self, key: &Key) -> Result<Region> {
            self.get_region_count.fetch_add(1, SeqCst);
            self.regions
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.contains(key))
                .cloned()
                .ok_or_else(|| internal_err!("region not found"))
        }

        async fn get_timestamp(&self) -> Result<u64> {
            Ok(1)
        }
    }

    fn region(id: u64, ver: u64, start: &'static str, end: &'static str) -> Region {
        Region::new(RegionVerId::new(id, 1, ver), start.into(), end.into(), "store1")
    }

    fn cache(pd: Arc<MockPd>) -> RegionCache<MockPd> {
        RegionCache::new(pd, Duration::from_secs(600), Duration::ZERO)
    }

    #[tokio::test]
    async fn cache_is_used_after_first_lookup() -> Result<()> {
        let pd = Arc::new(MockPd::default());
        pd.regions.lock().unwrap().push(region(1, 1, "", "m"));
        pd.regions.lock().unwrap().push(region(2, 1, "m", ""));
        let cache = cache(pd.clone());

        assert_eq!(cache.locate(&"a".into()).await?.id(), 1);
        assert_eq!(cache.locate(&"b".into()).await?.id(), 1);
        assert_eq!(cache.locate(&"x".into()).await?.id(), 2);
        assert_eq!(pd.get_region_count.load(SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_only_drops_matching_version() -> Result<()> {
        let pd = Arc::new(MockPd::default());
        pd.regions.lock().unwrap().push(region(1, 1, "", ""));
        let cache = cache(pd.clone());
        let stale = cache.locate(&"a".into()).await?.ver_id();

        // The region splits; PD now knows two regions.
        *pd.regions.lock().unwrap() = vec![region(1, 2, "", "m"), region(3, 2, "m", "")];
        cache.invalidate(&stale).await;
        let fresh = cache.locate(&"a".into()).await?;
        assert_eq!(fresh.ver_id.ver, 2);

        // A late invalidation of the old version must not evict the fresh entry.
        cache.invalidate(&stale).await;
        let before = pd.get_region_count.load(SeqCst);
        assert_eq!(cache.locate(&"a".into()).await?.ver_id, fresh.ver_id);
        assert_eq!(pd.get_region_count.load(SeqCst), before);
        Ok(())
    }

    #[tokio::test]
    async fn add_region_replaces_overlapping_entries() {
        let cache = cache(Arc::new(MockPd::default()));
        cache.add_region(region(1, 1, "", "m")).await;
        cache.add_region(region(2, 1, "m", "")).await;
        cache.add_region(region(3, 2, "k", "p")).await;

        let map = cache.region_cache.read().await;
        assert_eq!(map.ver_id_to_region.len(), 1);
        assert_eq!(
            map.key_to_ver_id.get(&Key::from("k")),
            Some(&RegionVerId::new(3, 1, 2))
        );
    }

    #[tokio::test]
    async fn update_leader_keeps_entry() -> Result<()> {
        let pd = Arc::new(MockPd::default());
        pd.regions.lock().unwrap().push(region(1, 1, "", ""));
        let cache = cache(pd.clone());
        let ver_id = cache.locate(&"a".into()).await?.ver_id();

        RegionRouter::update_leader(&cache, &ver_id, "store2".to_owned()).await;
        assert_eq!(cache.locate(&"a".into()).await?.leader_addr(), "store2");
        assert_eq!(pd.get_region_count.load(SeqCst), 1);
        Ok(())
    }
}
