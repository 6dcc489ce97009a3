// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! An in-memory cluster for tests.
//!
//! [`MockCluster`] is both the [`PdClient`] (regions and timestamps) and the [`KvClient`]
//! (storage), backed by a single MVCC store. Regions can be split at runtime, which bumps their
//! epoch so cached routing goes stale. Faults can be injected per region or per command.

mod mvcc;
mod oracle;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use self::mvcc::MvccStore;
use self::oracle::LocalOracle;
use crate::pd::PdClient;
use crate::region::Region;
use crate::region::RegionId;
use crate::region::RegionVerId;
use crate::region_cache::RegionCache;
use crate::store::BatchGetResponse;
use crate::store::BatchRollbackResponse;
use crate::store::CheckTxnStatusResponse;
use crate::store::Command;
use crate::store::CommitResponse;
use crate::store::GetResponse;
use crate::store::KvClient;
use crate::store::KvRequest;
use crate::store::KvResponse;
use crate::store::KvStore;
use crate::store::LockInfo;
use crate::store::PrewriteResponse;
use crate::store::RegionError;
use crate::store::ResolveLockResponse;
use crate::store::ResponseBody;
use crate::store::ScanResponse;
use crate::Error;
use crate::Key;
use crate::Result;
use crate::Value;

const STORE_ADDR: &str = "store1";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

#[derive(Default)]
struct Faults {
    region_errors: HashMap<RegionId, VecDeque<RegionError>>,
    transport_errors: HashMap<RegionId, usize>,
    command_errors: HashMap<&'static str, usize>,
    delays: HashMap<RegionId, Duration>,
}

pub struct MockCluster {
    oracle: LocalOracle,
    regions: Mutex<Vec<Region>>,
    next_region_id: Mutex<RegionId>,
    mvcc: Mutex<MvccStore>,
    faults: Mutex<Faults>,
    requests: Mutex<HashMap<&'static str, usize>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// A cluster with a single region covering every key.
    pub fn new() -> Self {
        let region = Region::new(RegionVerId::new(1, 1, 1), Key::EMPTY, Key::EMPTY, STORE_ADDR);
        MockCluster {
            oracle: LocalOracle::default(),
            regions: Mutex::new(vec![region]),
            next_region_id: Mutex::new(2),
            mvcc: Mutex::new(MvccStore::default()),
            faults: Mutex::new(Faults::default()),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// A store routed through a fresh region cache over this cluster.
    pub fn kv_store(self: &Arc<Self>) -> KvStore {
        let cache = RegionCache::new(self.clone(), Duration::from_secs(600), Duration::ZERO);
        KvStore::new(Arc::new(cache), self.clone(), self.clone())
    }

    /// Split the region containing `key` at `key`. Both halves get a new version.
    pub fn split(&self, key: impl Into<Key>) {
        let key = key.into();
        let mut regions = lock(&self.regions);
        let Some(pos) = regions.iter().position(|r| r.contains(&key)) else {
            return;
        };
        if regions[pos].start_key == key {
            return;
        }
        let mut id = lock(&self.next_region_id);
        let old = regions.remove(pos);
        let ver = old.ver_id.ver + 1;
        let left = Region::new(
            RegionVerId::new(old.id(), old.ver_id.conf_ver, ver),
            old.start_key.clone(),
            key.clone(),
            STORE_ADDR,
        );
        let right = Region::new(
            RegionVerId::new(*id, old.ver_id.conf_ver, ver),
            key,
            old.end_key.clone(),
            STORE_ADDR,
        );
        *id += 1;
        debug!("mock split {:?} into {:?} and {:?}", old.ver_id, left.ver_id, right.ver_id);
        regions.insert(pos, right);
        regions.insert(pos, left);
    }

    pub fn region_for(&self, key: impl Into<Key>) -> Region {
        let key = key.into();
        lock(&self.regions)
            .iter()
            .find(|r| r.contains(&key))
            .cloned()
            .unwrap_or_else(|| panic!("no region for {key:?}"))
    }

    pub fn region_count(&self) -> usize {
        lock(&self.regions).len()
    }

    /// The next request to `region_id` fails with `err` instead of being applied.
    pub fn inject_region_error(&self, region_id: RegionId, err: RegionError) {
        lock(&self.faults)
            .region_errors
            .entry(region_id)
            .or_default()
            .push_back(err);
    }

    /// The next `count` requests to `region_id` fail in transport without reaching the store.
    pub fn inject_transport_errors(&self, region_id: RegionId, count: usize) {
        lock(&self.faults).transport_errors.insert(region_id, count);
    }

    /// The next `count` requests of kind `label` (see [`Command::label`]) fail in transport.
    pub fn inject_command_errors(&self, label: &'static str, count: usize) {
        lock(&self.faults).command_errors.insert(label, count);
    }

    pub fn clear_command_errors(&self) {
        lock(&self.faults).command_errors.clear();
    }

    /// Requests to `region_id` take `delay` before they are applied.
    pub fn set_region_delay(&self, region_id: RegionId, delay: Duration) {
        lock(&self.faults).delays.insert(region_id, delay);
    }

    /// How many requests of kind `label` were sent, including failed ones.
    pub fn request_count(&self, label: &str) -> usize {
        lock(&self.requests).get(label).copied().unwrap_or(0)
    }

    pub fn reset_request_counts(&self) {
        lock(&self.requests).clear();
    }

    /// Write committed values equal to their keys, at a fresh timestamp.
    pub fn must_put(&self, keys: &[&'static str]) {
        for key in keys {
            self.must_put_value(*key, key.as_bytes().to_vec());
        }
    }

    pub fn must_put_value(&self, key: impl Into<Key>, value: impl Into<Value>) {
        let start_ts = self.ts();
        let commit_ts = self.ts();
        lock(&self.mvcc).put_committed(key.into(), value.into(), start_ts, commit_ts);
    }

    /// Leave a lock at `key` as if a prewrite of `start_ts` had been abandoned there.
    pub fn must_lock(
        &self,
        key: impl Into<Key>,
        primary: impl Into<Key>,
        start_ts: u64,
        ttl: u64,
        txn_size: u64,
    ) {
        lock(&self.mvcc).put_lock(key.into(), primary.into(), start_ts, ttl, txn_size);
    }

    pub fn lock_at(&self, key: impl Into<Key>) -> Option<LockInfo> {
        lock(&self.mvcc).lock(&key.into())
    }

    /// The committed value at `version`, ignoring locks.
    pub fn value_at(&self, key: impl Into<Key>, version: u64) -> Option<Value> {
        lock(&self.mvcc).committed_value(&key.into(), version)
    }

    pub fn commit_ts_of(&self, key: impl Into<Key>, start_ts: u64) -> Option<u64> {
        lock(&self.mvcc).commit_ts_of(&key.into(), start_ts)
    }

    pub fn is_rolled_back(&self, key: impl Into<Key>, start_ts: u64) -> bool {
        lock(&self.mvcc).is_rolled_back(&key.into(), start_ts)
    }

    fn ts(&self) -> u64 {
        self.oracle
            .get_timestamp()
            .unwrap_or_else(|e| panic!("mock oracle failed: {e}"))
    }

    fn check_region(&self, ver_id: &RegionVerId, keys: &[&Key]) -> std::result::Result<Region, RegionError> {
        let regions = lock(&self.regions);
        let Some(current) = regions.iter().find(|r| r.id() == ver_id.id) else {
            return Err(RegionError::RegionNotFound {
                region_id: ver_id.id,
            });
        };
        if current.ver_id != *ver_id {
            return Err(RegionError::EpochNotMatch {
                current_regions: vec![current.clone()],
            });
        }
        for key in keys {
            if !current.contains(key) {
                return Err(RegionError::KeyNotInRegion {
                    key: (*key).clone(),
                    region_id: ver_id.id,
                });
            }
        }
        Ok(current.clone())
    }

    fn apply(&self, region: &Region, command: Command) -> ResponseBody {
        let mut mvcc = lock(&self.mvcc);
        match command {
            Command::Get(req) => match mvcc.get(&req.key, req.version) {
                Ok(value) => ResponseBody::Get(GetResponse { value, error: None }),
                Err(e) => ResponseBody::Get(GetResponse {
                    value: None,
                    error: Some(e),
                }),
            },
            Command::BatchGet(req) => {
                let mut resp = BatchGetResponse::default();
                for key in req.keys {
                    match mvcc.get(&key, req.version) {
                        Ok(Some(value)) => resp.pairs.push((key, value).into()),
                        Ok(None) => {}
                        Err(e) => resp.errors.push(e),
                    }
                }
                ResponseBody::BatchGet(resp)
            }
            Command::Scan(req) => {
                let start = req.start_key.clone().max(region.start_key.clone());
                let end = if region.end_key.is_empty()
                    || (!req.end_key.is_empty() && req.end_key < region.end_key)
                {
                    req.end_key
                } else {
                    region.end_key.clone()
                };
                let (pairs, errors) = mvcc.scan(&start, &end, req.limit as usize, req.version);
                ResponseBody::Scan(ScanResponse { pairs, errors })
            }
            Command::Prewrite(req) => ResponseBody::Prewrite(PrewriteResponse {
                errors: mvcc.prewrite(
                    req.mutations,
                    &req.primary,
                    req.start_ts,
                    req.lock_ttl,
                    req.txn_size,
                ),
            }),
            Command::Commit(req) => ResponseBody::Commit(CommitResponse {
                error: mvcc.commit(&req.keys, req.start_ts, req.commit_ts),
            }),
            Command::BatchRollback(req) => ResponseBody::BatchRollback(BatchRollbackResponse {
                error: mvcc.batch_rollback(&req.keys, req.start_ts),
            }),
            Command::CheckTxnStatus(req) => {
                let resp = match mvcc.check_txn_status(
                    &req.primary,
                    req.lock_ts,
                    req.caller_start_ts,
                    req.current_ts,
                    req.rollback_if_not_exist,
                ) {
                    Ok(status) => CheckTxnStatusResponse {
                        lock_ttl: status.lock_ttl,
                        commit_version: status.commit_version,
                        action: status.action,
                        error: None,
                    },
                    Err(e) => CheckTxnStatusResponse {
                        lock_ttl: 0,
                        commit_version: 0,
                        action: crate::store::Action::NoAction,
                        error: Some(e),
                    },
                };
                ResponseBody::CheckTxnStatus(resp)
            }
            Command::ResolveLock(req) => ResponseBody::ResolveLock(ResolveLockResponse {
                error: mvcc.resolve_lock(
                    req.start_ts,
                    req.commit_ts,
                    &req.keys,
                    &region.start_key,
                    &region.end_key,
                ),
            }),
        }
    }
}

fn command_keys(command: &Command) -> Vec<&Key> {
    match command {
        Command::Get(req) => vec![&req.key],
        Command::BatchGet(req) => req.keys.iter().collect(),
        Command::Scan(req) => vec![&req.start_key],
        Command::Prewrite(req) => req.mutations.iter().map(|m| &m.key).collect(),
        Command::Commit(req) => req.keys.iter().collect(),
        Command::BatchRollback(req) => req.keys.iter().collect(),
        Command::CheckTxnStatus(req) => vec![&req.primary],
        Command::ResolveLock(req) => req.keys.iter().collect(),
    }
}

#[async_trait]
impl PdClient for MockCluster {
    async fn get_region(&self, key: &Key) -> Result<Region> {
        lock(&self.regions)
            .iter()
            .find(|r| r.contains(key))
            .cloned()
            .ok_or_else(|| Error::RegionForKeyNotFound { key: key.clone() })
    }

    async fn get_timestamp(&self) -> Result<u64> {
        self.oracle.get_timestamp()
    }
}

#[async_trait]
impl KvClient for MockCluster {
    async fn send(&self, address: &str, req: KvRequest, timeout: Duration) -> Result<KvResponse> {
        let label = req.command.label();
        *lock(&self.requests).entry(label).or_default() += 1;

        let delay = {
            let mut faults = lock(&self.faults);
            let by_region = match faults.transport_errors.get_mut(&req.region.id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            let by_command = match faults.command_errors.get_mut(label) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            if by_region || by_command {
                return Err(Error::Transport {
                    message: format!("injected failure sending {label} to {address}"),
                });
            }
            if let Some(err) = faults
                .region_errors
                .get_mut(&req.region.id)
                .and_then(VecDeque::pop_front)
            {
                return Ok(KvResponse::RegionError(err));
            }
            faults.delays.get(&req.region.id).copied()
        };

        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(Error::Transport {
                    message: format!("{label} to {address} timed out"),
                });
            }
            tokio::time::sleep(delay).await;
        }

        let region = match self.check_region(&req.region, &command_keys(&req.command)) {
            Ok(region) => region,
            Err(e) => return Ok(KvResponse::RegionError(e)),
        };
        Ok(KvResponse::Body(self.apply(&region, req.command)))
    }
}
