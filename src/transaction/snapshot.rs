// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::ops::Bound;
use std::ops::RangeBounds;
use std::sync::Arc;

use async_trait::async_trait;
use derive_new::new;
use log::debug;

use crate::backoffer::BackoffContext;
use crate::backoffer::Backoffer;
use crate::backoffer::BackofferError;
use crate::backoffer::BO_TXN_LOCK_FAST;
use crate::config::Config;
use crate::request::plan::BatchAction;
use crate::request::plan::BatchResult;
use crate::request::plan::RegionBatcher;
use crate::request::BatchKeys;
use crate::stats;
use crate::store::BatchGetRequest;
use crate::store::Command;
use crate::store::GetRequest;
use crate::store::KeyError;
use crate::store::LockInfo;
use crate::store::ResponseBody;
use crate::store::ScanRequest;
use crate::transaction::lock::LockResolver;
use crate::Error;
use crate::Key;
use crate::KvPair;
use crate::Result;
use crate::Value;

/// A read-only view of the store at a fixed `version`.
///
/// Reads that meet locks of other transactions resolve them and retry. A lock that is still
/// alive is waited out (within the read budget) instead of being pushed aside.
///
/// # Examples
/// ```rust,no_run
/// # use percolator_client::{Result, TransactionClient};
/// # async fn example(client: TransactionClient) -> Result<()> {
/// let version = client.current_timestamp().await?;
/// let snapshot = client.snapshot(version);
/// let value = snapshot.get("k1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Snapshot {
    batcher: RegionBatcher,
    resolver: LockResolver,
    version: u64,
    config: Config,
    ctx: BackoffContext,
}

impl Snapshot {
    pub(crate) fn new(
        batcher: RegionBatcher,
        resolver: LockResolver,
        version: u64,
        config: Config,
    ) -> Self {
        Snapshot {
            batcher,
            resolver,
            version,
            config,
            ctx: BackoffContext::background(),
        }
    }

    /// Bind subsequent reads to `ctx`.
    #[must_use]
    pub fn with_context(mut self, ctx: BackoffContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Get the value of a key, `None` if it does not exist at this version.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        stats::inc_txn_cmd("get");
        let key = key.into();
        let version = self.version;
        let mut bo = Backoffer::new(self.ctx.clone(), self.config.backoff.get_max_backoff);
        loop {
            let (_, body) = self
                .batcher
                .send_to_key(&mut bo, &key, self.config.timeout, |_| {
                    Command::Get(GetRequest {
                        key: key.clone(),
                        version,
                    })
                })
                .await?;
            let resp = body.into_get()?;
            match resp.error {
                None => return Ok(resp.value),
                Some(KeyError::Locked(lock)) => {
                    debug!("get at {version} met lock {lock:?}");
                    resolve_and_wait(&self.resolver, &mut bo, version, vec![lock]).await?;
                }
                Some(e) => return Err(e.into()),
            }
        }
    }

    /// Get the values of several keys. Missing keys are left out, the order is unspecified.
    pub async fn batch_get(
        &self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<KvPair>> {
        stats::inc_txn_cmd("batch_get");
        let bo = Backoffer::new(self.ctx.clone(), self.config.backoff.get_max_backoff);
        let action = Arc::new(BatchGetAction::new(self.resolver.clone(), self.version));
        let batches = self
            .batcher
            .make_batches(action.as_ref(), keys.into_iter().map(Into::into), None)
            .await?;
        self.batcher
            .send_batches(&bo, batches, &action, self.config.timeout)
            .await
    }

    /// Read up to `limit` pairs in `range`, in key order.
    pub async fn scan(&self, range: impl RangeBounds<Key>, limit: u32) -> Result<Vec<KvPair>> {
        stats::inc_txn_cmd("scan");
        let (start, end) = range_to_keys(&range);
        let version = self.version;
        let mut bo = Backoffer::new(self.ctx.clone(), self.config.backoff.scan_max_backoff);
        let mut pairs = Vec::new();
        let mut cursor = start;
        while pairs.len() < limit as usize {
            let remaining = limit - pairs.len() as u32;
            let (region, body) = self
                .batcher
                .send_to_key(&mut bo, &cursor, self.config.timeout, |region| {
                    let end_key = if !region.end_key.is_empty()
                        && (end.is_empty() || region.end_key < end)
                    {
                        region.end_key.clone()
                    } else {
                        end.clone()
                    };
                    Command::Scan(ScanRequest {
                        start_key: cursor.clone(),
                        end_key,
                        limit: remaining,
                        version,
                    })
                })
                .await?;
            let resp = body.into_scan()?;
            if !resp.errors.is_empty() {
                let locks = split_locks(resp.errors)?;
                debug!("scan at {version} met {} locks", locks.len());
                resolve_and_wait(&self.resolver, &mut bo, version, locks).await?;
                continue;
            }

            pairs.extend(resp.pairs);
            if region.end_key.is_empty() || (!end.is_empty() && region.end_key >= end) {
                break;
            }
            cursor = region.end_key;
        }
        pairs.truncate(limit as usize);
        Ok(pairs)
    }
}

/// Convert `range` to the `[start, end)` form requests use, where an empty `end` is unbounded.
pub(crate) fn range_to_keys(range: &impl RangeBounds<Key>) -> (Key, Key) {
    let start = match range.start_bound() {
        Bound::Included(k) => k.clone(),
        Bound::Excluded(k) => next_key(k),
        Bound::Unbounded => Key::EMPTY,
    };
    let end = match range.end_bound() {
        Bound::Included(k) => next_key(k),
        Bound::Excluded(k) => k.clone(),
        Bound::Unbounded => Key::EMPTY,
    };
    (start, end)
}

fn next_key(key: &Key) -> Key {
    let mut bytes: Vec<u8> = key.clone().into();
    bytes.push(0);
    bytes.into()
}

/// Keep the locks, fail on any other key error.
fn split_locks(errors: Vec<KeyError>) -> Result<Vec<LockInfo>> {
    let mut locks = Vec::with_capacity(errors.len());
    for e in errors {
        match e {
            KeyError::Locked(lock) => locks.push(lock),
            e => return Err(e.into()),
        }
    }
    Ok(locks)
}

/// Resolve `locks` on behalf of a reader at `version` and sleep while any of them is alive,
/// or when the round resolved nothing.
///
/// Running out of budget while locks are alive is reported as [`Error::ResolveLockError`].
async fn resolve_and_wait(
    resolver: &LockResolver,
    bo: &mut Backoffer,
    version: u64,
    locks: Vec<LockInfo>,
) -> Result<()> {
    let outcome = resolver.resolve_round(bo, version, locks.clone()).await?;
    let msg = format!("read at {version} is blocked by {} locks", locks.len());
    let slept = if outcome.ms_before_expired > 0 {
        bo.backoff_with_max_sleep(&BO_TXN_LOCK_FAST, outcome.ms_before_expired as u64, msg)
            .await
    } else if outcome.made_no_progress() {
        bo.backoff(&BO_TXN_LOCK_FAST, msg).await
    } else {
        return Ok(());
    };
    match slept {
        Ok(()) => Ok(()),
        Err(BackofferError::Canceled { cause }) => Err(Error::Canceled { cause }),
        Err(BackofferError::MaxSleepExceeded { .. }) => Err(Error::ResolveLockError(locks)),
    }
}

#[derive(new)]
struct BatchGetAction {
    resolver: LockResolver,
    version: u64,
}

#[async_trait]
impl BatchAction for BatchGetAction {
    type Item = KvPair;

    fn build_request(&self, batch: &BatchKeys) -> Command {
        Command::BatchGet(BatchGetRequest {
            keys: batch.keys.clone(),
            version: self.version,
        })
    }

    async fn on_response(
        &self,
        bo: &mut Backoffer,
        _batch: &BatchKeys,
        body: ResponseBody,
    ) -> Result<BatchResult<KvPair>> {
        let resp = body.into_batch_get()?;
        if resp.errors.is_empty() {
            return Ok(BatchResult::done(resp.pairs));
        }
        let locks = split_locks(resp.errors)?;
        let retry_keys = locks.iter().map(|lock| lock.key.clone()).collect();
        resolve_and_wait(&self.resolver, bo, self.version, locks).await?;
        Ok(BatchResult {
            items: resp.pairs,
            retry_keys,
        })
    }
}
