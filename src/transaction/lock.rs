// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::RwLock;

use crate::backoffer::Backoffer;
use crate::backoffer::BO_TXN_NOT_FOUND;
use crate::config::Config;
use crate::region::RegionVerId;
use crate::request::plan::RegionBatcher;
use crate::stats;
use crate::store::Action;
use crate::store::CheckTxnStatusRequest;
use crate::store::Command;
use crate::store::LockInfo;
use crate::store::ResolveLockRequest;
use crate::timestamp::until_expired;
use crate::Error;
use crate::Key;
use crate::Result;

/// The fate of a transaction as seen from its primary key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnStatus {
    /// Remaining lock TTL. `0` once the transaction is committed or rolled back.
    pub ttl: u64,
    /// Non-zero once the transaction is committed.
    pub commit_ts: u64,
    pub action: Action,
}

impl TxnStatus {
    pub fn is_committed(&self) -> bool {
        self.commit_ts > 0
    }

    /// Committed or rolled back. Such a status never changes again.
    pub fn is_final(&self) -> bool {
        self.ttl == 0
    }
}

struct ResolvedTxns {
    capacity: usize,
    /// Insertion order, for FIFO eviction.
    order: VecDeque<u64>,
    txns: HashMap<u64, TxnStatus>,
}

impl ResolvedTxns {
    fn insert(&mut self, txn_id: u64, status: TxnStatus) {
        if !self.txns.contains_key(&txn_id) {
            while self.capacity > 0 && self.order.len() >= self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.txns.remove(&evicted);
                }
            }
            self.order.push_back(txn_id);
        }
        self.txns.insert(txn_id, status);
    }
}

/// Shared memo of transactions known to be committed or rolled back.
///
/// Only final statuses are kept, so an entry never goes stale.
#[derive(Clone)]
pub struct ResolveLocksContext {
    resolved: Arc<RwLock<ResolvedTxns>>,
}

impl Default for ResolveLocksContext {
    fn default() -> Self {
        ResolveLocksContext::with_capacity(Config::default().txn.resolved_cache_size)
    }
}

impl ResolveLocksContext {
    pub fn with_capacity(capacity: usize) -> Self {
        ResolveLocksContext {
            resolved: Arc::new(RwLock::new(ResolvedTxns {
                capacity,
                order: VecDeque::new(),
                txns: HashMap::new(),
            })),
        }
    }

    pub async fn get_resolved(&self, txn_id: u64) -> Option<TxnStatus> {
        self.resolved
            .read()
            .await
            .txns
            .get(&txn_id)
            .copied()
    }

    pub async fn save_resolved(&self, txn_id: u64, status: TxnStatus) {
        self.resolved.write().await.insert(txn_id, status);
    }

    pub async fn len(&self) -> usize {
        self.resolved.read().await.txns.len()
    }
}

/// What one round of lock resolution achieved.
#[derive(Debug, Default)]
pub(crate) struct ResolveOutcome {
    /// Time until the earliest remaining live lock expires, `0` when none is left.
    pub(crate) ms_before_expired: i64,
    pub(crate) pushed: Vec<u64>,
    /// Locks whose owner's fate was pushed to their region in this round.
    pub(crate) resolved: usize,
}

impl ResolveOutcome {
    /// Nothing was resolved and no live lock gives a time to wait for. Retrying right away
    /// would meet the same locks again.
    pub(crate) fn made_no_progress(&self) -> bool {
        self.resolved == 0 && self.ms_before_expired <= 0
    }
}

/// Learns the fate of lock owners and pushes it to the locks they left behind.
#[derive(Clone)]
pub struct LockResolver {
    batcher: RegionBatcher,
    ctx: ResolveLocksContext,
    timeout: Duration,
}

impl LockResolver {
    pub(crate) fn new(batcher: RegionBatcher, ctx: ResolveLocksContext, timeout: Duration) -> Self {
        LockResolver {
            batcher,
            ctx,
            timeout,
        }
    }

    pub fn context(&self) -> &ResolveLocksContext {
        &self.ctx
    }

    /// Ask the primary key of transaction `txn_id` for its status.
    ///
    /// A `caller_start_ts` of `0` or `u64::MAX` never pushes the transaction's min commit ts.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_txn_status(
        &self,
        bo: &mut Backoffer,
        txn_id: u64,
        primary: Key,
        caller_start_ts: u64,
        current_ts: u64,
        rollback_if_not_exist: bool,
        force_sync_commit: bool,
    ) -> Result<TxnStatus> {
        if let Some(status) = self.ctx.get_resolved(txn_id).await {
            return Ok(status);
        }
        let caller_start_ts = if caller_start_ts == u64::MAX {
            0
        } else {
            caller_start_ts
        };

        let (_, body) = self
            .batcher
            .send_to_key(bo, &primary, self.timeout, |_| {
                Command::CheckTxnStatus(CheckTxnStatusRequest {
                    primary: primary.clone(),
                    lock_ts: txn_id,
                    caller_start_ts,
                    current_ts,
                    rollback_if_not_exist,
                    force_sync_commit,
                })
            })
            .await?;
        let resp = body.into_check_txn_status()?;
        if let Some(e) = resp.error {
            return Err(e.into());
        }

        let status = TxnStatus {
            ttl: resp.lock_ttl,
            commit_ts: resp.commit_version,
            action: resp.action,
        };
        debug!("txn {txn_id} status: {status:?}");
        match status.action {
            Action::TtlExpireRollback => stats::inc_lock_resolver("expired_rollback"),
            Action::LockNotExistRollback => stats::inc_lock_resolver("not_exist_rollback"),
            Action::MinCommitTsPushed => stats::inc_lock_resolver("min_commit_ts_pushed"),
            Action::NoAction => {}
        }
        if status.is_final() {
            self.ctx.save_resolved(txn_id, status).await;
        }
        Ok(status)
    }

    /// The status of the transaction that owns `lock`.
    ///
    /// When the primary has neither a lock nor a record yet, the owner may still be prewriting:
    /// wait while `lock` is alive, then have the primary rolled back.
    pub(crate) async fn get_txn_status_from_lock(
        &self,
        bo: &mut Backoffer,
        lock: &LockInfo,
        caller_start_ts: u64,
        force_sync_commit: bool,
    ) -> Result<TxnStatus> {
        let current_ts = if lock.ttl == 0 {
            // Such locks are always expired.
            u64::MAX
        } else {
            self.batcher.store().current_timestamp().await?
        };

        let mut rollback_if_not_exist = false;
        loop {
            match self
                .get_txn_status(
                    bo,
                    lock.start_ts,
                    lock.primary.clone(),
                    caller_start_ts,
                    current_ts,
                    rollback_if_not_exist,
                    force_sync_commit,
                )
                .await
            {
                Err(Error::TxnNotFound { start_ts }) => {
                    bo.backoff(&BO_TXN_NOT_FOUND, format!("txn {start_ts} not found"))
                        .await?;
                    let now = self.batcher.store().current_timestamp().await?;
                    if until_expired(lock.start_ts, lock.ttl, now) <= 0 {
                        debug!(
                            "lock of txn {} expired while its primary is missing, rolling back",
                            lock.start_ts
                        );
                        rollback_if_not_exist = true;
                    }
                }
                other => return other,
            }
        }
    }

    /// Push a final `status` of the lock's owner to the lock's region.
    ///
    /// `clean_regions` holds the regions already resolved as a whole for the lock's
    /// transaction. It must not outlive the caller's round of resolution: a lock met later in
    /// such a region is a lock the earlier resolve did not see.
    pub async fn resolve_lock(
        &self,
        bo: &mut Backoffer,
        lock: &LockInfo,
        status: TxnStatus,
        clean_regions: &mut HashSet<RegionVerId>,
    ) -> Result<()> {
        let region = self.batcher.store().router.locate(&lock.key).await?;
        if clean_regions.contains(&region.ver_id) {
            return Ok(());
        }

        // A single-key transaction only needs its own key resolved. Anything else is resolved
        // for the whole region, which leaves the region clean for this transaction.
        let lite = lock.txn_size == 1;
        let keys = if lite {
            vec![lock.key.clone()]
        } else {
            Vec::new()
        };
        let (region, body) = self
            .batcher
            .send_to_key(bo, &lock.key, self.timeout, |_| {
                Command::ResolveLock(ResolveLockRequest {
                    start_ts: lock.start_ts,
                    commit_ts: status.commit_ts,
                    keys: keys.clone(),
                })
            })
            .await?;
        if let Some(e) = body.into_resolve_lock()?.error {
            return Err(e.into());
        }
        stats::inc_lock_resolver(if status.is_committed() {
            "commit"
        } else {
            "rollback"
        });
        if !lite {
            clean_regions.insert(region.ver_id());
        }
        Ok(())
    }

    /// Resolve every lock whose owner is committed or rolled back.
    ///
    /// Returns the shortest time in milliseconds until a remaining live lock expires (`0` when
    /// none is left), and the start timestamps of transactions whose min commit ts was pushed.
    pub async fn resolve_locks(
        &self,
        bo: &mut Backoffer,
        caller_start_ts: u64,
        locks: Vec<LockInfo>,
    ) -> Result<(i64, Vec<u64>)> {
        let outcome = self.resolve_round(bo, caller_start_ts, locks).await?;
        Ok((outcome.ms_before_expired, outcome.pushed))
    }

    pub(crate) async fn resolve_round(
        &self,
        bo: &mut Backoffer,
        caller_start_ts: u64,
        locks: Vec<LockInfo>,
    ) -> Result<ResolveOutcome> {
        if locks.is_empty() {
            return Ok(ResolveOutcome::default());
        }
        stats::inc_lock_resolver("query_resolve_locks");

        let mut order = Vec::new();
        let mut by_txn: HashMap<u64, Vec<LockInfo>> = HashMap::new();
        let mut seen = HashSet::new();
        for lock in locks {
            if !seen.insert((lock.start_ts, lock.key.clone())) {
                continue;
            }
            let group = by_txn.entry(lock.start_ts).or_insert_with(|| {
                order.push(lock.start_ts);
                Vec::new()
            });
            group.push(lock);
        }

        let mut ms_before_expired: Option<i64> = None;
        let mut pushed = Vec::new();
        let mut resolved = 0;
        for txn_id in order {
            let Some(txn_locks) = by_txn.remove(&txn_id) else {
                continue;
            };
            let status = self
                .get_txn_status_from_lock(bo, &txn_locks[0], caller_start_ts, false)
                .await?;

            if status.is_final() {
                let mut clean_regions = HashSet::new();
                for lock in &txn_locks {
                    self.resolve_lock(bo, lock, status, &mut clean_regions)
                        .await?;
                }
                resolved += txn_locks.len();
                continue;
            }

            if status.action == Action::MinCommitTsPushed {
                pushed.push(txn_id);
            }
            let now = self.batcher.store().current_timestamp().await?;
            let ms = until_expired(txn_id, status.ttl, now).max(0);
            ms_before_expired = Some(ms_before_expired.map_or(ms, |cur| cur.min(ms)));
        }
        Ok(ResolveOutcome {
            ms_before_expired: ms_before_expired.unwrap_or(0),
            pushed,
            resolved,
        })
    }

    /// Resolve locks met by a write. Never pushes the owner's min commit ts.
    pub(crate) async fn resolve_locks_for_write(
        &self,
        bo: &mut Backoffer,
        locks: Vec<LockInfo>,
    ) -> Result<ResolveOutcome> {
        self.resolve_round(bo, 0, locks).await
    }
}
