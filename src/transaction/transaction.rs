// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashSet;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::sync::atomic;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use log::warn;
use tokio::task::JoinHandle;

use crate::backoffer::BackoffContext;
use crate::backoffer::Backoffer;
use crate::config::Config;
use crate::request::plan::RegionBatcher;
use crate::stats;
use crate::transaction::buffer::Buffer;
use crate::transaction::committer::CommitterState;
use crate::transaction::committer::TwoPhaseCommitter;
use crate::transaction::lock::LockResolver;
use crate::transaction::snapshot::range_to_keys;
use crate::transaction::ttl::LockTtlPolicy;
use crate::transaction::Snapshot;
use crate::Error;
use crate::Key;
use crate::KvPair;
use crate::Result;
use crate::Value;

/// An optimistic transaction.
///
/// Reads go to a snapshot at the start timestamp, overlaid with the transaction's own buffered
/// writes. Writes stay in the buffer until [`commit`](Transaction::commit), which runs
/// two-phase commit. The first key written becomes the primary key.
///
/// Once dropped, an active transaction is a bug: depending on its [`CheckLevel`] this panics,
/// logs a warning, or does nothing. Nothing is ever written by a transaction that was not
/// committed, so no cleanup is needed.
///
/// # Examples
///
/// ```rust,no_run
/// # use percolator_client::{BackoffContext, Result, TransactionClient};
/// # async fn example(client: TransactionClient) -> Result<()> {
/// let mut txn = client.begin().await?;
/// if let Some(foo) = txn.get("foo").await? {
///     txn.put("bar", foo).await?;
/// }
/// txn.commit(&BackoffContext::background()).await?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction {
    status: Arc<AtomicU8>,
    start_ts: u64,
    buffer: Buffer,
    snapshot: Snapshot,
    batcher: RegionBatcher,
    resolver: LockResolver,
    config: Config,
    ttl_policy: Arc<dyn LockTtlPolicy>,
    check_level: CheckLevel,
    start_instant: Instant,
    committer: Option<TwoPhaseCommitter>,
    #[cfg(any(test, feature = "test-util"))]
    lock_ttl: Option<u64>,
}

impl Transaction {
    pub(crate) fn new(
        start_ts: u64,
        batcher: RegionBatcher,
        resolver: LockResolver,
        config: Config,
        ttl_policy: Arc<dyn LockTtlPolicy>,
        check_level: CheckLevel,
    ) -> Transaction {
        let snapshot = Snapshot::new(batcher.clone(), resolver.clone(), start_ts, config.clone());
        Transaction {
            status: Arc::new(AtomicU8::new(TransactionStatus::Active as u8)),
            start_ts,
            buffer: Buffer::default(),
            snapshot,
            batcher,
            resolver,
            config,
            ttl_policy,
            check_level,
            start_instant: Instant::now(),
            committer: None,
            #[cfg(any(test, feature = "test-util"))]
            lock_ttl: None,
        }
    }

    /// What to do if the transaction is dropped without committing or rolling back.
    pub fn set_check_level(&mut self, check_level: CheckLevel) {
        self.check_level = check_level;
    }

    /// Replace the computed lock TTL of the commit.
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_lock_ttl(&mut self, ttl: u64) {
        self.lock_ttl = Some(ttl);
    }

    /// Get the value associated with the given key.
    ///
    /// Returns `Ok(None)` if the key does not exist, or was deleted by this transaction.
    pub async fn get(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.check_allow_operation()?;
        let key = key.into();
        if let Some(buffered) = self.buffer.get(&key) {
            return Ok(buffered);
        }
        self.snapshot.get(key).await
    }

    /// Get the values of several keys. Keys that do not exist are left out.
    pub async fn batch_get(
        &mut self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<KvPair>> {
        self.check_allow_operation()?;
        let mut pairs = Vec::new();
        let mut remote = Vec::new();
        let mut seen = HashSet::new();
        for key in keys.into_iter().map(Into::into) {
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.buffer.get(&key) {
                Some(Some(value)) => pairs.push(KvPair::new(key, value)),
                Some(None) => {}
                None => remote.push(key),
            }
        }
        if !remote.is_empty() {
            pairs.extend(self.snapshot.batch_get(remote).await?);
        }
        Ok(pairs)
    }

    /// Read up to `limit` pairs in `range`, in key order, including this transaction's writes.
    pub async fn scan(&mut self, range: impl RangeBounds<Key>, limit: u32) -> Result<Vec<KvPair>> {
        self.check_allow_operation()?;
        let (start, end) = range_to_keys(&range);
        let bounds = (
            Bound::Included(start),
            if end.is_empty() {
                Bound::Unbounded
            } else {
                Bound::Excluded(end)
            },
        );
        // Buffered deletes may hide pairs read from the snapshot.
        let buffered = self.buffer.scan(&bounds).len() as u32;
        let pairs = self
            .snapshot
            .scan(bounds.clone(), limit.saturating_add(buffered))
            .await?;
        let mut merged = self.buffer.merge_scan(&bounds, pairs);
        merged.truncate(limit as usize);
        Ok(merged)
    }

    /// Set the value of a key.
    pub async fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.check_allow_operation()?;
        self.buffer.put(key.into(), value.into());
        Ok(())
    }

    /// Set the value of a key that must not exist yet. Checked at prewrite.
    pub async fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.check_allow_operation()?;
        self.buffer.insert(key.into(), value.into());
        Ok(())
    }

    /// Delete a key.
    pub async fn delete(&mut self, key: impl Into<Key>) -> Result<()> {
        self.check_allow_operation()?;
        self.buffer.delete(key.into());
        Ok(())
    }

    /// Commit the transaction, bound to `ctx`.
    ///
    /// Returns the commit timestamp, or `None` if there was nothing to write. The call returns
    /// once the primary key is committed; the remaining keys are committed in the background.
    /// An [`Error::UndeterminedError`] means the outcome is unknown.
    pub async fn commit(&mut self, ctx: &BackoffContext) -> Result<Option<u64>> {
        debug!("committing transaction {}", self.start_ts);
        if !self.transit_status(
            |status| {
                matches!(
                    status,
                    TransactionStatus::StartedCommit | TransactionStatus::Active
                )
            },
            TransactionStatus::StartedCommit,
        ) {
            return Err(Error::OperationAfterCommitError);
        }

        if self.buffer.is_empty() {
            self.set_status(TransactionStatus::Committed);
            return Ok(None);
        }

        let committer = TwoPhaseCommitter::new(
            self.batcher.clone(),
            self.resolver.clone(),
            self.config.clone(),
            self.ttl_policy.clone(),
            self.start_ts,
            self.start_instant,
            self.buffer.mutations(),
        )?;
        #[cfg(any(test, feature = "test-util"))]
        if let Some(ttl) = self.lock_ttl {
            committer.set_lock_ttl(ttl);
        }
        self.committer = Some(committer.clone());

        let res = committer.execute(ctx).await;
        if res.is_ok() {
            self.set_status(TransactionStatus::Committed);
        }
        res.map(Some)
    }

    /// Roll back the transaction.
    ///
    /// Discards the buffer. If a commit attempt failed, its prewritten keys are rolled back too,
    /// unless the outcome of that attempt is undetermined.
    pub async fn rollback(&mut self) -> Result<()> {
        debug!("rolling back transaction {}", self.start_ts);
        if !self.transit_status(
            |status| {
                matches!(
                    status,
                    TransactionStatus::StartedRollback
                        | TransactionStatus::Active
                        | TransactionStatus::StartedCommit
                )
            },
            TransactionStatus::StartedRollback,
        ) {
            return Err(Error::OperationAfterCommitError);
        }
        stats::inc_txn_cmd("rollback");

        match &self.committer {
            // The primary may be committed; its locks are left to resolvers.
            Some(committer) if committer.state() == CommitterState::Failed => {
                debug!(
                    "not rolling back undetermined transaction {}",
                    self.start_ts
                );
            }
            Some(committer) => {
                let bo = Backoffer::new(
                    BackoffContext::background(),
                    self.config.backoff.cleanup_max_backoff,
                );
                committer
                    .cleanup_keys(&bo, committer.keys().to_vec())
                    .await?;
            }
            None => {}
        }
        self.set_status(TransactionStatus::Rolledback);
        Ok(())
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_ts
    }

    /// The commit timestamp, once the primary key is committed.
    pub fn commit_timestamp(&self) -> Option<u64> {
        self.committer
            .as_ref()
            .map(TwoPhaseCommitter::commit_ts)
            .filter(|ts| *ts > 0)
    }

    /// The handle of the background secondary commit or cleanup started by `commit`.
    ///
    /// Production code does not need it: the transaction's outcome never depends on it.
    pub fn take_background_task(&mut self) -> Option<JoinHandle<()>> {
        self.committer
            .as_ref()
            .and_then(TwoPhaseCommitter::take_background_handle)
    }

    fn check_allow_operation(&self) -> Result<()> {
        match self.get_status() {
            TransactionStatus::Active => Ok(()),
            _ => Err(Error::OperationAfterCommitError),
        }
    }

    fn get_status(&self) -> TransactionStatus {
        self.status.load(atomic::Ordering::Acquire).into()
    }

    fn set_status(&self, status: TransactionStatus) {
        self.status.store(status as u8, atomic::Ordering::Release);
    }

    fn transit_status<F>(&self, check_status: F, next: TransactionStatus) -> bool
    where
        F: Fn(TransactionStatus) -> bool,
    {
        let mut current = self.get_status();
        while check_status(current) {
            if current == next {
                return true;
            }
            match self.status.compare_exchange_weak(
                current as u8,
                next as u8,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(x) => current = x.into(),
            }
        }
        false
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        debug!("dropping transaction");
        if std::thread::panicking() {
            return;
        }
        if self.get_status() == TransactionStatus::Active {
            match self.check_level {
                CheckLevel::Panic => {
                    panic!("Dropping an active transaction. Consider commit or rollback it.")
                }
                CheckLevel::Warn => {
                    warn!("Dropping an active transaction. Consider commit or rollback it.")
                }

                CheckLevel::None => {}
            }
        }
        self.set_status(TransactionStatus::Dropped);
    }
}

/// The default behavior when a transaction is dropped while active.
///
/// The default is to panic.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub enum CheckLevel {
    /// The program will panic.
    ///
    /// Note that if the thread is already panicking, then we will not double-panic and abort, but
    /// just ignore the issue.
    #[default]
    Panic,
    /// Log a warning.
    Warn,
    /// Do nothing
    None,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
enum TransactionStatus {
    /// The transaction have not been committed or rolled back.
    Active = 0,
    /// The transaction has committed.
    Committed = 1,
    /// The transaction has tried to commit. Only `commit` is allowed.
    StartedCommit = 2,
    /// The transaction has rolled back.
    Rolledback = 3,
    /// The transaction has tried to rollback. Only `rollback` is allowed.
    StartedRollback = 4,
    /// The transaction has been dropped.
    Dropped = 5,
}

impl From<u8> for TransactionStatus {
    fn from(num: u8) -> Self {
        match num {
            0 => TransactionStatus::Active,
            1 => TransactionStatus::Committed,
            2 => TransactionStatus::StartedCommit,
            3 => TransactionStatus::Rolledback,
            4 => TransactionStatus::StartedRollback,
            _ => TransactionStatus::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockCluster;
    use crate::TransactionClient;

    fn client(cluster: &Arc<MockCluster>) -> TransactionClient {
        TransactionClient::new(cluster.clone(), cluster.clone(), Config::default())
    }

    async fn finish(txn: &mut Transaction) {
        if let Some(handle) = txn.take_background_task() {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn reads_see_own_writes() {
        let cluster = Arc::new(MockCluster::new());
        cluster.must_put(&["a", "b", "c"]);
        let client = client(&cluster);

        let mut txn = client.begin().await.unwrap();
        txn.put("a", "a2").await.unwrap();
        txn.delete("b").await.unwrap();
        txn.put("d", "d").await.unwrap();

        assert_eq!(txn.get("a").await.unwrap(), Some(b"a2".to_vec()));
        assert_eq!(txn.get("b").await.unwrap(), None);
        assert_eq!(txn.get("c").await.unwrap(), Some(b"c".to_vec()));

        let mut pairs = txn.batch_get(vec!["a", "b", "c", "a"]).await.unwrap();
        pairs.sort_by(|l, r| l.key.cmp(&r.key));
        assert_eq!(
            pairs,
            vec![KvPair::new("a", "a2"), KvPair::new("c", "c")]
        );

        let scanned = txn.scan(.., 3).await.unwrap();
        let keys: Vec<Key> = scanned.into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![Key::from("a"), Key::from("c"), Key::from("d")]);

        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn committed_transaction_is_visible_to_later_readers() {
        let cluster = Arc::new(MockCluster::new());
        cluster.split("m");
        let client = client(&cluster);

        let mut txn = client.begin().await.unwrap();
        txn.put("a", "1").await.unwrap();
        txn.put("x", "2").await.unwrap();
        let commit_ts = txn
            .commit(&BackoffContext::background())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(txn.commit_timestamp(), Some(commit_ts));
        assert!(commit_ts > txn.start_timestamp());

        // Even before the secondaries are committed, a reader resolves them.
        let snapshot = client.snapshot(client.current_timestamp().await.unwrap());
        assert_eq!(snapshot.get("x").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(snapshot.get("a").await.unwrap(), Some(b"1".to_vec()));
        finish(&mut txn).await;

        let old = client.snapshot(txn.start_timestamp());
        assert_eq!(old.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_commit_writes_nothing() {
        let cluster = Arc::new(MockCluster::new());
        let client = client(&cluster);
        let mut txn = client.begin().await.unwrap();
        assert_eq!(txn.commit(&BackoffContext::background()).await.unwrap(), None);
        assert_eq!(cluster.request_count("kv_prewrite"), 0);
    }

    #[tokio::test]
    async fn operations_after_commit_fail() {
        let cluster = Arc::new(MockCluster::new());
        let client = client(&cluster);
        let mut txn = client.begin().await.unwrap();
        txn.put("a", "a").await.unwrap();
        txn.commit(&BackoffContext::background()).await.unwrap();

        assert!(matches!(
            txn.put("b", "b").await,
            Err(Error::OperationAfterCommitError)
        ));
        assert!(matches!(
            txn.get("a").await,
            Err(Error::OperationAfterCommitError)
        ));
        assert!(matches!(
            txn.rollback().await,
            Err(Error::OperationAfterCommitError)
        ));
    }

    #[tokio::test]
    async fn insert_of_existing_key_fails() {
        let cluster = Arc::new(MockCluster::new());
        cluster.must_put(&["a"]);
        let client = client(&cluster);

        let mut txn = client.begin().await.unwrap();
        txn.insert("a", "again").await.unwrap();
        let err = txn
            .commit(&BackoffContext::background())
            .await
            .unwrap_err();
        assert!(err.is_key_exists(), "{err:?}");
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn edge_max_start_ts_fails_commit() {
        let cluster = Arc::new(MockCluster::new());
        let client = client(&cluster);
        let mut txn = client.begin_with_start_timestamp(u64::MAX);
        txn.put("a", "a").await.unwrap();

        let err = txn
            .commit(&BackoffContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStartTs { .. }));
        assert!(err.to_string().contains("invalid txnStartTS"));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_after_failed_commit_removes_locks() {
        let cluster = Arc::new(MockCluster::new());
        cluster.split("m");
        let client = client(&cluster);

        let mut txn = client.begin().await.unwrap();
        txn.put("a", "a").await.unwrap();
        txn.put("x", "x").await.unwrap();
        let (ctx, cancel) = BackoffContext::new();
        cancel.cancel();
        let err = txn.commit(&ctx).await.unwrap_err();
        assert!(err.is_canceled());

        txn.rollback().await.unwrap();
        finish(&mut txn).await;
        assert!(cluster.lock_at("a").is_none());
        assert!(cluster.lock_at("x").is_none());
    }

    #[tokio::test]
    async fn short_lock_ttl_lets_others_roll_back() {
        let cluster = Arc::new(MockCluster::new());
        let mut config = Config::default();
        config.backoff.commit_max_backoff = 500;
        let impatient = TransactionClient::new(cluster.clone(), cluster.clone(), config);

        let mut blocked = impatient.begin().await.unwrap();
        blocked.put("a", "mine").await.unwrap();
        blocked.set_lock_ttl(1);
        // The primary commit is lost, leaving the lock behind.
        cluster.inject_command_errors("kv_commit", usize::MAX);
        let err = blocked
            .commit(&BackoffContext::background())
            .await
            .unwrap_err();
        assert!(err.is_undetermined(), "{err:?}");
        cluster.clear_command_errors();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let client = client(&cluster);
        let mut txn = client.begin().await.unwrap();
        txn.put("a", "theirs").await.unwrap();
        let commit_ts = txn
            .commit(&BackoffContext::background())
            .await
            .unwrap()
            .unwrap();
        assert!(cluster.is_rolled_back("a", blocked.start_timestamp()));
        assert_eq!(cluster.value_at("a", commit_ts), Some(b"theirs".to_vec()));
    }

    #[tokio::test]
    async fn rollback_keeps_locks_of_undetermined_commit() {
        let cluster = Arc::new(MockCluster::new());
        let mut config = Config::default();
        config.backoff.commit_max_backoff = 500;
        let client = TransactionClient::new(cluster.clone(), cluster.clone(), config);

        let mut txn = client.begin().await.unwrap();
        txn.put("a", "a").await.unwrap();
        txn.put("b", "b").await.unwrap();
        cluster.inject_command_errors("kv_commit", usize::MAX);
        let err = txn
            .commit(&BackoffContext::background())
            .await
            .unwrap_err();
        assert!(err.is_undetermined(), "{err:?}");

        cluster.reset_request_counts();
        txn.rollback().await.unwrap();
        assert_eq!(cluster.request_count("kv_batch_rollback"), 0);
        assert!(cluster.lock_at("a").is_some());
        assert!(cluster.lock_at("b").is_some());
    }

    #[test]
    #[should_panic(expected = "Dropping an active transaction")]
    fn dropping_active_transaction_panics() {
        let cluster = Arc::new(MockCluster::new());
        let client = client(&cluster);
        let _txn = client.begin_with_start_timestamp(1);
    }

    #[test]
    fn dropping_with_warn_level_is_quiet() {
        let cluster = Arc::new(MockCluster::new());
        let client = client(&cluster);
        let mut txn = client.begin_with_start_timestamp(1);
        txn.set_check_level(CheckLevel::Warn);
    }
}
