// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Instant;

use async_trait::async_trait;
use fail::fail_point;
use log::debug;
use log::warn;
use tokio::task::JoinHandle;

use crate::backoffer::BackoffContext;
use crate::backoffer::Backoffer;
use crate::backoffer::BO_TXN_LOCK;
use crate::backoffer::BO_TXN_LOCK_FAST;
use crate::config::Config;
use crate::internal_err;
use crate::request::plan::BatchAction;
use crate::request::plan::BatchResult;
use crate::request::plan::RegionBatcher;
use crate::request::BatchKeys;
use crate::stats;
use crate::store::BatchRollbackRequest;
use crate::store::Command;
use crate::store::CommitRequest;
use crate::store::KeyError;
use crate::store::Mutation;
use crate::store::PrewriteRequest;
use crate::store::ResponseBody;
use crate::transaction::lock::LockResolver;
use crate::transaction::ttl::LockTtlPolicy;
use crate::Error;
use crate::Key;
use crate::Result;

/// The lifecycle of a commit.
///
/// `Prewriting`/`Prewritten` may exit to `RollingBack` and then `RolledBack`.
/// `CommittingPrimary` exits to `Failed` when the outcome of the primary commit is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommitterState {
    Init = 0,
    Prewriting = 1,
    Prewritten = 2,
    CommittingPrimary = 3,
    Committed = 4,
    RollingBack = 5,
    RolledBack = 6,
    Failed = 7,
}

impl From<u8> for CommitterState {
    fn from(num: u8) -> Self {
        match num {
            0 => CommitterState::Init,
            1 => CommitterState::Prewriting,
            2 => CommitterState::Prewritten,
            3 => CommitterState::CommittingPrimary,
            4 => CommitterState::Committed,
            5 => CommitterState::RollingBack,
            6 => CommitterState::RolledBack,
            _ => CommitterState::Failed,
        }
    }
}

struct CommitterInner {
    batcher: RegionBatcher,
    resolver: LockResolver,
    config: Config,
    ttl_policy: Arc<dyn LockTtlPolicy>,
    start_ts: u64,
    start_instant: Instant,
    primary: Key,
    /// Keys in insertion order; the first one is the primary.
    keys: Vec<Key>,
    mutations: HashMap<Key, Mutation>,
    write_size: u64,
    lock_ttl: AtomicU64,
    lock_ttl_override: AtomicU64,
    commit_ts: AtomicU64,
    state: AtomicU8,
    /// Keys whose prewrite went on the wire. Cleanup rolls back exactly these.
    written: Mutex<HashSet<Key>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives the two-phase commit of a single transaction.
///
/// Prewrite locks every key, then the primary key is committed synchronously. Once the primary
/// is committed the transaction is durable: secondaries are committed by a detached task, and a
/// reader that meets a leftover secondary lock resolves it through the primary.
#[derive(Clone)]
pub struct TwoPhaseCommitter {
    inner: Arc<CommitterInner>,
}

impl TwoPhaseCommitter {
    pub(crate) fn new(
        batcher: RegionBatcher,
        resolver: LockResolver,
        config: Config,
        ttl_policy: Arc<dyn LockTtlPolicy>,
        start_ts: u64,
        start_instant: Instant,
        mutations: Vec<Mutation>,
    ) -> Result<Self> {
        let (primary, keys, mutations, write_size) = Self::init_keys_and_mutations(mutations)?;
        Ok(TwoPhaseCommitter {
            inner: Arc::new(CommitterInner {
                batcher,
                resolver,
                config,
                ttl_policy,
                start_ts,
                start_instant,
                primary,
                keys,
                mutations,
                write_size,
                lock_ttl: AtomicU64::new(0),
                lock_ttl_override: AtomicU64::new(0),
                commit_ts: AtomicU64::new(0),
                state: AtomicU8::new(CommitterState::Init as u8),
                written: Mutex::new(HashSet::new()),
                background: Mutex::new(None),
            }),
        })
    }

    /// Freeze the mutation set. Later mutations of a key replace earlier ones, the key keeps its
    /// first position, and the first key becomes the primary.
    fn init_keys_and_mutations(
        mutations: Vec<Mutation>,
    ) -> Result<(Key, Vec<Key>, HashMap<Key, Mutation>, u64)> {
        let mut keys = Vec::with_capacity(mutations.len());
        let mut by_key = HashMap::with_capacity(mutations.len());
        for mutation in mutations {
            if !by_key.contains_key(&mutation.key) {
                keys.push(mutation.key.clone());
            }
            by_key.insert(mutation.key.clone(), mutation);
        }
        let primary = keys.first().cloned().ok_or(Error::NoPrimaryKey)?;
        let write_size = by_key.values().map(|m| m.size() as u64).sum();
        Ok((primary, keys, by_key, write_size))
    }

    pub fn start_ts(&self) -> u64 {
        self.inner.start_ts
    }

    pub fn primary_key(&self) -> &Key {
        &self.inner.primary
    }

    pub fn keys(&self) -> &[Key] {
        &self.inner.keys
    }

    /// `0` until the primary key is committed.
    pub fn commit_ts(&self) -> u64 {
        self.inner.commit_ts.load(atomic::Ordering::Acquire)
    }

    /// The TTL sent with the prewrite, `0` before prewrite.
    pub fn lock_ttl(&self) -> u64 {
        self.inner.lock_ttl.load(atomic::Ordering::Acquire)
    }

    pub fn state(&self) -> CommitterState {
        self.inner.state.load(atomic::Ordering::Acquire).into()
    }

    fn set_state(&self, state: CommitterState) {
        self.inner.state.store(state as u8, atomic::Ordering::Release);
    }

    /// Replace the computed lock TTL.
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_lock_ttl(&self, ttl: u64) {
        self.inner
            .lock_ttl_override
            .store(ttl, atomic::Ordering::Release);
    }

    /// The handle of the detached secondary commit or cleanup, if one was started.
    pub fn take_background_handle(&self) -> Option<JoinHandle<()>> {
        guard(&self.inner.background).take()
    }

    fn compute_lock_ttl(&self) -> u64 {
        let overridden = self.inner.lock_ttl_override.load(atomic::Ordering::Acquire);
        if overridden > 0 {
            return overridden;
        }
        let elapsed_ms = self.inner.start_instant.elapsed().as_millis() as u64;
        self.inner
            .ttl_policy
            .lock_ttl(self.inner.write_size)
            .saturating_add(elapsed_ms)
    }

    /// Prewrite `keys`, resolving locks of other transactions on the way.
    pub async fn prewrite_keys(&self, bo: &Backoffer, keys: Vec<Key>) -> Result<()> {
        let inner = &self.inner;
        let lock_ttl = self.compute_lock_ttl();
        inner.lock_ttl.store(lock_ttl, atomic::Ordering::Release);
        debug!(
            "prewriting {} keys of txn {}, lock ttl {}",
            keys.len(),
            inner.start_ts,
            lock_ttl
        );
        let action = Arc::new(PrewriteAction {
            inner: inner.clone(),
            lock_ttl,
        });
        let batches = inner
            .batcher
            .make_batches(action.as_ref(), keys, Some(&inner.primary))
            .await?;
        inner
            .batcher
            .send_batches(bo, batches, &action, inner.config.timeout)
            .await?;
        Ok(())
    }

    /// Commit `keys` at the current commit timestamp.
    pub async fn commit_keys(&self, bo: &Backoffer, commit_ts: u64, keys: Vec<Key>) -> Result<()> {
        let inner = &self.inner;
        debug!(
            "committing {} keys of txn {} at {}",
            keys.len(),
            inner.start_ts,
            commit_ts
        );
        let action = Arc::new(CommitAction {
            start_ts: inner.start_ts,
            commit_ts,
        });
        let batches = inner
            .batcher
            .make_batches(action.as_ref(), keys, Some(&inner.primary))
            .await?;
        inner
            .batcher
            .send_batches(bo, batches, &action, inner.config.timeout)
            .await?;
        Ok(())
    }

    /// Roll back `keys`. Already rolled back keys are fine.
    pub async fn cleanup_keys(&self, bo: &Backoffer, keys: Vec<Key>) -> Result<()> {
        let inner = &self.inner;
        debug!("cleaning up {} keys of txn {}", keys.len(), inner.start_ts);
        let action = Arc::new(RollbackAction {
            start_ts: inner.start_ts,
        });
        let batches = inner
            .batcher
            .make_batches(action.as_ref(), keys, Some(&inner.primary))
            .await?;
        inner
            .batcher
            .send_batches(bo, batches, &action, inner.config.timeout)
            .await?;
        Ok(())
    }

    /// Run the whole commit bound to `ctx` and return the commit timestamp.
    ///
    /// Returns once the fate of the primary key is known. Secondary commit and cleanup run
    /// detached, see [`take_background_handle`](Self::take_background_handle).
    pub async fn execute(&self, ctx: &BackoffContext) -> Result<u64> {
        let inner = &self.inner;
        let start_ts = inner.start_ts;
        if start_ts == 0 || start_ts == u64::MAX {
            self.set_state(CommitterState::Failed);
            return Err(Error::InvalidStartTs { start_ts });
        }
        stats::inc_txn_cmd("commit");
        let budget = inner.config.backoff;

        self.set_state(CommitterState::Prewriting);
        let prewrite_bo = Backoffer::new(ctx.clone(), budget.prewrite_max_backoff);
        if let Err(e) = self.prewrite_keys(&prewrite_bo, inner.keys.clone()).await {
            debug!("prewrite of txn {start_ts} failed: {e}");
            self.spawn_cleanup();
            return Err(e);
        }
        self.set_state(CommitterState::Prewritten);

        let fp = || -> Result<()> {
            fail_point!("after-prewrite", |_| {
                Err(internal_err!("failpoint: after-prewrite return error"))
            });
            Ok(())
        };
        if let Err(e) = fp() {
            self.spawn_cleanup();
            return Err(e);
        }

        let commit_ts = match inner.batcher.store().current_timestamp().await {
            Ok(ts) => ts,
            Err(e) => {
                self.spawn_cleanup();
                return Err(e);
            }
        };
        if commit_ts <= start_ts {
            self.spawn_cleanup();
            return Err(Error::InvalidCommitTs {
                start_ts,
                commit_ts,
            });
        }

        let commit_bo = Backoffer::new(ctx.clone(), budget.commit_max_backoff);
        if let Err(e) = commit_bo.check_canceled() {
            self.spawn_cleanup();
            return Err(e.into());
        }
        self.set_state(CommitterState::CommittingPrimary);
        match self
            .commit_keys(&commit_bo, commit_ts, vec![inner.primary.clone()])
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_ambiguous() => {
                warn!("commit of txn {start_ts} is undetermined: {e}");
                self.set_state(CommitterState::Failed);
                return Err(Error::UndeterminedError(Box::new(e)));
            }
            Err(e) => {
                debug!("primary commit of txn {start_ts} failed: {e}");
                self.spawn_cleanup();
                return Err(e);
            }
        }
        inner.commit_ts.store(commit_ts, atomic::Ordering::Release);
        self.set_state(CommitterState::Committed);
        debug!("txn {start_ts} committed at {commit_ts}");

        self.spawn_commit_secondaries(&commit_bo, commit_ts);
        Ok(commit_ts)
    }

    fn spawn_commit_secondaries(&self, commit_bo: &Backoffer, commit_ts: u64) {
        let secondaries: Vec<Key> = self
            .inner
            .keys
            .iter()
            .filter(|k| **k != self.inner.primary)
            .cloned()
            .collect();
        if secondaries.is_empty() {
            return;
        }
        // The caller canceling its context must not strand the secondary locks.
        let (bo, _) = commit_bo.fork();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let fp = || -> Result<()> {
                fail_point!("before-commit-secondary", |_| {
                    Err(internal_err!("failpoint: before-commit-secondary return error"))
                });
                Ok(())
            };
            let res = match fp() {
                Ok(()) => this.commit_keys(&bo, commit_ts, secondaries).await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                warn!(
                    "failed to commit secondary keys of txn {}: {}",
                    this.inner.start_ts, e
                );
            }
        });
        *guard(&self.inner.background) = Some(handle);
    }

    fn spawn_cleanup(&self) {
        self.set_state(CommitterState::RollingBack);
        let keys: Vec<Key> = {
            let written = guard(&self.inner.written);
            self.inner
                .keys
                .iter()
                .filter(|k| written.contains(*k))
                .cloned()
                .collect()
        };
        if keys.is_empty() {
            self.set_state(CommitterState::RolledBack);
            return;
        }
        let bo = Backoffer::new(
            BackoffContext::background(),
            self.inner.config.backoff.cleanup_max_backoff,
        );
        let this = self.clone();
        let handle = tokio::spawn(async move {
            match this.cleanup_keys(&bo, keys).await {
                Ok(()) => this.set_state(CommitterState::RolledBack),
                Err(e) => warn!(
                    "failed to clean up txn {}: {}",
                    this.inner.start_ts, e
                ),
            }
        });
        *guard(&self.inner.background) = Some(handle);
    }
}

fn into_single_error(mut errors: Vec<Error>) -> Error {
    if errors.len() == 1 {
        if let Some(e) = errors.pop() {
            return e;
        }
    }
    Error::MultipleKeyErrors(errors)
}

struct PrewriteAction {
    inner: Arc<CommitterInner>,
    lock_ttl: u64,
}

#[async_trait]
impl BatchAction for PrewriteAction {
    type Item = ();

    fn build_request(&self, batch: &BatchKeys) -> Command {
        Command::Prewrite(PrewriteRequest {
            mutations: batch
                .keys
                .iter()
                .filter_map(|k| self.inner.mutations.get(k).cloned())
                .collect(),
            primary: self.inner.primary.clone(),
            start_ts: self.inner.start_ts,
            lock_ttl: self.lock_ttl,
            txn_size: batch.txn_size,
        })
    }

    fn key_size(&self, key: &Key) -> usize {
        self.inner
            .mutations
            .get(key)
            .map_or(key.len(), Mutation::size)
    }

    fn on_send(&self, batch: &BatchKeys) {
        guard(&self.inner.written).extend(batch.keys.iter().cloned());
    }

    async fn on_response(
        &self,
        bo: &mut Backoffer,
        batch: &BatchKeys,
        body: ResponseBody,
    ) -> Result<BatchResult<()>> {
        let resp = body.into_prewrite()?;
        if resp.errors.is_empty() {
            return Ok(BatchResult::done(Vec::new()));
        }

        let mut locks = Vec::new();
        let mut fatal = Vec::new();
        for e in resp.errors {
            match e {
                KeyError::Locked(lock) => locks.push(lock),
                e => fatal.push(Error::from(e)),
            }
        }
        if !fatal.is_empty() {
            return Err(into_single_error(fatal));
        }

        debug!(
            "prewrite of txn {} met {} locks",
            self.inner.start_ts,
            locks.len()
        );
        let outcome = self.inner.resolver.resolve_locks_for_write(bo, locks).await?;
        let msg = format!("prewrite of txn {} is blocked by locks", self.inner.start_ts);
        if outcome.ms_before_expired > 0 {
            bo.backoff_with_max_sleep(&BO_TXN_LOCK, outcome.ms_before_expired as u64, msg)
                .await?;
        } else if outcome.made_no_progress() {
            bo.backoff(&BO_TXN_LOCK_FAST, msg).await?;
        }
        // A batch with any error wrote nothing.
        Ok(BatchResult {
            items: Vec::new(),
            retry_keys: batch.keys.clone(),
        })
    }
}

struct CommitAction {
    start_ts: u64,
    commit_ts: u64,
}

#[async_trait]
impl BatchAction for CommitAction {
    type Item = ();

    fn build_request(&self, batch: &BatchKeys) -> Command {
        Command::Commit(CommitRequest {
            keys: batch.keys.clone(),
            start_ts: self.start_ts,
            commit_ts: self.commit_ts,
        })
    }

    async fn on_response(
        &self,
        _bo: &mut Backoffer,
        _batch: &BatchKeys,
        body: ResponseBody,
    ) -> Result<BatchResult<()>> {
        match body.into_commit()?.error {
            Some(e) => Err(e.into()),
            None => Ok(BatchResult::done(Vec::new())),
        }
    }
}

struct RollbackAction {
    start_ts: u64,
}

#[async_trait]
impl BatchAction for RollbackAction {
    type Item = ();

    fn build_request(&self, batch: &BatchKeys) -> Command {
        Command::BatchRollback(BatchRollbackRequest {
            keys: batch.keys.clone(),
            start_ts: self.start_ts,
        })
    }

    async fn on_response(
        &self,
        _bo: &mut Backoffer,
        _batch: &BatchKeys,
        body: ResponseBody,
    ) -> Result<BatchResult<()>> {
        match body.into_batch_rollback()?.error {
            Some(e) => Err(e.into()),
            None => Ok(BatchResult::done(Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoffer::CancelCause;
    use crate::mock::MockCluster;
    use crate::store::Action;
    use crate::store::LockInfo;
    use crate::store::MutationOp;
    use crate::transaction::lock::ResolveLocksContext;
    use crate::transaction::lock::TxnStatus;
    use crate::transaction::ttl::DefaultTtlPolicy;
    use crate::Value;

    fn put(key: impl Into<Key>, value: impl Into<Value>) -> Mutation {
        Mutation::new(key.into(), MutationOp::Put(value.into()))
    }

    fn committer_with(
        cluster: &Arc<MockCluster>,
        config: Config,
        start_ts: u64,
        mutations: Vec<Mutation>,
    ) -> TwoPhaseCommitter {
        let batcher = RegionBatcher::new(cluster.kv_store(), config.txn.txn_commit_batch_size);
        let resolver = LockResolver::new(
            batcher.clone(),
            ResolveLocksContext::default(),
            config.timeout,
        );
        let policy = Arc::new(DefaultTtlPolicy::new(&config.txn));
        TwoPhaseCommitter::new(
            batcher,
            resolver,
            config,
            policy,
            start_ts,
            Instant::now(),
            mutations,
        )
        .unwrap()
    }

    async fn committer(cluster: &Arc<MockCluster>, mutations: Vec<Mutation>) -> TwoPhaseCommitter {
        let start_ts = cluster.kv_store().current_timestamp().await.unwrap();
        committer_with(cluster, Config::default(), start_ts, mutations)
    }

    fn bo() -> Backoffer {
        Backoffer::new(BackoffContext::background(), 20_000)
    }

    async fn wait_background(committer: &TwoPhaseCommitter) {
        if let Some(handle) = committer.take_background_handle() {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn commit_makes_all_keys_visible() {
        let cluster = Arc::new(MockCluster::new());
        cluster.split("m");
        let committer = committer(&cluster, vec![put("a", "a1"), put("x", "x1")]).await;

        let commit_ts = committer.execute(&BackoffContext::background()).await.unwrap();
        assert_eq!(committer.state(), CommitterState::Committed);
        assert_eq!(committer.commit_ts(), commit_ts);
        assert_eq!(cluster.value_at("a", commit_ts), Some(b"a1".to_vec()));
        assert!(cluster.lock_at("a").is_none());

        wait_background(&committer).await;
        assert_eq!(cluster.value_at("x", u64::MAX - 1), Some(b"x1".to_vec()));
        assert!(cluster.lock_at("x").is_none());
    }

    #[tokio::test]
    async fn empty_mutations_have_no_primary() {
        let cluster = Arc::new(MockCluster::new());
        let batcher = RegionBatcher::new(cluster.kv_store(), 1024);
        let resolver = LockResolver::new(
            batcher.clone(),
            ResolveLocksContext::default(),
            Duration::from_secs(1),
        );
        let res = TwoPhaseCommitter::new(
            batcher,
            resolver,
            Config::default(),
            Arc::new(DefaultTtlPolicy::default()),
            1,
            Instant::now(),
            Vec::new(),
        );
        assert!(matches!(res, Err(Error::NoPrimaryKey)));
    }

    #[tokio::test]
    async fn later_mutation_of_a_key_wins() {
        let cluster = Arc::new(MockCluster::new());
        let committer = committer(
            &cluster,
            vec![put("b", "b1"), put("a", "a1"), put("b", "b2")],
        )
        .await;
        assert_eq!(committer.primary_key(), &Key::from("b"));
        assert_eq!(committer.keys(), &[Key::from("b"), Key::from("a")]);

        let commit_ts = committer.execute(&BackoffContext::background()).await.unwrap();
        assert_eq!(cluster.value_at("b", commit_ts), Some(b"b2".to_vec()));
    }

    #[tokio::test]
    async fn edge_max_start_ts_is_rejected_before_any_request() {
        let cluster = Arc::new(MockCluster::new());
        let committer = committer_with(&cluster, Config::default(), u64::MAX, vec![put("a", "a")]);

        let err = committer
            .execute(&BackoffContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStartTs { start_ts } if start_ts == u64::MAX));
        assert_eq!(cluster.request_count("kv_prewrite"), 0);
        assert_eq!(committer.state(), CommitterState::Failed);
    }

    #[tokio::test]
    async fn stale_commit_ts_is_rejected_and_cleaned_up() {
        let cluster = Arc::new(MockCluster::new());
        let now = cluster.kv_store().current_timestamp().await.unwrap();
        // A start ts from the future makes every commit ts stale.
        let committer = committer_with(
            &cluster,
            Config::default(),
            now + (1 << 30),
            vec![put("a", "a"), put("b", "b")],
        );

        let err = committer
            .execute(&BackoffContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommitTs { .. }));
        wait_background(&committer).await;
        assert!(cluster.lock_at("a").is_none());
        assert!(cluster.lock_at("b").is_none());
        assert_eq!(committer.state(), CommitterState::RolledBack);
    }

    #[tokio::test]
    async fn prewrite_sends_txn_size_per_region() {
        let cluster = Arc::new(MockCluster::new());
        cluster.split("m");
        let committer = committer(
            &cluster,
            vec![
                put("a", "1"),
                put("b", "1"),
                put("c", "1"),
                put("x", "1"),
                put("y", "1"),
            ],
        )
        .await;

        committer
            .prewrite_keys(&bo(), committer.keys().to_vec())
            .await
            .unwrap();
        assert_eq!(cluster.lock_at("a").unwrap().txn_size, 3);
        assert_eq!(cluster.lock_at("x").unwrap().txn_size, 2);
        assert_eq!(cluster.lock_at("y").unwrap().primary, Key::from("a"));
    }

    #[tokio::test]
    async fn lock_ttl_grows_with_size_and_elapsed_time() {
        let cluster = Arc::new(MockCluster::new());
        let config = Config::default().with_lock_ttl(3, 120, 6.0);
        let start_ts = cluster.kv_store().current_timestamp().await.unwrap();

        let mutations: Vec<Mutation> = (0..2048)
            .map(|i| {
                let mut key = format!("key{i:05}").into_bytes();
                key.resize(1024, b'k');
                put(key, vec![b'v'; 1024])
            })
            .collect();
        let started = Instant::now();
        let committer = committer_with(&cluster, config, start_ts, mutations);
        committer
            .prewrite_keys(&bo(), committer.keys().to_vec())
            .await
            .unwrap();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // 4 MiB: 6 * sqrt(4) = 12.
        let ttl = cluster.lock_at(committer.primary_key().clone()).unwrap().ttl;
        assert_eq!(ttl, committer.lock_ttl());
        assert!(ttl >= 12 && ttl <= 12 + elapsed_ms, "ttl = {ttl}");
    }

    #[tokio::test]
    async fn lock_ttl_override_is_sent() {
        let cluster = Arc::new(MockCluster::new());
        let committer = committer(&cluster, vec![put("a", "a")]).await;
        committer.set_lock_ttl(7);
        committer.prewrite_keys(&bo(), vec!["a".into()]).await.unwrap();
        assert_eq!(cluster.lock_at("a").unwrap().ttl, 7);
    }

    #[tokio::test]
    async fn write_conflict_aborts_and_cleans_up() {
        let cluster = Arc::new(MockCluster::new());
        let t1 = committer(&cluster, vec![put("a", "a1"), put("b", "b1")]).await;
        let t2 = committer(&cluster, vec![put("a", "a2")]).await;
        t2.execute(&BackoffContext::background()).await.unwrap();

        let err = t1.execute(&BackoffContext::background()).await.unwrap_err();
        assert!(err.is_write_conflict(), "{err:?}");
        wait_background(&t1).await;
        assert!(cluster.lock_at("b").is_none());
        assert_eq!(
            cluster.value_at("a", u64::MAX - 1),
            Some(b"a2".to_vec())
        );
        assert_eq!(cluster.value_at("b", u64::MAX - 1), None);
    }

    #[tokio::test]
    async fn primary_rolled_back_by_resolver_fails_commit() {
        let cluster = Arc::new(MockCluster::new());
        let t1 = committer(&cluster, vec![put("a", "a1"), put("b", "b1")]).await;
        t1.prewrite_keys(&bo(), t1.keys().to_vec()).await.unwrap();

        // Another client decides the primary is dead.
        let resolver = t1.inner.resolver.clone();
        let lock = LockInfo {
            key: "a".into(),
            primary: "a".into(),
            start_ts: t1.start_ts(),
            ttl: 0,
            txn_size: 1,
        };
        let rolled_back = TxnStatus {
            ttl: 0,
            commit_ts: 0,
            action: Action::NoAction,
        };
        resolver
            .resolve_lock(&mut bo(), &lock, rolled_back, &mut HashSet::new())
            .await
            .unwrap();

        let commit_ts = cluster.kv_store().current_timestamp().await.unwrap();
        let err = t1
            .commit_keys(&bo(), commit_ts, vec!["a".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TxnLockNotFound { .. }), "{err:?}");

        // Rolling back twice is fine.
        t1.cleanup_keys(&bo(), t1.keys().to_vec()).await.unwrap();
        t1.cleanup_keys(&bo(), t1.keys().to_vec()).await.unwrap();
        assert!(cluster.lock_at("b").is_none());
        assert!(cluster.is_rolled_back("b", t1.start_ts()));
    }

    #[tokio::test]
    async fn concurrent_commit_between_prewrite_and_commit_wins() {
        let cluster = Arc::new(MockCluster::new());
        let t1 = committer(&cluster, vec![put("a", "a1"), put("b", "b1")]).await;
        t1.set_lock_ttl(1);
        t1.prewrite_keys(&bo(), t1.keys().to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // T2 finds T1's primary lock expired and rolls it back before writing.
        let t2 = committer(&cluster, vec![put("a", "a2")]).await;
        let t2_commit_ts = t2.execute(&BackoffContext::background()).await.unwrap();
        assert!(cluster.is_rolled_back("a", t1.start_ts()));

        let commit_ts = cluster.kv_store().current_timestamp().await.unwrap();
        let err = t1
            .commit_keys(&bo(), commit_ts, vec!["a".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TxnLockNotFound { .. }), "{err:?}");
        assert_eq!(cluster.value_at("a", t2_commit_ts), Some(b"a2".to_vec()));
        assert_eq!(cluster.value_at("b", u64::MAX - 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn prewrite_waits_out_a_foreign_lock() {
        let cluster = Arc::new(MockCluster::new());
        let blocker = committer(&cluster, vec![put("a", "old")]).await;
        blocker.set_lock_ttl(1);
        blocker.prewrite_keys(&bo(), vec!["a".into()]).await.unwrap();

        let t = committer(&cluster, vec![put("a", "new")]).await;
        let commit_ts = t.execute(&BackoffContext::background()).await.unwrap();
        assert_eq!(cluster.value_at("a", commit_ts), Some(b"new".to_vec()));
        assert!(cluster.is_rolled_back("a", blocker.start_ts()));
    }

    #[tokio::test]
    async fn canceled_before_primary_aborts() {
        let cluster = Arc::new(MockCluster::new());
        let committer = committer(&cluster, vec![put("a", "a"), put("b", "b")]).await;
        let (ctx, cancel) = BackoffContext::new();
        cancel.cancel();

        let err = committer.execute(&ctx).await.unwrap_err();
        assert_eq!(err.cancel_cause(), Some(CancelCause::Canceled));
        assert!(!err.is_undetermined());
        wait_background(&committer).await;
        assert!(cluster.lock_at("a").is_none());
        assert_eq!(committer.commit_ts(), 0);
    }

    #[tokio::test]
    async fn canceled_prewrite_rolls_back_nothing_it_never_sent() {
        let cluster = Arc::new(MockCluster::new());
        cluster.split("m");
        let committer = committer(&cluster, vec![put("a", "a"), put("x", "x")]).await;
        let (ctx, cancel) = BackoffContext::new();
        cancel.cancel();

        let err = committer.execute(&ctx).await.unwrap_err();
        assert!(err.is_canceled(), "{err:?}");
        wait_background(&committer).await;
        assert_eq!(cluster.request_count("kv_prewrite"), 0);
        assert_eq!(cluster.request_count("kv_batch_rollback"), 0);
        assert_eq!(committer.state(), CommitterState::RolledBack);
        assert!(!cluster.is_rolled_back("a", committer.start_ts()));
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_during_prewrite_cleans_up() {
        let cluster = Arc::new(MockCluster::new());
        cluster.split("m");
        let committer = committer(&cluster, vec![put("a", "a"), put("x", "x")]).await;
        let slow = cluster.region_for("x").id();
        cluster.set_region_delay(slow, Duration::from_millis(200));

        let (ctx, cancel) = BackoffContext::new();
        let canceler = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = committer.execute(&ctx).await.unwrap_err();
        canceler.await.unwrap();
        assert!(err.is_canceled(), "{err:?}");

        wait_background(&committer).await;
        assert!(cluster.lock_at("a").is_none());
        assert!(cluster.lock_at("x").is_none());
        assert_eq!(cluster.value_at("a", u64::MAX - 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_after_primary_still_commits_secondaries() {
        let cluster = Arc::new(MockCluster::new());
        cluster.split("m");
        let committer = committer(&cluster, vec![put("a", "a"), put("x", "x")]).await;

        let (ctx, cancel) = BackoffContext::new();
        committer.execute(&ctx).await.unwrap();
        let slow = cluster.region_for("x").id();
        cluster.set_region_delay(slow, Duration::from_millis(200));
        cancel.cancel();

        wait_background(&committer).await;
        assert!(cluster.lock_at("x").is_none());
        assert_eq!(cluster.value_at("x", u64::MAX - 1), Some(b"x".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_primary_commit_is_undetermined() {
        let cluster = Arc::new(MockCluster::new());
        let mut config = Config::default();
        config.backoff.commit_max_backoff = 500;
        let start_ts = cluster.kv_store().current_timestamp().await.unwrap();
        let committer = committer_with(&cluster, config, start_ts, vec![put("a", "a"), put("b", "b")]);
        cluster.inject_command_errors("kv_commit", usize::MAX);

        let err = committer
            .execute(&BackoffContext::background())
            .await
            .unwrap_err();
        assert!(err.is_undetermined(), "{err:?}");
        assert_eq!(committer.state(), CommitterState::Failed);
        assert!(committer.take_background_handle().is_none());
        // Locks stay for a resolver to decide.
        assert!(cluster.lock_at("a").is_some());
        assert!(cluster.lock_at("b").is_some());
    }

    #[cfg(feature = "failpoints")]
    mod failpoints {
        use serial_test::serial;

        use super::*;

        #[tokio::test]
        #[serial]
        async fn after_prewrite_failure_rolls_back() {
            let scenario = fail::FailScenario::setup();
            fail::cfg("after-prewrite", "return").unwrap();

            let cluster = Arc::new(MockCluster::new());
            let committer = committer(&cluster, vec![put("a", "a"), put("b", "b")]).await;
            let err = committer.execute(&BackoffContext::background()).await;
            assert!(err.is_err());
            wait_background(&committer).await;
            assert!(cluster.lock_at("a").is_none());
            assert!(cluster.lock_at("b").is_none());
            assert!(cluster.is_rolled_back("a", committer.start_ts()));

            scenario.teardown();
        }

        #[tokio::test]
        #[serial]
        async fn lost_secondary_commit_is_still_committed() {
            let scenario = fail::FailScenario::setup();
            fail::cfg("before-commit-secondary", "return").unwrap();

            let cluster = Arc::new(MockCluster::new());
            let committer = committer(&cluster, vec![put("a", "a"), put("b", "b")]).await;
            let commit_ts = committer
                .execute(&BackoffContext::background())
                .await
                .unwrap();
            wait_background(&committer).await;
            assert!(cluster.lock_at("b").is_some());

            let lock = cluster.lock_at("b").unwrap();
            let (ms, _) = committer
                .inner
                .resolver
                .resolve_locks(&mut bo(), 0, vec![lock])
                .await
                .unwrap();
            assert_eq!(ms, 0);
            assert_eq!(cluster.commit_ts_of("b", committer.start_ts()), Some(commit_ts));

            scenario.teardown();
        }
    }
}
