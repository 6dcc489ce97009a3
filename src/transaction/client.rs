// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use log::debug;

use crate::config::Config;
use crate::pd::PdClient;
use crate::region_cache::RegionCache;
use crate::request::plan::RegionBatcher;
use crate::store::KvClient;
use crate::store::KvStore;
use crate::transaction::lock::LockResolver;
use crate::transaction::lock::ResolveLocksContext;
use crate::transaction::ttl::DefaultTtlPolicy;
use crate::transaction::ttl::LockTtlPolicy;
use crate::transaction::CheckLevel;
use crate::transaction::Snapshot;
use crate::transaction::Transaction;
use crate::Result;

/// The transactional client.
///
/// Begin a [`Transaction`] with [`begin`](TransactionClient::begin). A transaction must be
/// committed or rolled back.
///
/// Besides transactions, the client provides:
/// - `current_timestamp`: get a fresh timestamp from the oracle.
/// - `snapshot`: get a read-only [`Snapshot`] at a given timestamp.
/// - `lock_resolver`: resolve locks left by other transactions directly.
///
/// Clones share the region cache and the resolved-transaction cache.
#[derive(Clone)]
pub struct TransactionClient {
    batcher: RegionBatcher,
    resolver: LockResolver,
    config: Config,
    ttl_policy: Arc<dyn LockTtlPolicy>,
    check_level: CheckLevel,
}

impl TransactionClient {
    /// Create a client over a timestamp oracle and region directory `pd` and a store transport
    /// `kv`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use std::time::Duration;
    /// # use percolator_client::{Config, KvClient, PdClient, TransactionClient};
    /// # fn example(pd: Arc<impl PdClient>, kv: Arc<impl KvClient>) {
    /// let client = TransactionClient::new(
    ///     pd,
    ///     kv,
    ///     Config::default().with_timeout(Duration::from_secs(60)),
    /// );
    /// # }
    /// ```
    pub fn new<P, K>(pd: Arc<P>, kv: Arc<K>, config: Config) -> TransactionClient
    where
        P: PdClient,
        K: KvClient,
    {
        debug!("creating new transactional client");
        let cache = RegionCache::new(
            pd.clone(),
            config.region_cache_ttl,
            config.region_cache_ttl_jitter,
        );
        let store = KvStore::new(Arc::new(cache), kv, pd);
        let batcher = RegionBatcher::new(store, config.txn.txn_commit_batch_size);
        let resolver = LockResolver::new(
            batcher.clone(),
            ResolveLocksContext::with_capacity(config.txn.resolved_cache_size),
            config.timeout,
        );
        let ttl_policy = Arc::new(DefaultTtlPolicy::new(&config.txn));
        TransactionClient {
            batcher,
            resolver,
            config,
            ttl_policy,
            check_level: CheckLevel::default(),
        }
    }

    /// Replace the policy that maps a transaction's write size to its lock TTL.
    #[must_use]
    pub fn with_ttl_policy(mut self, policy: Arc<dyn LockTtlPolicy>) -> Self {
        self.ttl_policy = policy;
        self
    }

    /// The [`CheckLevel`] of transactions created by this client.
    #[must_use]
    pub fn with_check_level(mut self, check_level: CheckLevel) -> Self {
        self.check_level = check_level;
        self
    }

    /// Begin a transaction at a fresh timestamp.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use percolator_client::{BackoffContext, TransactionClient};
    /// # async fn example(client: TransactionClient) {
    /// let mut transaction = client.begin().await.unwrap();
    /// // ... Issue some commands.
    /// transaction.commit(&BackoffContext::background()).await.unwrap();
    /// # }
    /// ```
    pub async fn begin(&self) -> Result<Transaction> {
        debug!("creating new optimistic transaction");
        let start_ts = self.current_timestamp().await?;
        Ok(self.begin_with_start_timestamp(start_ts))
    }

    /// Begin a transaction at the given timestamp.
    pub fn begin_with_start_timestamp(&self, start_ts: u64) -> Transaction {
        Transaction::new(
            start_ts,
            self.batcher.clone(),
            self.resolver.clone(),
            self.config.clone(),
            self.ttl_policy.clone(),
            self.check_level,
        )
    }

    /// Create a read-only [`Snapshot`] at the given timestamp.
    pub fn snapshot(&self, version: u64) -> Snapshot {
        debug!("creating new snapshot at {}", version);
        Snapshot::new(
            self.batcher.clone(),
            self.resolver.clone(),
            version,
            self.config.clone(),
        )
    }

    /// Retrieve the current timestamp from the oracle.
    pub async fn current_timestamp(&self) -> Result<u64> {
        self.batcher.store().current_timestamp().await
    }

    /// The lock resolver shared by every transaction and snapshot of this client.
    pub fn lock_resolver(&self) -> &LockResolver {
        &self.resolver
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;
    use crate::BackoffContext;
    use crate::Backoffer;

    #[tokio::test]
    async fn timestamps_increase() {
        let cluster = Arc::new(MockCluster::new());
        let client = TransactionClient::new(cluster.clone(), cluster, Config::default());
        let first = client.current_timestamp().await.unwrap();
        let second = client.current_timestamp().await.unwrap();
        assert!(second > first);

        let mut txn = client.begin().await.unwrap();
        assert!(txn.start_timestamp() > second);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn lock_resolver_rolls_back_dead_locks() {
        let cluster = Arc::new(MockCluster::new());
        let client = TransactionClient::new(cluster.clone(), cluster.clone(), Config::default())
            .with_check_level(CheckLevel::Warn);
        let start_ts = client.current_timestamp().await.unwrap();
        cluster.must_lock("a", "a", start_ts, 0, 1);

        let mut bo = Backoffer::new(BackoffContext::background(), 1000);
        let lock = cluster.lock_at("a").unwrap();
        let caller = client.current_timestamp().await.unwrap();
        let (ms, _) = client
            .lock_resolver()
            .resolve_locks(&mut bo, caller, vec![lock])
            .await
            .unwrap();
        assert_eq!(ms, 0);
        assert!(cluster.is_rolled_back("a", start_ts));
        assert_eq!(client.lock_resolver().context().len().await, 1);

        let mut txn = client.begin().await.unwrap();
        assert_eq!(txn.get("a").await.unwrap(), None);
    }
}
