// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

use serde_derive::Deserialize;
use serde_derive::Serialize;

/// Lock TTL and batching knobs for the two-phase committer.
///
/// All TTLs are in milliseconds and are compared against the physical part of timestamps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct TxnConfig {
    /// The minimum lock TTL, used for transactions that fit in one commit batch.
    pub default_lock_ttl: u64,
    /// The ceiling of the size-based part of the lock TTL.
    pub max_lock_ttl: u64,
    /// Scale factor of the size-based TTL: `ttl_factor * sqrt(size_in_mib)`.
    pub ttl_factor: f64,
    /// Upper bound (in bytes of keys and values) of a single prewrite/commit batch.
    pub txn_commit_batch_size: u64,
    /// How many resolved transactions the lock resolver remembers.
    pub resolved_cache_size: usize,
}

pub const DEFAULT_LOCK_TTL: u64 = 3000;
pub const MAX_LOCK_TTL: u64 = 120_000;
pub const TTL_FACTOR: f64 = 6000.0;
pub const TXN_COMMIT_BATCH_SIZE: u64 = 16 * 1024;
const RESOLVED_CACHE_SIZE: usize = 2048;

impl Default for TxnConfig {
    fn default() -> Self {
        TxnConfig {
            default_lock_ttl: DEFAULT_LOCK_TTL,
            max_lock_ttl: MAX_LOCK_TTL,
            ttl_factor: TTL_FACTOR,
            txn_commit_batch_size: TXN_COMMIT_BATCH_SIZE,
            resolved_cache_size: RESOLVED_CACHE_SIZE,
        }
    }
}

/// Cumulative backoff budgets (in milliseconds) for each class of operation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct BackoffBudget {
    pub prewrite_max_backoff: u64,
    pub commit_max_backoff: u64,
    pub cleanup_max_backoff: u64,
    pub get_max_backoff: u64,
    pub scan_max_backoff: u64,
    pub resolve_max_backoff: u64,
}

impl Default for BackoffBudget {
    fn default() -> Self {
        BackoffBudget {
            prewrite_max_backoff: 20_000,
            commit_max_backoff: 41_000,
            cleanup_max_backoff: 20_000,
            get_max_backoff: 20_000,
            scan_max_backoff: 20_000,
            resolve_max_backoff: 20_000,
        }
    }
}

/// The configuration of a [`TransactionClient`](crate::TransactionClient).
///
/// It is injected into every committer and lock resolver created by the client, so tests can
/// shorten TTLs and budgets without touching shared state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Timeout of a single request to a region.
    pub timeout: Duration,
    /// Region cache TTL base (see `region_cache_ttl_jitter`).
    pub region_cache_ttl: Duration,
    /// Adds jitter to region cache TTL to avoid thundering herds.
    ///
    /// The real TTL is in range `[region_cache_ttl, region_cache_ttl + region_cache_ttl_jitter)`.
    pub region_cache_ttl_jitter: Duration,
    pub txn: TxnConfig,
    pub backoff: BackoffBudget,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_REGION_CACHE_TTL: Duration = Duration::from_secs(600);
const DEFAULT_REGION_CACHE_TTL_JITTER: Duration = Duration::from_secs(60);

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            region_cache_ttl: DEFAULT_REGION_CACHE_TTL,
            region_cache_ttl_jitter: DEFAULT_REGION_CACHE_TTL_JITTER,
            txn: TxnConfig::default(),
            backoff: BackoffBudget::default(),
        }
    }
}

impl Config {
    /// Set the timeout of a single request.
    ///
    /// # Examples
    /// ```rust
    /// # use percolator_client::Config;
    /// # use std::time::Duration;
    /// let config = Config::default().with_timeout(Duration::from_secs(10));
    /// ```
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set region cache TTL and jitter.
    #[must_use]
    pub fn with_region_cache_ttl(mut self, base: Duration, jitter: Duration) -> Self {
        self.region_cache_ttl = base;
        self.region_cache_ttl_jitter = jitter;
        self
    }

    /// Set the lock TTL policy constants.
    ///
    /// # Examples
    /// ```rust
    /// # use percolator_client::Config;
    /// // Shortened values, handy in tests that wait for locks to expire.
    /// let config = Config::default().with_lock_ttl(3, 120, 6.0);
    /// assert_eq!(config.txn.default_lock_ttl, 3);
    /// ```
    #[must_use]
    pub fn with_lock_ttl(mut self, default_ttl: u64, max_ttl: u64, ttl_factor: f64) -> Self {
        self.txn.default_lock_ttl = default_ttl;
        self.txn.max_lock_ttl = max_ttl;
        self.txn.ttl_factor = ttl_factor;
        self
    }

    #[must_use]
    pub fn with_txn_config(mut self, txn: TxnConfig) -> Self {
        self.txn = txn;
        self
    }

    #[must_use]
    pub fn with_backoff_budget(mut self, backoff: BackoffBudget) -> Self {
        self.backoff = backoff;
        self
    }
}
