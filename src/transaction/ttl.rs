// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

use crate::config::TxnConfig;

/// Maps the size of a transaction to the size-based part of its lock TTL, in milliseconds.
///
/// The committer adds the time elapsed since the transaction started on top of this value.
pub trait LockTtlPolicy: Send + Sync + 'static {
    fn lock_ttl(&self, write_size: u64) -> u64;
}

/// `ttl_factor * sqrt(size in MiB)`, clamped to `[default_lock_ttl, max_lock_ttl]`, for
/// transactions larger than one commit batch. Smaller ones get `default_lock_ttl`.
#[derive(Clone, Debug, PartialEq)]
pub struct DefaultTtlPolicy {
    default_lock_ttl: u64,
    max_lock_ttl: u64,
    ttl_factor: f64,
    txn_commit_batch_size: u64,
}

impl DefaultTtlPolicy {
    pub fn new(config: &TxnConfig) -> Self {
        DefaultTtlPolicy {
            default_lock_ttl: config.default_lock_ttl,
            max_lock_ttl: config.max_lock_ttl,
            ttl_factor: config.ttl_factor,
            txn_commit_batch_size: config.txn_commit_batch_size,
        }
    }
}

impl Default for DefaultTtlPolicy {
    fn default() -> Self {
        DefaultTtlPolicy::new(&TxnConfig::default())
    }
}

impl LockTtlPolicy for DefaultTtlPolicy {
    fn lock_ttl(&self, write_size: u64) -> u64 {
        if write_size <= self.txn_commit_batch_size {
            return self.default_lock_ttl;
        }
        let size_mib = write_size as f64 / 1024.0 / 1024.0;
        let ttl = (self.ttl_factor * size_mib.sqrt()) as u64;
        ttl.max(self.default_lock_ttl).min(self.max_lock_ttl.max(self.default_lock_ttl))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn small_transactions_get_default_ttl() {
        let policy = DefaultTtlPolicy::default();
        assert_eq!(policy.lock_ttl(0), 3000);
        assert_eq!(policy.lock_ttl(16 * 1024), 3000);
    }

    #[test]
    fn four_mib_with_shortened_constants() {
        let config = crate::Config::default().with_lock_ttl(3, 120, 6.0);
        let policy = DefaultTtlPolicy::new(&config.txn);
        assert_eq!(policy.lock_ttl(4 * 1024 * 1024), 12);
        assert_eq!(policy.lock_ttl(1024 * 1024 * 1024), 120);
    }

    proptest! {
        #[test]
        fn ttl_stays_within_bounds(size in any::<u64>()) {
            let policy = DefaultTtlPolicy::default();
            let ttl = policy.lock_ttl(size);
            prop_assert!(ttl >= 3000);
            prop_assert!(ttl <= 120_000);
        }

        #[test]
        fn ttl_grows_with_size(a in 0u64..1 << 40, b in 0u64..1 << 40) {
            let policy = DefaultTtlPolicy::default();
            let (small, large) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(policy.lock_ttl(small) <= policy.lock_ttl(large));
        }
    }
}
