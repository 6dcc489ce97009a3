// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Optimistic transactions over the Percolator protocol.
//!
//! A [`Transaction`] buffers its writes locally and commits them with a [`TwoPhaseCommitter`].
//! Reads go through a [`Snapshot`], which uses the [`LockResolver`] to get past locks that
//! other transactions left behind.

pub use client::TransactionClient;
pub use committer::CommitterState;
pub use committer::TwoPhaseCommitter;
pub use lock::LockResolver;
pub use lock::ResolveLocksContext;
pub use lock::TxnStatus;
pub use snapshot::Snapshot;
pub use transaction::CheckLevel;
pub use transaction::Transaction;
pub use ttl::DefaultTtlPolicy;
pub use ttl::LockTtlPolicy;

pub(crate) mod buffer;
mod client;
mod committer;
mod lock;
mod snapshot;
#[allow(clippy::module_inception)]
mod transaction;
mod ttl;
