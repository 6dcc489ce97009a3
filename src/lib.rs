// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

//! This crate is the client side of a Percolator-style transaction protocol over a sharded,
//! multi-version key-value store.
//!
//! The store keeps every key's versions, locks and commit records. It is split into regions,
//! each served by a leader. The client does the rest:
//!
//! - it routes keys to regions through a [`RegionCache`](region_cache::RegionCache) and retries
//!   when the routing turns out to be stale,
//! - it commits transactions in two phases: every key is prewritten (locked), then the primary
//!   key is committed, which decides the transaction, then the other keys are committed in the
//!   background,
//! - it resolves locks left behind by other transactions, by asking their primary key what
//!   happened and then committing or rolling back the locks to match.
//!
//! Retries are bounded by a [`Backoffer`], which sleeps with a per-error schedule, stops when a
//! cumulative budget is spent and follows the cancellation of a [`BackoffContext`].
//!
//! The crate is transport agnostic. A deployment provides a [`PdClient`] (timestamps and region
//! discovery) and a [`KvClient`] (requests to a store), and builds a [`TransactionClient`] over
//! them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use percolator_client::{BackoffContext, Config, KvClient, PdClient, Result, TransactionClient};
//! # async fn example(pd: Arc<impl PdClient>, kv: Arc<impl KvClient>) -> Result<()> {
//! let client = TransactionClient::new(pd, kv, Config::default());
//! let mut txn = client.begin().await?;
//! txn.put("key".to_owned(), "value".to_owned()).await?;
//! let _value = txn.get("key".to_owned()).await?;
//! txn.commit(&BackoffContext::background()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Since this crate provides an async API, you need an async runtime (Tokio-only).

#![allow(clippy::field_reassign_with_default)]

mod backoffer;
mod common;
mod config;
mod kv;
mod pd;
#[doc(hidden)]
pub mod region;
#[doc(hidden)]
pub mod region_cache;
mod request;
mod stats;
#[doc(hidden)]
pub mod store;
mod timestamp;
#[doc(hidden)]
pub mod transaction;

#[cfg(any(test, feature = "test-util"))]
#[cfg_attr(feature = "test-util", allow(dead_code))]
mod mock;

/// Test and benchmark utilities (feature-gated).
#[cfg(feature = "test-util")]
pub mod test_util {
    pub use super::mock::MockCluster;
}

#[doc(inline)]
pub use common::Error;
#[doc(inline)]
pub use common::KeyExistsError;
#[doc(inline)]
pub use common::Result;
#[doc(inline)]
pub use common::WriteConflictError;
#[doc(inline)]
pub use config::BackoffBudget;
#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use config::TxnConfig;

#[doc(inline)]
pub use crate::backoffer::BackoffCancel;
#[doc(inline)]
pub use crate::backoffer::BackoffContext;
#[doc(inline)]
pub use crate::backoffer::BackoffErrorKind;
#[doc(inline)]
pub use crate::backoffer::Backoffer;
#[doc(inline)]
pub use crate::backoffer::CancelCause;
#[doc(inline)]
pub use crate::kv::Key;
#[doc(inline)]
pub use crate::kv::KvPair;
#[doc(inline)]
pub use crate::kv::Value;
#[doc(inline)]
pub use crate::pd::PdClient;
#[doc(inline)]
pub use crate::store::KvClient;
#[doc(inline)]
pub use crate::timestamp::compose_ts;
#[doc(inline)]
pub use crate::timestamp::extract_logical;
#[doc(inline)]
pub use crate::timestamp::extract_physical;
#[doc(inline)]
pub use crate::timestamp::get_physical;
#[doc(inline)]
pub use crate::timestamp::time_to_ts;
#[doc(inline)]
pub use crate::transaction::CheckLevel;
#[doc(inline)]
pub use crate::transaction::CommitterState;
#[doc(inline)]
pub use crate::transaction::LockResolver;
#[doc(inline)]
pub use crate::transaction::LockTtlPolicy;
#[doc(inline)]
pub use crate::transaction::Snapshot;
#[doc(inline)]
pub use crate::transaction::Transaction;
#[doc(inline)]
pub use crate::transaction::TransactionClient;
#[doc(inline)]
pub use crate::transaction::TwoPhaseCommitter;
#[doc(inline)]
pub use crate::transaction::TxnStatus;
