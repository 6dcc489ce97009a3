// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use thiserror::Error;

use crate::region::Region;
use crate::region::RegionId;
use crate::Key;

/// A lock left by a prewrite. It is logically owned by the transaction whose start timestamp is
/// `start_ts`; `primary` points at the key whose state decides that transaction's fate.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockInfo {
    pub key: Key,
    pub primary: Key,
    pub start_ts: u64,
    /// Milliseconds, measured from the physical part of `start_ts`.
    pub ttl: u64,
    /// How many keys the owning transaction wrote in the lock's region.
    pub txn_size: u64,
}

/// A per-key failure reported inside an otherwise successful response.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is locked: {0:?}")]
    Locked(LockInfo),
    #[error("write conflict on {key:?}: start_ts={start_ts}, conflict_ts={conflict_ts}, conflict_commit_ts={conflict_commit_ts}")]
    WriteConflict {
        start_ts: u64,
        conflict_ts: u64,
        conflict_commit_ts: u64,
        key: Key,
        primary: Key,
    },
    #[error("key {key:?} already exists")]
    AlreadyExist { key: Key },
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("abort: {0}")]
    Abort(String),
    /// Commit found neither the transaction's lock nor its commit record.
    #[error("txn {start_ts} lock not found on {key:?}")]
    TxnLockNotFound { start_ts: u64, key: Key },
    /// Status check found neither a lock nor any record of the transaction on its primary.
    #[error("txn {start_ts} not found on primary {primary:?}")]
    TxnNotFound { start_ts: u64, primary: Key },
}

/// A region-level failure. The request was not applied and must be re-routed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("region {region_id} is not led by the addressed store, leader: {leader:?}")]
    NotLeader {
        region_id: RegionId,
        leader: Option<String>,
    },
    #[error("epoch not match, current regions: {current_regions:?}")]
    EpochNotMatch { current_regions: Vec<Region> },
    #[error("region {region_id} not found")]
    RegionNotFound { region_id: RegionId },
    #[error("key {key:?} is not in region {region_id}")]
    KeyNotInRegion { key: Key, region_id: RegionId },
    #[error("server is busy: {reason}")]
    ServerIsBusy { reason: String },
    #[error("stale command")]
    StaleCommand,
}
