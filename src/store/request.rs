// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! Per-region commands and their responses.
//!
//! Each request kind has a matching response kind. Extraction from [`ResponseBody`] is
//! exhaustive: a body of the wrong kind is an internal error, never silently ignored.

use crate::internal_err;
use crate::region::RegionVerId;
use crate::store::Action;
use crate::store::KeyError;
use crate::store::RegionError;
use crate::Key;
use crate::KvPair;
use crate::Result;
use crate::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOp {
    Put(Value),
    Delete,
    /// A put that fails with `AlreadyExist` if the key has a visible value.
    Insert(Value),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub key: Key,
    pub op: MutationOp,
}

impl Mutation {
    pub fn new(key: Key, op: MutationOp) -> Self {
        Mutation { key, op }
    }

    /// Bytes this mutation contributes to a batch.
    pub fn size(&self) -> usize {
        self.key.len()
            + match &self.op {
                MutationOp::Put(v) | MutationOp::Insert(v) => v.len(),
                MutationOp::Delete => 0,
            }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetRequest {
    pub key: Key,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchGetRequest {
    pub keys: Vec<Key>,
    pub version: u64,
}

/// Reads `[start_key, end_key)`. An empty `end_key` is unbounded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub start_key: Key,
    pub end_key: Key,
    pub limit: u32,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrewriteRequest {
    pub mutations: Vec<Mutation>,
    pub primary: Key,
    pub start_ts: u64,
    pub lock_ttl: u64,
    pub txn_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRequest {
    pub keys: Vec<Key>,
    pub start_ts: u64,
    pub commit_ts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchRollbackRequest {
    pub keys: Vec<Key>,
    pub start_ts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckTxnStatusRequest {
    pub primary: Key,
    pub lock_ts: u64,
    pub caller_start_ts: u64,
    pub current_ts: u64,
    pub rollback_if_not_exist: bool,
    pub force_sync_commit: bool,
}

/// Commits (`commit_ts > 0`) or rolls back (`commit_ts == 0`) the locks of `start_ts`.
/// With no `keys`, every lock of the transaction in the region is resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveLockRequest {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub keys: Vec<Key>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Get(GetRequest),
    BatchGet(BatchGetRequest),
    Scan(ScanRequest),
    Prewrite(PrewriteRequest),
    Commit(CommitRequest),
    BatchRollback(BatchRollbackRequest),
    CheckTxnStatus(CheckTxnStatusRequest),
    ResolveLock(ResolveLockRequest),
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::Get(_) => "kv_get",
            Command::BatchGet(_) => "kv_batch_get",
            Command::Scan(_) => "kv_scan",
            Command::Prewrite(_) => "kv_prewrite",
            Command::Commit(_) => "kv_commit",
            Command::BatchRollback(_) => "kv_batch_rollback",
            Command::CheckTxnStatus(_) => "kv_check_txn_status",
            Command::ResolveLock(_) => "kv_resolve_lock",
        }
    }
}

/// A command addressed to one version of one region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvRequest {
    pub region: RegionVerId,
    pub command: Command,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub value: Option<Value>,
    pub error: Option<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchGetResponse {
    pub pairs: Vec<KvPair>,
    pub errors: Vec<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResponse {
    pub pairs: Vec<KvPair>,
    pub errors: Vec<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrewriteResponse {
    pub errors: Vec<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitResponse {
    pub error: Option<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchRollbackResponse {
    pub error: Option<KeyError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckTxnStatusResponse {
    pub lock_ttl: u64,
    pub commit_version: u64,
    pub action: Action,
    pub error: Option<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveLockResponse {
    pub error: Option<KeyError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseBody {
    Get(GetResponse),
    BatchGet(BatchGetResponse),
    Scan(ScanResponse),
    Prewrite(PrewriteResponse),
    Commit(CommitResponse),
    BatchRollback(BatchRollbackResponse),
    CheckTxnStatus(CheckTxnStatusResponse),
    ResolveLock(ResolveLockResponse),
}

/// What the store answered: either a body, or a region error meaning nothing was applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvResponse {
    Body(ResponseBody),
    RegionError(RegionError),
}

macro_rules! response_kinds {
    ($($variant:ident => $method:ident($ty:ty)),* $(,)?) => {
        impl ResponseBody {
            pub fn label(&self) -> &'static str {
                match self {
                    $(ResponseBody::$variant(_) => stringify!($variant),)*
                }
            }

            $(
                pub(crate) fn $method(self) -> Result<$ty> {
                    match self {
                        ResponseBody::$variant(resp) => Ok(resp),
                        other => Err(internal_err!(
                            "expected {} response, got {}",
                            stringify!($variant),
                            other.label()
                        )),
                    }
                }
            )*
        }
    };
}

response_kinds! {
    Get => into_get(GetResponse),
    BatchGet => into_batch_get(BatchGetResponse),
    Scan => into_scan(ScanResponse),
    Prewrite => into_prewrite(PrewriteResponse),
    Commit => into_commit(CommitResponse),
    BatchRollback => into_batch_rollback(BatchRollbackResponse),
    CheckTxnStatus => into_check_txn_status(CheckTxnStatusResponse),
    ResolveLock => into_resolve_lock(ResolveLockResponse),
}
