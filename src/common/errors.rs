// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt;
use std::result;

use thiserror::Error;

use crate::backoffer::BackoffErrorKind;
use crate::backoffer::BackofferError;
use crate::backoffer::CancelCause;
use crate::kv::HexRepr;
use crate::kv::Key;
use crate::store::KeyError;
use crate::store::LockInfo;
use crate::store::RegionError;

/// A write conflict reported by the store.
///
/// `conflict_commit_ts` is the commit (or rollback) timestamp of the record that is newer than
/// the transaction's `start_ts`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteConflictError {
    pub start_ts: u64,
    pub conflict_ts: u64,
    pub conflict_commit_ts: u64,
    pub key: Key,
    pub primary: Key,
}

impl fmt::Display for WriteConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start_ts={}, conflict_ts={}, conflict_commit_ts={}, key={}, primary={}",
            self.start_ts,
            self.conflict_ts,
            self.conflict_commit_ts,
            HexRepr(self.key.as_bytes()),
            HexRepr(self.primary.as_bytes()),
        )
    }
}

/// An `Insert` hit a key that already has a visible value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyExistsError {
    pub key: Key,
}

impl fmt::Display for KeyExistsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key={}", HexRepr(self.key.as_bytes()))
    }
}

/// An error originating from the transaction client or its collaborators.
#[derive(Debug, Error)]
#[allow(clippy::large_enum_variant)]
pub enum Error {
    /// A key is locked by another transaction and the lock could not be resolved in time.
    #[error("Key is locked: {0:?}")]
    KeyIsLocked(LockInfo),
    /// Locks that were still alive when the read gave up.
    #[error("Failed to resolve lock")]
    ResolveLockError(Vec<LockInfo>),
    /// Write conflict reported by the store.
    #[error("Write conflict: {0}")]
    WriteConflict(WriteConflictError),
    /// Key already exists (e.g. Insert on an existing key).
    #[error("Key already exists: {0}")]
    KeyExists(KeyExistsError),
    /// Region routing is stale and the retry budget ran out before it converged.
    #[error("Region error: {0}")]
    RegionError(Box<RegionError>),
    /// The bound context was canceled or its deadline passed.
    #[error("Operation canceled: {cause}")]
    Canceled { cause: CancelCause },
    /// The cumulative backoff budget was used up.
    #[error("Backoff exhausted after retrying {kind}: {message}")]
    BackoffExhausted {
        kind: BackoffErrorKind,
        message: String,
    },
    /// The start timestamp can not be used to commit.
    #[error("Try to commit with invalid txnStartTS: {start_ts}")]
    InvalidStartTs { start_ts: u64 },
    /// The commit timestamp is not newer than the start timestamp.
    #[error("Invalid transaction tso with txnStartTS={start_ts} while txnCommitTS={commit_ts}")]
    InvalidCommitTs { start_ts: u64, commit_ts: u64 },
    /// The transaction's lock is gone and no commit record exists for it.
    #[error("Txn {start_ts} lock not found on key {}", HexRepr(.key.as_bytes()))]
    TxnLockNotFound { start_ts: u64, key: Key },
    /// The primary lock of the transaction is not found.
    #[error("Txn {start_ts} not found")]
    TxnNotFound { start_ts: u64 },
    /// The store aborted the transaction.
    #[error("Store aborts txn: {message}")]
    TxnAborted { message: String },
    /// Retryable error returned by the store.
    #[error("Retryable error: {message}")]
    Retryable { message: String },
    /// Whether the transaction is committed or not is undetermined.
    #[error("Whether the transaction is committed or not is undetermined: {0}")]
    UndeterminedError(Box<Error>),
    /// The transport failed to deliver a request or receive its response.
    #[error("Transport error: {message}")]
    Transport { message: String },
    /// Multiple key errors.
    #[error("Multiple key errors: {0:?}")]
    MultipleKeyErrors(Vec<Error>),
    /// It's not allowed to perform operations in a transaction after it has been committed or rolled back.
    #[error("Cannot read or write data after any attempt to commit or roll back the transaction")]
    OperationAfterCommitError,
    /// An operation requires a primary key, but the transaction was empty.
    #[error("transaction has no primary key")]
    NoPrimaryKey,
    /// No region is found for the given key.
    #[error("Region is not found for key: {:?}", key)]
    RegionForKeyNotFound { key: Key },
    /// Can't join tokio tasks
    #[error("Failed to join tokio tasks")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("{}", message)]
    InternalError { message: String },
}

impl From<RegionError> for Error {
    fn from(e: RegionError) -> Error {
        Error::RegionError(Box::new(e))
    }
}

impl From<KeyError> for Error {
    fn from(e: KeyError) -> Error {
        match e {
            KeyError::Locked(lock) => Error::KeyIsLocked(lock),
            KeyError::WriteConflict {
                start_ts,
                conflict_ts,
                conflict_commit_ts,
                key,
                primary,
            } => Error::WriteConflict(WriteConflictError {
                start_ts,
                conflict_ts,
                conflict_commit_ts,
                key,
                primary,
            }),
            KeyError::AlreadyExist { key } => Error::KeyExists(KeyExistsError { key }),
            KeyError::Retryable(message) => Error::Retryable { message },
            KeyError::Abort(message) => Error::TxnAborted { message },
            KeyError::TxnLockNotFound { start_ts, key } => Error::TxnLockNotFound { start_ts, key },
            KeyError::TxnNotFound { start_ts, .. } => Error::TxnNotFound { start_ts },
        }
    }
}

impl From<BackofferError> for Error {
    fn from(e: BackofferError) -> Error {
        match e {
            BackofferError::Canceled { cause } => Error::Canceled { cause },
            BackofferError::MaxSleepExceeded { kind, message } => {
                Error::BackoffExhausted { kind, message }
            }
        }
    }
}

impl Error {
    pub fn is_write_conflict(&self) -> bool {
        match self {
            Error::WriteConflict(_) => true,
            Error::UndeterminedError(inner) => inner.is_write_conflict(),
            Error::MultipleKeyErrors(errors) => errors.iter().any(Error::is_write_conflict),
            _ => false,
        }
    }

    pub fn is_key_exists(&self) -> bool {
        match self {
            Error::KeyExists(_) => true,
            Error::MultipleKeyErrors(errors) => errors.iter().any(Error::is_key_exists),
            _ => false,
        }
    }

    /// Whether the error came from the caller giving up, either by canceling or by a deadline.
    pub fn is_canceled(&self) -> bool {
        match self {
            Error::Canceled { .. } => true,
            Error::UndeterminedError(inner) => inner.is_canceled(),
            _ => false,
        }
    }

    /// The cancellation cause, if this error is cancellation-flavored.
    pub fn cancel_cause(&self) -> Option<CancelCause> {
        match self {
            Error::Canceled { cause } => Some(*cause),
            Error::UndeterminedError(inner) => inner.cancel_cause(),
            _ => None,
        }
    }

    pub fn is_undetermined(&self) -> bool {
        matches!(self, Error::UndeterminedError(_))
    }

    pub fn is_backoff_exhausted(&self) -> bool {
        matches!(self, Error::BackoffExhausted { .. })
    }

    /// Transient errors that are handled internally with bounded backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::KeyIsLocked(_)
                | Error::RegionError(_)
                | Error::Retryable { .. }
                | Error::Transport { .. }
                | Error::TxnNotFound { .. }
        )
    }

    /// Whether the request may have reached the store even though it failed.
    pub(crate) fn is_ambiguous(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::Canceled { .. } => true,
            Error::BackoffExhausted { kind, .. } => *kind == BackoffErrorKind::TiKVServerTimeout,
            _ => false,
        }
    }
}

/// A result holding an [`Error`](enum@Error).
pub type Result<T> = result::Result<T, Error>;

#[doc(hidden)]
#[macro_export]
macro_rules! internal_err {
    ($e:expr) => ({
        $crate::Error::InternalError {
            message: format!("[{}:{}]: {}", file!(), line!(),  $e)
        }
    });
    ($f:tt, $($arg:expr),+) => ({
        $crate::internal_err!(format!($f, $($arg),+))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_error_maps_to_typed_error() {
        let err: Error = KeyError::WriteConflict {
            start_ts: 10,
            conflict_ts: 5,
            conflict_commit_ts: 11,
            key: Key::from("a".to_owned()),
            primary: Key::from("a".to_owned()),
        }
        .into();
        assert!(err.is_write_conflict());
        assert!(err.to_string().contains("conflict_commit_ts=11"));

        let err: Error = KeyError::AlreadyExist {
            key: Key::from("k".to_owned()),
        }
        .into();
        assert!(err.is_key_exists());
        assert!(!err.is_retryable());
    }

    #[test]
    fn undetermined_keeps_inner_classification() {
        let err = Error::UndeterminedError(Box::new(Error::Canceled {
            cause: CancelCause::DeadlineExceeded,
        }));
        assert!(err.is_undetermined());
        assert!(err.is_canceled());
        assert_eq!(err.cancel_cause(), Some(CancelCause::DeadlineExceeded));
    }

    #[test]
    fn invalid_start_ts_is_descriptive() {
        let err = Error::InvalidStartTs {
            start_ts: u64::MAX,
        };
        assert!(err.to_string().contains("invalid txnStartTS"));
    }
}
