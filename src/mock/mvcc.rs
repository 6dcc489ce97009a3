// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! In-memory Percolator storage: a lock table plus per-key write records.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::store::Action;
use crate::store::KeyError;
use crate::store::LockInfo;
use crate::store::Mutation;
use crate::store::MutationOp;
use crate::timestamp::is_expired;
use crate::Key;
use crate::KvPair;
use crate::Value;

#[derive(Clone, Debug)]
struct Lock {
    primary: Key,
    start_ts: u64,
    ttl: u64,
    txn_size: u64,
    min_commit_ts: u64,
    op: MutationOp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum WriteKind {
    Put(Value),
    Delete,
    Rollback,
}

#[derive(Clone, Debug)]
struct Write {
    start_ts: u64,
    commit_ts: u64,
    kind: WriteKind,
}

/// Result of a status check on a primary key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TxnStatusRecord {
    pub lock_ttl: u64,
    pub commit_version: u64,
    pub action: Action,
}

#[derive(Default)]
pub(crate) struct MvccStore {
    locks: BTreeMap<Key, Lock>,
    /// Newest first.
    writes: BTreeMap<Key, Vec<Write>>,
}

impl MvccStore {
    fn lock_info(key: &Key, lock: &Lock) -> LockInfo {
        LockInfo {
            key: key.clone(),
            primary: lock.primary.clone(),
            start_ts: lock.start_ts,
            ttl: lock.ttl,
            txn_size: lock.txn_size,
        }
    }

    fn push_write(&mut self, key: &Key, write: Write) {
        let writes = self.writes.entry(key.clone()).or_default();
        let pos = writes
            .iter()
            .position(|w| w.commit_ts < write.commit_ts)
            .unwrap_or(writes.len());
        writes.insert(pos, write);
    }

    fn write_of_txn(&self, key: &Key, start_ts: u64) -> Option<&Write> {
        self.writes
            .get(key)?
            .iter()
            .find(|w| w.start_ts == start_ts)
    }

    /// The newest committed value at `version`, ignoring locks.
    pub(crate) fn committed_value(&self, key: &Key, version: u64) -> Option<Value> {
        let writes = self.writes.get(key)?;
        for w in writes.iter().filter(|w| w.commit_ts <= version) {
            match &w.kind {
                WriteKind::Put(v) => return Some(v.clone()),
                WriteKind::Delete => return None,
                WriteKind::Rollback => continue,
            }
        }
        None
    }

    pub(crate) fn get(&self, key: &Key, version: u64) -> Result<Option<Value>, KeyError> {
        if let Some(lock) = self.locks.get(key) {
            if lock.start_ts <= version {
                return Err(KeyError::Locked(Self::lock_info(key, lock)));
            }
        }
        Ok(self.committed_value(key, version))
    }

    pub(crate) fn scan(
        &self,
        start: &Key,
        end: &Key,
        limit: usize,
        version: u64,
    ) -> (Vec<KvPair>, Vec<KeyError>) {
        let in_range = |k: &&Key| *k >= start && (end.is_empty() || *k < end);
        let keys: BTreeSet<&Key> = self
            .locks
            .keys()
            .filter(in_range)
            .chain(self.writes.keys().filter(in_range))
            .collect();

        let mut pairs = Vec::new();
        let mut errors = Vec::new();
        for key in keys {
            if pairs.len() + errors.len() >= limit {
                break;
            }
            match self.get(key, version) {
                Ok(Some(value)) => pairs.push(KvPair::new(key.clone(), value)),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        (pairs, errors)
    }

    /// Either every mutation is locked or none is.
    pub(crate) fn prewrite(
        &mut self,
        mutations: Vec<Mutation>,
        primary: &Key,
        start_ts: u64,
        ttl: u64,
        txn_size: u64,
    ) -> Vec<KeyError> {
        let mut errors = Vec::new();
        let mut to_lock = Vec::new();
        for m in mutations {
            if let Some(lock) = self.locks.get(&m.key) {
                if lock.start_ts != start_ts {
                    errors.push(KeyError::Locked(Self::lock_info(&m.key, lock)));
                }
                continue;
            }
            if let Some(newest) = self.writes.get(&m.key).and_then(|ws| ws.first()) {
                if newest.commit_ts >= start_ts {
                    errors.push(KeyError::WriteConflict {
                        start_ts,
                        conflict_ts: newest.start_ts,
                        conflict_commit_ts: newest.commit_ts,
                        key: m.key.clone(),
                        primary: primary.clone(),
                    });
                    continue;
                }
            }
            if matches!(m.op, MutationOp::Insert(_))
                && self.committed_value(&m.key, u64::MAX).is_some()
            {
                errors.push(KeyError::AlreadyExist { key: m.key });
                continue;
            }
            to_lock.push(m);
        }
        if !errors.is_empty() {
            return errors;
        }
        for m in to_lock {
            self.locks.insert(
                m.key,
                Lock {
                    primary: primary.clone(),
                    start_ts,
                    ttl,
                    txn_size,
                    min_commit_ts: start_ts + 1,
                    op: m.op,
                },
            );
        }
        errors
    }

    fn commit_key(&mut self, key: &Key, start_ts: u64, commit_ts: u64) -> Result<(), KeyError> {
        match self.locks.get(key) {
            Some(lock) if lock.start_ts == start_ts => {
                let kind = match &lock.op {
                    MutationOp::Put(v) | MutationOp::Insert(v) => WriteKind::Put(v.clone()),
                    MutationOp::Delete => WriteKind::Delete,
                };
                self.locks.remove(key);
                self.push_write(
                    key,
                    Write {
                        start_ts,
                        commit_ts,
                        kind,
                    },
                );
                Ok(())
            }
            _ => match self.write_of_txn(key, start_ts) {
                Some(w) if w.kind != WriteKind::Rollback => Ok(()),
                _ => Err(KeyError::TxnLockNotFound {
                    start_ts,
                    key: key.clone(),
                }),
            },
        }
    }

    pub(crate) fn commit(
        &mut self,
        keys: &[Key],
        start_ts: u64,
        commit_ts: u64,
    ) -> Option<KeyError> {
        keys.iter()
            .find_map(|key| self.commit_key(key, start_ts, commit_ts).err())
    }

    fn rollback_key(&mut self, key: &Key, start_ts: u64) -> Result<(), KeyError> {
        if let Some(w) = self.write_of_txn(key, start_ts) {
            return match w.kind {
                WriteKind::Rollback => Ok(()),
                _ => Err(KeyError::Abort(format!(
                    "txn {start_ts} is already committed on {key:?}"
                ))),
            };
        }
        if self
            .locks
            .get(key)
            .map_or(false, |lock| lock.start_ts == start_ts)
        {
            self.locks.remove(key);
        }
        self.push_write(
            key,
            Write {
                start_ts,
                commit_ts: start_ts,
                kind: WriteKind::Rollback,
            },
        );
        Ok(())
    }

    pub(crate) fn batch_rollback(&mut self, keys: &[Key], start_ts: u64) -> Option<KeyError> {
        keys.iter()
            .find_map(|key| self.rollback_key(key, start_ts).err())
    }

    pub(crate) fn check_txn_status(
        &mut self,
        primary: &Key,
        lock_ts: u64,
        caller_start_ts: u64,
        current_ts: u64,
        rollback_if_not_exist: bool,
    ) -> Result<TxnStatusRecord, KeyError> {
        let expired = self
            .locks
            .get(primary)
            .filter(|lock| lock.start_ts == lock_ts)
            .map(|lock| is_expired(lock.start_ts, lock.ttl, current_ts));
        match expired {
            Some(true) => {
                self.rollback_key(primary, lock_ts)?;
                return Ok(TxnStatusRecord {
                    lock_ttl: 0,
                    commit_version: 0,
                    action: Action::TtlExpireRollback,
                });
            }
            Some(false) => {
                if let Some(lock) = self.locks.get_mut(primary) {
                    let mut action = Action::NoAction;
                    if caller_start_ts != 0
                        && caller_start_ts != u64::MAX
                        && caller_start_ts >= lock.min_commit_ts
                    {
                        lock.min_commit_ts = caller_start_ts + 1;
                        action = Action::MinCommitTsPushed;
                    }
                    return Ok(TxnStatusRecord {
                        lock_ttl: lock.ttl,
                        commit_version: 0,
                        action,
                    });
                }
            }
            None => {}
        }

        match self.write_of_txn(primary, lock_ts) {
            Some(w) => Ok(TxnStatusRecord {
                lock_ttl: 0,
                commit_version: if w.kind == WriteKind::Rollback {
                    0
                } else {
                    w.commit_ts
                },
                action: Action::NoAction,
            }),
            None if rollback_if_not_exist => {
                self.rollback_key(primary, lock_ts)?;
                Ok(TxnStatusRecord {
                    lock_ttl: 0,
                    commit_version: 0,
                    action: Action::LockNotExistRollback,
                })
            }
            None => Err(KeyError::TxnNotFound {
                start_ts: lock_ts,
                primary: primary.clone(),
            }),
        }
    }

    /// Commit (`commit_ts > 0`) or roll back the locks of `start_ts` on `keys`, or on every key
    /// in `[start, end)` when `keys` is empty.
    pub(crate) fn resolve_lock(
        &mut self,
        start_ts: u64,
        commit_ts: u64,
        keys: &[Key],
        start: &Key,
        end: &Key,
    ) -> Option<KeyError> {
        let targets: Vec<Key> = if keys.is_empty() {
            self.locks
                .iter()
                .filter(|(k, l)| {
                    l.start_ts == start_ts && *k >= start && (end.is_empty() || *k < end)
                })
                .map(|(k, _)| k.clone())
                .collect()
        } else {
            keys.iter()
                .filter(|k| {
                    self.locks
                        .get(*k)
                        .map_or(false, |l| l.start_ts == start_ts)
                })
                .cloned()
                .collect()
        };
        targets.iter().find_map(|key| {
            if commit_ts > 0 {
                self.commit_key(key, start_ts, commit_ts).err()
            } else {
                self.rollback_key(key, start_ts).err()
            }
        })
    }

    pub(crate) fn lock(&self, key: &Key) -> Option<LockInfo> {
        self.locks.get(key).map(|l| Self::lock_info(key, l))
    }

    pub(crate) fn put_lock(&mut self, key: Key, primary: Key, start_ts: u64, ttl: u64, txn_size: u64) {
        self.locks.insert(
            key.clone(),
            Lock {
                primary,
                start_ts,
                ttl,
                txn_size,
                min_commit_ts: start_ts + 1,
                op: MutationOp::Put(key.into()),
            },
        );
    }

    pub(crate) fn put_committed(&mut self, key: Key, value: Value, start_ts: u64, commit_ts: u64) {
        self.push_write(
            &key,
            Write {
                start_ts,
                commit_ts,
                kind: WriteKind::Put(value),
            },
        );
    }

    pub(crate) fn commit_ts_of(&self, key: &Key, start_ts: u64) -> Option<u64> {
        self.write_of_txn(key, start_ts)
            .filter(|w| w.kind != WriteKind::Rollback)
            .map(|w| w.commit_ts)
    }

    pub(crate) fn is_rolled_back(&self, key: &Key, start_ts: u64) -> bool {
        self.write_of_txn(key, start_ts)
            .map_or(false, |w| w.kind == WriteKind::Rollback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::compose_ts;

    fn put(key: &'static str, value: &'static str) -> Mutation {
        Mutation::new(key.into(), MutationOp::Put(value.into()))
    }

    #[test]
    fn prewrite_commit_then_read() {
        let mut store = MvccStore::default();
        let errors = store.prewrite(vec![put("a", "1"), put("b", "2")], &"a".into(), 10, 3000, 2);
        assert!(errors.is_empty());
        assert!(matches!(store.get(&"b".into(), 20), Err(KeyError::Locked(_))));
        // Reads below the lock are not blocked.
        assert_eq!(store.get(&"b".into(), 5), Ok(None));

        assert_eq!(store.commit(&[Key::from("a"), Key::from("b")], 10, 11), None);
        assert_eq!(store.get(&"a".into(), 11), Ok(Some(b"1".to_vec())));
        assert_eq!(store.get(&"a".into(), 10), Ok(None));
        // Committing again is a no-op.
        assert_eq!(store.commit(&[Key::from("a")], 10, 11), None);
    }

    #[test]
    fn newer_write_conflicts_and_nothing_is_locked() {
        let mut store = MvccStore::default();
        store.put_committed("b".into(), b"x".to_vec(), 12, 15);
        let errors = store.prewrite(vec![put("a", "1"), put("b", "2")], &"a".into(), 10, 3000, 2);
        assert!(matches!(
            errors.as_slice(),
            [KeyError::WriteConflict { conflict_commit_ts: 15, .. }]
        ));
        assert!(store.lock(&"a".into()).is_none());
    }

    #[test]
    fn rollback_is_idempotent_and_blocks_late_prewrite() {
        let mut store = MvccStore::default();
        assert_eq!(store.batch_rollback(&[Key::from("a")], 10), None);
        assert_eq!(store.batch_rollback(&[Key::from("a")], 10), None);
        assert!(store.is_rolled_back(&"a".into(), 10));

        let errors = store.prewrite(vec![put("a", "1")], &"a".into(), 10, 3000, 1);
        assert!(matches!(errors.as_slice(), [KeyError::WriteConflict { .. }]));
        assert!(matches!(
            store.commit(&[Key::from("a")], 10, 11),
            Some(KeyError::TxnLockNotFound { .. })
        ));
    }

    #[test]
    fn check_txn_status_outcomes() {
        let mut store = MvccStore::default();
        let lock_ts = compose_ts(1_000, 0).unwrap();
        let before_expiry = compose_ts(1_500, 0).unwrap();
        let after_expiry = compose_ts(5_000, 0).unwrap();
        store.put_lock("p".into(), "p".into(), lock_ts, 3000, 1);

        let alive = store
            .check_txn_status(&"p".into(), lock_ts, 0, before_expiry, false)
            .unwrap();
        assert_eq!((alive.lock_ttl, alive.action), (3000, Action::NoAction));

        let pushed = store
            .check_txn_status(&"p".into(), lock_ts, before_expiry, before_expiry, false)
            .unwrap();
        assert_eq!(pushed.action, Action::MinCommitTsPushed);

        let expired = store
            .check_txn_status(&"p".into(), lock_ts, 0, after_expiry, false)
            .unwrap();
        assert_eq!(expired.action, Action::TtlExpireRollback);
        assert!(store.lock(&"p".into()).is_none());

        assert!(matches!(
            store.check_txn_status(&"q".into(), lock_ts, 0, after_expiry, false),
            Err(KeyError::TxnNotFound { .. })
        ));
        let status = store
            .check_txn_status(&"q".into(), lock_ts, 0, after_expiry, true)
            .unwrap();
        assert_eq!(status.action, Action::LockNotExistRollback);
    }

    #[test]
    fn insert_fails_on_existing_value() {
        let mut store = MvccStore::default();
        store.put_committed("a".into(), b"v".to_vec(), 1, 2);
        let errors = store.prewrite(
            vec![Mutation::new("a".into(), MutationOp::Insert(b"w".to_vec()))],
            &"a".into(),
            10,
            3000,
            1,
        );
        assert!(matches!(errors.as_slice(), [KeyError::AlreadyExist { .. }]));
    }

    #[test]
    fn resolve_whole_range_only_touches_the_txn() {
        let mut store = MvccStore::default();
        store.put_lock("a".into(), "a".into(), 10, 3000, 2);
        store.put_lock("b".into(), "a".into(), 10, 3000, 2);
        store.put_lock("c".into(), "c".into(), 20, 3000, 1);
        assert_eq!(store.resolve_lock(10, 0, &[], &Key::EMPTY, &Key::EMPTY), None);
        assert!(store.lock(&"a".into()).is_none());
        assert!(store.lock(&"b".into()).is_none());
        assert!(store.lock(&"c".into()).is_some());
    }
}
