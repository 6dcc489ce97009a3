// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! Retry budget tracking bound to a cancellable operation context.
//!
//! A [`Backoffer`] owns a "max total sleep" budget shared by every retry of one logical operation
//! (a prewrite, a primary commit, a read). Each retry sleeps according to a per-kind exponential
//! schedule and the sleep is preempted as soon as the bound [`BackoffContext`] is canceled or its
//! deadline passes.
//!
//! `tikvServerBusy` sleeps are "excluded": they are tracked in their own bucket and do not
//! consume the regular budget.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use log::debug;
use rand::thread_rng;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::stats;

const TIKV_SERVER_BUSY_EXCLUDED_MAX_MS: u64 = 600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Jitter {
    NoJitter,
    FullJitter,
    EqualJitter,
    DecorrJitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffFnCfg {
    base_ms: u64,
    cap_ms: u64,
    jitter: Jitter,
}

impl BackoffFnCfg {
    pub(crate) const fn new(base_ms: u64, cap_ms: u64, jitter: Jitter) -> Self {
        Self {
            base_ms,
            cap_ms,
            jitter,
        }
    }
}

/// The class of failure reported when a budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffErrorKind {
    TiKVServerTimeout,
    ResolveLockTimeout,
    RegionUnavailable,
    TiKVServerBusy,
}

impl fmt::Display for BackoffErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackoffErrorKind::TiKVServerTimeout => "tikv server timeout",
            BackoffErrorKind::ResolveLockTimeout => "resolve lock timeout",
            BackoffErrorKind::RegionUnavailable => "region unavailable",
            BackoffErrorKind::TiKVServerBusy => "tikv server busy",
        };
        f.write_str(s)
    }
}

/// Why a context stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The owner of the context called [`BackoffCancel::cancel`].
    Canceled,
    /// The context's deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Canceled => f.write_str("context canceled"),
            CancelCause::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackofferError {
    #[error("{cause}")]
    Canceled { cause: CancelCause },

    /// Max sleep budget exceeded. Reports the dominant backoff kind (longest sleep time).
    #[error("{kind}: {message}")]
    MaxSleepExceeded {
        kind: BackoffErrorKind,
        message: String,
    },
}

impl BackofferError {
    #[cfg(test)]
    pub(crate) fn kind(&self) -> Option<BackoffErrorKind> {
        match self {
            BackofferError::MaxSleepExceeded { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffConfig {
    name: &'static str,
    fn_cfg: BackoffFnCfg,
    err_kind: BackoffErrorKind,
}

impl BackoffConfig {
    pub(crate) const fn new(
        name: &'static str,
        fn_cfg: BackoffFnCfg,
        err_kind: BackoffErrorKind,
    ) -> Self {
        Self {
            name,
            fn_cfg,
            err_kind,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    fn is_excluded(&self) -> bool {
        self.name == BO_TIKV_SERVER_BUSY.name
    }
}

pub(crate) const BO_TIKV_RPC: BackoffConfig = BackoffConfig::new(
    "tikvRPC",
    BackoffFnCfg::new(100, 2000, Jitter::EqualJitter),
    BackoffErrorKind::TiKVServerTimeout,
);

pub(crate) const BO_REGION_MISS: BackoffConfig = BackoffConfig::new(
    "regionMiss",
    BackoffFnCfg::new(2, 500, Jitter::NoJitter),
    BackoffErrorKind::RegionUnavailable,
);

/// A store named a new leader. The retry goes to that leader, so the sleep stays short.
pub(crate) const BO_UPDATE_LEADER: BackoffConfig = BackoffConfig::new(
    "updateLeader",
    BackoffFnCfg::new(1, 10, Jitter::NoJitter),
    BackoffErrorKind::TiKVServerTimeout,
);

pub(crate) const BO_TIKV_SERVER_BUSY: BackoffConfig = BackoffConfig::new(
    "tikvServerBusy",
    BackoffFnCfg::new(2000, 10_000, Jitter::EqualJitter),
    BackoffErrorKind::TiKVServerBusy,
);

pub(crate) const BO_TXN_NOT_FOUND: BackoffConfig = BackoffConfig::new(
    "txnNotFound",
    BackoffFnCfg::new(2, 500, Jitter::NoJitter),
    BackoffErrorKind::ResolveLockTimeout,
);

pub(crate) const BO_TXN_LOCK: BackoffConfig = BackoffConfig::new(
    "txnLock",
    BackoffFnCfg::new(200, 3000, Jitter::EqualJitter),
    BackoffErrorKind::ResolveLockTimeout,
);

pub(crate) const BO_TXN_LOCK_FAST: BackoffConfig = BackoffConfig::new(
    "txnLockFast",
    BackoffFnCfg::new(10, 3000, Jitter::EqualJitter),
    BackoffErrorKind::ResolveLockTimeout,
);

#[derive(Debug)]
struct BackoffFnState {
    base_ms: u64,
    cap_ms: u64,
    jitter: Jitter,
    attempts: u32,
    last_sleep_ms: u64,
}

impl BackoffFnState {
    fn new(base_ms: u64, cap_ms: u64, jitter: Jitter) -> Self {
        // Keep jitter helpers' ranges non-empty.
        let base_ms = base_ms.max(2);
        let cap_ms = cap_ms.max(base_ms);
        Self {
            base_ms,
            cap_ms,
            jitter,
            attempts: 0,
            last_sleep_ms: base_ms,
        }
    }

    fn backoff_ms(&mut self, max_sleep_ms: Option<u64>) -> u64 {
        let sleep_ms = match self.jitter {
            Jitter::NoJitter => expo(self.base_ms, self.cap_ms, self.attempts),
            Jitter::FullJitter => {
                let v = expo(self.base_ms, self.cap_ms, self.attempts);
                thread_rng().gen_range(0..v)
            }
            Jitter::EqualJitter => {
                let v = expo(self.base_ms, self.cap_ms, self.attempts);
                let half = v / 2;
                half + thread_rng().gen_range(0..half)
            }
            Jitter::DecorrJitter => {
                let upper_exclusive = self
                    .last_sleep_ms
                    .saturating_mul(3)
                    .saturating_sub(self.base_ms)
                    .max(1);
                let v = self.base_ms + thread_rng().gen_range(0..upper_exclusive);
                v.min(self.cap_ms)
            }
        };

        self.attempts = self.attempts.saturating_add(1);
        self.last_sleep_ms = sleep_ms;
        max_sleep_ms.map_or(sleep_ms, |max| sleep_ms.min(max))
    }
}

fn expo(base_ms: u64, cap_ms: u64, attempts: u32) -> u64 {
    let mul = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    base_ms.saturating_mul(mul).min(cap_ms)
}

#[derive(Debug)]
struct BackoffContextInner {
    parent: Option<Arc<BackoffContextInner>>,
    canceled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
}

impl BackoffContextInner {
    fn new(parent: Option<Arc<BackoffContextInner>>, deadline: Option<Instant>) -> Arc<Self> {
        Arc::new(BackoffContextInner {
            parent,
            canceled: AtomicBool::new(false),
            notify: Notify::new(),
            deadline,
        })
    }
}

/// A cancellation and deadline scope.
///
/// Contexts form a tree: a context derived with [`with_cancel`](Self::with_cancel) or
/// [`with_timeout`](Self::with_timeout) stops when its parent stops, but canceling it leaves the
/// parent running.
#[derive(Debug, Clone)]
pub struct BackoffContext {
    inner: Arc<BackoffContextInner>,
}

impl BackoffContext {
    /// A root context that is never canceled and has no deadline.
    pub fn background() -> Self {
        BackoffContext {
            inner: BackoffContextInner::new(None, None),
        }
    }

    /// A cancelable root context.
    pub fn new() -> (Self, BackoffCancel) {
        Self::with_inner(BackoffContextInner::new(None, None))
    }

    /// Derive a child that can be canceled on its own.
    pub fn with_cancel(&self) -> (Self, BackoffCancel) {
        Self::with_inner(BackoffContextInner::new(
            Some(self.inner.clone()),
            self.inner.deadline,
        ))
    }

    /// Derive a child that stops at `deadline` at the latest.
    pub fn with_deadline(&self, deadline: Instant) -> (Self, BackoffCancel) {
        let deadline = match self.inner.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self::with_inner(BackoffContextInner::new(
            Some(self.inner.clone()),
            Some(deadline),
        ))
    }

    /// Derive a child that stops after `timeout` at the latest.
    pub fn with_timeout(&self, timeout: Duration) -> (Self, BackoffCancel) {
        self.with_deadline(Instant::now() + timeout)
    }

    fn with_inner(inner: Arc<BackoffContextInner>) -> (Self, BackoffCancel) {
        (
            BackoffContext {
                inner: inner.clone(),
            },
            BackoffCancel { inner },
        )
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Why the context stopped, or `None` while it is still live.
    ///
    /// An explicit cancel anywhere up the chain wins over an expired deadline.
    pub fn cause(&self) -> Option<CancelCause> {
        let mut cursor = Some(&self.inner);
        while let Some(inner) = cursor {
            if inner.canceled.load(Ordering::SeqCst) {
                return Some(CancelCause::Canceled);
            }
            cursor = inner.parent.as_ref();
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cause().is_some()
    }

    /// Resolves once the context (or any ancestor) is canceled, or its deadline passes.
    pub async fn canceled(&self) -> CancelCause {
        let mut chain = Vec::new();
        let mut cursor = Some(self.inner.clone());
        while let Some(inner) = cursor {
            cursor = inner.parent.clone();
            chain.push(inner);
        }

        loop {
            let mut waiters: Vec<_> = chain
                .iter()
                .map(|inner| Box::pin(inner.notify.notified()))
                .collect();
            // Register before checking the flags so a concurrent cancel is not missed.
            for waiter in &mut waiters {
                waiter.as_mut().enable();
            }
            if let Some(cause) = self.cause() {
                return cause;
            }
            match self.inner.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = select_all(waiters) => {}
                        _ = tokio::time::sleep_until(deadline) => return CancelCause::DeadlineExceeded,
                    }
                }
                None => {
                    select_all(waiters).await;
                }
            }
        }
    }
}

/// Cancels the [`BackoffContext`] it was created with.
#[derive(Debug, Clone)]
pub struct BackoffCancel {
    inner: Arc<BackoffContextInner>,
}

impl BackoffCancel {
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

/// A backoff budget with a total sleep cap and an "excluded sleep" bucket.
#[derive(Debug)]
pub struct Backoffer {
    ctx: BackoffContext,
    max_sleep_ms: u64,
    total_sleep_ms: u64,
    excluded_sleep_ms: u64,

    errors: Vec<String>,
    configs: Vec<BackoffConfig>,
    backoff_sleep_ms: HashMap<&'static str, u64>,
    backoff_times: HashMap<&'static str, u64>,

    // Attempt counters. Reset on clone and fork.
    fns: HashMap<&'static str, BackoffFnState>,
}

impl Clone for Backoffer {
    fn clone(&self) -> Self {
        self.clone_with_ctx(self.ctx.clone())
    }
}

impl Backoffer {
    /// A backoffer bound to `ctx` that gives up once `max_sleep_ms` of sleep would be exceeded.
    /// A budget of `0` means unbounded.
    pub fn new(ctx: BackoffContext, max_sleep_ms: u64) -> Self {
        Self {
            ctx,
            max_sleep_ms,
            total_sleep_ms: 0,
            excluded_sleep_ms: 0,
            errors: Vec::new(),
            configs: Vec::new(),
            backoff_sleep_ms: HashMap::new(),
            backoff_times: HashMap::new(),
            fns: HashMap::new(),
        }
    }

    fn clone_with_ctx(&self, ctx: BackoffContext) -> Self {
        Self {
            ctx,
            max_sleep_ms: self.max_sleep_ms,
            total_sleep_ms: self.total_sleep_ms,
            excluded_sleep_ms: self.excluded_sleep_ms,
            errors: self.errors.clone(),
            configs: self.configs.clone(),
            backoff_sleep_ms: self.backoff_sleep_ms.clone(),
            backoff_times: self.backoff_times.clone(),
            fns: HashMap::new(),
        }
    }

    /// A child with the same budget bookkeeping and its own cancellation scope.
    ///
    /// The child does not observe the parent's cancellation or deadline, and canceling the child
    /// leaves the parent untouched.
    pub fn fork(&self) -> (Self, BackoffCancel) {
        let (ctx, cancel) = BackoffContext::new();
        (self.clone_with_ctx(ctx), cancel)
    }

    pub fn context(&self) -> &BackoffContext {
        &self.ctx
    }

    pub fn total_sleep_ms(&self) -> u64 {
        self.total_sleep_ms
    }

    pub fn max_sleep_ms(&self) -> u64 {
        self.max_sleep_ms
    }

    pub(crate) fn check_canceled(&self) -> Result<(), BackofferError> {
        match self.ctx.cause() {
            Some(cause) => Err(BackofferError::Canceled { cause }),
            None => Ok(()),
        }
    }

    pub(crate) fn longest_sleep_cfg(&self) -> Option<(BackoffConfig, u64)> {
        let mut candidate = None::<(&'static str, u64)>;
        for (&name, &sleep_ms) in &self.backoff_sleep_ms {
            if name == BO_TIKV_SERVER_BUSY.name {
                continue;
            }
            if candidate.map_or(true, |(_, best)| sleep_ms > best) {
                candidate = Some((name, sleep_ms));
            }
        }

        let (candidate_name, sleep_ms) = candidate?;
        let cfg = self
            .configs
            .iter()
            .copied()
            .find(|cfg| cfg.name == candidate_name)?;
        Some((cfg, sleep_ms))
    }

    /// Sleep according to `cfg`'s schedule, or fail if the budget would be exceeded or the
    /// context stops first.
    pub(crate) async fn backoff(
        &mut self,
        cfg: &BackoffConfig,
        err_message: impl Into<String>,
    ) -> Result<(), BackofferError> {
        self.backoff_with_cfg_and_max_sleep(cfg, None, err_message.into())
            .await
    }

    /// Like [`backoff`](Self::backoff), but a single sleep never exceeds `max_sleep_ms`.
    ///
    /// Used to wait out the remaining TTL of a lock.
    pub(crate) async fn backoff_with_max_sleep(
        &mut self,
        cfg: &BackoffConfig,
        max_sleep_ms: u64,
        err_message: impl Into<String>,
    ) -> Result<(), BackofferError> {
        self.backoff_with_cfg_and_max_sleep(cfg, Some(max_sleep_ms), err_message.into())
            .await
    }

    async fn backoff_with_cfg_and_max_sleep(
        &mut self,
        cfg: &BackoffConfig,
        max_sleep_ms: Option<u64>,
        err_message: String,
    ) -> Result<(), BackofferError> {
        self.check_canceled()?;

        let state = self.fns.entry(cfg.name).or_insert_with(|| {
            BackoffFnState::new(cfg.fn_cfg.base_ms, cfg.fn_cfg.cap_ms, cfg.fn_cfg.jitter)
        });
        let sleep_ms = state.backoff_ms(max_sleep_ms);

        let exceeded = if cfg.is_excluded() {
            self.excluded_sleep_ms.saturating_add(sleep_ms)
                > TIKV_SERVER_BUSY_EXCLUDED_MAX_MS.max(self.max_sleep_ms)
        } else {
            self.max_sleep_ms > 0
                && (self.total_sleep_ms - self.excluded_sleep_ms).saturating_add(sleep_ms)
                    > self.max_sleep_ms
        };
        if exceeded {
            let kind = self
                .longest_sleep_cfg()
                .map_or(cfg.err_kind, |(cfg, _)| cfg.err_kind);
            debug!(
                "backoff budget exhausted, kind: {}, total sleep: {}ms, max: {}ms, errors: {:?}",
                kind, self.total_sleep_ms, self.max_sleep_ms, self.errors
            );
            return Err(BackofferError::MaxSleepExceeded {
                kind,
                message: err_message,
            });
        }

        debug!(
            "backoff {} for {}ms, total sleep: {}ms: {}",
            cfg.name, sleep_ms, self.total_sleep_ms, err_message
        );
        self.errors.push(err_message);
        self.configs.push(*cfg);

        let sleep = Duration::from_millis(sleep_ms);
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            cause = self.ctx.canceled() => return Err(BackofferError::Canceled { cause }),
        }
        stats::observe_backoff_sleep(cfg.name, sleep);

        self.total_sleep_ms += sleep_ms;
        if cfg.is_excluded() {
            self.excluded_sleep_ms += sleep_ms;
        }
        *self.backoff_sleep_ms.entry(cfg.name).or_default() += sleep_ms;
        *self.backoff_times.entry(cfg.name).or_default() += 1;

        Ok(())
    }
}
