// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

mod client;
mod errors;
mod request;

use std::sync::Arc;

use derive_new::new;

pub use self::client::KvClient;
pub use self::errors::KeyError;
pub use self::errors::LockInfo;
pub use self::errors::RegionError;
pub use self::request::*;
use crate::pd::PdClient;
use crate::region_cache::RegionRouter;
use crate::Result;

/// What the store decided while checking a transaction's primary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    NoAction,
    /// The primary lock had expired and was rolled back by this check.
    TtlExpireRollback,
    /// Neither lock nor record existed; a rollback record was written.
    LockNotExistRollback,
    MinCommitTsPushed,
}

/// The collaborators every request path needs: routing, transport and the timestamp oracle.
#[derive(Clone, new)]
pub struct KvStore {
    pub router: Arc<dyn RegionRouter>,
    pub client: Arc<dyn KvClient>,
    pub pd: Arc<dyn PdClient>,
}

impl KvStore {
    pub async fn current_timestamp(&self) -> Result<u64> {
        self.pd.get_timestamp().await
    }
}
