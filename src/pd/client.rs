// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;

use crate::region::Region;
use crate::Key;
use crate::Result;

/// The placement driver: region discovery plus the timestamp oracle.
///
/// Implementations must be safe to share across tasks; every transaction and the region cache
/// call into the same instance concurrently.
#[async_trait]
pub trait PdClient: Send + Sync + 'static {
    /// The region currently containing `key`, with its leader's address.
    async fn get_region(&self, key: &Key) -> Result<Region>;

    /// A fresh timestamp, strictly greater than every timestamp returned before.
    async fn get_timestamp(&self) -> Result<u64>;
}
