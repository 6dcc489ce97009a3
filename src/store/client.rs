// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

use async_trait::async_trait;

use crate::store::KvRequest;
use crate::store::KvResponse;
use crate::Result;

/// The wire transport to storage nodes.
///
/// A returned `Err` is a network failure: the request may or may not have been applied. Region
/// and key errors travel inside the [`KvResponse`].
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    async fn send(&self, address: &str, req: KvRequest, timeout: Duration) -> Result<KvResponse>;
}
