// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::time::Duration;

use async_recursion::async_recursion;
use async_trait::async_trait;
use futures::future::try_join_all;
use log::debug;

use crate::backoffer::Backoffer;
use crate::backoffer::BO_REGION_MISS;
use crate::backoffer::BO_TIKV_RPC;
use crate::backoffer::BO_TIKV_SERVER_BUSY;
use crate::backoffer::BO_UPDATE_LEADER;
use crate::region::Region;
use crate::request::shard::group_keys_by_region;
use crate::request::shard::split_by_size;
use crate::request::shard::BatchKeys;
use crate::stats;
use crate::store::Command;
use crate::store::KvRequest;
use crate::store::KvResponse;
use crate::store::KvStore;
use crate::store::RegionError;
use crate::store::ResponseBody;
use crate::Error;
use crate::Key;
use crate::Result;

/// The outcome of one batch: per-key items, plus keys that must be sent again.
#[derive(Debug)]
pub(crate) struct BatchResult<T> {
    pub items: Vec<T>,
    pub retry_keys: Vec<Key>,
}

impl<T> BatchResult<T> {
    pub fn done(items: Vec<T>) -> Self {
        BatchResult {
            items,
            retry_keys: Vec::new(),
        }
    }
}

/// One kind of multi-key request: how to build it for a batch and how to read its response.
#[async_trait]
pub(crate) trait BatchAction: Send + Sync + 'static {
    type Item: Send + 'static;

    fn build_request(&self, batch: &BatchKeys) -> Command;

    /// Bytes a key contributes to a batch, used when re-splitting retried keys.
    fn key_size(&self, key: &Key) -> usize {
        key.len()
    }

    /// Called right before `batch` goes on the wire.
    fn on_send(&self, _batch: &BatchKeys) {}

    /// Interpret a response. Per-key errors that are final belong in `items` or in the returned
    /// error; keys in `retry_keys` are grouped again and re-sent.
    async fn on_response(
        &self,
        bo: &mut Backoffer,
        batch: &BatchKeys,
        body: ResponseBody,
    ) -> Result<BatchResult<Self::Item>>;
}

/// Dispatches requests to regions and handles region-level failures.
#[derive(Clone)]
pub(crate) struct RegionBatcher {
    store: KvStore,
    batch_limit: u64,
}

impl RegionBatcher {
    pub fn new(store: KvStore, batch_limit: u64) -> Self {
        RegionBatcher { store, batch_limit }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub async fn group_by_region(
        &self,
        keys: impl IntoIterator<Item = Key>,
    ) -> Result<Vec<BatchKeys>> {
        group_keys_by_region(self.store.router.as_ref(), keys).await
    }

    /// Group `keys` by region and split the groups by size, putting `primary`'s batch first.
    pub async fn make_batches<A: BatchAction>(
        &self,
        action: &A,
        keys: impl IntoIterator<Item = Key>,
        primary: Option<&Key>,
    ) -> Result<Vec<BatchKeys>> {
        let groups = self.group_by_region(keys).await?;
        Ok(split_by_size(
            groups,
            self.batch_limit,
            |k| action.key_size(k),
            primary,
        ))
    }

    /// Send every batch concurrently and collect their items.
    ///
    /// Each batch retries on its own: a region error re-routes only the keys of that batch,
    /// and a failure of one batch fails the whole call.
    pub async fn send_batches<A: BatchAction>(
        &self,
        bo: &Backoffer,
        batches: Vec<BatchKeys>,
        action: &Arc<A>,
        timeout: Duration,
    ) -> Result<Vec<A::Item>> {
        let handles = batches
            .into_iter()
            .map(|batch| self.send_batch(bo.clone(), action.clone(), batch, timeout));
        let results = try_join_all(handles).await?;
        Ok(results.into_iter().flatten().collect())
    }

    #[async_recursion]
    async fn send_batch<A: BatchAction>(
        &self,
        mut bo: Backoffer,
        action: Arc<A>,
        batch: BatchKeys,
        timeout: Duration,
    ) -> Result<Vec<A::Item>> {
        // A batch that is never sent must not be reported as sent.
        bo.check_canceled()?;
        action.on_send(&batch);
        let command = action.build_request(&batch);
        let resp = self
            .send_request(&bo, &batch.region, command, timeout)
            .await;
        match resp {
            Ok(KvResponse::Body(body)) => {
                let BatchResult {
                    mut items,
                    retry_keys,
                } = action.on_response(&mut bo, &batch, body).await?;
                if !retry_keys.is_empty() {
                    items.extend(self.resend(&bo, action, retry_keys, timeout).await?);
                }
                Ok(items)
            }
            Ok(KvResponse::RegionError(e)) => {
                self.handle_region_error(&mut bo, &batch.region, e).await?;
                self.resend(&bo, action, batch.keys, timeout).await
            }
            Err(e @ Error::Transport { .. }) => {
                self.handle_transport_error(&mut bo, &batch.region, e)
                    .await?;
                self.resend(&bo, action, batch.keys, timeout).await
            }
            Err(e) => Err(e),
        }
    }

    async fn resend<A: BatchAction>(
        &self,
        bo: &Backoffer,
        action: Arc<A>,
        keys: Vec<Key>,
        timeout: Duration,
    ) -> Result<Vec<A::Item>> {
        let mut batches = self.make_batches(action.as_ref(), keys, None).await?;
        for batch in &mut batches {
            batch.txn_size = u64::MAX;
        }
        debug!("resending {} regrouped batches", batches.len());
        self.send_batches(bo, batches, &action, timeout).await
    }

    /// Send a request addressed to the key's current region, retrying until the region
    /// accepts it. Returns the region that answered.
    pub async fn send_to_key(
        &self,
        bo: &mut Backoffer,
        key: &Key,
        timeout: Duration,
        build: impl Fn(&Region) -> Command + Send,
    ) -> Result<(Region, ResponseBody)> {
        loop {
            let region = self.store.router.locate(key).await?;
            match self.send_request(bo, &region, build(&region), timeout).await {
                Ok(KvResponse::Body(body)) => return Ok((region, body)),
                Ok(KvResponse::RegionError(e)) => {
                    self.handle_region_error(bo, &region, e).await?
                }
                Err(e @ Error::Transport { .. }) => {
                    self.handle_transport_error(bo, &region, e).await?
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A single request, raced against the backoffer's cancellation.
    pub async fn send_request(
        &self,
        bo: &Backoffer,
        region: &Region,
        command: Command,
        timeout: Duration,
    ) -> Result<KvResponse> {
        bo.check_canceled()?;
        let stats = stats::request_stats(command.label());
        let req = KvRequest {
            region: region.ver_id(),
            command,
        };
        let resp = tokio::select! {
            resp = self.store.client.send(region.leader_addr(), req, timeout) => resp,
            cause = bo.context().canceled() => Err(Error::Canceled { cause }),
        };
        stats.done(resp)
    }

    async fn handle_transport_error(
        &self,
        bo: &mut Backoffer,
        region: &Region,
        e: Error,
    ) -> Result<()> {
        debug!("transport error on region {:?}: {}", region.ver_id, e);
        self.store.router.invalidate(&region.ver_id).await;
        bo.backoff(&BO_TIKV_RPC, e.to_string()).await?;
        Ok(())
    }

    /// Bring routing up to date after `e`, sleeping when the store needs time to recover.
    pub(crate) async fn handle_region_error(
        &self,
        bo: &mut Backoffer,
        region: &Region,
        e: RegionError,
    ) -> Result<()> {
        debug!("region error on region {:?}: {}", region.ver_id, e);
        let router = &self.store.router;
        match e {
            RegionError::NotLeader {
                leader: Some(ref leader),
                ..
            } => {
                router.update_leader(&region.ver_id, leader.clone()).await;
                bo.backoff(&BO_UPDATE_LEADER, e.to_string()).await?;
            }
            RegionError::NotLeader { leader: None, .. } => {
                router.invalidate(&region.ver_id).await;
                bo.backoff(&BO_REGION_MISS, e.to_string()).await?;
            }
            RegionError::EpochNotMatch { .. } => {
                router.invalidate(&region.ver_id).await;
            }
            RegionError::RegionNotFound { .. }
            | RegionError::KeyNotInRegion { .. }
            | RegionError::StaleCommand => {
                router.invalidate(&region.ver_id).await;
                bo.backoff(&BO_REGION_MISS, e.to_string()).await?;
            }
            RegionError::ServerIsBusy { .. } => {
                bo.backoff(&BO_TIKV_SERVER_BUSY, e.to_string()).await?;
            }
        }
        Ok(())
    }
}
