// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! Routing of multi-key operations to regions.
//!
//! [`shard`] groups keys into per-region [`BatchKeys`](shard::BatchKeys); [`plan`] dispatches
//! them and re-routes whatever a region error bounced back.

pub(crate) mod plan;
pub(crate) mod shard;

pub use self::shard::BatchKeys;
