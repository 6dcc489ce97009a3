// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

mod client;

pub use self::client::PdClient;
