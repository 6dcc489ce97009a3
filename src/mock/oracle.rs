// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! Local timestamp oracle: wall-clock milliseconds plus a logical counter within the same
//! millisecond, so every timestamp is unique and increasing.

use std::sync::Mutex;
use std::time::SystemTime;

use crate::timestamp::compose_ts;
use crate::timestamp::extract_logical;
use crate::timestamp::extract_physical;
use crate::timestamp::time_to_ts;
use crate::Result;

#[derive(Default)]
pub(crate) struct LocalOracle {
    last_ts: Mutex<u64>,
}

impl LocalOracle {
    pub(crate) fn get_timestamp(&self) -> Result<u64> {
        let now = time_to_ts(SystemTime::now())?;
        let mut last = match self.last_ts.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        let ts = if now > *last {
            now
        } else {
            // Same millisecond, or the clock stepped back.
            compose_ts(extract_physical(*last), extract_logical(*last) + 1)?
        };
        *last = ts;
        Ok(ts)
    }
}
