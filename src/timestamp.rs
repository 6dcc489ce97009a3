//! Transaction timestamps issued by the timestamp oracle.
//!
//! The lower 18 (PHYSICAL_SHIFT_BITS) bits are the logical part of the timestamp.
//! The higher bits are the physical part, in milliseconds since the Unix epoch.
//! Lock TTLs are measured against the physical part.

use std::convert::TryInto;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::internal_err;
use crate::Result;

const PHYSICAL_SHIFT_BITS: u32 = 18;
const LOGICAL_MASK: i64 = (1_i64 << PHYSICAL_SHIFT_BITS) - 1;

/// Create a transaction timestamp from its physical and logical parts.
///
/// The encoding is `(physical_ms << 18) + logical`.
pub fn compose_ts(physical_ms: i64, logical: i64) -> Result<u64> {
    let ts: i128 = ((physical_ms as i128) << PHYSICAL_SHIFT_BITS) + (logical as i128);
    ts.try_into().map_err(|_| {
        internal_err!("invalid ts parts (physical_ms={physical_ms}, logical={logical})")
    })
}

/// Extract the physical part (milliseconds since Unix epoch) from a timestamp.
pub fn extract_physical(ts: u64) -> i64 {
    (ts >> PHYSICAL_SHIFT_BITS) as i64
}

/// Extract the logical part from a timestamp.
pub fn extract_logical(ts: u64) -> i64 {
    (ts as i64) & LOGICAL_MASK
}

/// Return the physical part (milliseconds since Unix epoch) of the given time.
pub fn get_physical(t: SystemTime) -> Result<i64> {
    let millis = t
        .duration_since(UNIX_EPOCH)
        .map_err(|_| internal_err!("time is before the Unix epoch"))?
        .as_millis();
    millis
        .try_into()
        .map_err(|_| internal_err!("overflow converting SystemTime to milliseconds"))
}

/// Convert a `SystemTime` to a timestamp with a zero logical part.
pub fn time_to_ts(t: SystemTime) -> Result<u64> {
    compose_ts(get_physical(t)?, 0)
}

/// Milliseconds left before a lock started at `lock_ts` with `ttl_ms` expires, as seen at
/// `current_ts`. Negative once expired.
///
/// Saturates instead of overflowing, so `0` and `u64::MAX` are valid inputs.
pub fn until_expired(lock_ts: u64, ttl_ms: u64, current_ts: u64) -> i64 {
    let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
    extract_physical(lock_ts)
        .saturating_add(ttl)
        .saturating_sub(extract_physical(current_ts))
}

/// Whether a lock started at `lock_ts` with `ttl_ms` has expired at `current_ts`.
pub fn is_expired(lock_ts: u64, ttl_ms: u64, current_ts: u64) -> bool {
    until_expired(lock_ts, ttl_ms, current_ts) <= 0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ts_parts_round_trip() {
        let physical_ms = 1_700_000_123_456_i64;
        let logical = 42_i64;
        let ts = compose_ts(physical_ms, logical).unwrap();
        assert_eq!(extract_physical(ts), physical_ms);
        assert_eq!(extract_logical(ts), logical);
    }

    #[test]
    fn system_time_has_ms_precision() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
        let ts = time_to_ts(t).unwrap();
        assert_eq!(extract_logical(ts), 0);
        assert_eq!(extract_physical(ts), 1_700_000_000_000);
    }

    #[test]
    fn compose_ts_rejects_negative_timestamps() {
        assert!(compose_ts(-1, 0).is_err());
    }

    #[test]
    fn until_expired_uses_physical_part() {
        let lock_ts = compose_ts(1_700_000_000_000, 7).unwrap();
        let now = compose_ts(1_700_000_000_010, 0).unwrap();
        assert_eq!(until_expired(lock_ts, 6, now), -4);
        assert_eq!(until_expired(lock_ts, 14, now), 4);
        assert!(is_expired(lock_ts, 5, now));
        assert!(!is_expired(lock_ts, 200, now));
    }

    #[test]
    fn until_expired_saturates_on_edge_timestamps() {
        assert!(until_expired(0, 3000, u64::MAX) < 0);
        assert!(until_expired(u64::MAX, u64::MAX, 0) > 0);
        assert!(is_expired(1, 0, u64::MAX));
    }
}
