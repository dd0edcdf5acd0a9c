//! Wall-clock timestamps and jitter
//!
//! All loop timestamps are milliseconds since the Unix epoch. The clock is
//! wall-clock based, so adjusting the system time during a run distorts
//! deadlines.

use crate::rng::DetRng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Absolute timestamp in milliseconds.
pub type Ts = i64;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> Ts {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as Ts,
        // Clock set before 1970
        Err(e) => -(e.duration().as_millis() as Ts),
    }
}

/// Current wall-clock time in nanoseconds, used only to seed jitter.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Random offset in `[-j, j)` where `j = base_ms * pct / 100`.
///
/// Returns 0 when jitter is disabled or the window rounds down to nothing.
/// `j` is capped so that `2 * j` fits an `i64`.
pub fn jitter_offset(base_ms: i64, pct: u32, rng: &mut DetRng) -> i64 {
    if pct == 0 {
        return 0;
    }
    let wide = u128::from(base_ms.unsigned_abs()) * u128::from(pct) / 100;
    let j = i64::try_from(wide).unwrap_or(i64::MAX).min(i64::MAX / 2);
    if j == 0 {
        return 0;
    }
    rng.below((2 * j) as u64) as i64 - j
}
