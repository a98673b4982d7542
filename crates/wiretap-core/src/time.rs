//! Wall-clock helpers shared by plugins that stamp or schedule on nanosecond
//! timestamps (spec.md §4.1, §4.6).

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as nanoseconds since the Unix epoch, the unit every `meta`
/// timestamp field uses on the wire.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_nanos() as i64
}
