//! Monotonic wall-clock millisecond source used for stream deadlines and a
//! wall-clock second source used for store expiry.

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of "now", split into the two granularities the rest of the
/// engine actually needs: milliseconds for stream pacing deadlines, seconds
/// for message expiry (the original reference keeps these as `int64_t`
/// epoch millis and `time_t` seconds respectively).
pub trait Clock: Send {
    fn now_millis(&self) -> i64;

    fn now_secs(&self) -> i64 {
        self.now_millis() / 1000
    }
}

/// The real wall clock, backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }
}
