//! Liveness tracking for the registry's scheduler.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Timestamp of the most recent scheduler beat.
#[derive(Debug)]
pub struct Heartbeat {
    last_beat_ms: AtomicI64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    /// A fresh heartbeat counts as a beat at creation time.
    pub fn new() -> Self {
        Self {
            last_beat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn beat(&self) {
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since the last beat.
    pub fn age(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.last_beat_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() <= max_age
    }

    #[cfg(test)]
    pub(crate) fn set_age(&self, age: Duration) {
        let at = Utc::now().timestamp_millis() - age.as_millis() as i64;
        self.last_beat_ms.store(at, Ordering::Relaxed);
    }
}
