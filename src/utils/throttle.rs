//! Log throttling for faults that repeat on every sampling tick
//!
//! Telemetry submissions and stats polls fire every few seconds. When the
//! collaborator behind them is down, the same warning would otherwise be
//! written on every tick for the rest of the lesson.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often a message with the same key is logged
///
/// # Example
///
/// ```rust
/// use classroom_rtc::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(30));
/// assert!(throttler.should_log("telemetry_submit"));
/// assert!(!throttler.should_log("telemetry_submit"));
/// ```
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` (and records the time) if `key` has not been logged
    /// within the throttle interval.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget `key` so the next failure after a recovery is logged immediately.
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(30)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("stats_poll"));
        assert!(!throttler.should_log("stats_poll"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("stats_poll"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("telemetry_submit"));
        assert!(throttler.should_log("stats_poll"));
        assert!(!throttler.should_log("telemetry_submit"));
    }

    #[test]
    fn test_clear_after_recovery() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("telemetry_submit"));
        throttler.clear("telemetry_submit");
        assert!(throttler.should_log("telemetry_submit"));
    }
}
