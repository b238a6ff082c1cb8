use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::time::Duration;

/// Per-key exponential backoff for failed reconciliations.
///
/// Each failure for a key doubles its delay up to `max`; a successful
/// reconciliation resets the key.
#[derive(Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5 * 60))
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure for `key` and returns how long to wait before
    /// retrying it.
    pub fn next(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock();
        let n = attempts.entry(key.to_string()).or_default();
        let delay = self
            .min
            .checked_mul(1u32.checked_shl(*n).unwrap_or(u32::MAX))
            .unwrap_or(self.max)
            .min(self.max);
        *n = n.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        self.attempts.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_ceiling() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays = (0..6).map(|_| backoff.next("n1")).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 10, 10]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn keys_are_independent_and_resettable() {
        let backoff = Backoff::default();
        backoff.next("n1");
        backoff.next("n1");
        assert_eq!(backoff.next("n2"), Duration::from_secs(1));
        assert_eq!(backoff.next("n1"), Duration::from_secs(4));

        backoff.reset("n1");
        assert_eq!(backoff.next("n1"), Duration::from_secs(1));
    }

    #[test]
    fn many_failures_do_not_overflow() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            assert!(backoff.next("n1") <= Duration::from_secs(300));
        }
    }
}
