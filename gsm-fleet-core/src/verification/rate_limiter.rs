use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::traits::clock::Clock;

/// Per-phone send limiter.
///
/// A send is refused when the previous one to the same phone is younger than
/// `min_interval`, or when `max_sends` already happened inside the rolling
/// `window`. All state sits behind one lock and every operation touches a
/// single phone's history.
pub struct RateLimiter {
    min_interval: chrono::Duration,
    window: chrono::Duration,
    max_sends: usize,
    clock: Arc<dyn Clock>,
    history: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, window: Duration, max_sends: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval: to_chrono(min_interval),
            window: to_chrono(window),
            max_sends,
            clock,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record a send to `phone`, or return how long until one is allowed.
    pub fn try_acquire(&self, phone: &str) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut history = self.history.lock();
        let sends = history.entry(phone.to_string()).or_default();

        while sends.front().is_some_and(|&t| now - t >= self.window) {
            sends.pop_front();
        }

        if let Some(&last) = sends.back() {
            let since = now - last;
            if since < self.min_interval {
                return Err(to_std(self.min_interval - since));
            }
        }
        if sends.len() >= self.max_sends {
            let oldest = sends.front().copied().unwrap_or(now);
            return Err(to_std(oldest + self.window - now));
        }

        sends.push_back(now);
        Ok(())
    }

    /// Undo the most recent acquisition for `phone` (delivery failed).
    pub fn release(&self, phone: &str) {
        let mut history = self.history.lock();
        if let Some(sends) = history.get_mut(phone) {
            sends.pop_back();
            if sends.is_empty() {
                history.remove(phone);
            }
        }
    }

    /// Drop phones whose whole history left the window.
    pub fn prune(&self) {
        let now = self.clock.now();
        let window = self.window;
        self.history
            .lock()
            .retain(|_, sends| sends.back().is_some_and(|&t| now - t < window));
    }

    pub fn tracked_phones(&self) -> usize {
        self.history.lock().len()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn to_std(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::clock::manual::ManualClock;

    fn limiter(clock: &Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
            3,
            Arc::clone(clock) as Arc<dyn Clock>,
        )
    }

    #[test]
    fn enforces_minimum_interval() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);

        assert!(limiter.try_acquire("+998901234567").is_ok());
        clock.advance_secs(20);
        assert_eq!(
            limiter.try_acquire("+998901234567"),
            Err(Duration::from_secs(40))
        );
        clock.advance_secs(40);
        assert!(limiter.try_acquire("+998901234567").is_ok());
    }

    #[test]
    fn blocks_fourth_send_in_window() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);

        for _ in 0..3 {
            assert!(limiter.try_acquire("+998901234567").is_ok());
            clock.advance_secs(61);
        }
        // first send was 183s ago; it leaves the window in 117s
        assert_eq!(
            limiter.try_acquire("+998901234567"),
            Err(Duration::from_secs(117))
        );
        clock.advance_secs(117);
        assert!(limiter.try_acquire("+998901234567").is_ok());
    }

    #[test]
    fn phones_are_independent() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);

        assert!(limiter.try_acquire("+998901234567").is_ok());
        assert!(limiter.try_acquire("+998907654321").is_ok());
        assert!(limiter.try_acquire("+998901234567").is_err());
    }

    #[test]
    fn release_undoes_last_send() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);

        assert!(limiter.try_acquire("+998901234567").is_ok());
        limiter.release("+998901234567");
        assert!(limiter.try_acquire("+998901234567").is_ok());
    }

    #[test]
    fn prune_forgets_idle_phones() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);

        limiter.try_acquire("+998901234567").unwrap();
        clock.advance_secs(301);
        limiter.prune();
        assert_eq!(limiter.tracked_phones(), 0);
    }
}
