use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

/// Caps task starts per rolling minute
#[derive(Debug)]
pub(crate) struct ThroughputLimiter {
    max_per_minute: Option<usize>,
    starts: VecDeque<Instant>,
}

impl ThroughputLimiter {
    pub(crate) fn new(max_per_minute: Option<usize>) -> Self {
        Self {
            max_per_minute,
            starts: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.starts.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether another task may start at `now`
    pub(crate) fn allows(&mut self, now: Instant) -> bool {
        let Some(max) = self.max_per_minute else {
            return true;
        };
        self.evict(now);
        self.starts.len() < max
    }

    pub(crate) fn record(&mut self, now: Instant) {
        if self.max_per_minute.is_some() {
            self.starts.push_back(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_always_allows() {
        let mut limiter = ThroughputLimiter::new(None);
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.allows(now));
            limiter.record(now);
        }
    }

    #[test]
    fn test_window_rolls_over() {
        let mut limiter = ThroughputLimiter::new(Some(2));
        let start = Instant::now();

        limiter.record(start);
        limiter.record(start + Duration::from_secs(10));
        assert!(!limiter.allows(start + Duration::from_secs(30)));

        // the first start leaves the window
        assert!(limiter.allows(start + Duration::from_secs(60)));
        limiter.record(start + Duration::from_secs(60));
        assert!(!limiter.allows(start + Duration::from_secs(65)));
        assert!(limiter.allows(start + Duration::from_secs(70)));
    }
}
