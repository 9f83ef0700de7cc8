use std::time::Duration;

/// Exponential backoff: `initial`, `2 * initial`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(initial_ms), Duration::from_millis(max_ms))
    }

    /// Delay to wait before the next attempt; doubles on every call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .map_or(self.max, |d| d.min(self.max));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
