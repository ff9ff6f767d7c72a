use std::time::Duration;

/// Exponential reconnect delay: starts at `min`, doubles per attempt, holds at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: None,
            attempt: 0,
        }
    }

    /// Advance and return `(attempt, delay)` for the next reconnect.
    pub fn next_delay(&mut self) -> (u32, Duration) {
        let delay = match self.current {
            None => self.min,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        self.attempt = self.attempt.saturating_add(1);
        (self.attempt, delay)
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.attempt = 0;
    }
}
