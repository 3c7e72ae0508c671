use std::time::{Duration, Instant, SystemTime};

/// Utility for keeping track of the time it took to perform some operation.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    /// wall-clock time the timer was last reset (for reports)
    started_at: SystemTime,
    /// monotonic counterpart of `started_at` (for durations)
    start: Instant,
}

impl Timer {
    /// Create a new `Timer`.
    pub fn now() -> Self {
        Self {
            started_at: SystemTime::now(),
            start: Instant::now(),
        }
    }

    /// Reset internal timer to now.
    pub fn reset(&mut self) {
        *self = Self::now();
    }

    /// Wall-clock time at which the timer was started.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Time elapsed since the timer was last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log a message with the elapsed time since the timer was last reset.
    pub fn print_elapsed(&self, task: &str) {
        eprintln!("{} took {:?}", task, self.elapsed());
    }
}
