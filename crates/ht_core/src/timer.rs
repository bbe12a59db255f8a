//! Deadline timer used to bound retry loops.

use std::time::{Duration, Instant};

/// A started countdown with a fixed overall budget.
#[derive(Clone, Copy, Debug)]
pub struct Timer {
    start: Instant,
    duration: Duration,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        Self {
            start: Instant::now(),
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time left before the deadline; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.start.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}
