use std::time::{Duration, Instant};

use rand::Rng;

/// Source of time and election deadlines for a node.
pub trait Timer: Send {
    fn now(&self) -> Instant;

    /// A fresh election deadline. Re-drawn on every reset.
    fn next(&mut self) -> Instant;
}

/// Election deadlines drawn uniformly from [now + 2×tick, now + 5×tick), so
/// nodes time out at different moments and split votes do not repeat.
pub struct RandomTimer {
    tick: Duration,
}

impl RandomTimer {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }
}

impl Timer for RandomTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn next(&mut self) -> Instant {
        let span = (self.tick * 3).as_micros() as u64;
        let jitter = rand::rng().random_range(0..span.max(1));
        Instant::now() + self.tick * 2 + Duration::from_micros(jitter)
    }
}
