//! Wall-clock helpers for the tick scheduler.

use std::time::{Duration, Instant};

/// Stopwatch used to bound per-tick work.
pub struct Timer {
    start_time: Option<Instant>,
    elapsed: Duration,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            start_time: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Create and immediately start a timer
    pub fn started() -> Timer {
        let mut timer = Timer::new();
        timer.start();
        timer
    }

    // Start or restart
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        self.elapsed = Duration::ZERO;
    }

    pub fn stop(&mut self) {
        if self.start_time.is_some() {
            self.elapsed = self.elapsed_duration();
            self.start_time = None;
        }
    }

    pub fn elapsed_duration(&self) -> Duration {
        match self.start_time {
            Some(start_time) => start_time.elapsed(),
            None => self.elapsed,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_duration().as_millis() as u64
    }

    pub fn elapsed_micro(&self) -> u128 {
        self.elapsed_duration().as_micros()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
