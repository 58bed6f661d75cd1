//! Phase Timer - Timing Utilities
//!
//! High-precision timer for relocation phases.

use std::time::{Duration, Instant};

/// PhaseTimer - measures one relocation phase
pub struct PhaseTimer {
    start: Instant,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped timer, reports its duration on drop
pub struct ScopedTimer<'a> {
    start: Instant,
    callback: Box<dyn FnMut(Duration) + 'a>,
}

impl<'a> ScopedTimer<'a> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(Duration) + 'a,
    {
        Self {
            start: Instant::now(),
            callback: Box::new(callback),
        }
    }
}

impl<'a> Drop for ScopedTimer<'a> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        (self.callback)(duration);
    }
}
