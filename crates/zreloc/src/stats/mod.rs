//! Stats Module - Relocation Counters
//!
//! Counters collected while a relocation set is evacuated:
//! - Pages relocated, and how many of them in place
//! - Objects and bytes copied by workers versus mutator barriers
//! - Lost copy races and mutator stalls
//! - Phase durations
//!
//! Counters are relaxed atomics; a [`RelocationSummary`] is a point-in-time
//! snapshot that can be serialized for reporting.

pub mod timer;

pub use timer::{PhaseTimer, ScopedTimer};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// RelocationStats - counters shared by workers and barriers
#[derive(Debug, Default)]
pub struct RelocationStats {
    pages_relocated: AtomicU64,
    pages_in_place: AtomicU64,
    pages_freed: AtomicU64,
    worker_objects: AtomicU64,
    worker_bytes: AtomicU64,
    mutator_objects: AtomicU64,
    mutator_bytes: AtomicU64,
    /// Copies discarded because another thread forwarded first
    lost_races: AtomicU64,
    /// Relocation phases run
    phases: AtomicU64,
    /// Accumulated phase time in microseconds
    phase_time_us: AtomicU64,
}

impl RelocationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_worker_copy(&self, bytes: usize) {
        self.worker_objects.fetch_add(1, Ordering::Relaxed);
        self.worker_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_mutator_copy(&self, bytes: usize) {
        self.mutator_objects.fetch_add(1, Ordering::Relaxed);
        self.mutator_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_lost_race(&self) {
        self.lost_races.fetch_add(1, Ordering::Relaxed);
    }

    /// One page finished; `freed` is false when it stays as a target page
    pub fn record_page(&self, in_place: bool, freed: bool) {
        self.pages_relocated.fetch_add(1, Ordering::Relaxed);
        if in_place {
            self.pages_in_place.fetch_add(1, Ordering::Relaxed);
        }
        if freed {
            self.pages_freed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_phase(&self, duration: Duration) {
        self.phases.fetch_add(1, Ordering::Relaxed);
        self.phase_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Snapshot of the counters; `stalls` comes from the relocate queue
    pub fn summary(&self, stalls: u64) -> RelocationSummary {
        RelocationSummary {
            pages_relocated: self.pages_relocated.load(Ordering::Relaxed),
            pages_in_place: self.pages_in_place.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
            worker_objects: self.worker_objects.load(Ordering::Relaxed),
            worker_bytes: self.worker_bytes.load(Ordering::Relaxed),
            mutator_objects: self.mutator_objects.load(Ordering::Relaxed),
            mutator_bytes: self.mutator_bytes.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            stalls,
            phases: self.phases.load(Ordering::Relaxed),
            phase_time_ms: self.phase_time_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    pub fn reset(&self) {
        self.pages_relocated.store(0, Ordering::Relaxed);
        self.pages_in_place.store(0, Ordering::Relaxed);
        self.pages_freed.store(0, Ordering::Relaxed);
        self.worker_objects.store(0, Ordering::Relaxed);
        self.worker_bytes.store(0, Ordering::Relaxed);
        self.mutator_objects.store(0, Ordering::Relaxed);
        self.mutator_bytes.store(0, Ordering::Relaxed);
        self.lost_races.store(0, Ordering::Relaxed);
        self.phases.store(0, Ordering::Relaxed);
        self.phase_time_us.store(0, Ordering::Relaxed);
    }
}

/// Summary statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelocationSummary {
    pub pages_relocated: u64,
    pub pages_in_place: u64,
    pub pages_freed: u64,
    pub worker_objects: u64,
    pub worker_bytes: u64,
    pub mutator_objects: u64,
    pub mutator_bytes: u64,
    pub lost_races: u64,
    pub stalls: u64,
    pub phases: u64,
    pub phase_time_ms: f64,
}

impl RelocationSummary {
    /// Objects copied by anyone
    pub fn objects_relocated(&self) -> u64 {
        self.worker_objects + self.mutator_objects
    }

    /// Bytes copied by anyone
    pub fn bytes_relocated(&self) -> u64 {
        self.worker_bytes + self.mutator_bytes
    }
}
