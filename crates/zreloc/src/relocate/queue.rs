//! Relocate Queue - Mutator Waiters and Worker Rendezvous
//!
//! Mutators that cannot relocate an object themselves (no target memory, or
//! the page is being compacted in place) hand the page's forwarding to the
//! workers through this queue and park until it is done.
//!
//! The same lock and condition variable implement a cooperative rendezvous:
//! `synchronize()` returns once every worker is parked in
//! `synchronize_poll()`, and `desynchronize()` lets them continue.
//!
//! Workers poll without locking: `needs_attention` is non-zero only while the
//! pending list is non-empty or a rendezvous is requested.

use super::forwarding::Forwarding;
use crate::fatal;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often a parked mutator reports that it is still waiting
const STALL_REPORT_INTERVAL: Duration = Duration::from_secs(1);

struct QueueState {
    /// Forwardings with parked mutators
    pending: Vec<Arc<Forwarding>>,

    nworkers: usize,

    /// Workers parked in `synchronize_poll`
    nsynchronized: usize,

    synchronize: bool,
}

/// RelocateQueue - pending forwardings plus worker synchronization
pub struct RelocateQueue {
    state: Mutex<QueueState>,

    cond: Condvar,

    /// One for a non-empty pending list, one for a synchronize request
    needs_attention: AtomicI32,

    /// Mutators that had to wait for a worker
    stalls: AtomicU64,
}

impl RelocateQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                nworkers: 0,
                nsynchronized: 0,
                synchronize: false,
            }),
            cond: Condvar::new(),
            needs_attention: AtomicI32::new(0),
            stalls: AtomicU64::new(0),
        }
    }

    fn needs_attention(&self) -> bool {
        self.needs_attention.load(Ordering::Acquire) != 0
    }

    fn inc_needs_attention(&self) {
        let needs = self.needs_attention.fetch_add(1, Ordering::AcqRel) + 1;
        if !(1..=2).contains(&needs) {
            fatal!("relocate queue needs_attention out of range: {}", needs);
        }
    }

    fn dec_needs_attention(&self) {
        let needs = self.needs_attention.fetch_sub(1, Ordering::AcqRel) - 1;
        if !(0..=1).contains(&needs) {
            fatal!("relocate queue needs_attention out of range: {}", needs);
        }
    }

    /// Register the workers of a relocation phase
    pub fn join(&self, nworkers: usize) {
        let mut state = self.state.lock();
        if state.nworkers != 0 {
            fatal!("relocate queue joined twice ({} workers active)", state.nworkers);
        }
        state.nworkers = nworkers;
    }

    /// A worker found no more work
    pub fn leave(&self) {
        let mut state = self.state.lock();

        if state.nworkers == 0 {
            fatal!("relocate queue left by more workers than joined");
        }
        state.nworkers -= 1;

        if self.prune(&mut state) {
            self.cond.notify_all();
        }

        if state.synchronize && state.nworkers == state.nsynchronized {
            // Remaining workers are all parked
            self.cond.notify_all();
        }
    }

    /// Hand `forwarding` to the workers and park until it is done
    pub fn add_and_wait(&self, forwarding: &Arc<Forwarding>) {
        {
            let mut state = self.state.lock();

            if forwarding.is_done() {
                return;
            }

            if !state.pending.iter().any(|f| Arc::ptr_eq(f, forwarding)) {
                state.pending.push(Arc::clone(forwarding));
                if state.pending.len() == 1 {
                    self.inc_needs_attention();
                }
            }

            self.cond.notify_all();
        }

        self.stalls.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "Relocation stall on page {:#x}",
            forwarding.page().start()
        );

        let start = Instant::now();
        while !forwarding.wait_done_for(STALL_REPORT_INTERVAL) {
            log::warn!(
                "Still waiting for page {:#x} after {:?}",
                forwarding.page().start(),
                start.elapsed()
            );
        }
    }

    /// Drop done forwardings; returns true if any were removed
    fn prune(&self, state: &mut QueueState) -> bool {
        if state.pending.is_empty() {
            return false;
        }

        let before = state.pending.len();
        state.pending.retain(|f| !f.is_done());
        let pruned = state.pending.len() != before;

        if state.pending.is_empty() {
            self.dec_needs_attention();
        }

        pruned
    }

    fn prune_and_claim(&self, state: &mut QueueState) -> Option<Arc<Forwarding>> {
        if self.prune(state) {
            self.cond.notify_all();
        }

        state
            .pending
            .iter()
            .find(|f| f.claim())
            .map(Arc::clone)
    }

    /// Worker-side poll
    ///
    /// Returns a claimed forwarding a mutator is waiting for, or parks the
    /// worker while a rendezvous is in progress. The fast path takes no
    /// lock.
    pub fn synchronize_poll(&self) -> Option<Arc<Forwarding>> {
        if !self.needs_attention() {
            return None;
        }

        let mut state = self.state.lock();

        if let Some(forwarding) = self.prune_and_claim(&mut state) {
            // Waiting mutators come before the rendezvous
            return Some(forwarding);
        }

        if !state.synchronize {
            return None;
        }

        state.nsynchronized += 1;
        if state.nsynchronized == state.nworkers {
            self.cond.notify_all();
        }

        let mut claimed = None;
        loop {
            self.cond.wait(&mut state);

            if let Some(forwarding) = self.prune_and_claim(&mut state) {
                claimed = Some(forwarding);
                break;
            }

            if !state.synchronize {
                break;
            }
        }

        state.nsynchronized -= 1;
        claimed
    }

    /// Wait until every worker is parked in `synchronize_poll`
    pub fn synchronize(&self) {
        let mut state = self.state.lock();

        state.synchronize = true;
        self.inc_needs_attention();

        while state.nworkers != state.nsynchronized {
            self.cond.wait(&mut state);
        }

        log::debug!("Relocation workers synchronized ({})", state.nworkers);
    }

    /// Release workers parked by `synchronize`
    pub fn desynchronize(&self) {
        let mut state = self.state.lock();

        state.synchronize = false;
        self.dec_needs_attention();

        self.cond.notify_all();
    }

    /// Every joined worker is parked
    pub fn is_synchronized(&self) -> bool {
        let state = self.state.lock();
        state.synchronize && state.nworkers == state.nsynchronized
    }

    /// Forget the pending list after all workers left
    pub fn clear(&self) {
        let mut state = self.state.lock();

        if state.nworkers != 0 {
            fatal!("relocate queue cleared with {} workers active", state.nworkers);
        }

        if state.pending.is_empty() {
            return;
        }

        if let Some(f) = state.pending.iter().find(|f| !f.is_done()) {
            fatal!(
                "relocate queue cleared with page {:#x} still relocating",
                f.page().start()
            );
        }

        state.pending.clear();
        self.dec_needs_attention();
    }

    /// Forwardings with parked mutators
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn nworkers(&self) -> usize {
        self.state.lock().nworkers
    }

    /// Total mutator stalls since creation
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }
}

impl Default for RelocateQueue {
    fn default() -> Self {
        Self::new()
    }
}
