//! Forwarding - Per-Page Relocation State
//!
//! One `Forwarding` exists for every page selected for relocation in a cycle.
//! It owns the page's forwarding table and pins the page while threads copy
//! objects out of it.
//!
//! State machine:
//! ```text
//! Created ──claim()──▶ Claimed ──▶ Relocating ──mark_done()──▶ Done
//!                         │
//!                         └── in_place_relocation_claim_page() ──▶ InPlace
//! ```
//!
//! # Reference count
//!
//! ```text
//!   n > 0   page retained by n threads (the relocating worker holds one)
//!   0       page released, detach_page() may return it to the heap
//!   n < 0   claimed for in-place relocation, |n| - 1 threads still draining
//! ```
//!
//! Retainers that find a negative count park in the relocate queue until the
//! forwarding is done. Every transition that can unblock a waiter notifies
//! the forwarding's monitor.

use super::forwarding_table::{ForwardingCursor, ForwardingTable};
use super::queue::RelocateQueue;
use crate::fatal;
use crate::heap::{Page, PageAge};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Forwarding - relocation state of one from-page
pub struct Forwarding {
    table: ForwardingTable,

    page: Arc<Page>,

    from_age: PageAge,

    to_age: PageAge,

    /// Set by the single thread that relocates this page
    claimed: AtomicBool,

    /// Monitor for ref count transitions and `done`
    ref_lock: Mutex<()>,
    ref_cond: Condvar,

    ref_count: AtomicI32,

    done: AtomicBool,

    in_place: AtomicBool,

    /// Heap offset of the first object compacted in place
    in_place_watermark: AtomicUsize,

    /// Page top when in-place relocation started
    in_place_top_at_start: AtomicUsize,

    in_place_thread: Mutex<Option<ThreadId>>,
}

impl Forwarding {
    /// Create a forwarding with its own table, sized for the page's live objects
    pub fn new(page: Arc<Page>, to_age: PageAge) -> Self {
        let table = ForwardingTable::new(ForwardingTable::nentries_for(page.live_objects()));
        Self::with_table(page, to_age, table)
    }

    /// Create a forwarding over a prepared table
    pub fn with_table(page: Arc<Page>, to_age: PageAge, table: ForwardingTable) -> Self {
        let from_age = page.age();

        Self {
            table,
            page,
            from_age,
            to_age,
            claimed: AtomicBool::new(false),
            ref_lock: Mutex::new(()),
            ref_cond: Condvar::new(),
            ref_count: AtomicI32::new(1),
            done: AtomicBool::new(false),
            in_place: AtomicBool::new(false),
            in_place_watermark: AtomicUsize::new(0),
            in_place_top_at_start: AtomicUsize::new(0),
            in_place_thread: Mutex::new(None),
        }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn table(&self) -> &ForwardingTable {
        &self.table
    }

    pub fn start(&self) -> usize {
        self.page.start()
    }

    pub fn size(&self) -> usize {
        self.page.size()
    }

    pub fn from_age(&self) -> PageAge {
        self.from_age
    }

    pub fn to_age(&self) -> PageAge {
        self.to_age
    }

    /// Objects move from a young page into the old generation
    pub fn is_promotion(&self) -> bool {
        !self.from_age.is_old() && self.to_age.is_old()
    }

    /// Claim the right to relocate this page; exactly one caller wins
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    fn notify_all(&self) {
        let _guard = self.ref_lock.lock();
        self.ref_cond.notify_all();
    }

    /// Pin the page for copying
    ///
    /// Returns false once the page has been released or is done. If the page
    /// is being relocated in place, the caller is parked on `queue` until the
    /// relocation is done, and false is returned.
    pub fn retain_page(self: &Arc<Self>, queue: &RelocateQueue) -> bool {
        loop {
            if self.is_done() {
                return false;
            }

            let ref_count = self.ref_count.load(Ordering::Acquire);

            if ref_count == 0 {
                return false;
            }

            if ref_count < 0 {
                queue.add_and_wait(self);
                return false;
            }

            if self
                .ref_count
                .compare_exchange(ref_count, ref_count + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Drop one pin taken by `retain_page` (or the worker's initial pin)
    pub fn release_page(&self) {
        loop {
            let ref_count = self.ref_count.load(Ordering::Acquire);

            if ref_count == 0 {
                fatal!(
                    "release of page {:#x} with ref count 0 (double release)",
                    self.page.start()
                );
            }

            if ref_count > 0 {
                if self
                    .ref_count
                    .compare_exchange(ref_count, ref_count - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }

                if ref_count == 1 {
                    self.notify_all();
                }
            } else {
                if self
                    .ref_count
                    .compare_exchange(ref_count, ref_count + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }

                // -2 -> -1 unblocks the in-place claimer, -1 -> 0 the detacher
                if ref_count == -2 || ref_count == -1 {
                    self.notify_all();
                }
            }

            return;
        }
    }

    /// Wait for every pin to be released and hand out the page
    pub fn detach_page(&self) -> Arc<Page> {
        if self.ref_count.load(Ordering::Acquire) != 0 {
            let mut guard = self.ref_lock.lock();
            while self.ref_count.load(Ordering::Acquire) != 0 {
                self.ref_cond.wait(&mut guard);
            }
        }

        Arc::clone(&self.page)
    }

    /// Block new retainers and wait until only the caller holds the page
    ///
    /// Must be called by the thread that claimed the forwarding, while it
    /// still holds its own pin.
    pub fn in_place_relocation_claim_page(&self) {
        loop {
            let ref_count = self.ref_count.load(Ordering::Acquire);

            if ref_count <= 0 {
                fatal!(
                    "in-place claim of page {:#x} with ref count {}",
                    self.page.start(),
                    ref_count
                );
            }

            if self
                .ref_count
                .compare_exchange(ref_count, -ref_count, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            if ref_count != 1 {
                let mut guard = self.ref_lock.lock();
                while self.ref_count.load(Ordering::Acquire) != -1 {
                    self.ref_cond.wait(&mut guard);
                }
            }

            return;
        }
    }

    /// Start compacting the page into itself
    ///
    /// `watermark` is the heap offset of the first object that is relocated
    /// in place; objects below it were already copied to other pages.
    pub fn in_place_relocation_start(&self, watermark: usize) {
        self.in_place_top_at_start
            .store(self.page.top(), Ordering::Relaxed);
        self.in_place_watermark.store(watermark, Ordering::Relaxed);
        *self.in_place_thread.lock() = Some(thread::current().id());
        self.in_place.store(true, Ordering::Release);

        log::debug!(
            "In-place relocation start: page {:#x}, watermark {:#x}",
            self.page.start(),
            watermark
        );
    }

    pub fn in_place_relocation_finish(&self) {
        if !self.in_place() {
            fatal!(
                "in-place finish on page {:#x} that is not relocating in place",
                self.page.start()
            );
        }

        *self.in_place_thread.lock() = None;

        log::debug!(
            "In-place relocation finish: page {:#x}, top at start {:#x}, new top {:#x}",
            self.page.start(),
            self.in_place_top_at_start.load(Ordering::Relaxed),
            self.page.top()
        );
    }

    pub fn in_place(&self) -> bool {
        self.in_place.load(Ordering::Acquire)
    }

    pub fn in_place_watermark(&self) -> usize {
        self.in_place_watermark.load(Ordering::Relaxed)
    }

    pub fn in_place_top_at_start(&self) -> usize {
        self.in_place_top_at_start.load(Ordering::Relaxed)
    }

    /// The current thread is compacting this page
    pub fn is_in_place_relocating_thread(&self) -> bool {
        *self.in_place_thread.lock() == Some(thread::current().id())
    }

    /// Publish completion; every insert happens before this
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Park until done or until `timeout` elapses; returns `is_done()`
    pub fn wait_done_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.ref_lock.lock();
        while !self.is_done() {
            if self.ref_cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_done()
    }

    /// To-address of an object, if it has been forwarded
    pub fn find(&self, from_addr: usize) -> Option<usize> {
        self.table.find(self.page.object_index(from_addr))
    }

    /// Record `from_addr -> to_addr`; returns the address that won
    pub fn insert(&self, from_addr: usize, to_addr: usize) -> usize {
        self.table.insert(self.page.object_index(from_addr), to_addr)
    }

    /// `find` that remembers where the search stopped
    pub fn find_with_cursor(&self, from_addr: usize) -> (Option<usize>, ForwardingCursor) {
        self.table.find_with_cursor(self.page.object_index(from_addr))
    }

    /// `insert` continuing from a cursor returned by `find_with_cursor`
    pub fn insert_at(&self, from_addr: usize, to_addr: usize, cursor: ForwardingCursor) -> usize {
        self.table
            .insert_at(self.page.object_index(from_addr), to_addr, cursor)
    }

    /// Live objects of the page in ascending address order
    pub fn live_objects(&self) -> Vec<(usize, usize)> {
        self.page.live_objects_sorted()
    }
}

impl fmt::Debug for Forwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarding")
            .field("page", &format_args!("{:#x}", self.page.start()))
            .field("ref_count", &self.ref_count())
            .field("claimed", &self.is_claimed())
            .field("in_place", &self.in_place())
            .field("done", &self.is_done())
            .finish()
    }
}
