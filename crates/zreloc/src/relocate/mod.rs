//! Relocate Module - Concurrent Page Evacuation
//!
//! Evacuates the pages of an installed [`RelocationSet`] while mutators keep
//! running. Workers and mutator barriers race to copy objects; the forwarding
//! table of each page decides the winner.
//!
//! Relocation Strategy:
//! 1. Workers take forwardings from the set (or from the relocate queue, where
//!    stalled mutators wait) and claim them
//! 2. Live objects are copied in address order into target pages: a private
//!    target per worker for Small pages, a shared target for Medium pages
//! 3. When no target page can be allocated, the page is compacted into
//!    itself (in-place relocation) and becomes a target page afterwards
//! 4. The page is released, detached and freed, and the forwarding is marked
//!    done
//!
//! Barrier Slow Path:
//! A mutator that meets an object on a from-page calls
//! [`Relocate::relocate_object`]: look up the forwarding, otherwise pin the
//! page, copy the object itself and publish the copy. If it cannot allocate,
//! it waits in the relocate queue for a worker to finish the page.

pub mod forwarding;
pub mod forwarding_table;
pub mod queue;
pub mod selector;
pub mod set;

pub use forwarding::Forwarding;
pub use forwarding_table::{ForwardingCursor, ForwardingEntry, ForwardingTable};
pub use queue::RelocateQueue;
pub use selector::{
    GroupStats, RelocationSetSelector, RelocationSetSelectorGroup, SelectorStats, SizeClass,
};
pub use set::{RelocationSet, RelocationSetIterator};

use crate::fatal;
use crate::heap::{Heap, Page, PageAge, PageType};
use crate::logging::{log_event, RelocEvent};
use crate::stats::{PhaseTimer, RelocationStats, RelocationSummary, ScopedTimer};
use crate::workers::WorkerPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Target pages shared between threads, one per page type and age
struct SharedTargets {
    pages: Mutex<HashMap<(PageType, PageAge), Arc<Page>>>,
}

impl SharedTargets {
    fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate in the current target, replacing it when full
    fn alloc_object(&self, heap: &Heap, page_type: PageType, age: PageAge, size: usize) -> Option<usize> {
        let mut pages = self.pages.lock();

        if let Some(addr) = pages
            .get(&(page_type, age))
            .and_then(|page| page.alloc_object(size))
        {
            return Some(addr);
        }

        let page = heap.alloc_page(page_type, age)?;
        let addr = page.alloc_object(size);
        pages.insert((page_type, age), page);
        addr
    }

    /// Offer a page compacted in place as the new target
    fn share(&self, page: Arc<Page>, age: PageAge) {
        self.pages.lock().insert((page.page_type(), age), page);
    }

    fn retire(&self) {
        self.pages.lock().clear();
    }
}

/// Relocate - drives workers over a relocation set and serves barriers
pub struct Relocate {
    heap: Arc<Heap>,

    workers: WorkerPool,

    queue: RelocateQueue,

    /// Medium worker targets and all mutator targets
    shared: SharedTargets,

    stats: RelocationStats,

    verbose: bool,
}

impl Relocate {
    /// Create with the configured number of workers
    pub fn new(heap: Arc<Heap>) -> Self {
        let nworkers = heap.config().worker_count();
        Self::with_workers(heap, nworkers)
    }

    pub fn with_workers(heap: Arc<Heap>, nworkers: usize) -> Self {
        let verbose = heap.config().verbose;

        Self {
            heap,
            workers: WorkerPool::new(nworkers),
            queue: RelocateQueue::new(),
            shared: SharedTargets::new(),
            stats: RelocationStats::new(),
            verbose,
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn queue(&self) -> &RelocateQueue {
        &self.queue
    }

    pub fn nworkers(&self) -> usize {
        self.workers.nworkers()
    }

    /// Snapshot of the relocation counters
    pub fn stats(&self) -> RelocationSummary {
        self.stats.summary(self.queue.stalls())
    }

    /// Evacuate every page of `set`
    ///
    /// Returns once all forwardings are done. Target pages filled during the
    /// phase stay allocated in the heap. A worker that cannot be started or
    /// dies mid-phase leaves claimed pages unfinished and waiters parked, so
    /// it is treated as an invariant violation.
    pub fn relocate(&self, set: &RelocationSet) {
        let timer = PhaseTimer::new();
        let _phase = ScopedTimer::new(|duration| self.stats.record_phase(duration));

        let nworkers = self.workers.nworkers();
        log::debug!(
            "Relocation start: {} pages, {} workers",
            set.len(),
            nworkers
        );
        if self.verbose {
            log_event(RelocEvent::RelocationStart {
                pages: set.len(),
                workers: nworkers,
            });
        }

        self.queue.join(nworkers);

        let iter = set.iter();
        if let Err(e) = self.workers.run_concurrent(|id| {
            let mut worker = RelocateWorker::new(id, self, set);
            worker.run(&iter);
        }) {
            fatal!("relocation of {} pages failed: {}", set.len(), e);
        }

        self.queue.clear();
        self.shared.retire();

        let summary = self.stats();
        log::debug!(
            "Relocation end: {} pages ({} in place), {} bytes, {:.2}ms",
            summary.pages_relocated,
            summary.pages_in_place,
            summary.bytes_relocated(),
            timer.elapsed_ms()
        );
        if self.verbose {
            log_event(RelocEvent::RelocationEnd {
                pages: set.len(),
                bytes: summary.bytes_relocated() as usize,
                duration_ms: timer.elapsed_ms(),
            });
        }
    }

    /// Barrier slow path: relocate (or find) the object at `from_addr`
    ///
    /// Returns the object's to-space address.
    pub fn relocate_object(&self, forwarding: &Arc<Forwarding>, from_addr: usize) -> usize {
        let (found, cursor) = forwarding.find_with_cursor(from_addr);
        if let Some(to_addr) = found {
            return to_addr;
        }

        if forwarding.retain_page(&self.queue) {
            let to_addr = self.relocate_object_inner(forwarding, from_addr, cursor);
            forwarding.release_page();

            if let Some(to_addr) = to_addr {
                return to_addr;
            }

            // No memory for the copy; let a worker finish the page
            if self.verbose {
                log_event(RelocEvent::MutatorStall {
                    page: forwarding.start(),
                });
            }
            self.queue.add_and_wait(forwarding);
        }

        self.forward_object(forwarding, from_addr)
    }

    fn relocate_object_inner(&self, forwarding: &Forwarding, from_addr: usize, cursor: ForwardingCursor) -> Option<usize> {
        let from_page = forwarding.page();
        let Some(size) = from_page.object_size(from_addr) else {
            fatal!(
                "relocating object {:#x} that is not live in page {:#x}",
                from_addr,
                from_page.start()
            );
        };

        let to_addr = self.shared.alloc_object(
            &self.heap,
            from_page.page_type(),
            forwarding.to_age(),
            size,
        )?;

        self.heap.copy_object_disjoint(from_addr, to_addr, size);

        let winner = forwarding.insert_at(from_addr, to_addr, cursor);
        if winner != to_addr {
            self.undo_alloc_object(to_addr, size);
            self.stats.record_lost_race();
        } else {
            self.stats.record_mutator_copy(size);
        }

        Some(winner)
    }

    /// Remap-only lookup; the object must already be forwarded
    pub fn forward_object(&self, forwarding: &Forwarding, from_addr: usize) -> usize {
        match forwarding.find(from_addr) {
            Some(to_addr) => to_addr,
            None => fatal!(
                "object {:#x} in page {:#x} was never forwarded",
                from_addr,
                forwarding.start()
            ),
        }
    }

    /// Park all relocation workers
    pub fn synchronize(&self) {
        self.queue.synchronize();
    }

    /// Let parked relocation workers continue
    pub fn desynchronize(&self) {
        self.queue.desynchronize();
    }

    fn undo_alloc_object(&self, addr: usize, size: usize) {
        if let Some(page) = self.heap.page_containing(addr) {
            // A later allocation leaves the copy behind as garbage
            page.undo_alloc_object(addr, size);
        }
    }
}

/// One worker's view of a relocation phase
struct RelocateWorker<'a> {
    id: usize,

    relocate: &'a Relocate,

    set: &'a RelocationSet,

    /// Private Small targets by age
    small_targets: HashMap<PageAge, Arc<Page>>,

    forwardings: usize,
}

impl<'a> RelocateWorker<'a> {
    fn new(id: usize, relocate: &'a Relocate, set: &'a RelocationSet) -> Self {
        Self {
            id,
            relocate,
            set,
            small_targets: HashMap::new(),
            forwardings: 0,
        }
    }

    fn run(&mut self, iter: &RelocationSetIterator<'_>) {
        loop {
            // Stalled mutators first
            while let Some(forwarding) = self.relocate.queue.synchronize_poll() {
                self.do_forwarding(&forwarding);
            }

            match iter.next() {
                Some(forwarding) => {
                    if forwarding.claim() {
                        self.do_forwarding(forwarding);
                    }
                }
                None => break,
            }
        }

        self.relocate.queue.leave();

        log::trace!(
            "reloc-worker-{} finished: {} forwardings",
            self.id,
            self.forwardings
        );
    }

    fn alloc_object(&mut self, page_type: PageType, age: PageAge, size: usize) -> Option<usize> {
        let heap = &self.relocate.heap;

        if page_type != PageType::Small {
            return self.relocate.shared.alloc_object(heap, page_type, age, size);
        }

        if let Some(addr) = self
            .small_targets
            .get(&age)
            .and_then(|page| page.alloc_object(size))
        {
            return Some(addr);
        }

        let page = heap.alloc_page(PageType::Small, age)?;
        let addr = page.alloc_object(size);
        self.small_targets.insert(age, page);
        addr
    }

    /// Copy into a target page; `None` when no target memory is left
    fn relocate_object(&mut self, forwarding: &Forwarding, from_addr: usize, size: usize) -> Option<()> {
        let (found, cursor) = forwarding.find_with_cursor(from_addr);
        if found.is_some() {
            // Already relocated by a mutator
            return Some(());
        }

        let page_type = forwarding.page().page_type();
        let to_addr = self.alloc_object(page_type, forwarding.to_age(), size)?;

        self.relocate.heap.copy_object_disjoint(from_addr, to_addr, size);

        if forwarding.insert_at(from_addr, to_addr, cursor) != to_addr {
            self.relocate.undo_alloc_object(to_addr, size);
            self.relocate.stats.record_lost_race();
        } else {
            self.relocate.stats.record_worker_copy(size);
        }

        Some(())
    }

    fn start_in_place_relocation(&self, forwarding: &Forwarding, watermark: usize) {
        forwarding.in_place_relocation_claim_page();
        forwarding.in_place_relocation_start(watermark);
        forwarding.page().reset_top_for_allocation();

        if self.relocate.verbose {
            log_event(RelocEvent::InPlaceFallback {
                page: forwarding.start(),
                watermark,
            });
        }
    }

    /// Slide an object down inside its own page
    fn relocate_object_in_place(&self, forwarding: &Forwarding, from_addr: usize, size: usize) {
        if forwarding.find(from_addr).is_some() {
            return;
        }

        if from_addr < forwarding.in_place_watermark() || !forwarding.is_in_place_relocating_thread() {
            fatal!(
                "in-place relocation of {:#x} below watermark {:#x} or from a foreign thread",
                from_addr,
                forwarding.in_place_watermark()
            );
        }

        let page = forwarding.page();
        let Some(to_addr) = page.alloc_object(size) else {
            fatal!(
                "in-place relocation of {:#x} overflows page {:#x}",
                from_addr,
                page.start()
            );
        };

        if to_addr != from_addr {
            self.relocate.heap.copy_object_conjoint(from_addr, to_addr, size);
        }

        // The page is claimed; nobody else can insert
        let winner = forwarding.insert(from_addr, to_addr);
        if winner != to_addr {
            fatal!(
                "in-place relocation of {:#x} lost to {:#x}",
                from_addr,
                winner
            );
        }

        self.relocate.stats.record_worker_copy(size);
    }

    fn do_forwarding(&mut self, forwarding: &Arc<Forwarding>) {
        let from_page = forwarding.page();
        let mut in_place = false;
        let mut objects = 0;
        let mut bytes = 0;

        for (from_addr, size) in forwarding.live_objects() {
            if !in_place && self.relocate_object(forwarding, from_addr, size).is_none() {
                // Out of target pages
                self.start_in_place_relocation(forwarding, from_addr);
                in_place = true;
            }

            if in_place {
                self.relocate_object_in_place(forwarding, from_addr, size);
            }

            objects += 1;
            bytes += size;
        }

        if in_place {
            forwarding.in_place_relocation_finish();
            from_page.reset_livemap();
            from_page.set_age(forwarding.to_age());

            if forwarding.is_promotion() {
                self.set.register_in_place_relocate_promoted(Arc::clone(from_page));
            }
        }

        forwarding.release_page();
        let page = forwarding.detach_page();

        // A page goes back to the heap only once it is done and unpinned
        forwarding.mark_done();

        if in_place {
            let age = forwarding.to_age();
            if page.is_small() {
                self.small_targets.insert(age, page);
            } else {
                self.relocate.shared.share(page, age);
            }
        } else {
            self.relocate.heap.free_page(page);
        }

        self.forwardings += 1;
        self.relocate.stats.record_page(in_place, !in_place);

        log::trace!(
            "reloc-worker-{} relocated page {:#x}: {} objects, {} bytes{}",
            self.id,
            forwarding.start(),
            objects,
            bytes,
            if in_place { " (in place)" } else { "" }
        );
        if self.relocate.verbose {
            log_event(RelocEvent::PageRelocated {
                page: forwarding.start(),
                objects,
                bytes,
                in_place,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RelocationConfig, KB, MB};
    use crate::error::Result;
    use crate::heap::{AnonymousBacking, PhysicalBacking};

    fn config() -> RelocationConfig {
        RelocationConfig {
            small_page_size: 64 * KB,
            medium_page_size: 512 * KB,
            relocation_workers: Some(2),
            ..Default::default()
        }
    }

    /// Page with `count` objects of `size` bytes, every `stride`-th one live
    fn populate(heap: &Heap, count: usize, size: usize, stride: usize) -> (Arc<Page>, Vec<(usize, Vec<u8>)>) {
        let page = heap.alloc_page(PageType::Small, PageAge::Eden).unwrap();
        let mut live = Vec::new();

        for i in 0..count {
            let addr = page.alloc_object(size).unwrap();
            let bytes = vec![(i % 251) as u8; size];
            heap.write_bytes(addr, &bytes).unwrap();
            if i % stride == 0 {
                page.mark_object(addr, size);
                live.push((addr, bytes));
            }
        }

        (page, live)
    }

    fn install(heap: &Heap, pages: &[Arc<Page>]) -> RelocationSet {
        let mut selector = RelocationSetSelector::new(heap.config());
        for page in pages {
            selector.register_live_page(Arc::clone(page));
        }
        selector.select();

        let mut set = RelocationSet::new(heap.config().tenuring_threshold);
        set.install(&selector);
        set
    }

    /// Every live object is readable at its forwarded address
    fn assert_forwarded(heap: &Heap, relocate: &Relocate, set: &RelocationSet, live: &[(usize, Vec<u8>)]) {
        for (from_addr, bytes) in live {
            let forwarding = set.forwarding_for(*from_addr).unwrap();
            assert!(forwarding.is_done());
            let to_addr = relocate.forward_object(forwarding, *from_addr);
            assert_eq!(&heap.read_bytes(to_addr, bytes.len()).unwrap(), bytes);
        }
    }

    #[test]
    fn test_relocate_moves_live_objects() {
        let heap = Arc::new(Heap::new(config(), 8 * MB).unwrap());
        let (a, live_a) = populate(&heap, 200, 64, 4);
        let (b, live_b) = populate(&heap, 200, 64, 5);

        let set = install(&heap, &[a, b]);
        assert_eq!(set.len(), 2);

        let relocate = Relocate::new(Arc::clone(&heap));
        relocate.relocate(&set);

        assert_forwarded(&heap, &relocate, &set, &live_a);
        assert_forwarded(&heap, &relocate, &set, &live_b);

        let stats = relocate.stats();
        assert_eq!(stats.pages_relocated, 2);
        assert_eq!(stats.pages_freed, 2);
        assert_eq!(stats.worker_objects, 50 + 40);
        assert!(heap.page_containing(live_a[0].0).is_none());
    }

    /// Backing that records, for every unmapped page, whether its
    /// forwarding was already done
    struct DoneAtFreeBacking {
        inner: AnonymousBacking,
        forwardings: Arc<Mutex<Vec<Arc<Forwarding>>>>,
        freed: Arc<Mutex<Vec<(usize, bool)>>>,
    }

    impl PhysicalBacking for DoneAtFreeBacking {
        fn base(&self) -> usize {
            self.inner.base()
        }

        fn capacity(&self) -> usize {
            self.inner.capacity()
        }

        fn commit(&self, offset: usize, len: usize) -> usize {
            self.inner.commit(offset, len)
        }

        fn uncommit(&self, offset: usize, len: usize) -> usize {
            self.inner.uncommit(offset, len)
        }

        fn map(&self, addr: usize, size: usize, offset: usize) -> Result<()> {
            self.inner.map(addr, size, offset)
        }

        fn unmap(&self, addr: usize, size: usize) -> Result<()> {
            let start = addr - self.inner.base();
            let done = self
                .forwardings
                .lock()
                .iter()
                .find(|f| f.start() == start)
                .map(|f| f.is_done());
            if let Some(done) = done {
                self.freed.lock().push((start, done));
            }
            self.inner.unmap(addr, size)
        }

        fn committed(&self) -> usize {
            self.inner.committed()
        }
    }

    #[test]
    fn test_pages_freed_only_after_done() {
        let forwardings = Arc::new(Mutex::new(Vec::new()));
        let freed = Arc::new(Mutex::new(Vec::new()));
        let backing = DoneAtFreeBacking {
            inner: AnonymousBacking::reserve(8 * MB).unwrap(),
            forwardings: Arc::clone(&forwardings),
            freed: Arc::clone(&freed),
        };
        let heap = Arc::new(Heap::with_backing(config(), Box::new(backing)).unwrap());

        let (a, _) = populate(&heap, 100, 64, 4);
        let (b, _) = populate(&heap, 100, 64, 4);
        let set = install(&heap, &[a, b]);
        forwardings.lock().extend(set.forwardings().iter().cloned());

        Relocate::with_workers(Arc::clone(&heap), 2).relocate(&set);

        let freed = freed.lock();
        assert_eq!(freed.len(), 2);
        assert!(freed.iter().all(|&(_, done)| done), "freed before done: {:?}", *freed);
    }

    #[test]
    fn test_mutator_relocation_before_workers() {
        let heap = Arc::new(Heap::new(config(), 8 * MB).unwrap());
        let (a, live_a) = populate(&heap, 100, 32, 3);
        let (b, _) = populate(&heap, 100, 32, 3);

        let set = install(&heap, &[a, b]);
        let relocate = Relocate::with_workers(Arc::clone(&heap), 1);

        let forwarding = set.forwarding_for(live_a[0].0).unwrap();
        let (from_addr, bytes) = &live_a[0];

        let to_addr = relocate.relocate_object(forwarding, *from_addr);
        assert_eq!(relocate.relocate_object(forwarding, *from_addr), to_addr);
        assert_eq!(&heap.read_bytes(to_addr, bytes.len()).unwrap(), bytes);
        assert_eq!(forwarding.ref_count(), 1);

        relocate.relocate(&set);

        // The worker kept the mutator's copy
        assert_eq!(relocate.forward_object(forwarding, *from_addr), to_addr);
        assert_eq!(relocate.stats().mutator_objects, 1);
        assert_forwarded(&heap, &relocate, &set, &live_a);
    }

    #[test]
    fn test_in_place_relocation_when_heap_full() {
        let backing = AnonymousBacking::with_commit_limit(8 * MB, 128 * KB).unwrap();
        let heap = Arc::new(Heap::with_backing(config(), Box::new(backing)).unwrap());

        // Two pages use the whole commit limit; no target page can be made
        let (a, live_a) = populate(&heap, 256, 128, 2);
        let (b, live_b) = populate(&heap, 256, 128, 3);
        assert!(heap.alloc_page(PageType::Small, PageAge::Eden).is_none());

        let set = install(&heap, &[a, b]);
        let relocate = Relocate::with_workers(Arc::clone(&heap), 1);
        relocate.relocate(&set);

        assert_forwarded(&heap, &relocate, &set, &live_a);
        assert_forwarded(&heap, &relocate, &set, &live_b);

        // The first page is compacted into itself and then receives the
        // objects of the second one
        let in_place: Vec<_> = set.forwardings().iter().filter(|f| f.in_place()).collect();
        assert_eq!(in_place.len(), 1);
        let page = in_place[0].page();
        for (from_addr, _) in live_a.iter().chain(live_b.iter()) {
            let to_addr = set.forwarding_for(*from_addr).unwrap().find(*from_addr).unwrap();
            assert!(page.is_in(to_addr));
        }

        let stats = relocate.stats();
        assert_eq!(stats.pages_in_place, 1);
        assert_eq!(stats.pages_freed, 1);
    }

    #[test]
    fn test_in_place_promotion_registered() {
        let config = RelocationConfig {
            tenuring_threshold: 0,
            ..config()
        };
        let backing = AnonymousBacking::with_commit_limit(8 * MB, 128 * KB).unwrap();
        let heap = Arc::new(Heap::with_backing(config, Box::new(backing)).unwrap());

        let (a, _) = populate(&heap, 64, 128, 2);
        let (b, _) = populate(&heap, 64, 128, 2);

        let set = install(&heap, &[a, b]);
        assert!(set.forwardings().iter().all(|f| f.is_promotion()));

        let relocate = Relocate::with_workers(Arc::clone(&heap), 1);
        relocate.relocate(&set);

        let promoted = set.in_place_promoted();
        assert_eq!(promoted.len(), 1);
        assert!(promoted[0].age().is_old());
    }

    #[test]
    #[should_panic(expected = "relocation of 2 pages failed")]
    fn test_worker_invariant_violation_is_fatal() {
        let heap = Arc::new(Heap::new(config(), 8 * MB).unwrap());
        let (a, _) = populate(&heap, 16, 64, 2);
        let (b, _) = populate(&heap, 16, 64, 2);
        let set = install(&heap, &[a, b]);

        // The worker's own release becomes a double release
        set.forwardings()[0].release_page();

        Relocate::with_workers(Arc::clone(&heap), 1).relocate(&set);
    }

    #[test]
    #[should_panic(expected = "was never forwarded")]
    fn test_forward_miss_is_fatal() {
        let heap = Arc::new(Heap::new(config(), 8 * MB).unwrap());
        let (a, live_a) = populate(&heap, 16, 64, 2);
        let (b, _) = populate(&heap, 16, 64, 2);

        let set = install(&heap, &[a, b]);
        let relocate = Relocate::with_workers(Arc::clone(&heap), 1);

        let forwarding = set.forwarding_for(live_a[0].0).unwrap();
        relocate.forward_object(forwarding, live_a[0].0);
    }
}
