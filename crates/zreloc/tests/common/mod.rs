//! Test Utilities for the Relocation Test Suite
//!
//! Builds heaps with small pages, fills pages with recognisable byte
//! patterns and checks that every live object survives relocation intact.

#![allow(dead_code)]

use std::sync::Arc;
use zreloc::{
    AnonymousBacking, Heap, Page, PageAge, PageType, Relocate, RelocationConfig, RelocationSet,
    RelocationSetSelector,
};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

/// Small page size used by the fixtures (the smallest allowed)
pub const SMALL_PAGE: usize = 64 * KB;

/// Medium page size used by the fixtures
pub const MEDIUM_PAGE: usize = 512 * KB;

/// A live object and the bytes written into it
#[derive(Debug, Clone)]
pub struct LiveObject {
    pub addr: usize,
    pub bytes: Vec<u8>,
}

/// Configuration with test-sized pages
pub fn test_config(workers: usize) -> RelocationConfig {
    RelocationConfig {
        small_page_size: SMALL_PAGE,
        medium_page_size: MEDIUM_PAGE,
        relocation_workers: Some(workers),
        ..Default::default()
    }
}

/// ============================================================================
/// HEAP FIXTURE
/// ============================================================================

pub struct HeapFixture {
    pub heap: Arc<Heap>,
    next_pattern: u8,
}

impl HeapFixture {
    pub fn new(workers: usize, capacity: usize) -> Self {
        Self::with_config(test_config(workers), capacity)
    }

    pub fn with_config(config: RelocationConfig, capacity: usize) -> Self {
        let heap = Heap::new(config, capacity).expect("heap should initialize");
        Self {
            heap: Arc::new(heap),
            next_pattern: 1,
        }
    }

    /// Heap whose physical memory runs out after `commit_limit` bytes
    pub fn with_commit_limit(workers: usize, capacity: usize, commit_limit: usize) -> Self {
        let backing =
            AnonymousBacking::with_commit_limit(capacity, commit_limit).expect("reserve heap");
        let heap =
            Heap::with_backing(test_config(workers), Box::new(backing)).expect("heap should initialize");
        Self {
            heap: Arc::new(heap),
            next_pattern: 1,
        }
    }

    /// Fill a new page with `count` objects of `size` bytes; every
    /// `stride`-th object is marked live
    pub fn populate(
        &mut self,
        page_type: PageType,
        count: usize,
        size: usize,
        stride: usize,
    ) -> (Arc<Page>, Vec<LiveObject>) {
        let page = self
            .heap
            .alloc_page(page_type, PageAge::Eden)
            .expect("page allocation should succeed");

        let mut live = Vec::new();
        for i in 0..count {
            let addr = page.alloc_object(size).expect("object should fit");
            let bytes = self.pattern(size);
            self.heap.write_bytes(addr, &bytes).expect("write object");

            if i % stride == 0 {
                page.mark_object(addr, size);
                live.push(LiveObject { addr, bytes });
            }
        }

        (page, live)
    }

    /// Distinct content per object, so a wrong forwarding shows up as a
    /// content mismatch
    fn pattern(&mut self, size: usize) -> Vec<u8> {
        let seed = self.next_pattern;
        self.next_pattern = self.next_pattern.wrapping_add(1).max(1);
        (0..size).map(|i| seed.wrapping_add(i as u8)).collect()
    }
}

/// Run selection over `pages` and install the result
pub fn install(heap: &Heap, pages: &[Arc<Page>]) -> RelocationSet {
    let mut selector = RelocationSetSelector::new(heap.config());
    for page in pages {
        selector.register_live_page(Arc::clone(page));
    }
    selector.select();

    let mut set = RelocationSet::new(heap.config().tenuring_threshold);
    set.install(&selector);
    set
}

/// Assert every live object of a relocated page is intact at its new address
pub fn assert_relocated(heap: &Heap, relocate: &Relocate, set: &RelocationSet, live: &[LiveObject]) {
    for object in live {
        let forwarding = set
            .forwarding_for(object.addr)
            .expect("object should belong to the relocation set");
        assert!(forwarding.is_done(), "page {:#x} not done", forwarding.start());

        let to_addr = relocate.forward_object(forwarding, object.addr);
        let bytes = heap
            .read_bytes(to_addr, object.bytes.len())
            .expect("forwarded address should be readable");
        assert_eq!(
            bytes, object.bytes,
            "object {:#x} corrupted at {:#x}",
            object.addr, to_addr
        );
    }
}

/// Assert no two live objects were forwarded to overlapping ranges
pub fn assert_no_overlap(relocate: &Relocate, set: &RelocationSet, live: &[LiveObject]) {
    let mut ranges: Vec<(usize, usize)> = live
        .iter()
        .map(|object| {
            let forwarding = set.forwarding_for(object.addr).expect("forwarding");
            let to_addr = relocate.forward_object(forwarding, object.addr);
            (to_addr, to_addr + object.bytes.len())
        })
        .collect();
    ranges.sort_unstable();

    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "objects overlap: {:#x}..{:#x} and {:#x}..{:#x}",
            pair[0].0,
            pair[0].1,
            pair[1].0,
            pair[1].1
        );
    }
}
