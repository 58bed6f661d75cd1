//! Relocation Set Selector - Choosing Pages to Evacuate
//!
//! After marking, every page with live objects is registered here. Pages that
//! hold more garbage than the fragmentation limit become candidates; the rest
//! keep their garbage as tolerated fragmentation.
//!
//! Selection per size class:
//! ```text
//! candidates ──semi-sort by live bytes──▶ [p0 ≤ p1 ≤ ... ≤ pn]
//!                                              │
//!        greedy walk: grow the prefix while the relative gain in
//!        reclaimable pages exceeds the fragmentation limit
//!                                              │
//!                                              ▼
//!                         selected = sorted[..nselected]
//! ```
//!
//! The walk never stops at the first prefix that fails the threshold: the
//! gain of a longer prefix is measured against the last accepted one and can
//! rise again after a dip.

use crate::config::RelocationConfig;
use crate::heap::{Page, PageType};
use crate::logging::{log_event, RelocEvent};
use crate::relocate::forwarding_table::ForwardingTable;
use serde::Serialize;
use std::sync::Arc;

const NPARTITIONS_SHIFT: u32 = 11;
const NPARTITIONS: usize = 1 << NPARTITIONS_SHIFT;

/// Relocatable size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeClass {
    Small,
    Medium,
}

impl SizeClass {
    pub fn page_type(self) -> PageType {
        match self {
            SizeClass::Small => PageType::Small,
            SizeClass::Medium => PageType::Medium,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SizeClass::Small => "Small",
            SizeClass::Medium => "Medium",
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    page: Arc<Page>,
    garbage: usize,
}

/// Per-group statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStats {
    /// Pages registered with live objects
    pub npages: usize,
    /// Pages above the fragmentation limit
    pub npages_candidates: usize,
    pub npages_selected: usize,
    /// Bytes of all registered pages
    pub total: usize,
    pub live: usize,
    pub garbage: usize,
    /// Live bytes of selected pages
    pub relocate: usize,
    /// Destination pages needed in the worst case
    pub selected_to: usize,
}

/// RelocationSetSelectorGroup - candidate selection for one size class
pub struct RelocationSetSelectorGroup {
    class: SizeClass,

    page_size: usize,

    object_size_limit: usize,

    /// Percent
    fragmentation_limit: f64,

    /// Garbage bytes a page may hold without becoming a candidate
    fragmentation_limit_bytes: usize,

    candidates: Vec<Candidate>,

    /// Pages under the fragmentation limit
    tolerated: Vec<Arc<Page>>,

    tolerated_fragmentation: usize,

    /// Candidates after the last `select()`
    sorted: Vec<Candidate>,

    nselected: usize,
    selected_to: usize,
    relocating: usize,
    forwarding_entries: usize,
    fragmentation: usize,

    total: usize,
    live: usize,
    garbage: usize,
}

impl RelocationSetSelectorGroup {
    pub fn new(class: SizeClass, config: &RelocationConfig) -> Self {
        let page_type = class.page_type();
        let page_size = match page_type {
            PageType::Small => config.small_page_size,
            _ => config.medium_page_size,
        };

        Self {
            class,
            page_size,
            object_size_limit: config.object_size_limit(page_type),
            fragmentation_limit: config.fragmentation_limit,
            fragmentation_limit_bytes: config.fragmentation_limit_bytes(page_size),
            candidates: Vec::new(),
            tolerated: Vec::new(),
            tolerated_fragmentation: 0,
            sorted: Vec::new(),
            nselected: 0,
            selected_to: 0,
            relocating: 0,
            forwarding_entries: 0,
            fragmentation: 0,
            total: 0,
            live: 0,
            garbage: 0,
        }
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Register a page with live objects and `garbage` dead bytes
    pub fn register_live_page(&mut self, page: Arc<Page>, garbage: usize) {
        self.total += page.size();
        self.live += page.live_bytes();
        self.garbage += garbage;

        if garbage > self.fragmentation_limit_bytes {
            self.candidates.push(Candidate { page, garbage });
        } else {
            self.tolerated_fragmentation += garbage;
            self.tolerated.push(page);
        }
    }

    fn is_selectable(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Order candidates by live bytes with a counting sort over 2^11
    /// partitions; order inside a partition is registration order
    fn semi_sort(&mut self) {
        let partition_shift = self.page_size.trailing_zeros().saturating_sub(NPARTITIONS_SHIFT);
        let partition_of =
            |c: &Candidate| (c.page.live_bytes() >> partition_shift).min(NPARTITIONS - 1);

        let mut partitions = vec![0usize; NPARTITIONS];
        for candidate in &self.candidates {
            partitions[partition_of(candidate)] += 1;
        }

        // Slot counts to fingers
        let mut finger = 0;
        for slot in partitions.iter_mut() {
            let count = *slot;
            *slot = finger;
            finger += count;
        }

        let mut sorted: Vec<Option<Candidate>> = vec![None; self.candidates.len()];
        for candidate in &self.candidates {
            let partition = partition_of(candidate);
            sorted[partitions[partition]] = Some(candidate.clone());
            partitions[partition] += 1;
        }

        self.sorted = sorted.into_iter().flatten().collect();
    }

    fn select_inner(&mut self) {
        let npages = self.sorted.len();
        let to_capacity = self.page_size - self.object_size_limit;

        let mut from_live_bytes = 0;
        let mut from_forwarding_entries = 0;

        let mut selected_from = 0;
        let mut selected_to = 0;
        let mut selected_live_bytes = 0;
        let mut selected_forwarding_entries = 0;

        for from in 1..=npages {
            let page = &self.sorted[from - 1].page;
            from_live_bytes += page.live_bytes();
            from_forwarding_entries += ForwardingTable::nentries_for(page.live_objects());

            // Worst case: objects never pack perfectly into destination pages
            let to = from_live_bytes.div_ceil(to_capacity);

            let diff_from = from - selected_from;
            let diff_to = to - selected_to;
            let diff_reclaimable = 100.0 - 100.0 * diff_to as f64 / diff_from as f64;

            if diff_reclaimable > self.fragmentation_limit {
                selected_from = from;
                selected_to = to;
                selected_live_bytes = from_live_bytes;
                selected_forwarding_entries = from_forwarding_entries;
            }

            log::trace!(
                "Candidate Relocation Set ({} Pages): {:#x}, {:.1}% relative defragmentation, {} forwarding entries, {}",
                self.class.name(),
                page.start(),
                diff_reclaimable,
                from_forwarding_entries,
                if selected_from == from { "Selected" } else { "Rejected" }
            );
        }

        self.nselected = selected_from;
        self.selected_to = selected_to;
        self.relocating = selected_live_bytes;
        self.forwarding_entries = selected_forwarding_entries;
    }

    /// Select pages to relocate
    ///
    /// Results are recomputed from the registered pages on every call, so
    /// calling it again without new registrations yields the same outcome.
    pub fn select(&mut self) {
        self.nselected = 0;
        self.selected_to = 0;
        self.relocating = 0;
        self.forwarding_entries = 0;

        self.semi_sort();

        if self.is_selectable() {
            self.select_inner();
        }

        let unselected_garbage: usize = self.sorted[self.nselected..]
            .iter()
            .map(|c| c.garbage)
            .sum();
        self.fragmentation = self.tolerated_fragmentation + unselected_garbage;

        log::debug!(
            "Relocation Set ({} Pages): {} candidates, {} selected, {} to pages, {} bytes relocating",
            self.class.name(),
            self.candidates.len(),
            self.nselected,
            self.selected_to,
            self.relocating
        );
    }

    /// Selected pages, ascending live bytes
    pub fn selected(&self) -> Vec<Arc<Page>> {
        self.sorted[..self.nselected]
            .iter()
            .map(|c| Arc::clone(&c.page))
            .collect()
    }

    /// Registered pages that were not selected
    pub fn not_selected(&self) -> Vec<Arc<Page>> {
        self.tolerated
            .iter()
            .cloned()
            .chain(self.sorted[self.nselected..].iter().map(|c| Arc::clone(&c.page)))
            .collect()
    }

    pub fn nselected(&self) -> usize {
        self.nselected
    }

    pub fn ncandidates(&self) -> usize {
        self.candidates.len()
    }

    /// Live bytes of the selected pages
    pub fn relocating(&self) -> usize {
        self.relocating
    }

    /// Garbage left behind in unselected and tolerated pages
    pub fn fragmentation(&self) -> usize {
        self.fragmentation
    }

    pub fn selected_to(&self) -> usize {
        self.selected_to
    }

    /// Forwarding table slots needed by the selected pages
    pub fn forwarding_entries(&self) -> usize {
        self.forwarding_entries
    }

    pub fn stats(&self) -> GroupStats {
        GroupStats {
            npages: self.candidates.len() + self.tolerated.len(),
            npages_candidates: self.candidates.len(),
            npages_selected: self.nselected,
            total: self.total,
            live: self.live,
            garbage: self.garbage,
            relocate: self.relocating,
            selected_to: self.selected_to,
        }
    }
}

/// Selector statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectorStats {
    pub small: GroupStats,
    pub medium: GroupStats,
    pub npages_large: usize,
    /// Fully-garbage pages
    pub npages_empty: usize,
    pub live: usize,
    pub garbage: usize,
    pub empty: usize,
    pub relocating: usize,
    pub fragmentation: usize,
}

/// RelocationSetSelector - routes pages to size-class groups
pub struct RelocationSetSelector {
    verbose: bool,

    small: RelocationSetSelectorGroup,

    medium: RelocationSetSelectorGroup,

    large: Vec<Arc<Page>>,

    large_fragmentation: usize,

    /// Fully-garbage pages, returned to the caller for freeing
    garbage_pages: Vec<Arc<Page>>,

    live: usize,
    garbage: usize,
    empty: usize,
}

impl RelocationSetSelector {
    pub fn new(config: &RelocationConfig) -> Self {
        Self {
            verbose: config.verbose,
            small: RelocationSetSelectorGroup::new(SizeClass::Small, config),
            medium: RelocationSetSelectorGroup::new(SizeClass::Medium, config),
            large: Vec::new(),
            large_fragmentation: 0,
            garbage_pages: Vec::new(),
            live: 0,
            garbage: 0,
            empty: 0,
        }
    }

    /// Register a page with live objects
    pub fn register_live_page(&mut self, page: Arc<Page>) {
        let live = page.live_bytes();
        let garbage = page.size().saturating_sub(live);

        self.live += live;
        self.garbage += garbage;

        match page.page_type() {
            PageType::Small => self.small.register_live_page(page, garbage),
            PageType::Medium => self.medium.register_live_page(page, garbage),
            PageType::Large => {
                self.large_fragmentation += garbage;
                self.large.push(page);
            }
        }
    }

    /// Register a page without live objects
    pub fn register_garbage_page(&mut self, page: Arc<Page>) {
        let size = page.size();
        self.garbage += size;
        self.empty += size;
        self.garbage_pages.push(page);
    }

    /// Select pages from both groups, Medium first
    pub fn select(&mut self) {
        self.medium.select();
        self.small.select();

        log::debug!(
            "Relocation set selected: {} medium, {} small pages, {} bytes relocating, {} bytes fragmentation",
            self.medium.nselected(),
            self.small.nselected(),
            self.relocating(),
            self.fragmentation()
        );

        if self.verbose {
            log_event(RelocEvent::SelectionComplete {
                small_selected: self.small.nselected(),
                medium_selected: self.medium.nselected(),
                relocating_bytes: self.relocating(),
                fragmentation_bytes: self.fragmentation(),
            });
        }
    }

    pub fn small(&self) -> &RelocationSetSelectorGroup {
        &self.small
    }

    pub fn medium(&self) -> &RelocationSetSelectorGroup {
        &self.medium
    }

    pub fn selected_small(&self) -> Vec<Arc<Page>> {
        self.small.selected()
    }

    pub fn selected_medium(&self) -> Vec<Arc<Page>> {
        self.medium.selected()
    }

    /// All selected pages, Medium before Small
    pub fn selected(&self) -> Vec<Arc<Page>> {
        let mut pages = self.medium.selected();
        pages.extend(self.small.selected());
        pages
    }

    /// Pages with live objects that stay where they are
    pub fn not_selected(&self) -> Vec<Arc<Page>> {
        let mut pages = self.medium.not_selected();
        pages.extend(self.small.not_selected());
        pages.extend(self.large.iter().cloned());
        pages
    }

    pub fn garbage_pages(&self) -> &[Arc<Page>] {
        &self.garbage_pages
    }

    /// Hand the fully-garbage pages to the caller
    pub fn take_garbage_pages(&mut self) -> Vec<Arc<Page>> {
        std::mem::take(&mut self.garbage_pages)
    }

    pub fn relocating(&self) -> usize {
        self.medium.relocating() + self.small.relocating()
    }

    pub fn fragmentation(&self) -> usize {
        self.large_fragmentation + self.medium.fragmentation() + self.small.fragmentation()
    }

    pub fn forwarding_entries(&self) -> usize {
        self.medium.forwarding_entries() + self.small.forwarding_entries()
    }

    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            small: self.small.stats(),
            medium: self.medium.stats(),
            npages_large: self.large.len(),
            npages_empty: self.garbage_pages.len(),
            live: self.live,
            garbage: self.garbage,
            empty: self.empty,
            relocating: self.relocating(),
            fragmentation: self.fragmentation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KB, MB};
    use crate::heap::PageAge;

    const CHUNK: usize = 4 * KB;

    fn config(small_page_size: usize) -> RelocationConfig {
        RelocationConfig {
            small_page_size,
            medium_page_size: 32 * MB,
            fragmentation_limit: 25.0,
            ..Default::default()
        }
    }

    /// Page number `n` of `page_type` with `live` bytes marked in 4KB objects
    fn page_with_live(page_type: PageType, size: usize, n: usize, live: usize) -> Arc<Page> {
        let start = size * (n + 1);
        let page = Page::new(page_type, start, size, 3, PageAge::Eden).unwrap();

        let mut marked = 0;
        while marked < live {
            let object = CHUNK.min(live - marked);
            page.mark_object(start + marked, object);
            marked += object;
        }
        page.alloc_object(live.max(8));

        Arc::new(page)
    }

    #[test]
    fn test_sparse_page_is_candidate() {
        let config = config(MB);
        let mut group = RelocationSetSelectorGroup::new(SizeClass::Small, &config);

        let page = page_with_live(PageType::Small, MB, 0, 100 * KB);
        group.register_live_page(page, 900 * KB);

        assert_eq!(group.ncandidates(), 1);
        assert_eq!(group.stats().garbage, 900 * KB);
    }

    #[test]
    fn test_single_candidate_without_gain_not_selected() {
        let config = config(MB);
        let mut group = RelocationSetSelectorGroup::new(SizeClass::Small, &config);

        group.register_live_page(page_with_live(PageType::Small, MB, 0, 100 * KB), 924 * KB);
        group.select();

        // One from-page still needs one to-page: 0% relative gain, so the
        // greedy walk keeps an empty prefix even though the page is sparse
        assert_eq!(group.nselected(), 0);
        assert_eq!(group.fragmentation(), 924 * KB);
    }

    #[test]
    fn test_two_sparse_pages_selected() {
        let config = config(MB);
        let mut group = RelocationSetSelectorGroup::new(SizeClass::Small, &config);

        for n in 0..2 {
            group.register_live_page(page_with_live(PageType::Small, MB, n, 100 * KB), 924 * KB);
        }
        group.select();

        assert_eq!(group.nselected(), 2);
        assert_eq!(group.selected_to(), 1);
        assert_eq!(group.relocating(), 200 * KB);
        assert_eq!(group.fragmentation(), 0);
    }

    #[test]
    fn test_walk_continues_past_dips() {
        // 2MB pages, 256KB object limit: each to-page holds 1.75MB
        let config = config(2 * MB);
        let mut group = RelocationSetSelectorGroup::new(SizeClass::Small, &config);

        const N: usize = 7;
        for n in 0..N {
            group.register_live_page(page_with_live(PageType::Small, 2 * MB, n, MB), MB);
        }
        group.select();

        // Prefixes 4 and 6 have no gain over 3 and 5, yet 7 is reached
        assert_eq!(group.nselected(), N);
        let expected_to = (N * MB).div_ceil(2 * MB - 256 * KB);
        assert_eq!(group.selected_to(), expected_to);
        assert_eq!(group.selected_to(), 4);
        assert_eq!(group.relocating(), N * MB);
    }

    #[test]
    fn test_select_is_idempotent() {
        let config = config(2 * MB);
        let mut group = RelocationSetSelectorGroup::new(SizeClass::Small, &config);

        for (n, live) in [900, 300, 1200, 64, 700].iter().enumerate() {
            let page = page_with_live(PageType::Small, 2 * MB, n, live * KB);
            let garbage = 2 * MB - live * KB;
            group.register_live_page(page, garbage);
        }

        group.select();
        let first = (group.nselected(), group.relocating(), group.fragmentation(), group.selected_to());
        let first_pages: Vec<usize> = group.selected().iter().map(|p| p.start()).collect();

        group.select();
        let second = (group.nselected(), group.relocating(), group.fragmentation(), group.selected_to());
        let second_pages: Vec<usize> = group.selected().iter().map(|p| p.start()).collect();

        assert_eq!(first, second);
        assert_eq!(first_pages, second_pages);
    }

    #[test]
    fn test_semi_sort_ascending_live_bytes() {
        let config = config(2 * MB);
        let mut group = RelocationSetSelectorGroup::new(SizeClass::Small, &config);

        for (n, live) in [1000, 20, 500, 8].iter().enumerate() {
            let page = page_with_live(PageType::Small, 2 * MB, n, live * KB);
            group.register_live_page(page, 2 * MB - live * KB);
        }
        group.semi_sort();

        let live: Vec<usize> = group.sorted.iter().map(|c| c.page.live_bytes() / KB).collect();
        assert_eq!(live, vec![8, 20, 500, 1000]);
    }

    #[test]
    fn test_dense_page_tolerated() {
        let config = config(2 * MB);
        let mut group = RelocationSetSelectorGroup::new(SizeClass::Small, &config);

        let page = page_with_live(PageType::Small, 2 * MB, 0, 2 * MB - 100 * KB);
        group.register_live_page(page, 100 * KB);
        group.select();

        assert_eq!(group.ncandidates(), 0);
        assert_eq!(group.nselected(), 0);
        assert_eq!(group.fragmentation(), 100 * KB);
        assert_eq!(group.not_selected().len(), 1);
    }

    #[test]
    fn test_selector_routes_by_page_type() {
        let config = config(2 * MB);
        let mut selector = RelocationSetSelector::new(&config);

        for n in 0..3 {
            selector.register_live_page(page_with_live(PageType::Small, 2 * MB, n, 64 * KB));
        }
        for n in 0..3 {
            selector.register_live_page(page_with_live(PageType::Medium, 32 * MB, n + 1, MB));
        }
        let large = page_with_live(PageType::Large, 4 * MB, 10, 3 * MB);
        selector.register_live_page(large);

        selector.select();

        let stats = selector.stats();
        assert_eq!(stats.small.npages_candidates, 3);
        assert_eq!(stats.medium.npages_candidates, 3);
        assert_eq!(stats.npages_large, 1);
        assert_eq!(selector.selected_small().len(), 3);
        assert_eq!(selector.selected_medium().len(), 3);

        // Medium pages come first
        let selected = selector.selected();
        assert!(selected[..3].iter().all(|p| p.page_type() == PageType::Medium));
        assert!(selected[3..].iter().all(|p| p.page_type() == PageType::Small));

        // The large page's garbage is pure fragmentation
        assert_eq!(selector.fragmentation(), MB);
        assert_eq!(selector.relocating(), 3 * 64 * KB + 3 * MB);
    }

    #[test]
    fn test_selector_keeps_garbage_pages() {
        let config = config(2 * MB);
        let mut selector = RelocationSetSelector::new(&config);

        selector.register_garbage_page(page_with_live(PageType::Small, 2 * MB, 0, 0));
        selector.select();

        let stats = selector.stats();
        assert_eq!(stats.npages_empty, 1);
        assert_eq!(stats.empty, 2 * MB);
        assert_eq!(stats.small.npages, 0);

        let pages = selector.take_garbage_pages();
        assert_eq!(pages.len(), 1);
        assert!(selector.garbage_pages().is_empty());
    }

    #[test]
    fn test_selector_stats_serialize() {
        let config = config(2 * MB);
        let mut selector = RelocationSetSelector::new(&config);
        selector.register_live_page(page_with_live(PageType::Small, 2 * MB, 0, 64 * KB));
        selector.select();

        let json = serde_json::to_value(selector.stats()).unwrap();
        assert_eq!(json["small"]["npages_candidates"], 1);
        assert_eq!(json["live"], 64 * KB);
    }
}
