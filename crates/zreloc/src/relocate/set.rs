//! Relocation Set - Forwardings of One Cycle
//!
//! `install()` turns the selector's result into one [`Forwarding`] per
//! selected page, Medium pages first. All forwarding tables of the cycle
//! live in a single entries arena sized from the selection.
//!
//! ```text
//! arena: [ medium 0 table | medium 1 table | small 0 table | small 1 ... ]
//!             ▲                                   ▲
//!        forwardings[0]                     forwardings[2]
//! ```
//!
//! Membership is fixed once installed. Workers share a
//! [`RelocationSetIterator`] and advance its cursor to take the next
//! forwarding; each forwarding is handed out exactly once.

use super::forwarding::Forwarding;
use super::forwarding_table::ForwardingTable;
use super::selector::RelocationSetSelector;
use crate::fatal;
use crate::heap::{Page, PageAge};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// RelocationSet - fixed set of forwardings for one relocation phase
pub struct RelocationSet {
    tenuring_threshold: u8,

    /// Medium then Small, in selection order
    forwardings: Vec<Arc<Forwarding>>,

    /// `(page start, index into forwardings)`, sorted by start
    by_start: Vec<(usize, usize)>,

    /// Shared storage of all forwarding tables
    arena: Option<Arc<[AtomicU64]>>,

    nmedium: usize,

    /// Not-selected pages that aged into the old generation
    flip_promoted: Vec<Arc<Page>>,

    /// Pages compacted in place into the old generation
    in_place_promoted: Mutex<Vec<Arc<Page>>>,

    installed: bool,
}

impl RelocationSet {
    pub fn new(tenuring_threshold: u8) -> Self {
        Self {
            tenuring_threshold,
            forwardings: Vec::new(),
            by_start: Vec::new(),
            arena: None,
            nmedium: 0,
            flip_promoted: Vec::new(),
            in_place_promoted: Mutex::new(Vec::new()),
            installed: false,
        }
    }

    /// Create forwardings for every page the selector chose
    ///
    /// Pages that were not selected are aged in place; those that reach the
    /// old generation are recorded as flip-promoted.
    pub fn install(&mut self, selector: &RelocationSetSelector) {
        if self.installed {
            fatal!("relocation set installed twice without reset");
        }

        let medium = selector.selected_medium();
        let small = selector.selected_small();
        let npages = medium.len() + small.len();

        let sizes: Vec<usize> = medium
            .iter()
            .chain(small.iter())
            .map(|page| ForwardingTable::nentries_for(page.live_objects()))
            .collect();
        let nentries: usize = sizes.iter().sum();

        let arena: Arc<[AtomicU64]> = (0..nentries).map(|_| AtomicU64::new(0)).collect();

        let mut forwardings = Vec::with_capacity(npages);
        let mut base = 0;
        for (page, &size) in medium.into_iter().chain(small).zip(&sizes) {
            let table = ForwardingTable::in_arena(Arc::clone(&arena), base, size);
            let to_age = page.age().next(self.tenuring_threshold);
            forwardings.push(Arc::new(Forwarding::with_table(page, to_age, table)));
            base += size;
        }

        let mut by_start: Vec<(usize, usize)> = forwardings
            .iter()
            .enumerate()
            .map(|(i, f)| (f.start(), i))
            .collect();
        by_start.sort_unstable();

        self.nmedium = selector.medium().nselected();
        self.forwardings = forwardings;
        self.by_start = by_start;
        self.arena = Some(arena);
        self.flip_age_not_selected(selector);
        self.installed = true;

        log::debug!(
            "Relocation set installed: {} forwardings ({} medium), {} table entries, {} flip-promoted",
            npages,
            self.nmedium,
            nentries,
            self.flip_promoted.len()
        );
    }

    fn flip_age_not_selected(&mut self, selector: &RelocationSetSelector) {
        for page in selector.not_selected() {
            let from_age = page.age();
            if from_age.is_old() {
                continue;
            }

            let to_age = from_age.next(self.tenuring_threshold);
            page.set_age(to_age);

            if to_age == PageAge::Old {
                self.flip_promoted.push(page);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.forwardings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwardings.is_empty()
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn forwardings(&self) -> &[Arc<Forwarding>] {
        &self.forwardings
    }

    pub fn medium_forwardings(&self) -> &[Arc<Forwarding>] {
        &self.forwardings[..self.nmedium]
    }

    pub fn small_forwardings(&self) -> &[Arc<Forwarding>] {
        &self.forwardings[self.nmedium..]
    }

    /// Entries arena size
    pub fn nentries(&self) -> usize {
        self.arena.as_ref().map_or(0, |arena| arena.len())
    }

    /// Shared claim-based iterator
    pub fn iter(&self) -> RelocationSetIterator<'_> {
        RelocationSetIterator::new(&self.forwardings)
    }

    /// Forwarding of the page containing `addr`
    pub fn forwarding_for(&self, addr: usize) -> Option<&Arc<Forwarding>> {
        let pos = self.by_start.partition_point(|&(start, _)| start <= addr);
        let &(_, index) = self.by_start.get(pos.checked_sub(1)?)?;
        let forwarding = &self.forwardings[index];

        if forwarding.page().is_in(addr) {
            Some(forwarding)
        } else {
            None
        }
    }

    pub fn flip_promoted(&self) -> &[Arc<Page>] {
        &self.flip_promoted
    }

    /// Record a page that was compacted into itself and promoted
    pub fn register_in_place_relocate_promoted(&self, page: Arc<Page>) {
        self.in_place_promoted.lock().push(page);
    }

    pub fn in_place_promoted(&self) -> Vec<Arc<Page>> {
        self.in_place_promoted.lock().clone()
    }

    /// Retire the forwardings of a finished cycle
    pub fn reset(&mut self) {
        if let Some(forwarding) = self.forwardings.iter().find(|f| !f.is_done()) {
            fatal!(
                "relocation set reset while page {:#x} is not done",
                forwarding.start()
            );
        }

        self.forwardings.clear();
        self.by_start.clear();
        self.arena = None;
        self.nmedium = 0;
        self.flip_promoted.clear();
        self.in_place_promoted.lock().clear();
        self.installed = false;
    }
}

/// Claim-based parallel iterator over a relocation set
pub struct RelocationSetIterator<'a> {
    forwardings: &'a [Arc<Forwarding>],
    next: CachePadded<AtomicUsize>,
}

impl<'a> RelocationSetIterator<'a> {
    fn new(forwardings: &'a [Arc<Forwarding>]) -> Self {
        Self {
            forwardings,
            next: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Take the next forwarding; `None` once all have been handed out
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> Option<&'a Arc<Forwarding>> {
        if self.next.load(Ordering::Relaxed) >= self.forwardings.len() {
            return None;
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.forwardings.get(index)
    }
}
