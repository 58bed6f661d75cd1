//! Page - Unit of Allocation and Relocation
//!
//! A page is a contiguous heap range of fixed size (Small, Medium) or of a
//! single large object (Large). Addresses handled here are heap offsets;
//! [`Heap`](crate::heap::Heap) translates them to real memory.
//!
//! Page Lifecycle:
//! ```text
//! Allocated ──▶ Marked ──▶ Selected ──▶ Relocating ──▶ Freed
//!                  │                        │
//!                  └── not selected         └── in-place: reused as target
//! ```
//!
//! # Memory Ordering Model
//!
//! ## Bump pointer (`top`)
//! - Allocation uses a CAS loop, `AcqRel` on success so the reserved range is
//!   ordered before the caller writes the object.
//! - `undo_alloc_object` only rolls back when the object is still the last
//!   allocation in the page.
//!
//! ## Live map
//! - Written by the marker before relocation starts, read-only afterwards.
//!   Guarded by an `RwLock`; the relocation phase only takes read locks.

use crate::error::{RelocError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Page size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageType {
    /// Small page for small objects
    Small,
    /// Medium page for medium objects
    Medium,
    /// Single-object page, never relocated
    Large,
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageType::Small => write!(f, "Small"),
            PageType::Medium => write!(f, "Medium"),
            PageType::Large => write!(f, "Large"),
        }
    }
}

/// Generational age of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageAge {
    /// Freshly allocated
    Eden,
    /// Survived `n` young collections (1..=14)
    Survivor(u8),
    /// Old generation
    Old,
}

const AGE_OLD: u8 = 15;

impl PageAge {
    fn encode(self) -> u8 {
        match self {
            PageAge::Eden => 0,
            PageAge::Survivor(n) => n.clamp(1, AGE_OLD - 1),
            PageAge::Old => AGE_OLD,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            0 => PageAge::Eden,
            AGE_OLD => PageAge::Old,
            n => PageAge::Survivor(n),
        }
    }

    /// Age of the objects after surviving one more collection
    ///
    /// Objects older than `tenuring_threshold` are promoted.
    pub fn next(self, tenuring_threshold: u8) -> PageAge {
        match self {
            PageAge::Old => PageAge::Old,
            age => {
                let next = age.encode() + 1;
                if next > tenuring_threshold || next >= AGE_OLD {
                    PageAge::Old
                } else {
                    PageAge::Survivor(next)
                }
            }
        }
    }

    pub fn is_old(self) -> bool {
        self == PageAge::Old
    }
}

/// Page - fixed heap range with bump allocation and a live map
pub struct Page {
    page_type: PageType,

    /// Heap offset of the first byte
    start: usize,

    size: usize,

    /// log2 of object alignment, used for forwarding indices
    alignment_shift: u32,

    age: AtomicU8,

    /// Bump pointer (heap offset)
    top: AtomicUsize,

    /// Live objects: offset -> size
    live: RwLock<BTreeMap<usize, usize>>,

    live_bytes: AtomicUsize,
}

impl Page {
    /// Create a page covering `[start, start + size)`
    ///
    /// # Validation
    /// - `size` must be non-zero and a multiple of the object alignment
    /// - `start` must be aligned to the object alignment
    pub fn new(
        page_type: PageType,
        start: usize,
        size: usize,
        alignment_shift: u32,
        age: PageAge,
    ) -> Result<Self> {
        let alignment = 1usize << alignment_shift;

        if size == 0 || size % alignment != 0 {
            return Err(RelocError::InvalidArgument(format!(
                "page size {} must be a non-zero multiple of {}",
                size, alignment
            )));
        }

        if start % alignment != 0 {
            return Err(RelocError::InvalidArgument(format!(
                "page start {:#x} must be aligned to {}",
                start, alignment
            )));
        }

        start.checked_add(size).ok_or_else(|| {
            RelocError::InvalidArgument(format!(
                "page start ({:#x}) + size ({}) overflows usize",
                start, size
            ))
        })?;

        Ok(Self {
            page_type,
            start,
            size,
            alignment_shift,
            age: AtomicU8::new(age.encode()),
            top: AtomicUsize::new(start),
            live: RwLock::new(BTreeMap::new()),
            live_bytes: AtomicUsize::new(0),
        })
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn is_small(&self) -> bool {
        self.page_type == PageType::Small
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment_shift(&self) -> u32 {
        self.alignment_shift
    }

    pub fn age(&self) -> PageAge {
        PageAge::decode(self.age.load(Ordering::Acquire))
    }

    pub fn set_age(&self, age: PageAge) {
        self.age.store(age.encode(), Ordering::Release);
    }

    /// Current bump pointer
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Bytes handed out by the bump allocator
    pub fn used(&self) -> usize {
        self.top() - self.start
    }

    /// Check if address falls inside this page
    #[inline]
    pub fn is_in(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Object index of an address, relative to the page start
    #[inline]
    pub fn object_index(&self, addr: usize) -> usize {
        (addr - self.start) >> self.alignment_shift
    }

    fn align_object_size(&self, size: usize) -> Option<usize> {
        let alignment = 1usize << self.alignment_shift;
        size.checked_add(alignment - 1).map(|s| s & !(alignment - 1))
    }

    /// Bump-allocate an object
    ///
    /// Returns `None` when the page cannot fit the aligned size.
    pub fn alloc_object(&self, size: usize) -> Option<usize> {
        let aligned_size = self.align_object_size(size)?;
        let end = self.end();
        let mut current_top = self.top.load(Ordering::Relaxed);

        loop {
            let new_top = current_top.checked_add(aligned_size)?;
            if new_top > end {
                return None;
            }

            match self.top.compare_exchange_weak(
                current_top,
                new_top,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current_top),
                Err(actual) => current_top = actual,
            }
        }
    }

    /// Roll back an allocation if it is still the last one in the page
    ///
    /// Returns false when another allocation followed; the object is then
    /// left behind as garbage.
    pub fn undo_alloc_object(&self, addr: usize, size: usize) -> bool {
        let Some(aligned_size) = self.align_object_size(size) else {
            return false;
        };

        self.top
            .compare_exchange(
                addr + aligned_size,
                addr,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Restart bump allocation from the page start
    ///
    /// Used when the page becomes its own relocation target.
    pub fn reset_top_for_allocation(&self) {
        self.top.store(self.start, Ordering::Release);
    }

    /// Record a live object found by marking
    ///
    /// Marking the same address twice is a no-op.
    pub fn mark_object(&self, addr: usize, size: usize) {
        if !self.is_in(addr) || addr + size > self.end() {
            log::warn!(
                "mark_object: object {:#x}+{} outside page [{:#x}, {:#x})",
                addr,
                size,
                self.start,
                self.end()
            );
            return;
        }

        let mut live = self.live.write();
        if live.insert(addr, size).is_none() {
            self.live_bytes.fetch_add(size, Ordering::Relaxed);
        }
    }

    /// Size of a live object
    pub fn object_size(&self, addr: usize) -> Option<usize> {
        self.live.read().get(&addr).copied()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn live_objects(&self) -> usize {
        self.live.read().len()
    }

    /// Live objects in ascending address order
    pub fn live_objects_sorted(&self) -> Vec<(usize, usize)> {
        self.live.read().iter().map(|(&a, &s)| (a, s)).collect()
    }

    /// Drop liveness information
    ///
    /// Called once the page contents have been rewritten by in-place
    /// relocation.
    pub fn reset_livemap(&self) {
        self.live.write().clear();
        self.live_bytes.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("type", &self.page_type)
            .field("start", &format_args!("{:#x}", self.start))
            .field("size", &self.size)
            .field("age", &self.age())
            .field("top", &format_args!("{:#x}", self.top()))
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}
