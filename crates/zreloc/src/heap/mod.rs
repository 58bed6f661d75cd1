//! Heap Module - Page Allocation over a Physical Backing
//!
//! The heap hands out pages for relocation targets and takes back pages whose
//! objects have all been evacuated. Addresses are heap offsets in
//! `[0, capacity)`; offset 0 is never handed out so that a zero offset can
//! stand for "no address".
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬───────────────────────┬───────────┐
//! │ reserved │  Small   │  Small   │        Medium         │   free    │
//! │ granule  │  page    │  page    │        page           │           │
//! └──────────┴──────────┴──────────┴───────────────────────┴───────────┘
//! 0                                                                capacity
//! ```
//!
//! Commit shortfalls are not errors: the page is reported as unavailable
//! (`None`), and relocation falls back to in-place compaction.

pub mod memory;
pub mod page;

pub use memory::{AnonymousBacking, PhysicalBacking};
pub use page::{Page, PageAge, PageType};

use crate::config::RelocationConfig;
use crate::error::{RelocError, Result};
use crate::fatal;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Address range bookkeeping for page placement
struct HeapRanges {
    /// First never-used offset
    top: usize,
    /// Released ranges: offset -> size
    free: BTreeMap<usize, usize>,
}

/// Heap - page allocator for the relocation engine
pub struct Heap {
    config: RelocationConfig,

    backing: Box<dyn PhysicalBacking>,

    ranges: Mutex<HeapRanges>,

    /// Live pages by start offset
    pages: RwLock<BTreeMap<usize, Arc<Page>>>,

    /// Bytes held by allocated pages
    used: AtomicUsize,

    /// Bytes returned through `free_page`
    freed: AtomicUsize,
}

impl Heap {
    /// Create heap with an anonymous reservation of `capacity` bytes
    pub fn new(config: RelocationConfig, capacity: usize) -> Result<Self> {
        let backing = AnonymousBacking::reserve(capacity)?;
        Self::with_backing(config, Box::new(backing))
    }

    /// Create heap over a caller-provided backing
    pub fn with_backing(config: RelocationConfig, backing: Box<dyn PhysicalBacking>) -> Result<Self> {
        config.validate()?;

        if backing.capacity() >= MAX_HEAP_CAPACITY {
            return Err(RelocError::HeapInitialization(format!(
                "capacity {} exceeds the forwarding offset range {}",
                backing.capacity(),
                MAX_HEAP_CAPACITY
            )));
        }

        // Offset 0 stays unused so page starts are never zero
        let first = config.small_page_size;

        Ok(Self {
            config,
            backing,
            ranges: Mutex::new(HeapRanges {
                top: first,
                free: BTreeMap::new(),
            }),
            pages: RwLock::new(BTreeMap::new()),
            used: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &RelocationConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.backing.capacity()
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::Relaxed)
    }

    pub fn committed(&self) -> usize {
        self.backing.committed()
    }

    /// Allocate a Small or Medium page
    ///
    /// Returns `None` when the address space is exhausted or the backing
    /// cannot commit the full page.
    pub fn alloc_page(&self, page_type: PageType, age: PageAge) -> Option<Arc<Page>> {
        let size = self.config.page_size(page_type)?;
        self.alloc_page_of_size(page_type, size, age)
    }

    /// Allocate a Large page holding one object of `size` bytes
    pub fn alloc_large_page(&self, size: usize, age: PageAge) -> Option<Arc<Page>> {
        let granule = self.config.small_page_size;
        let size = size.div_ceil(granule) * granule;
        self.alloc_page_of_size(PageType::Large, size, age)
    }

    fn alloc_page_of_size(&self, page_type: PageType, size: usize, age: PageAge) -> Option<Arc<Page>> {
        let offset = self.reserve_range(size)?;

        let committed = self.backing.commit(offset, size);
        if committed < size {
            log::warn!(
                "Commit shortfall for {} page at {:#x}: {} of {} bytes",
                page_type,
                offset,
                committed,
                size
            );
            self.backing.uncommit(offset, committed);
            self.release_range(offset, size);
            return None;
        }

        if let Err(e) = self.backing.map(self.backing.base() + offset, size, offset) {
            log::warn!("Failed to map {} page at {:#x}: {}", page_type, offset, e);
            self.backing.uncommit(offset, size);
            self.release_range(offset, size);
            return None;
        }

        let shift = self.config.object_alignment_shift(page_type);
        let page = match Page::new(page_type, offset, size, shift, age) {
            Ok(page) => Arc::new(page),
            Err(e) => fatal!("heap produced an invalid page at {:#x}: {}", offset, e),
        };

        self.pages.write().insert(offset, Arc::clone(&page));
        self.used.fetch_add(size, Ordering::Relaxed);

        log::trace!("Allocated {} page at {:#x} ({} bytes)", page_type, offset, size);
        Some(page)
    }

    /// Return a page to the heap
    ///
    /// Invoked once relocation has detached the page from its forwarding.
    pub fn free_page(&self, page: Arc<Page>) {
        let offset = page.start();
        let size = page.size();

        if self.pages.write().remove(&offset).is_none() {
            fatal!("freeing unknown page at {:#x}", offset);
        }

        if let Err(e) = self.backing.unmap(self.backing.base() + offset, size) {
            log::warn!("Failed to unmap page at {:#x}: {}", offset, e);
        }
        self.backing.uncommit(offset, size);
        self.release_range(offset, size);

        self.used.fetch_sub(size, Ordering::Relaxed);
        self.freed.fetch_add(size, Ordering::Relaxed);

        log::trace!("Freed {} page at {:#x}", page.page_type(), offset);
    }

    fn reserve_range(&self, size: usize) -> Option<usize> {
        let mut ranges = self.ranges.lock();

        let reused = ranges
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&start, &len)| (start, len));

        if let Some((start, len)) = reused {
            ranges.free.remove(&start);
            if len > size {
                ranges.free.insert(start + size, len - size);
            }
            return Some(start);
        }

        let start = ranges.top;
        let end = start.checked_add(size)?;
        if end > self.backing.capacity() {
            return None;
        }
        ranges.top = end;
        Some(start)
    }

    /// Return a range, merging it with free neighbours
    fn release_range(&self, offset: usize, size: usize) {
        let mut ranges = self.ranges.lock();
        let mut start = offset;
        let mut end = offset + size;

        let prev = ranges
            .free
            .range(..start)
            .next_back()
            .map(|(&s, &len)| (s, len));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                ranges.free.remove(&prev_start);
                start = prev_start;
            }
        }

        if let Some(next_len) = ranges.free.remove(&end) {
            end += next_len;
        }

        if end == ranges.top {
            ranges.top = start;
        } else {
            ranges.free.insert(start, end - start);
        }
    }

    /// Page containing a heap offset
    pub fn page_containing(&self, addr: usize) -> Option<Arc<Page>> {
        let pages = self.pages.read();
        pages
            .range(..=addr)
            .next_back()
            .filter(|(_, page)| page.is_in(addr))
            .map(|(_, page)| Arc::clone(page))
    }

    /// Number of allocated pages
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    fn check_range(&self, addr: usize, len: usize) -> Result<()> {
        match addr.checked_add(len) {
            Some(end) if addr != 0 && end <= self.backing.capacity() => Ok(()),
            _ => Err(RelocError::InvalidPointer { address: addr }),
        }
    }

    /// Real memory address of a heap offset
    pub fn address(&self, addr: usize) -> Result<*mut u8> {
        self.check_range(addr, 0)?;
        Ok((self.backing.base() + addr) as *mut u8)
    }

    /// Write bytes at a heap offset
    pub fn write_bytes(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(addr, bytes.len())?;
        // SAFETY: range checked against the reservation above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (self.backing.base() + addr) as *mut u8,
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Read bytes at a heap offset
    pub fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(addr, len)?;
        let mut buf = vec![0u8; len];
        // SAFETY: range checked against the reservation above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (self.backing.base() + addr) as *const u8,
                buf.as_mut_ptr(),
                len,
            );
        }
        Ok(buf)
    }

    /// Copy an object to a non-overlapping destination
    pub fn copy_object_disjoint(&self, from: usize, to: usize, size: usize) {
        self.check_copy(from, to, size);
        // SAFETY: both ranges lie inside the reservation; the caller owns the
        // destination allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (self.backing.base() + from) as *const u8,
                (self.backing.base() + to) as *mut u8,
                size,
            );
        }
    }

    /// Copy an object to a possibly overlapping destination
    ///
    /// Used by in-place relocation when an object slides over itself.
    pub fn copy_object_conjoint(&self, from: usize, to: usize, size: usize) {
        self.check_copy(from, to, size);
        // SAFETY: both ranges lie inside the reservation; `copy` handles
        // overlap.
        unsafe {
            std::ptr::copy(
                (self.backing.base() + from) as *const u8,
                (self.backing.base() + to) as *mut u8,
                size,
            );
        }
    }

    fn check_copy(&self, from: usize, to: usize, size: usize) {
        if self.check_range(from, size).is_err() || self.check_range(to, size).is_err() {
            fatal!(
                "object copy {:#x} -> {:#x} ({} bytes) outside the heap",
                from,
                to,
                size
            );
        }
    }
}

/// Forwarding entries hold 45-bit heap offsets
pub const MAX_HEAP_CAPACITY: usize = 1 << 45;
