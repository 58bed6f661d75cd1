//! Physical Memory Backing
//!
//! The relocation engine never touches the OS directly. Pages get their
//! memory through a [`PhysicalBacking`], which commits and uncommits
//! physical memory for heap offsets and maps them into the heap view.
//!
//! ```text
//! Reserve ──► Commit ──► Map ──► Use ──► Unmap ──► Uncommit
//!    │          │                                     │
//!    │          └── may fall short (commit limit)     └── madvise(MADV_DONTNEED)
//!    └── anonymous mapping (memmap2)
//! ```
//!
//! [`AnonymousBacking`] reserves one anonymous mapping and uses it as an
//! identity view: heap offset `o` lives at `base + o`.

use crate::error::{RelocError, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Physical memory provider for heap pages
pub trait PhysicalBacking: Send + Sync {
    /// Virtual address of heap offset 0
    fn base(&self) -> usize;

    /// Reserved bytes
    fn capacity(&self) -> usize;

    /// Commit physical memory for `[offset, offset + len)`
    ///
    /// Returns the number of bytes committed from `offset`, which is less
    /// than `len` on a shortfall.
    fn commit(&self, offset: usize, len: usize) -> usize;

    /// Return physical memory for `[offset, offset + len)`
    ///
    /// Returns the number of bytes uncommitted.
    fn uncommit(&self, offset: usize, len: usize) -> usize;

    /// Make committed memory at `offset` visible at virtual address `addr`
    fn map(&self, addr: usize, size: usize, offset: usize) -> Result<()>;

    /// Remove the view at `addr`
    fn unmap(&self, addr: usize, size: usize) -> Result<()>;

    /// Total committed bytes
    fn committed(&self) -> usize;
}

/// Anonymous-mapping backing with optional commit limit
pub struct AnonymousBacking {
    /// Keeps the reservation alive
    _mmap: MmapMut,

    base: usize,

    capacity: usize,

    committed: AtomicUsize,

    /// Maximum committed bytes; commits beyond this fall short
    commit_limit: usize,

    /// Active views: addr -> size
    mappings: Mutex<BTreeMap<usize, usize>>,
}

impl AnonymousBacking {
    /// Reserve `capacity` bytes (rounded up to the OS page size)
    pub fn reserve(capacity: usize) -> Result<Self> {
        Self::with_commit_limit(capacity, usize::MAX)
    }

    /// Reserve `capacity` bytes and never commit more than `commit_limit`
    pub fn with_commit_limit(capacity: usize, commit_limit: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RelocError::HeapInitialization(
                "capacity must be greater than 0".to_string(),
            ));
        }

        let os_page = page_size::get();
        let capacity = capacity.div_ceil(os_page) * os_page;

        let mut mmap = MmapOptions::new().len(capacity).map_anon().map_err(|e| {
            RelocError::HeapInitialization(format!(
                "Failed to reserve {} bytes: {}",
                capacity, e
            ))
        })?;

        let base = mmap.as_mut_ptr() as usize;

        Ok(Self {
            _mmap: mmap,
            base,
            capacity,
            committed: AtomicUsize::new(0),
            commit_limit,
            mappings: Mutex::new(BTreeMap::new()),
        })
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(RelocError::VirtualMemory(format!(
                "range offset={:#x} len={} exceeds reserved size {}",
                offset, len, self.capacity
            ))),
        }
    }

    #[cfg(unix)]
    fn discard(&self, offset: usize, len: usize) {
        let os_page = page_size::get();
        if offset % os_page != 0 || len % os_page != 0 {
            return;
        }

        // SAFETY: the range lies inside our own anonymous mapping.
        let ret = unsafe {
            libc::madvise(
                (self.base + offset) as *mut libc::c_void,
                len,
                libc::MADV_DONTNEED,
            )
        };
        if ret != 0 {
            log::warn!(
                "madvise(MADV_DONTNEED) failed for offset={:#x} len={}",
                offset,
                len
            );
        }
    }

    #[cfg(not(unix))]
    fn discard(&self, offset: usize, len: usize) {
        // SAFETY: the range lies inside our own anonymous mapping.
        unsafe {
            std::ptr::write_bytes((self.base + offset) as *mut u8, 0, len);
        }
    }
}

impl PhysicalBacking for AnonymousBacking {
    fn base(&self) -> usize {
        self.base
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn commit(&self, offset: usize, len: usize) -> usize {
        if self.check_range(offset, len).is_err() {
            return 0;
        }

        let mut current = self.committed.load(Ordering::Relaxed);
        loop {
            let available = self.commit_limit.saturating_sub(current);
            let granted = len.min(available);
            if granted == 0 {
                return 0;
            }

            match self.committed.compare_exchange_weak(
                current,
                current + granted,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    fn uncommit(&self, offset: usize, len: usize) -> usize {
        if len == 0 || self.check_range(offset, len).is_err() {
            return 0;
        }

        self.discard(offset, len);
        self.committed.fetch_sub(len, Ordering::AcqRel);
        len
    }

    fn map(&self, addr: usize, size: usize, offset: usize) -> Result<()> {
        self.check_range(offset, size)?;

        if addr != self.base + offset {
            return Err(RelocError::VirtualMemory(format!(
                "identity view expects {:#x} for offset {:#x}, got {:#x}",
                self.base + offset,
                offset,
                addr
            )));
        }

        let mut mappings = self.mappings.lock();
        let overlaps = mappings
            .range(..addr + size)
            .next_back()
            .is_some_and(|(&start, &len)| start + len > addr);
        if overlaps {
            return Err(RelocError::VirtualMemory(format!(
                "mapping {:#x}+{} overlaps an existing view",
                addr, size
            )));
        }

        mappings.insert(addr, size);
        Ok(())
    }

    fn unmap(&self, addr: usize, size: usize) -> Result<()> {
        let mut mappings = self.mappings.lock();
        match mappings.get(&addr) {
            Some(&len) if len == size => {
                mappings.remove(&addr);
                Ok(())
            }
            _ => Err(RelocError::VirtualMemory(format!(
                "no view of {} bytes at {:#x}",
                size, addr
            ))),
        }
    }

    fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }
}
