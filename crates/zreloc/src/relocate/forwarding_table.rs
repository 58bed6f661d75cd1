//! Forwarding Table - Lock-Free Address Mapping During Relocation
//!
//! Per-page open-addressed hash map from a from-space object index to the
//! to-space heap offset the object was copied to.
//!
//! Structure:
//! - Power-of-two array of packed 64-bit entries, linear probing
//! - Slots are single-assignment: empty (all zero) until one CAS fills them
//! - Tables of one relocation cycle share a single entries arena
//!
//! Entry layout:
//! ```text
//!  63              46 45                                        1  0
//! ┌──────────────────┬──────────────────────────────────────────┬───┐
//! │ from_index (18)  │            to_offset (45)                │ P │
//! └──────────────────┴──────────────────────────────────────────┴───┘
//! ```
//!
//! # Memory Ordering
//! - `insert` publishes with an `AcqRel` CAS, so the object copy that
//!   precedes it is visible to every thread that later reads the entry.
//! - `find` reads with `Acquire`.

use crate::fatal;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const POPULATED_BITS: u32 = 1;
const TO_OFFSET_BITS: u32 = 45;
const FROM_INDEX_BITS: u32 = 18;

const TO_OFFSET_SHIFT: u32 = POPULATED_BITS;
const FROM_INDEX_SHIFT: u32 = POPULATED_BITS + TO_OFFSET_BITS;

const TO_OFFSET_MASK: u64 = (1 << TO_OFFSET_BITS) - 1;
const FROM_INDEX_MASK: u64 = (1 << FROM_INDEX_BITS) - 1;

/// Largest object index an entry can hold
pub const MAX_FROM_INDEX: usize = FROM_INDEX_MASK as usize;

/// Largest heap offset an entry can hold
pub const MAX_TO_OFFSET: usize = TO_OFFSET_MASK as usize;

/// Packed forwarding entry
///
/// The all-zero word means "empty"; a populated entry always has bit 0 set,
/// so `(from_index 0, to_offset 0)` remains distinguishable from empty.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ForwardingEntry(u64);

impl ForwardingEntry {
    pub const EMPTY: ForwardingEntry = ForwardingEntry(0);

    pub fn new(from_index: usize, to_offset: usize) -> Self {
        if from_index > MAX_FROM_INDEX || to_offset > MAX_TO_OFFSET {
            fatal!(
                "forwarding entry out of range: from_index={} to_offset={:#x}",
                from_index,
                to_offset
            );
        }

        ForwardingEntry(
            ((from_index as u64) << FROM_INDEX_SHIFT)
                | ((to_offset as u64) << TO_OFFSET_SHIFT)
                | 1,
        )
    }

    #[inline]
    fn from_raw(raw: u64) -> Self {
        ForwardingEntry(raw)
    }

    #[inline]
    fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn populated(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub fn from_index(self) -> usize {
        ((self.0 >> FROM_INDEX_SHIFT) & FROM_INDEX_MASK) as usize
    }

    #[inline]
    pub fn to_offset(self) -> usize {
        ((self.0 >> TO_OFFSET_SHIFT) & TO_OFFSET_MASK) as usize
    }
}

impl fmt::Debug for ForwardingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.populated() {
            write!(f, "ForwardingEntry({} -> {:#x})", self.from_index(), self.to_offset())
        } else {
            write!(f, "ForwardingEntry(empty)")
        }
    }
}

/// Search position left behind by `find_with_cursor`
///
/// Points at the empty slot where the search stopped, so a following
/// `insert_at` does not scan the same slots again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingCursor(usize);

/// Wang 32-bit integer mix
#[inline]
fn hash(key: u32) -> u32 {
    let mut key = key;
    key = (!key).wrapping_add(key << 15);
    key ^= key >> 12;
    key = key.wrapping_add(key << 2);
    key ^= key >> 4;
    key = key.wrapping_mul(2057);
    key ^= key >> 16;
    key
}

/// ForwardingTable - lock-free from-index -> to-offset map
pub struct ForwardingTable {
    /// Shared entries arena
    entries: Arc<[AtomicU64]>,

    /// First slot of this table in the arena
    base: usize,

    /// Table length minus one
    mask: usize,
}

impl ForwardingTable {
    /// Table length for a page with `live_objects` live objects
    ///
    /// Twice the live count rounded up to a power of two, at least 2, which
    /// keeps the load factor at or below one half.
    pub fn nentries_for(live_objects: usize) -> usize {
        live_objects.saturating_mul(2).max(2).next_power_of_two()
    }

    /// Create a table with its own storage
    pub fn new(nentries: usize) -> Self {
        let nentries = nentries.max(2).next_power_of_two();
        let entries: Arc<[AtomicU64]> = (0..nentries).map(|_| AtomicU64::new(0)).collect();
        Self::in_arena(entries, 0, nentries)
    }

    /// Create a table over `arena[base..base + nentries]`
    ///
    /// `nentries` must be a power of two and the slots must be empty.
    pub fn in_arena(arena: Arc<[AtomicU64]>, base: usize, nentries: usize) -> Self {
        if !nentries.is_power_of_two() || base + nentries > arena.len() {
            fatal!(
                "forwarding table slice [{}, {}) invalid for arena of {}",
                base,
                base + nentries,
                arena.len()
            );
        }

        Self {
            entries: arena,
            base,
            mask: nentries - 1,
        }
    }

    /// Number of slots
    pub fn nentries(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicU64 {
        &self.entries[self.base + index]
    }

    #[inline]
    fn load(&self, index: usize) -> ForwardingEntry {
        ForwardingEntry::from_raw(self.slot(index).load(Ordering::Acquire))
    }

    #[inline]
    fn first_index(&self, from_index: usize) -> usize {
        hash(from_index as u32) as usize & self.mask
    }

    #[inline]
    fn next_index(&self, index: usize) -> usize {
        (index + 1) & self.mask
    }

    /// Look up the to-offset of an object
    pub fn find(&self, from_index: usize) -> Option<usize> {
        self.find_with_cursor(from_index).0
    }

    /// Look up the to-offset and return the search position
    ///
    /// On a miss the cursor points at the empty slot that ended the search.
    pub fn find_with_cursor(&self, from_index: usize) -> (Option<usize>, ForwardingCursor) {
        let mut index = self.first_index(from_index);

        for _ in 0..self.nentries() {
            let entry = self.load(index);
            if !entry.populated() {
                return (None, ForwardingCursor(index));
            }
            if entry.from_index() == from_index {
                return (Some(entry.to_offset()), ForwardingCursor(index));
            }
            index = self.next_index(index);
        }

        fatal!(
            "forwarding table full: no slot for from_index {} in {} entries",
            from_index,
            self.nentries()
        );
    }

    /// Record `from_index -> to_offset`
    ///
    /// Returns the to-offset that won. When another thread already forwarded
    /// the same object, its offset is returned and the caller's copy is
    /// garbage.
    pub fn insert(&self, from_index: usize, to_offset: usize) -> usize {
        let cursor = ForwardingCursor(self.first_index(from_index));
        self.insert_at(from_index, to_offset, cursor)
    }

    /// Record `from_index -> to_offset`, probing from `cursor`
    pub fn insert_at(&self, from_index: usize, to_offset: usize, cursor: ForwardingCursor) -> usize {
        let new_entry = ForwardingEntry::new(from_index, to_offset);
        let mut index = cursor.0 & self.mask;

        for _ in 0..self.nentries() {
            match self.slot(index).compare_exchange(
                ForwardingEntry::EMPTY.raw(),
                new_entry.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return to_offset,
                Err(raw) => {
                    let entry = ForwardingEntry::from_raw(raw);
                    if entry.from_index() == from_index {
                        return entry.to_offset();
                    }
                }
            }
            index = self.next_index(index);
        }

        fatal!(
            "forwarding table full: cannot insert from_index {} into {} entries",
            from_index,
            self.nentries()
        );
    }

    /// Populated entries, for verification and statistics
    pub fn populated(&self) -> usize {
        (0..self.nentries())
            .filter(|&i| self.load(i).populated())
            .count()
    }

    /// Populated entries as `(from_index, to_offset)` pairs
    pub fn entries(&self) -> Vec<(usize, usize)> {
        (0..self.nentries())
            .map(|i| self.load(i))
            .filter(|e| e.populated())
            .map(|e| (e.from_index(), e.to_offset()))
            .collect()
    }
}

impl fmt::Debug for ForwardingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingTable")
            .field("base", &self.base)
            .field("nentries", &self.nentries())
            .finish()
    }
}
