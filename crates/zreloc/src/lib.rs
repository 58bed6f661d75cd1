//! # zreloc - Concurrent Page Relocation
//!
//! zreloc is the evacuation engine of a region-based, low-pause garbage
//! collector. After marking, it picks the pages worth compacting, builds a
//! forwarding table per page and moves the live objects while mutator
//! threads keep running.
//!
//! ## Overview
//!
//! - **Relocation Set Selection**: Pages with enough garbage become
//!   candidates; a greedy walk over candidates sorted by live bytes keeps the
//!   prefix that actually frees memory
//! - **Forwarding Tables**: Lock-free open-addressing tables, one per page,
//!   map old object addresses to new ones
//! - **Concurrent Relocation**: Worker threads and mutator barriers race to
//!   copy objects; exactly one copy wins
//! - **In-Place Relocation**: When no target page can be allocated a page is
//!   compacted into itself, so relocation always makes progress
//! - **Relocate Queue**: Stalled mutators hand their page to the workers and
//!   wait for it to finish
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use zreloc::{
//!     Heap, PageAge, PageType, Relocate, RelocationConfig, RelocationSet,
//!     RelocationSetSelector,
//! };
//!
//! fn main() -> zreloc::Result<()> {
//!     let heap = Arc::new(Heap::new(RelocationConfig::default(), 64 * 1024 * 1024)?);
//!
//!     // Two mostly-dead pages with one live object each
//!     let mut selector = RelocationSetSelector::new(heap.config());
//!     let mut live = Vec::new();
//!     for _ in 0..2 {
//!         let page = heap
//!             .alloc_page(PageType::Small, PageAge::Eden)
//!             .expect("heap has room");
//!         let addr = page.alloc_object(64).expect("page has room");
//!         heap.write_bytes(addr, &[7u8; 64])?;
//!         page.mark_object(addr, 64);
//!         live.push(addr);
//!         selector.register_live_page(page);
//!     }
//!     selector.select();
//!
//!     let mut set = RelocationSet::new(heap.config().tenuring_threshold);
//!     set.install(&selector);
//!
//!     let relocate = Relocate::new(Arc::clone(&heap));
//!     relocate.relocate(&set);
//!
//!     for addr in live {
//!         let forwarding = set.forwarding_for(addr).expect("page was selected");
//!         let moved = relocate.forward_object(forwarding, addr);
//!         assert_eq!(heap.read_bytes(moved, 64)?, vec![7u8; 64]);
//!     }
//!
//!     set.reset();
//!     Ok(())
//! }
//! ```
//!
//! ## Relocation Phases
//!
//! 1. **Select** (concurrent): register live pages, sort candidates, pick the
//!    relocation set
//! 2. **Install** (pause): allocate forwardings, age the pages left behind
//! 3. **Relocate** (concurrent): workers evacuate pages, barriers call
//!    [`Relocate::relocate_object`]
//! 4. **Reset** (pause): drop forwardings; every page must be done
//!
//! ## Forwarding Entry Layout
//!
//! ```text
//! 64-bit entry:
//! ┌──────────────────────┬──────────────────────────────────────┬───┐
//! │  from_index (18)     │           to_offset (45)             │ P │
//! │  63-46               │             45-1                     │ 0 │
//! └──────────────────────┴──────────────────────────────────────┴───┘
//! ```
//!
//! An all-zero word is an empty slot.
//!
//! ## Thread Safety
//!
//! - `Relocate`, `RelocationSet` and `Heap` are `Send + Sync`
//! - Forwarding lookups are wait-free; inserts are a single CAS
//! - Broken invariants (double release, missing forwarding) abort the
//!   process through [`fatal!`]

pub mod config;
pub mod error;
pub mod heap;
pub mod logging;
pub mod relocate;
pub mod stats;
pub mod workers;

pub use config::{ConfigError, RelocationConfig};
pub use error::{RelocError, Result};
pub use heap::{AnonymousBacking, Heap, Page, PageAge, PageType, PhysicalBacking};
pub use relocate::{
    Forwarding, ForwardingTable, Relocate, RelocateQueue, RelocationSet, RelocationSetSelector,
};
pub use stats::RelocationSummary;
pub use workers::WorkerPool;

#[doc(hidden)]
pub use log;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
