//! Concurrent Relocation Tests - Workers Racing Mutators
//!
//! These tests run relocation workers while mutator threads hit the barrier
//! slow path on the same objects:
//! - Exactly one copy of each object wins
//! - Contents survive relocation, in place or not
//! - Stalled mutators are served by the workers
//! - The worker rendezvous really stops progress

mod common;

use common::{assert_no_overlap, assert_relocated, install, HeapFixture, LiveObject, KB, MB};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use zreloc::{PageType, Relocate, RelocationSet};

/// Live objects that ended up in the relocation set
fn selected_objects(set: &RelocationSet, live: Vec<LiveObject>) -> Vec<LiveObject> {
    live.into_iter()
        .filter(|object| set.forwarding_for(object.addr).is_some())
        .collect()
}

/// Call the barrier slow path on every object in a shuffled order
fn mutate(relocate: &Relocate, set: &RelocationSet, objects: &[LiveObject], seed: u64) -> Vec<(usize, usize)> {
    let mut order: Vec<&LiveObject> = objects.iter().collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    order
        .into_iter()
        .map(|object| {
            let forwarding = set.forwarding_for(object.addr).expect("forwarding");
            (object.addr, relocate.relocate_object(forwarding, object.addr))
        })
        .collect()
}

/// ============================================================================
/// WORKERS AND MUTATORS
/// ============================================================================

/// Mutators and workers relocate the same pages at the same time
///
/// **Invariant verified:** Every caller sees the same to-address for an
/// object, and each object is copied exactly once
#[test]
fn test_workers_and_mutators_agree_on_forwarding() {
    // Arrange - 32 pages, half of each page dead
    let mut fixture = HeapFixture::new(4, 64 * MB);
    let mut pages = Vec::new();
    let mut live = Vec::new();
    for _ in 0..32 {
        let (page, objects) = fixture.populate(PageType::Small, 256, 64, 2);
        pages.push(page);
        live.extend(objects);
    }

    let heap = Arc::clone(&fixture.heap);
    let set = install(&heap, &pages);
    assert!(!set.is_empty());
    let objects = selected_objects(&set, live);

    let relocate = Relocate::new(Arc::clone(&heap));
    let mutator_count = 4;
    let barrier = Barrier::new(mutator_count + 1);

    // Act - mutators and the relocation phase start together
    let observed: Vec<Vec<(usize, usize)>> = thread::scope(|s| {
        let mutators: Vec<_> = (0..mutator_count)
            .map(|i| {
                let (relocate, set, objects, barrier) = (&relocate, &set, &objects, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    mutate(relocate, set, objects, i as u64)
                })
            })
            .collect();

        barrier.wait();
        relocate.relocate(&set);

        mutators
            .into_iter()
            .map(|handle| handle.join().expect("mutator should not panic"))
            .collect()
    });

    // Assert
    assert_relocated(&heap, &relocate, &set, &objects);
    assert_no_overlap(&relocate, &set, &objects);

    for results in &observed {
        for &(from_addr, to_addr) in results {
            let forwarding = set.forwarding_for(from_addr).expect("forwarding");
            assert_eq!(relocate.forward_object(forwarding, from_addr), to_addr);
        }
    }

    let stats = relocate.stats();
    assert_eq!(stats.objects_relocated(), objects.len() as u64);
    assert_eq!(stats.pages_relocated, set.len() as u64);
    assert_eq!(stats.pages_in_place, 0);

    set.forwardings()
        .iter()
        .for_each(|forwarding| assert_eq!(forwarding.ref_count(), 0));
}

/// ============================================================================
/// IN-PLACE RELOCATION
/// ============================================================================

/// Relocation with no free memory compacts pages into themselves
///
/// **Invariant verified:** In-place relocation preserves contents and never
/// lets two objects overlap, even with mutators stalling on the pages
#[test]
fn test_in_place_relocation_with_stalled_mutators() {
    // Arrange - four pages use all of the physical memory
    let mut fixture = HeapFixture::with_commit_limit(2, 16 * MB, 256 * KB);
    let mut pages = Vec::new();
    let mut live = Vec::new();
    for _ in 0..4 {
        let (page, objects) = fixture.populate(PageType::Small, 512, 64, 2);
        pages.push(page);
        live.extend(objects);
    }

    let heap = Arc::clone(&fixture.heap);
    let set = install(&heap, &pages);
    assert!(set.len() >= 2);
    let objects = selected_objects(&set, live);

    let relocate = Relocate::new(Arc::clone(&heap));
    let barrier = Barrier::new(3);

    // Act
    let observed: Vec<Vec<(usize, usize)>> = thread::scope(|s| {
        let mutators: Vec<_> = (0..2)
            .map(|i| {
                let (relocate, set, objects, barrier) = (&relocate, &set, &objects, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    mutate(relocate, set, objects, 100 + i as u64)
                })
            })
            .collect();

        barrier.wait();
        relocate.relocate(&set);

        mutators
            .into_iter()
            .map(|handle| handle.join().expect("mutator should not panic"))
            .collect()
    });

    // Assert
    assert_relocated(&heap, &relocate, &set, &objects);
    assert_no_overlap(&relocate, &set, &objects);
    for results in &observed {
        for &(from_addr, to_addr) in results {
            let forwarding = set.forwarding_for(from_addr).expect("forwarding");
            assert_eq!(relocate.forward_object(forwarding, from_addr), to_addr);
        }
    }

    let stats = relocate.stats();
    assert!(stats.pages_in_place >= 1);
    assert_eq!(stats.pages_relocated, set.len() as u64);
    assert_eq!(stats.objects_relocated(), objects.len() as u64);
}

/// A mutator that cannot allocate waits for a worker to finish its page
///
/// **Invariant verified:** add-and-wait returns only once the page is done,
/// and the mutator then sees the worker's copy
#[test]
fn test_stalled_mutator_served_by_worker() {
    // Arrange - heap full before relocation starts
    let mut fixture = HeapFixture::with_commit_limit(1, 16 * MB, 128 * KB);
    let (a, live_a) = fixture.populate(PageType::Small, 256, 128, 2);
    let (b, live_b) = fixture.populate(PageType::Small, 256, 128, 3);

    let heap = Arc::clone(&fixture.heap);
    let set = install(&heap, &[a, b]);
    assert_eq!(set.len(), 2);

    let relocate = Relocate::new(Arc::clone(&heap));
    let target = live_a[1].clone();

    // Act
    let to_addr = thread::scope(|s| {
        let mutator = s.spawn(|| {
            let forwarding = set.forwarding_for(target.addr).expect("forwarding");
            relocate.relocate_object(forwarding, target.addr)
        });

        // The mutator parks in the relocate queue
        while relocate.queue().pending() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!set.forwarding_for(target.addr).expect("forwarding").is_done());

        relocate.relocate(&set);
        mutator.join().expect("mutator should not panic")
    });

    // Assert
    let forwarding = set.forwarding_for(target.addr).expect("forwarding");
    assert!(forwarding.is_done());
    assert_eq!(relocate.forward_object(forwarding, target.addr), to_addr);
    assert_eq!(heap.read_bytes(to_addr, target.bytes.len()).unwrap(), target.bytes);

    assert_relocated(&heap, &relocate, &set, &live_a);
    assert_relocated(&heap, &relocate, &set, &live_b);

    let stats = relocate.stats();
    assert!(stats.stalls >= 1);
    assert_eq!(stats.mutator_objects, 0);
    assert_eq!(relocate.queue().pending(), 0);
}

/// ============================================================================
/// RENDEZVOUS
/// ============================================================================

/// Synchronizing the workers freezes relocation progress
///
/// **Invariant verified:** While synchronized no forwarding completes;
/// after desynchronizing the phase runs to completion
#[test]
fn test_synchronize_stops_progress() {
    // Arrange
    let mut fixture = HeapFixture::new(2, 64 * MB);
    let mut pages = Vec::new();
    let mut live = Vec::new();
    for _ in 0..64 {
        let (page, objects) = fixture.populate(PageType::Small, 512, 64, 4);
        pages.push(page);
        live.extend(objects);
    }

    let heap = Arc::clone(&fixture.heap);
    let set = install(&heap, &pages);
    let objects = selected_objects(&set, live);
    let relocate = Relocate::new(Arc::clone(&heap));

    let done = |set: &RelocationSet| set.forwardings().iter().filter(|f| f.is_done()).count();

    // Act
    thread::scope(|s| {
        let phase = s.spawn(|| relocate.relocate(&set));

        relocate.synchronize();
        let frozen = done(&set);
        thread::sleep(Duration::from_millis(20));

        // Assert - no page finished while parked
        assert_eq!(done(&set), frozen);

        relocate.desynchronize();
        phase.join().expect("relocation thread should not panic");
    });

    assert_eq!(done(&set), set.len());
    assert_relocated(&heap, &relocate, &set, &objects);
    assert!(!relocate.queue().is_synchronized());
}

/// ============================================================================
/// MEDIUM PAGES
/// ============================================================================

/// Medium pages relocate through the shared target pages
///
/// **Invariant verified:** Medium and Small pages of one set are evacuated
/// together without corrupting each other
#[test]
fn test_mixed_medium_and_small_pages() {
    // Arrange
    let mut fixture = HeapFixture::new(3, 64 * MB);
    let mut pages = Vec::new();
    let mut live = Vec::new();
    for _ in 0..4 {
        let (page, objects) = fixture.populate(PageType::Medium, 512, 512, 3);
        pages.push(page);
        live.extend(objects);

        let (page, objects) = fixture.populate(PageType::Small, 256, 64, 3);
        pages.push(page);
        live.extend(objects);
    }

    let heap = Arc::clone(&fixture.heap);
    let set = install(&heap, &pages);
    assert!(!set.medium_forwardings().is_empty());
    assert!(!set.small_forwardings().is_empty());
    let objects = selected_objects(&set, live);

    // Act
    let relocate = Relocate::new(Arc::clone(&heap));
    relocate.relocate(&set);

    // Assert
    assert_relocated(&heap, &relocate, &set, &objects);
    assert_no_overlap(&relocate, &set, &objects);
    for forwarding in set.medium_forwardings() {
        let object = objects
            .iter()
            .find(|object| forwarding.page().is_in(object.addr))
            .expect("medium page has live objects");
        let to_addr = relocate.forward_object(forwarding, object.addr);
        let target = heap.page_containing(to_addr).expect("target page");
        assert_eq!(target.page_type(), PageType::Medium);
    }
}
