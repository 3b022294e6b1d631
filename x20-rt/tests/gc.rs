//! Black-box garbage collector scenarios, exercised only through the
//! public `GcHeap` API, the way an embedder outside this crate would
//! use it.

use std::cell::Cell;
use std::rc::Rc;

use x20_rt::{GcHeap, GcPtr, GlobalsRegion};

/// Allocate 180 words and drop the only reference, allocate 150 words
/// with a finalizer inside a function that returns
/// (dropping that reference too), then a 200-word allocation must
/// succeed — meaning a collection ran and reclaimed both — and the
/// finalizer must have run exactly once.
///
/// Sized so the tail free block left after both allocations (roughly
/// `total - 180 - 150 - 2*HEADER_WORDS` words) is smaller than 200,
/// so satisfying the third allocation is only possible after a
/// collection coalesces the two dead blocks back in.
#[test]
fn gc_reclaims_across_function_return_scenario() {
    let mut heap = GcHeap::new(400, None).expect("valid heap size");

    {
        let _first = heap.allocate(180, None).expect("first allocation fits");
        // _first's only reference is this local, dropped at scope end.
    }

    let finalized = Rc::new(Cell::new(0u32));

    fn allocate_with_finalizer(heap: &mut GcHeap, finalized: Rc<Cell<u32>>) {
        let _second = heap
            .allocate(150, Some(Box::new(move |_| finalized.set(finalized.get() + 1))))
            .expect("second allocation fits");
        // _second's only reference is this local, dropped on return.
    }
    allocate_with_finalizer(&mut heap, finalized.clone());

    let third = heap.allocate(200, None);
    assert!(
        third.is_ok(),
        "200-word allocation should succeed once the collector reclaims the \
         180- and 150-word blocks whose only references already went out of scope"
    );
    assert_eq!(
        finalized.get(),
        1,
        "the second allocation's finalizer must have run exactly once"
    );
}

/// GC safety: a block kept alive by a registered global slot keeps its
/// contents across a collection forced by exhausting the rest of the
/// arena.
#[test]
fn reachable_block_survives_collection_with_contents_intact() {
    let mut globals = [0u64; 1];
    // SAFETY: `globals` outlives `heap` (declared first, dropped last).
    let region = GlobalsRegion::of_words(&globals);
    let mut heap = GcHeap::new(300, Some(region)).expect("valid heap size");

    let kept = heap.allocate(4, None).expect("allocation fits");
    unsafe {
        heap.write(kept, 0, 0xCAFE_u64);
        heap.write(kept, 1, 0xBABE_u64);
    }
    globals[0] = kept.addr();

    // Exhaust the rest of the arena with throwaway allocations, none of
    // which are rooted anywhere, forcing at least one collection.
    for _ in 0..40 {
        if heap.allocate(6, None).is_err() {
            break;
        }
    }

    unsafe {
        assert_eq!(heap.read(kept, 0), 0xCAFE_u64);
        assert_eq!(heap.read(kept, 1), 0xBABE_u64);
    }
}

/// A block reachable only by being linked from another live block (heap-
/// to-heap marking) survives a collection the same way a globally or
/// stack-rooted one does.
#[test]
fn block_reachable_only_through_another_block_survives_collection() {
    let mut globals = [0u64; 1];
    let region = GlobalsRegion::of_words(&globals);
    let mut heap = GcHeap::new(300, Some(region)).expect("valid heap size");

    let child = heap.allocate(4, None).expect("child allocation fits");
    unsafe { heap.write(child, 0, 0x1234_u64) };

    let parent = heap.allocate(4, None).expect("parent allocation fits");
    unsafe { heap.write(parent, 0, child.addr()) };
    globals[0] = parent.addr();

    for _ in 0..40 {
        if heap.allocate(6, None).is_err() {
            break;
        }
    }

    let child_addr = unsafe { heap.read(parent, 0) };
    assert_eq!(child_addr, child.addr(), "parent's link to child must survive");
    assert_eq!(unsafe { heap.read(child, 0) }, 0x1234_u64);
}

/// An unrooted block with a finalizer is collected at most once even
/// across several further allocations (finalizer discipline).
#[test]
fn finalizer_runs_at_most_once_across_repeated_collections() {
    let mut heap = GcHeap::new(120, None).expect("valid heap size");
    let runs = Rc::new(Cell::new(0u32));

    {
        let runs = runs.clone();
        let _discarded = heap
            .allocate(8, Some(Box::new(move |_| runs.set(runs.get() + 1))))
            .expect("allocation fits");
    }

    for _ in 0..30 {
        let _ = heap.allocate(4, None);
    }

    assert!(runs.get() <= 1, "finalizer ran more than once");
}

/// `GcHeap::new` rejects a zero-word request.
#[test]
fn zero_size_heap_is_rejected() {
    assert!(GcHeap::new(0, None).is_err());
}

/// `dump` produces a non-empty diagnostic rendering of the arena.
#[test]
fn dump_reports_allocated_and_free_regions() {
    let mut heap = GcHeap::new(64, None).expect("valid heap size");
    let _block = heap.allocate(10, None).expect("allocation fits");
    let mut out = String::new();
    heap.dump(&mut out).expect("dump succeeds");
    assert!(!out.is_empty());
}

/// Documents the typed handle `GcPtr` carries: its address round-trips
/// through a globals slot the way any conservative root value would.
#[test]
fn gc_ptr_addr_round_trips_through_a_plain_u64_slot() {
    let mut heap = GcHeap::new(64, None).expect("valid heap size");
    let ptr: GcPtr = heap.allocate(4, None).expect("allocation fits");
    let stored = ptr.addr();
    assert_eq!(stored, ptr.addr());
}
