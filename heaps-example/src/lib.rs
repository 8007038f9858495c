//! Embedding patterns for `memheap`'s three allocators. This crate is not
//! part of the allocator's public contract (spec §6.5 names no CLI
//! surface); it exists purely to show how a caller wires up a region and
//! drives each backend through its lifecycle.

use memheap::{FixedHeap, Heap, Stats, TrackingHeap, VariableHeap};

/// A fixed-size node pool, the typical use for the FSA: many
/// equal-sized objects (here, 32-byte slots) allocated and freed at a
/// high rate with no fragmentation bookkeeping.
///
/// ```
/// let pool = memheap_example::node_pool_demo();
/// assert_eq!(pool, 0);
/// ```
pub fn node_pool_demo() -> usize {
    const SLOT_SIZE: usize = 32;
    const SLOT_COUNT: usize = 64;

    let mut region = vec![0u8; FixedHeap::region_length_for(SLOT_SIZE, SLOT_COUNT)];
    let fsa = FixedHeap::new();
    let heap = fsa.init(&mut region, SLOT_SIZE, None).expect("region sized for SLOT_COUNT slots");

    let mut nodes = Vec::new();
    for _ in 0..SLOT_COUNT {
        if let Some(p) = heap.alloc(SLOT_SIZE) {
            nodes.push(p);
        }
    }
    for p in nodes.drain(..) {
        unsafe { heap.free(Some(p)) };
    }

    let remaining = heap.count();
    heap.end(None);
    remaining
}

/// A general-purpose sub-allocator over a scratch buffer, the typical
/// use for the VSA: mixed-size, unpredictable-lifetime allocations that
/// benefit from best-fit placement and coalescing.
///
/// ```
/// let survived_leak_check = memheap_example::scratch_arena_demo();
/// assert!(survived_leak_check);
/// ```
pub fn scratch_arena_demo() -> bool {
    let mut region = vec![0u8; 16 * 1024];
    let vsa = VariableHeap::new();
    let heap = vsa.init(&mut region, None).expect("16 KiB holds at least one header");

    let a = heap.alloc(128).expect("scratch arena has room for a 128-byte block");
    let b = heap.alloc(256).expect("scratch arena has room for a 256-byte block");
    unsafe { heap.free(Some(a)) };
    let c = heap.alloc(64).expect("the freed 128-byte block can satisfy a smaller request");

    unsafe {
        heap.free(Some(b));
        heap.free(Some(c));
    }

    let mut stats = Stats::default();
    let region_base = heap.end(Some(&mut stats));
    stats.count == 0 && region_base.is_some()
}

/// Forwarding to the platform allocator with leak tracking, the typical
/// use for the TSA: a subsystem whose allocations should be tagged and
/// accounted for separately from the rest of the process, with a leak
/// report if it is torn down without freeing everything.
///
/// ```
/// let leaked = memheap_example::tracked_subsystem_demo();
/// assert_eq!(leaked, 1);
/// ```
pub fn tracked_subsystem_demo() -> usize {
    let tsa = TrackingHeap::new();
    let heap = tsa.init(None);

    let _kept = heap.alloc(64).expect("platform allocator has room for 64 bytes");
    let transient = heap.alloc(64).expect("platform allocator has room for 64 bytes");
    unsafe { heap.free(Some(transient)) };

    let mut stats = Stats::default();
    heap.end(Some(&mut stats));
    stats.count
}
