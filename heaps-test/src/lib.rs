//! Randomized alloc/free sequences driven against each backend, checking
//! the invariants from spec §8.1 after every operation. Shaped after the
//! teacher's `Operations`/`Arbitrary` harness (`wee_alloc_test::Operations`
//! in `examples/rustwasm-wee_alloc/test/src/lib.rs`): a sequence of
//! `Alloc`/`Free` operations, generated so that every outstanding
//! allocation is eventually freed, run against a single heap instance.

use memheap::{Heap, Stats, TrackingHeap, VariableHeap};
use quickcheck::{Arbitrary, Gen};

#[derive(Debug, Clone, Copy)]
enum Operation {
    /// Allocate this many bytes.
    Alloc(usize),
    /// Free the n'th allocation made so far, a no-op if already freed.
    Free(usize),
}

use Operation::*;

/// A sequence of `alloc`/`free` operations, quickcheck-generated so that
/// every id allocated is freed by the end of the sequence (possibly more
/// than once, to exercise double-free handling).
#[derive(Debug, Clone)]
pub struct Operations(Vec<Operation>);

impl Arbitrary for Operations {
    fn arbitrary(g: &mut Gen) -> Self {
        let n = g.size().max(8).min(4096);
        let mut active: Vec<usize> = Vec::new();
        let mut next_id = 0usize;
        let mut ops = Vec::with_capacity(n);

        for _ in 0..n {
            let free_biased = !active.is_empty() && u8::arbitrary(g) % 4 == 0;
            if free_biased {
                let idx = usize::arbitrary(g) % active.len();
                ops.push(Free(active.swap_remove(idx)));
            } else {
                // Small sizes by far the most common, an occasional
                // larger one, matching the teacher's weighting towards
                // realistic small-allocation-heavy workloads.
                let size = if u8::arbitrary(g) % 32 == 0 {
                    256 + usize::arbitrary(g) % 1024
                } else {
                    1 + usize::arbitrary(g) % 64
                };
                active.push(next_id);
                next_id += 1;
                ops.push(Alloc(size));
            }
        }

        // Drain whatever is still outstanding so every id is freed at
        // least once.
        while let Some(id) = active.pop() {
            ops.push(Free(id));
        }

        // Occasionally double-free the very first allocation again, to
        // exercise the idempotent-free property directly.
        if let Some(Alloc(_)) = ops.first() {
            if u8::arbitrary(g) % 3 == 0 {
                ops.push(Free(0));
            }
        }

        Operations(ops)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Operations>> {
        let ops = self.0.clone();
        Box::new((0..ops.len()).rev().map(move |i| Operations(ops[..i].to_vec())))
    }
}

/// Bytes given to each `VariableHeap` run. Large enough that most
/// generated workloads fit without exhausting the region, which matters
/// less than exercising split/coalesce/best-fit under churn.
const VARIABLE_REGION_BYTES: usize = 1 << 16;

impl Operations {
    /// Run this sequence against a fresh [`VariableHeap`], asserting the
    /// round-trip, idempotent-free, and restorability properties from
    /// spec §8.1 as it goes. Coalescing, monotonic free order, and count
    /// agreement are enforced internally by the `extra_assertions`
    /// feature, which this crate enables.
    pub fn run_against_variable_heap(self) {
        let mut region = vec![0u8; VARIABLE_REGION_BYTES];
        let region_base = region.as_ptr() as usize;
        let region_len = region.len();

        let vsa = VariableHeap::new();
        let heap = vsa.init(&mut region, None).expect("region large enough to init");
        let initial_max_free = heap.max_free_block();

        let mut live: Vec<Option<(core::ptr::NonNull<u8>, usize)>> = Vec::new();

        for op in self.0 {
            match op {
                Alloc(size) => {
                    let before = heap.count();
                    let ptr = heap.alloc(size);
                    match ptr {
                        Some(p) => {
                            let addr = p.as_ptr() as usize;
                            assert!(
                                addr > region_base && addr + size <= region_base + region_len,
                                "payload pointer must lie strictly inside the region"
                            );
                            assert_eq!(heap.count(), before + 1);
                            live.push(Some((p, size)));
                        }
                        None => {
                            assert_eq!(heap.count(), before, "failed alloc must not mutate state");
                            // Keep `live`'s indices aligned with the ids
                            // `Operations::arbitrary` assigned, even though
                            // this particular allocation never landed.
                            live.push(None);
                        }
                    }
                }
                Free(id) => {
                    if let Some(slot) = live.get_mut(id) {
                        if let Some((p, _)) = slot.take() {
                            let before = heap.count();
                            unsafe { heap.free(Some(p)) };
                            assert_eq!(heap.count(), before - 1);

                            let after_first_free = heap.count();
                            unsafe { heap.free(Some(p)) };
                            assert_eq!(
                                heap.count(),
                                after_first_free,
                                "freeing an already-freed pointer must be a no-op"
                            );
                        }
                    }
                }
            }
        }

        for slot in live.iter_mut() {
            if let Some((p, _)) = slot.take() {
                unsafe { heap.free(Some(p)) };
            }
        }

        assert_eq!(heap.count(), 0);
        assert_eq!(
            heap.max_free_block(),
            initial_max_free,
            "freeing every allocation must restore the single maximal free block"
        );

        let mut stats = Stats::default();
        heap.free_stats(&mut stats);
        assert_eq!(stats.count, 1, "a fully-freed region must coalesce to one free block");
    }

    /// Run this sequence against a fresh [`TrackingHeap`], asserting that
    /// the live count always equals the number of allocs not yet matched
    /// by a free (spec §8.1).
    pub fn run_against_tracking_heap(self) {
        let tsa = TrackingHeap::new();
        let heap = tsa.init(None);

        let mut live: Vec<Option<core::ptr::NonNull<u8>>> = Vec::new();
        let mut expected_live = 0usize;

        for op in self.0 {
            match op {
                Alloc(size) => {
                    if let Some(p) = heap.alloc(size) {
                        live.push(Some(p));
                        expected_live += 1;
                    } else {
                        live.push(None);
                    }
                }
                Free(id) => {
                    if let Some(slot) = live.get_mut(id) {
                        if let Some(p) = slot.take() {
                            unsafe { heap.free(Some(p)) };
                            expected_live -= 1;
                        }
                    }
                }
            }
            assert_eq!(heap.count(), expected_live);
        }

        for slot in live.iter_mut() {
            if let Some(p) = slot.take() {
                unsafe { heap.free(Some(p)) };
            }
        }
        assert_eq!(heap.count(), 0);
    }
}
