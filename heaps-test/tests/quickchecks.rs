//! Property-based fuzzing over randomized alloc/free sequences, the same
//! shape as the teacher's `quickchecks_0`..`quickchecks_7` battery
//! (`examples/rustwasm-wee_alloc/test/tests/global.rs` and
//! `test/src/lib.rs`'s `run_quickchecks!` macro), adapted to this crate's
//! `Operations` harness and the invariants in spec §8.1.

use memheap_test::Operations;
use quickcheck::QuickCheck;

#[test]
fn variable_heap_invariants_hold_under_random_churn() {
    fn prop(ops: Operations) -> bool {
        ops.run_against_variable_heap();
        true
    }
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop as fn(Operations) -> bool);
}

#[test]
fn tracking_heap_live_count_matches_unmatched_allocs() {
    fn prop(ops: Operations) -> bool {
        ops.run_against_tracking_heap();
        true
    }
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop as fn(Operations) -> bool);
}
