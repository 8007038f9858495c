//! The protection adapter (spec §4.B): a thin scoped lock/unlock wrapper
//! around a caller-supplied mutual-exclusion primitive.
//!
//! Grounded in the teacher's `imp_unix::Exclusive`/`imp_static_array::Exclusive`,
//! which wrap a lock acquisition, a call into user code, and a release. The
//! difference here is that the lock primitive itself is part of the public
//! contract (spec §1: "The core consumes a pair `{lock, unlock}`") rather
//! than an internal OS mutex, and release must happen on every exit path —
//! including an early return through failed validation, or a panic — so we
//! use a `Drop`-based scope guard (spec §9, "Use the language's scope-guard
//! mechanism") instead of the teacher's straight-line lock/call/unlock.

/// A `lock`/`unlock` pair supplied by the caller. Construct via
/// [`Protection::new`], which enforces spec §4.B's "both present or both
/// absent" rule.
#[derive(Clone, Copy)]
pub struct Protection {
    lock: unsafe fn(),
    unlock: unsafe fn(),
}

#[inline]
unsafe fn noop() {}

impl Protection {
    /// No protection: both slots are no-ops, removing a branch from the hot
    /// path (spec §4.B).
    pub const NONE: Protection = Protection {
        lock: noop,
        unlock: noop,
    };

    /// Build a protection pair from caller-supplied `lock`/`unlock`
    /// functions. Returns `None` if exactly one of the pair is supplied —
    /// "a half-populated pair fails initialization" (spec §4.B).
    pub fn new(lock: Option<unsafe fn()>, unlock: Option<unsafe fn()>) -> Option<Protection> {
        match (lock, unlock) {
            (Some(lock), Some(unlock)) => Some(Protection { lock, unlock }),
            (None, None) => Some(Protection::NONE),
            _ => None,
        }
    }

    /// Acquire `lock`, run `f`, and release `unlock` on every exit path —
    /// including an early return out of `f` or a panic unwinding through
    /// it. Not reentrant; reentrancy, if desired, must come from the
    /// caller's mutex (spec §4.B).
    #[inline]
    pub(crate) fn guarded<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        struct Guard(unsafe fn());

        impl Drop for Guard {
            #[inline]
            fn drop(&mut self) {
                unsafe { (self.0)() }
            }
        }

        unsafe { (self.lock)() };
        let _guard = Guard(self.unlock);
        f()
    }
}

impl Default for Protection {
    fn default() -> Self {
        Protection::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    // Plain statics rather than `std::thread_local!`: this crate is
    // `no_std` by default and these tests must compile without the `std`
    // feature enabled. Each test that needs call-counting gets its own
    // pair so tests running concurrently never share state.
    macro_rules! counting_pair {
        ($lock_fn:ident, $unlock_fn:ident, $lock_calls:ident, $unlock_calls:ident) => {
            static $lock_calls: AtomicU32 = AtomicU32::new(0);
            static $unlock_calls: AtomicU32 = AtomicU32::new(0);

            unsafe fn $lock_fn() {
                $lock_calls.fetch_add(1, Ordering::SeqCst);
            }

            unsafe fn $unlock_fn() {
                $unlock_calls.fetch_add(1, Ordering::SeqCst);
            }
        };
    }

    #[test]
    fn both_absent_is_noop_protection() {
        assert!(Protection::new(None, None).is_some());
    }

    #[test]
    fn half_populated_pair_rejected() {
        counting_pair!(record_lock_a, record_unlock_a, LOCK_CALLS_A, UNLOCK_CALLS_A);
        assert!(Protection::new(Some(record_lock_a), None).is_none());
        assert!(Protection::new(None, Some(record_unlock_a)).is_none());
    }

    #[test]
    fn guarded_locks_and_unlocks_once_each() {
        counting_pair!(record_lock_b, record_unlock_b, LOCK_CALLS_B, UNLOCK_CALLS_B);
        let p = Protection::new(Some(record_lock_b), Some(record_unlock_b)).unwrap();
        let value = p.guarded(|| 7);
        assert_eq!(value, 7);
        assert_eq!(
            (LOCK_CALLS_B.load(Ordering::SeqCst), UNLOCK_CALLS_B.load(Ordering::SeqCst)),
            (1, 1)
        );
    }

    #[test]
    fn guarded_unlocks_even_on_early_return_path() {
        counting_pair!(record_lock_c, record_unlock_c, LOCK_CALLS_C, UNLOCK_CALLS_C);
        let p = Protection::new(Some(record_lock_c), Some(record_unlock_c)).unwrap();
        let value: Option<u32> = p.guarded(|| {
            if true {
                return None;
            }
            Some(1)
        });
        assert_eq!(value, None);
        assert_eq!(
            (LOCK_CALLS_C.load(Ordering::SeqCst), UNLOCK_CALLS_C.load(Ordering::SeqCst)),
            (1, 1)
        );
    }
}
