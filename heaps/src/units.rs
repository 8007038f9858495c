//! Small rounding helpers built on top of the `memory_units` crate.
//!
//! Every payload size the allocators hand out is rounded up to a multiple
//! of the machine word size (spec §6.3). We reuse `memory_units`'s
//! `Bytes`/`Words`/`RoundUpTo` machinery for the arithmetic rather than
//! hand-rolling it, the same crate the teacher pulls in for an identical
//! purpose in its own `alloc_impl`.

use memory_units::{Bytes, RoundUpTo, Words};

/// Round `n` bytes up to the next whole machine word.
#[inline]
pub(crate) fn round_up_to_word(n: usize) -> usize {
    let words: Words = Bytes(n).round_up_to();
    let bytes: Bytes = words.into();
    bytes.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up() {
        let w = core::mem::size_of::<usize>();
        assert_eq!(round_up_to_word(0), 0);
        assert_eq!(round_up_to_word(1), w);
        assert_eq!(round_up_to_word(w), w);
        assert_eq!(round_up_to_word(w + 1), 2 * w);
    }
}
