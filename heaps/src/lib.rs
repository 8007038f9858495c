/*!

## About

`memheap` is a family of allocators that carve up memory regions supplied
by the caller rather than acquiring their own pages from the operating
system:

- [`FixedHeap`] — a fixed-size-block allocator. Every slot is the same
  size, threaded onto a singly-linked free list: O(1) `alloc`/`free`, no
  fragmentation bookkeeping, no coalescing.
- [`VariableHeap`] — a best-fit, splitting, coalescing allocator over an
  arbitrary region. This is the crate's hard core: every block sits on
  two intrusive doubly-linked lists at once (address order and
  size order), `free` determines which neighbors are themselves free and
  merges them, and `alloc` is best-fit from the smallest end of the free
  list.
- [`TrackingHeap`] — a thin wrapper around the platform allocator
  (`alloc::alloc::{alloc, dealloc}`) that tags every block so a foreign
  or doubly-freed pointer is rejected by one comparison, and reports
  outstanding blocks as a leak when torn down.

All three implement the same [`Heap`] trait, so code that only holds a
`&dyn Heap` cannot know or care which backend it is talking to.

## Design

Every handle starts life cleared (`const fn new()`), is installed over
its region (or, for [`TrackingHeap`], just configured) by `init`, and is
torn down by `end`, which reports any live blocks as a leak, clears the
handle, and hands back the region pointer so the caller can release it.
A handle must not move in memory between `init` and `end`: its identity
tag is the address it was initialized at, and every block it hands out
carries that same tag so cross-heap and foreign pointers are rejected by
a single comparison (see [`interface::Tag`]).

Locking is the caller's concern: `init` takes an optional
[`Protection`] pair, and every mutating entry point acquires it on entry
and releases it on every exit path, including an early return through
failed validation or a panic unwinding through the critical section.

No allocator here panics or returns a `Result` on user error — invalid
handles, wrong sizes, foreign pointers, and double-frees are all
flattened to the operation's neutral failure value (`None`, `0`, or a
silent no-op). The allocator only aborts on an internal invariant
violation, which would indicate corruption rather than caller misuse.

## `cargo` Features

- **logging**: On by default. Routes the one permitted diagnostic —
  the leak warning emitted by `end()` when live blocks remain — through
  the `log` facade.

- **debug-tracking**: On by default. Captures the call site
  (`file:line`) of each allocation via `#[track_caller]` and keeps a
  live-block list so a leak report can dump every surviving block
  individually, not just a count.

- **extra_assertions**: Off by default. Enables extra, expensive
  integrity assertions on internal invariants (e.g. that the VSA's
  allocated-block walk agrees with its running count). Useful when
  debugging the allocator itself, not for production use.

- **std**: Off by default. Enables `std`-only test conveniences and an
  `eprintln`-based diagnostic fallback when `logging` is disabled.

*/

#![no_std]
#![warn(missing_docs)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

#[macro_use]
mod extra_assert;

mod debug;
mod neighbors;
mod units;

pub mod fixed;
pub mod interface;
pub mod protect;
pub mod system;
pub mod variable;

pub use crate::fixed::FixedHeap;
pub use crate::interface::{Heap, Stats};
pub use crate::protect::Protection;
pub use crate::system::TrackingHeap;
pub use crate::variable::VariableHeap;
