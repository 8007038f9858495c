//! The fixed-size-block allocator (FSA) — spec §4.C.
//!
//! Carves a caller-supplied region into equal-sized slots threaded onto a
//! singly-linked free list, giving O(1) alloc/free at the cost of only
//! ever serving exactly one configured slot size. Grounded in
//! `examples/original_source/heaps/xstrhp/src/xtc_strhp.h` (`xsh_node_t`,
//! `XSH_NODE_SIZE`) and, for the idiom of mutating shared state through
//! `&self` via `Cell`, the teacher's `FreeCell`/`CellHeader`
//! (`wee_alloc`'s `lib.rs`).

use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::cell::Cell;

use crate::debug;
use crate::interface::{Heap, Stats, Tag};
use crate::protect::Protection;
use crate::units::round_up_to_word;

#[repr(C)]
struct FsaNode {
    next: Cell<*const FsaNode>,
    allocated: Cell<bool>,
}

/// A fixed-size-block allocator over a caller-supplied memory region.
pub struct FixedHeap<'a> {
    tag: Cell<Tag>,
    region_base: Cell<*mut u8>,
    region_length: Cell<usize>,
    slot_size: Cell<usize>,
    node_size: Cell<usize>,
    node_offset: Cell<usize>,
    free_head: Cell<*const FsaNode>,
    allocated_count: Cell<usize>,
    free_count: Cell<usize>,
    protect: Cell<Protection>,
    _region: PhantomData<&'a mut [u8]>,
}

unsafe impl<'a> Sync for FixedHeap<'a> {}

impl<'a> FixedHeap<'a> {
    /// A cleared handle, suitable for a `static` or stack slot that `init`
    /// will fill in later (spec §3.1's "cleared" state).
    pub const fn new() -> FixedHeap<'a> {
        FixedHeap {
            tag: Cell::new(Tag::NONE),
            region_base: Cell::new(ptr::null_mut()),
            region_length: Cell::new(0),
            slot_size: Cell::new(0),
            node_size: Cell::new(0),
            node_offset: Cell::new(0),
            free_head: Cell::new(ptr::null()),
            allocated_count: Cell::new(0),
            free_count: Cell::new(0),
            protect: Cell::new(Protection::NONE),
            _region: PhantomData,
        }
    }

    /// The region length needed to hold `slot_count` slots of `slot_size`
    /// bytes each, including per-slot header overhead — the Rust
    /// equivalent of the source's `XSH_HEAP_LENGTH` macro
    /// (`examples/original_source/heaps/xstrhp/src/xtc_strhp.h`).
    pub const fn region_length_for(slot_size: usize, slot_count: usize) -> usize {
        (slot_size + mem::size_of::<FsaNode>()) * slot_count
    }

    /// Initialize this handle over `region`, configuring it to serve
    /// allocations of exactly `slot_size` bytes (spec §4.C, §3.5).
    ///
    /// Returns `None` (a `ConfigurationError`, spec §7) if `slot_size` is
    /// zero or if `region` is too small to hold even one slot.
    pub fn init(
        &self,
        region: &'a mut [u8],
        slot_size: usize,
        protect: Option<Protection>,
    ) -> Option<&Self> {
        if slot_size == 0 {
            return None;
        }
        let protect = protect.unwrap_or(Protection::NONE);

        let slot_size = round_up_to_word(slot_size);
        let node_offset = mem::size_of::<FsaNode>();
        let node_size = slot_size + node_offset;
        let region_length = region.len();
        if node_size > region_length {
            return None;
        }

        let region_base = region.as_mut_ptr();
        let slot_count = region_length / node_size;

        self.protect.set(protect);
        self.region_base.set(region_base);
        self.region_length.set(region_length);
        self.slot_size.set(slot_size);
        self.node_size.set(node_size);
        self.node_offset.set(node_offset);
        self.allocated_count.set(0);
        self.free_count.set(slot_count);
        self.free_head.set(ptr::null());

        // Thread every slot in address order into the free list,
        // `free_head` first (spec §4.C).
        unsafe {
            for i in (0..slot_count).rev() {
                let node = region_base.add(i * node_size) as *mut FsaNode;
                ptr::write(
                    node,
                    FsaNode {
                        next: Cell::new(self.free_head.get()),
                        allocated: Cell::new(false),
                    },
                );
                self.free_head.set(node);
            }
        }

        self.tag.set(Tag::of(self));
        Some(self)
    }

    #[inline]
    fn is_valid(&self) -> bool {
        !self.tag.get().is_none() && self.tag.get() == Tag::of(self)
    }

    #[inline]
    unsafe fn node_data(node: *const FsaNode, node_offset: usize) -> *mut u8 {
        (node as *const u8).add(node_offset) as *mut u8
    }
}

impl<'a> Heap for FixedHeap<'a> {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if !self.is_valid() {
            return None;
        }
        // FSA serves exactly one configured slot size (spec §4.A).
        if size != self.slot_size.get() {
            return None;
        }

        self.protect.get().guarded(|| {
            let node = self.free_head.get();
            if node.is_null() {
                return None;
            }
            let node_ref = unsafe { &*node };
            self.free_head.set(node_ref.next.get());
            node_ref.allocated.set(true);
            node_ref.next.set(ptr::null());

            self.allocated_count.set(self.allocated_count.get() + 1);
            self.free_count.set(self.free_count.get() - 1);

            let data = unsafe { Self::node_data(node, self.node_offset.get()) };
            NonNull::new(data)
        })
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        if !self.is_valid() {
            return;
        }
        let ptr = match ptr {
            Some(ptr) => ptr.as_ptr(),
            None => return,
        };

        let region_base = self.region_base.get();
        let region_length = self.region_length.get();
        let node_offset = self.node_offset.get();
        let node_size = self.node_size.get();

        let addr = ptr as usize;
        let base = region_base as usize;
        // Reject anything outside the region, or too close to its start
        // to have a header before it.
        if addr < base || addr - base < node_offset || addr >= base + region_length {
            return;
        }

        let header_addr = addr - node_offset;
        // Catches interior/misaligned pointers: the header must start on
        // a node boundary (spec §4.C step 2).
        if (header_addr - base) % node_size != 0 {
            return;
        }
        if header_addr + node_size > base + region_length {
            return;
        }

        self.protect.get().guarded(|| {
            let node = header_addr as *const FsaNode;
            let node_ref = unsafe { &*node };
            // Catches double-free and frees of already-free slots (spec
            // §4.C step 3).
            if !node_ref.allocated.get() {
                return;
            }

            node_ref.allocated.set(false);
            node_ref.next.set(self.free_head.get());
            self.free_head.set(node);

            self.allocated_count.set(self.allocated_count.get() - 1);
            self.free_count.set(self.free_count.get() + 1);
        });
    }

    fn count(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        self.protect.get().guarded(|| self.allocated_count.get())
    }

    fn end(&self, stats: Option<&mut Stats>) -> Option<NonNull<u8>> {
        if !self.is_valid() {
            return None;
        }

        let (count, slot_size) = self
            .protect
            .get()
            .guarded(|| (self.allocated_count.get(), self.slot_size.get()));

        if let Some(stats) = stats {
            stats.count = count;
            stats.total_size = count * slot_size;
            stats.max_block_size = if count > 0 { slot_size } else { 0 };
        }
        if count > 0 {
            debug::report_leak("FixedHeap", count);
        }

        let base = self.region_base.get();
        self.tag.set(Tag::NONE);
        self.region_base.set(ptr::null_mut());
        self.region_length.set(0);
        self.slot_size.set(0);
        self.node_size.set(0);
        self.node_offset.set(0);
        self.free_head.set(ptr::null());
        self.allocated_count.set(0);
        self.free_count.set(0);

        NonNull::new(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word() -> usize {
        mem::size_of::<usize>()
    }

    #[test]
    fn rejects_zero_slot_size() {
        let fsa = FixedHeap::new();
        let mut region = [0u8; 128];
        assert!(fsa.init(&mut region, 0, None).is_none());
    }

    #[test]
    fn rejects_region_too_small() {
        let fsa = FixedHeap::new();
        let mut region = [0u8; 4];
        assert!(fsa.init(&mut region, 64, None).is_none());
    }

    #[test]
    fn alloc_free_round_trips_and_counts() {
        let fsa = FixedHeap::new();
        let mut region = [0u8; 256];
        let node_size = 16 + word();
        let slot_count = 256 / node_size;
        let heap = fsa.init(&mut region, 16, None).unwrap();

        let mut ptrs = Vec::new();
        for _ in 0..slot_count {
            ptrs.push(heap.alloc(16).expect("slot available"));
        }
        assert!(heap.alloc(16).is_none(), "region should be exhausted");
        assert_eq!(heap.count(), slot_count);

        unsafe { heap.free(Some(ptrs.pop().unwrap())) };
        assert_eq!(heap.count(), slot_count - 1);
        assert!(heap.alloc(16).is_some());
    }

    #[test]
    fn rejects_wrong_size() {
        let fsa = FixedHeap::new();
        let mut region = [0u8; 256];
        let heap = fsa.init(&mut region, 16, None).unwrap();
        assert!(heap.alloc(8).is_none());
        assert!(heap.alloc(32).is_none());
    }

    #[test]
    fn double_free_is_a_no_op() {
        let fsa = FixedHeap::new();
        let mut region = [0u8; 256];
        let heap = fsa.init(&mut region, 16, None).unwrap();
        let p = heap.alloc(16).unwrap();
        unsafe {
            heap.free(Some(p));
            heap.free(Some(p));
        }
        assert_eq!(heap.count(), 0);
    }

    #[test]
    fn foreign_pointer_across_two_fsas_is_a_no_op() {
        let fsa_a = FixedHeap::new();
        let mut region_a = [0u8; 256];
        let heap_a = fsa_a.init(&mut region_a, 16, None).unwrap();

        let fsa_b = FixedHeap::new();
        let mut region_b = [0u8; 256];
        let heap_b = fsa_b.init(&mut region_b, 16, None).unwrap();

        let p = heap_a.alloc(16).unwrap();
        unsafe { heap_b.free(Some(p)) };
        assert_eq!(heap_a.count(), 1);
        assert_eq!(heap_b.count(), 0);

        unsafe { heap_a.free(Some(p)) };
        assert_eq!(heap_a.count(), 0);
    }

    #[test]
    fn count_is_constant_across_operations() {
        let fsa = FixedHeap::new();
        let mut region = [0u8; 256];
        let node_size = 16 + word();
        let slot_count = 256 / node_size;
        let heap = fsa.init(&mut region, 16, None).unwrap();

        let total = |h: &FixedHeap<'_>| h.count() + (slot_count - h.count());
        assert_eq!(total(heap), slot_count);
        let p = heap.alloc(16).unwrap();
        assert_eq!(total(heap), slot_count);
        unsafe { heap.free(Some(p)) };
        assert_eq!(total(heap), slot_count);
    }
}
