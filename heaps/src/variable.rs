//! The variable-size-block allocator (VSA) — spec §4.E, the hard core of
//! this crate.
//!
//! Every block sits on two independent intrusive doubly-linked lists at
//! once: an address-ordered list of every block (allocated or free) and a
//! size-ordered list of only the free ones, sorted non-increasing so the
//! largest free block is always `free_head`. `alloc` is best-fit (walk
//! the free list from its smallest end); `free` determines which address
//! neighbors are themselves free, merges them into the freed block, and
//! reinserts the survivor into the free list starting from a restart
//! point chosen to avoid re-walking the whole list. Grounded in
//! `examples/original_source/heaps/xlclhp/src/xtc_lclhp.c` (`xlh_alloc`,
//! `xlh_free`, `xlh_insert_free`) for the algorithm, and in the teacher's
//! `CellHeader`/`Neighbors` for the Rust idiom of mutating an intrusive
//! list through `&self` via `Cell`.

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::debug;
use crate::interface::{Heap, Stats, Tag};
use crate::neighbors::Links;
use crate::protect::Protection;
use crate::units::round_up_to_word;

#[cfg(feature = "debug-tracking")]
use crate::debug::CallSite;

#[repr(C)]
struct VsaNode {
    owner_tag: Cell<usize>,
    size: Cell<usize>,
    block: Links<VsaNode>,
    free: Links<VsaNode>,
    #[cfg(feature = "debug-tracking")]
    site: Cell<Option<CallSite>>,
}

const HEADER_SIZE: usize = mem::size_of::<VsaNode>();

/// A best-fit, splitting, coalescing allocator over a caller-supplied
/// memory region.
pub struct VariableHeap<'a> {
    tag: Cell<Tag>,
    region_base: Cell<*mut u8>,
    region_length: Cell<usize>,
    block_head: Cell<*const VsaNode>,
    free_head: Cell<*const VsaNode>,
    free_tail: Cell<*const VsaNode>,
    allocated_count: Cell<usize>,
    protect: Cell<Protection>,
    _region: PhantomData<&'a mut [u8]>,
}

unsafe impl<'a> Sync for VariableHeap<'a> {}

impl<'a> VariableHeap<'a> {
    /// A cleared handle, suitable for a `static` or stack slot that
    /// `init` fills in later.
    pub const fn new() -> VariableHeap<'a> {
        VariableHeap {
            tag: Cell::new(Tag::NONE),
            region_base: Cell::new(ptr::null_mut()),
            region_length: Cell::new(0),
            block_head: Cell::new(ptr::null()),
            free_head: Cell::new(ptr::null()),
            free_tail: Cell::new(ptr::null()),
            allocated_count: Cell::new(0),
            protect: Cell::new(Protection::NONE),
            _region: PhantomData,
        }
    }

    /// Initialize the handle over `region`: the whole region becomes one
    /// maximal free block (spec §4.E.1). Returns `None` if the region
    /// cannot hold even a single header.
    pub fn init(&self, region: &'a mut [u8], protect: Option<Protection>) -> Option<&Self> {
        let region_length = region.len();
        if region_length <= HEADER_SIZE {
            return None;
        }

        let region_base = region.as_mut_ptr();
        unsafe { ptr::write_bytes(region_base, 0, region_length) };

        let node = region_base as *mut VsaNode;
        let payload_size = region_length - HEADER_SIZE;

        self.protect.set(protect.unwrap_or(Protection::NONE));
        self.region_base.set(region_base);
        self.region_length.set(region_length);
        self.allocated_count.set(0);
        self.tag.set(Tag::of(self));

        unsafe {
            ptr::write(
                node,
                VsaNode {
                    owner_tag: Cell::new(self as *const Self as usize),
                    size: Cell::new(payload_size),
                    block: Links::default(),
                    free: Links::default(),
                    #[cfg(feature = "debug-tracking")]
                    site: Cell::new(None),
                },
            );
        }

        self.block_head.set(node);
        self.free_head.set(node);
        self.free_tail.set(node);

        Some(self)
    }

    #[inline]
    fn is_valid(&self) -> bool {
        !self.tag.get().is_none() && self.tag.get() == Tag::of(self)
    }

    /// Spec §3.3's `is_free` predicate: a node is free iff it is
    /// `free_head`, or its `free.prev` is non-null. The open question in
    /// spec §9 asks implementers to assert the invariant that makes the
    /// disjunction safe (a lone free block is `free_head` with a null
    /// `free.prev`) rather than lean on it silently.
    fn is_free(&self, node: *const VsaNode) -> bool {
        if node.is_null() {
            return false;
        }
        if node == self.free_head.get() {
            extra_assert!(unsafe { &*node }.free.prev().is_null());
            return true;
        }
        !unsafe { &*node }.free.prev().is_null()
    }

    fn unlink_free(&self, node: *const VsaNode) {
        let node_ref = unsafe { &*node };
        let prev = node_ref.free.prev();
        let next = node_ref.free.next();
        match unsafe { prev.as_ref() } {
            Some(prev_ref) => prev_ref.free.set_next(next),
            None => self.free_head.set(next),
        }
        match unsafe { next.as_ref() } {
            Some(next_ref) => next_ref.free.set_prev(prev),
            None => self.free_tail.set(prev),
        }
        node_ref.free.clear();
    }

    /// Forward-insert (spec §4.E.5): walk `free.next` from `start`,
    /// insert `node` before the first element whose size is `<=
    /// node.size`, or at the tail if none.
    fn forward_insert(&self, node: *const VsaNode, start: *const VsaNode) {
        let node_ref = unsafe { &*node };
        let node_size = node_ref.size.get();

        let mut cur = start;
        while let Some(cur_ref) = unsafe { cur.as_ref() } {
            if cur_ref.size.get() <= node_size {
                break;
            }
            cur = cur_ref.free.next();
        }

        match unsafe { cur.as_ref() } {
            Some(cur_ref) => {
                let prev = cur_ref.free.prev();
                node_ref.free.set_prev(prev);
                node_ref.free.set_next(cur);
                match unsafe { prev.as_ref() } {
                    Some(prev_ref) => prev_ref.free.set_next(node),
                    None => self.free_head.set(node),
                }
                cur_ref.free.set_prev(node);
            }
            None => {
                let tail = self.free_tail.get();
                node_ref.free.set_prev(tail);
                node_ref.free.set_next(ptr::null());
                match unsafe { tail.as_ref() } {
                    Some(tail_ref) => tail_ref.free.set_next(node),
                    None => self.free_head.set(node),
                }
                self.free_tail.set(node);
            }
        }
    }

    /// Reverse-insert (spec §4.E.5): walk `free.prev` from `start`,
    /// insert `node` after the first element whose size is strictly `>
    /// node.size`, or at the head if none. Strict, not `>=`: ties are
    /// broken FIFO by free order (spec §4.E.6), and best-fit (§4.E.2)
    /// scans from `free_tail` toward `free_head`, so the earliest-freed
    /// block of a given size must stay closer to `free_tail` — a
    /// newly-freed equal-sized block has to land on the *head* side of
    /// its size-run, ahead of (not behind) the blocks already there.
    /// Idempotent if `node` is already free at the position this walk
    /// would select.
    fn reverse_insert(&self, node: *const VsaNode, start: *const VsaNode) {
        let node_ref = unsafe { &*node };
        let node_size = node_ref.size.get();

        if self.is_free(node) {
            let prev_ok = match unsafe { node_ref.free.prev().as_ref() } {
                Some(p) => p.size.get() > node_size,
                None => true,
            };
            let next_ok = match unsafe { node_ref.free.next().as_ref() } {
                Some(n) => n.size.get() < node_size,
                None => true,
            };
            if prev_ok && next_ok {
                return;
            }
            self.unlink_free(node);
        }

        let mut cur = start;
        while let Some(cur_ref) = unsafe { cur.as_ref() } {
            if cur_ref.size.get() > node_size {
                break;
            }
            cur = cur_ref.free.prev();
        }

        match unsafe { cur.as_ref() } {
            Some(cur_ref) => {
                let next = cur_ref.free.next();
                node_ref.free.set_next(next);
                node_ref.free.set_prev(cur);
                match unsafe { next.as_ref() } {
                    Some(next_ref) => next_ref.free.set_prev(node),
                    None => self.free_tail.set(node),
                }
                cur_ref.free.set_next(node);
            }
            None => {
                let head = self.free_head.get();
                node_ref.free.set_next(head);
                node_ref.free.set_prev(ptr::null());
                match unsafe { head.as_ref() } {
                    Some(head_ref) => head_ref.free.set_prev(node),
                    None => self.free_tail.set(node),
                }
                self.free_head.set(node);
            }
        }
    }

    /// `left` absorbs `right`, its address-order successor. `right`'s
    /// header is cleared; `left`'s size grows by `right`'s payload plus
    /// one header's worth.
    fn merge_adjacent(&self, left: *const VsaNode, right: *const VsaNode) {
        let left_ref = unsafe { &*left };
        let right_ref = unsafe { &*right };

        left_ref
            .size
            .set(left_ref.size.get() + HEADER_SIZE + right_ref.size.get());

        let right_next = right_ref.block.next();
        left_ref.block.set_next(right_next);
        if let Some(next_ref) = unsafe { right_next.as_ref() } {
            next_ref.block.set_prev(left);
        }

        right_ref.owner_tag.set(0);
        right_ref.size.set(0);
        right_ref.block.clear();
        right_ref.free.clear();
    }

    /// Apply spec §4.E.4's merge/insert plan for the block being freed.
    fn free_locked(&self, candidate: *const VsaNode) {
        let candidate_ref = unsafe { &*candidate };
        let candidate_size = candidate_ref.size.get();

        let p = candidate_ref.block.prev();
        let n = candidate_ref.block.next();
        let p_free = self.is_free(p);
        let n_free = self.is_free(n);

        let p_size = unsafe { p.as_ref() }.map(|r| r.size.get()).unwrap_or(0);
        let n_size = unsafe { n.as_ref() }.map(|r| r.size.get()).unwrap_or(0);
        let p_free_prev = unsafe { p.as_ref() }.map(|r| r.free.prev());
        let n_free_prev = unsafe { n.as_ref() }.map(|r| r.free.prev());

        match (p_free, n_free) {
            (false, false) => {
                let restart = self.free_tail.get();
                self.reverse_insert(candidate, restart);
            }
            (false, true) => {
                let restart = n_free_prev.unwrap();
                self.unlink_free(n);
                self.merge_adjacent(candidate, n);
                self.reverse_insert(candidate, restart);
            }
            (true, false) => {
                let final_size = candidate_size + p_size + HEADER_SIZE;
                let pp = p_free_prev.unwrap();
                let final_gt_pp = match unsafe { pp.as_ref() } {
                    Some(pp_ref) => final_size > pp_ref.size.get(),
                    None => true,
                };
                if final_gt_pp {
                    self.unlink_free(p);
                }
                self.merge_adjacent(p, candidate);
                if final_gt_pp {
                    self.reverse_insert(p, pp);
                }
            }
            (true, true) => {
                if p_size >= n_size {
                    let final_size =
                        candidate_size + p_size + HEADER_SIZE + n_size + HEADER_SIZE;
                    let pp = p_free_prev.unwrap();
                    let final_gt_pp = match unsafe { pp.as_ref() } {
                        Some(pp_ref) => final_size > pp_ref.size.get(),
                        None => true,
                    };
                    self.unlink_free(n);
                    if final_gt_pp {
                        self.unlink_free(p);
                    }
                    self.merge_adjacent(candidate, n);
                    self.merge_adjacent(p, candidate);
                    if final_gt_pp {
                        self.reverse_insert(p, pp);
                    }
                } else {
                    let restart_raw = n_free_prev.unwrap();
                    self.unlink_free(n);
                    self.unlink_free(p);
                    self.merge_adjacent(candidate, n);
                    self.merge_adjacent(p, candidate);
                    let restart = if restart_raw == p {
                        p_free_prev.unwrap()
                    } else {
                        restart_raw
                    };
                    self.reverse_insert(p, restart);
                }
            }
        }

        self.allocated_count.set(self.allocated_count.get() - 1);
    }

    /// Largest currently-free block, or 0 if none (spec §4.E.7).
    pub fn max_free_block(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        self.protect.get().guarded(|| {
            unsafe { self.free_head.get().as_ref() }
                .map(|n| n.size.get())
                .unwrap_or(0)
        })
    }

    /// Count, total bytes, and largest size among free blocks (spec
    /// §4.E.7).
    pub fn free_stats(&self, stats: &mut Stats) {
        if !self.is_valid() {
            *stats = Stats::default();
            return;
        }
        self.protect.get().guarded(|| {
            let mut count = 0;
            let mut total = 0;
            let mut max = 0;
            let mut cur = self.free_head.get();
            while let Some(cur_ref) = unsafe { cur.as_ref() } {
                count += 1;
                let size = cur_ref.size.get();
                total += size;
                if size > max {
                    max = size;
                }
                cur = cur_ref.free.next();
            }
            stats.count = count;
            stats.total_size = total;
            stats.max_block_size = max;
        });
    }

    /// Count, total bytes, and largest size among allocated blocks, found
    /// by walking the address-ordered list and skipping free blocks (spec
    /// §4.E.7). Asserts the walked count agrees with `allocated_count`.
    pub fn allocated_stats(&self, stats: &mut Stats) {
        if !self.is_valid() {
            *stats = Stats::default();
            return;
        }
        self.protect.get().guarded(|| {
            let mut count = 0;
            let mut total = 0;
            let mut max = 0;
            let mut cur = self.block_head.get();
            while let Some(cur_ref) = unsafe { cur.as_ref() } {
                if !self.is_free(cur) {
                    count += 1;
                    let size = cur_ref.size.get();
                    total += size;
                    if size > max {
                        max = size;
                    }
                }
                cur = cur_ref.block.next();
            }
            extra_assert_eq!(count, self.allocated_count.get());
            stats.count = count;
            stats.total_size = total;
            stats.max_block_size = max;
        });
    }
}

impl<'a> Heap for VariableHeap<'a> {
    #[cfg_attr(feature = "debug-tracking", track_caller)]
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if !self.is_valid() || size == 0 {
            return None;
        }
        let need = round_up_to_word(size);
        #[cfg(feature = "debug-tracking")]
        let site = CallSite::here();

        self.protect.get().guarded(|| {
            // Best-fit: walk the size-ordered free list from its
            // smallest end (spec §4.E.2).
            let mut cur = self.free_tail.get();
            let mut picked: *const VsaNode = ptr::null();
            while let Some(cur_ref) = unsafe { cur.as_ref() } {
                if cur_ref.size.get() >= need {
                    picked = cur;
                    break;
                }
                cur = cur_ref.free.prev();
            }
            if picked.is_null() {
                return None;
            }

            let picked_ref = unsafe { &*picked };
            let former_free_next = picked_ref.free.next();
            self.unlink_free(picked);

            let picked_size = picked_ref.size.get();
            let remainder = picked_size - need;

            if remainder > HEADER_SIZE {
                let new_size = remainder - HEADER_SIZE;
                let payload_start = unsafe { (picked as *const u8).add(HEADER_SIZE) };
                let new_node = unsafe { payload_start.add(need) } as *mut VsaNode;
                let old_next = picked_ref.block.next();

                unsafe {
                    ptr::write(
                        new_node,
                        VsaNode {
                            owner_tag: Cell::new(self as *const Self as usize),
                            size: Cell::new(new_size),
                            block: Links::default(),
                            free: Links::default(),
                            #[cfg(feature = "debug-tracking")]
                            site: Cell::new(None),
                        },
                    );
                }
                let new_node_ref = unsafe { &*new_node };
                new_node_ref.block.set_prev(picked);
                new_node_ref.block.set_next(old_next);
                if let Some(old_next_ref) = unsafe { old_next.as_ref() } {
                    old_next_ref.block.set_prev(new_node);
                }
                picked_ref.block.set_next(new_node);
                picked_ref.size.set(need);

                self.forward_insert(new_node, former_free_next);
            }

            self.allocated_count.set(self.allocated_count.get() + 1);
            #[cfg(feature = "debug-tracking")]
            picked_ref.site.set(Some(site));

            let payload = unsafe { (picked as *const u8).add(HEADER_SIZE) } as *mut u8;
            NonNull::new(payload)
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

        let base = self.region_base.get() as usize;
        let region_length = self.region_length.get();
        let addr = ptr as usize;

        // Strict inequality rejects both `region_base` itself and
        // pointers at or past the end (spec §4.E.8).
        if addr <= base || addr >= base + region_length {
            return;
        }
        if addr - base < HEADER_SIZE {
            return;
        }
        let candidate = (addr - HEADER_SIZE) as *const VsaNode;

        self.protect.get().guarded(|| {
            let candidate_ref = unsafe { &*candidate };
            // Tag mismatch catches foreign and cross-heap pointers;
            // `is_free` catches double-frees and pointers into a
            // currently-free block.
            if candidate_ref.owner_tag.get() != self as *const Self as usize {
                return;
            }
            if self.is_free(candidate) {
                return;
            }
            self.free_locked(candidate);
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

        if let Some(stats) = stats {
            self.allocated_stats(stats);
        }

        let count = self.protect.get().guarded(|| self.allocated_count.get());
        if count > 0 {
            debug::report_leak("VariableHeap", count);
            #[cfg(feature = "debug-tracking")]
            {
                let mut cur = self.block_head.get();
                while let Some(cur_ref) = unsafe { cur.as_ref() } {
                    if !self.is_free(cur) {
                        let payload = unsafe { (cur as *const u8).add(HEADER_SIZE) };
                        let size = cur_ref.size.get();
                        debug::report_block(payload, size, size, cur_ref.site.get());
                    }
                    cur = cur_ref.block.next();
                }
            }
        }

        let base = self.region_base.get();
        self.tag.set(Tag::NONE);
        self.region_base.set(ptr::null_mut());
        self.region_length.set(0);
        self.block_head.set(ptr::null());
        self.free_head.set(ptr::null());
        self.free_tail.set(ptr::null());
        self.allocated_count.set(0);

        NonNull::new(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: usize = HEADER_SIZE;

    #[test]
    fn init_yields_one_maximal_free_block() {
        let vsa = VariableHeap::new();
        let mut region = [0u8; 256];
        let heap = vsa.init(&mut region, None).unwrap();
        assert_eq!(heap.max_free_block(), 256 - HEADER);
    }

    #[test]
    fn split_and_restore() {
        let vsa = VariableHeap::new();
        let mut region = [0u8; 256];
        let heap = vsa.init(&mut region, None).unwrap();

        let p1 = heap.alloc(12).unwrap();
        assert_eq!(heap.max_free_block(), 256 - HEADER - 16 - HEADER);
        unsafe { heap.free(Some(p1)) };
        assert_eq!(heap.max_free_block(), 256 - HEADER);
    }

    #[test]
    fn coalesce_both_sides() {
        let vsa = VariableHeap::new();
        let slot = 32usize;
        let region_len = HEADER * 5 + slot * 5;
        let mut region = vec![0u8; region_len];
        let heap = vsa.init(&mut region, None).unwrap();

        let mut ptrs = Vec::new();
        for _ in 0..5 {
            ptrs.push(heap.alloc(slot).unwrap());
        }
        assert_eq!(heap.count(), 5);
        assert_eq!(heap.max_free_block(), 0, "region should be exactly filled");

        unsafe {
            heap.free(Some(ptrs[1]));
            heap.free(Some(ptrs[3]));
        }
        let mut stats = Stats::default();
        heap.free_stats(&mut stats);
        assert_eq!(stats.count, 2);

        unsafe { heap.free(Some(ptrs[2])) };
        heap.free_stats(&mut stats);
        assert_eq!(stats.count, 1, "three adjacent frees must coalesce into one block");
    }

    #[test]
    fn best_fit_tie_break_picks_earliest_freed() {
        let vsa = VariableHeap::new();
        let region_len = HEADER * 8 + 16 * 8;
        let mut region = vec![0u8; region_len];
        let heap = vsa.init(&mut region, None).unwrap();

        let mut ptrs = Vec::new();
        for _ in 0..8 {
            ptrs.push(heap.alloc(16).unwrap());
        }
        unsafe {
            heap.free(Some(ptrs[0]));
            heap.free(Some(ptrs[2]));
            heap.free(Some(ptrs[4]));
        }

        let next = heap.alloc(16).unwrap();
        assert_eq!(next.as_ptr(), ptrs[0].as_ptr());
    }

    #[test]
    fn fragmentation_can_fail_despite_sufficient_total_free_bytes() {
        let vsa = VariableHeap::new();
        let region_len = HEADER * 4 + 36 * 4;
        let mut region = vec![0u8; region_len];
        let heap = vsa.init(&mut region, None).unwrap();

        let ptrs: Vec<_> = (0..4).map(|_| heap.alloc(36).unwrap()).collect();
        unsafe {
            heap.free(Some(ptrs[1]));
            heap.free(Some(ptrs[3]));
        }
        assert!(heap.alloc(40).is_none());
    }

    #[test]
    fn idempotent_double_free() {
        let vsa = VariableHeap::new();
        let mut region = [0u8; 256];
        let heap = vsa.init(&mut region, None).unwrap();
        let p = heap.alloc(20).unwrap();
        unsafe {
            heap.free(Some(p));
            heap.free(Some(p));
        }
        assert_eq!(heap.count(), 0);
    }

    #[test]
    fn restorability_after_freeing_everything() {
        let vsa = VariableHeap::new();
        let mut region = [0u8; 512];
        let heap = vsa.init(&mut region, None).unwrap();

        let mut ptrs = Vec::new();
        loop {
            match heap.alloc(24) {
                Some(p) => ptrs.push(p),
                None => break,
            }
        }
        for p in ptrs {
            unsafe { heap.free(Some(p)) };
        }
        assert_eq!(heap.max_free_block(), 512 - HEADER);
        assert_eq!(heap.count(), 0);
    }
}
