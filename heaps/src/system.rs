//! The tracking system allocator (TSA) — spec §4.D.
//!
//! Forwards every request straight to the platform allocator (reached,
//! idiomatically, through Rust's `alloc` crate rather than a hand-rolled
//! `malloc` binding) and wraps each block in a small header that lets
//! `free` reject foreign and double-freed pointers by a single tag
//! comparison. Grounded in
//! `examples/original_source/heaps/xsyshp/src/xtc_syshp.h`
//! (`xss_node_t`'s `owner_tag`/`payload_size`, and the debug-only live
//! list `xss_alloc_dbg` threads blocks onto).

use core::alloc::Layout;
use core::cell::Cell;
use core::mem;
use core::ptr::{self, NonNull};

use alloc::alloc::{alloc, dealloc};

use crate::debug;
use crate::interface::{Heap, Stats, Tag};
use crate::protect::Protection;

#[cfg(feature = "debug-tracking")]
use crate::debug::CallSite;
#[cfg(feature = "debug-tracking")]
use crate::neighbors::Links;

#[repr(C)]
struct TsaNode {
    owner_tag: Cell<usize>,
    payload_size: Cell<usize>,
    #[cfg(feature = "debug-tracking")]
    links: Links<TsaNode>,
    #[cfg(feature = "debug-tracking")]
    site: Cell<Option<CallSite>>,
}

const HEADER_SIZE: usize = mem::size_of::<TsaNode>();
const HEADER_ALIGN: usize = mem::align_of::<TsaNode>();

/// A tracking wrapper around the platform allocator: tags every block with
/// the owning handle's address, so foreign pointers and double-frees are
/// caught by a single comparison, and (in debug builds) keeps a live-block
/// list for a leak dump at `end()`.
pub struct TrackingHeap {
    tag: Cell<Tag>,
    allocated_count: Cell<usize>,
    total_bytes: Cell<usize>,
    protect: Cell<Protection>,
    #[cfg(feature = "debug-tracking")]
    block_head: Cell<*const TsaNode>,
}

unsafe impl Sync for TrackingHeap {}

impl TrackingHeap {
    /// A cleared handle; call [`TrackingHeap::init`] before using it.
    pub const fn new() -> TrackingHeap {
        TrackingHeap {
            tag: Cell::new(Tag::NONE),
            allocated_count: Cell::new(0),
            total_bytes: Cell::new(0),
            protect: Cell::new(Protection::NONE),
            #[cfg(feature = "debug-tracking")]
            block_head: Cell::new(ptr::null()),
        }
    }

    /// Install the handle's identity tag and optional protection pair
    /// (spec §3.4, §3.5). Unlike the FSA/VSA, there is no caller-supplied
    /// region to validate — every allocation is forwarded individually to
    /// the platform allocator.
    pub fn init(&self, protect: Option<Protection>) -> &Self {
        self.protect.set(protect.unwrap_or(Protection::NONE));
        self.allocated_count.set(0);
        self.total_bytes.set(0);
        #[cfg(feature = "debug-tracking")]
        self.block_head.set(ptr::null());
        self.tag.set(Tag::of(self));
        self
    }

    #[inline]
    fn is_valid(&self) -> bool {
        !self.tag.get().is_none() && self.tag.get() == Tag::of(self)
    }

    /// Sum of every currently-live block's usable payload size — the Rust
    /// counterpart of the source's `xss_total_size` accessor.
    pub fn total_bytes(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        self.protect.get().guarded(|| self.total_bytes.get())
    }

    fn layout_for(payload_size: usize) -> Layout {
        Layout::from_size_align(HEADER_SIZE + payload_size, HEADER_ALIGN)
            .expect("payload_size + HEADER_SIZE must not overflow isize")
    }

    #[cfg(feature = "debug-tracking")]
    fn link(&self, node: *const TsaNode) {
        let node_ref = unsafe { &*node };
        node_ref.links.set_next(self.block_head.get());
        node_ref.links.set_prev(ptr::null());
        if let Some(old_head) = unsafe { self.block_head.get().as_ref() } {
            old_head.links.set_prev(node);
        }
        self.block_head.set(node);
    }

    #[cfg(feature = "debug-tracking")]
    fn unlink(&self, node: *const TsaNode) {
        let node_ref = unsafe { &*node };
        let prev = node_ref.links.prev();
        let next = node_ref.links.next();
        if let Some(prev_ref) = unsafe { prev.as_ref() } {
            prev_ref.links.set_next(next);
        } else {
            self.block_head.set(next);
        }
        if let Some(next_ref) = unsafe { next.as_ref() } {
            next_ref.links.set_prev(prev);
        }
        node_ref.links.clear();
    }
}

impl Heap for TrackingHeap {
    #[cfg_attr(feature = "debug-tracking", track_caller)]
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if !self.is_valid() || size == 0 {
            return None;
        }
        #[cfg(feature = "debug-tracking")]
        let site = CallSite::here();

        self.protect.get().guarded(|| {
            let layout = Self::layout_for(size);
            let base = unsafe { alloc(layout) };
            if base.is_null() {
                return None;
            }

            let node = base as *mut TsaNode;
            unsafe {
                ptr::write(
                    node,
                    TsaNode {
                        owner_tag: Cell::new(self as *const Self as usize),
                        payload_size: Cell::new(size),
                        #[cfg(feature = "debug-tracking")]
                        links: Links::default(),
                        #[cfg(feature = "debug-tracking")]
                        site: Cell::new(Some(site)),
                    },
                );
            }

            #[cfg(feature = "debug-tracking")]
            self.link(node);

            self.allocated_count.set(self.allocated_count.get() + 1);
            self.total_bytes.set(self.total_bytes.get() + size);

            let payload = unsafe { base.add(HEADER_SIZE) };
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

        let addr = ptr as usize;
        if addr < HEADER_SIZE {
            return;
        }
        let header_addr = addr - HEADER_SIZE;
        let node = header_addr as *const TsaNode;
        let node_ref = &*node;

        let freed_size = self.protect.get().guarded(|| {
            // Catches foreign pointers, cross-heap frees, and double-frees:
            // `free` zeros `owner_tag` below, so a second free sees a tag
            // that can never match a live handle's address.
            if node_ref.owner_tag.get() != self as *const Self as usize {
                return None;
            }

            let payload_size = node_ref.payload_size.get();

            #[cfg(feature = "debug-tracking")]
            self.unlink(node);

            node_ref.owner_tag.set(0);
            node_ref.payload_size.set(0);

            self.allocated_count.set(self.allocated_count.get() - 1);
            self.total_bytes.set(self.total_bytes.get() - payload_size);

            Some(payload_size)
        });

        if let Some(payload_size) = freed_size {
            dealloc(header_addr as *mut u8, Self::layout_for(payload_size));
        }
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

        let (count, total_bytes) = self
            .protect
            .get()
            .guarded(|| (self.allocated_count.get(), self.total_bytes.get()));

        if let Some(stats) = stats {
            stats.count = count;
            stats.total_size = total_bytes;
            #[cfg(feature = "debug-tracking")]
            {
                stats.max_block_size = self.max_live_block_size();
            }
            #[cfg(not(feature = "debug-tracking"))]
            {
                stats.max_block_size = 0;
            }
        }

        if count > 0 {
            debug::report_leak("TrackingHeap", count);
            #[cfg(feature = "debug-tracking")]
            self.dump_live_blocks();
        }

        self.tag.set(Tag::NONE);
        self.allocated_count.set(0);
        self.total_bytes.set(0);
        #[cfg(feature = "debug-tracking")]
        self.block_head.set(ptr::null());

        // Unlike the FSA/VSA there is no caller-supplied region to hand
        // back: every block was forwarded individually to the platform
        // allocator and is intentionally leaked by policy (spec §4.D).
        None
    }
}

#[cfg(feature = "debug-tracking")]
impl TrackingHeap {
    fn max_live_block_size(&self) -> usize {
        let mut max = 0;
        let mut cur = self.block_head.get();
        while let Some(node) = unsafe { cur.as_ref() } {
            max = max.max(node.payload_size.get());
            cur = node.links.next();
        }
        max
    }

    fn dump_live_blocks(&self) {
        let mut cur = self.block_head.get();
        while let Some(node) = unsafe { cur.as_ref() } {
            let payload = unsafe { (cur as *const u8).add(HEADER_SIZE) };
            let size = node.payload_size.get();
            debug::report_block(payload, size, size, node.site.get());
            cur = node.links.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trips_and_counts() {
        let tsa = TrackingHeap::new();
        let heap = tsa.init(None);
        let p = heap.alloc(32).unwrap();
        assert_eq!(heap.count(), 1);
        assert_eq!(heap.total_bytes(), 32);
        unsafe { heap.free(Some(p)) };
        assert_eq!(heap.count(), 0);
        assert_eq!(heap.total_bytes(), 0);
    }

    #[test]
    fn rejects_zero_size() {
        let tsa = TrackingHeap::new();
        let heap = tsa.init(None);
        assert!(heap.alloc(0).is_none());
    }

    #[test]
    fn double_free_is_a_no_op() {
        let tsa = TrackingHeap::new();
        let heap = tsa.init(None);
        let p = heap.alloc(16).unwrap();
        unsafe {
            heap.free(Some(p));
            heap.free(Some(p));
        }
        assert_eq!(heap.count(), 0);
    }

    #[test]
    fn foreign_pointer_across_two_tsas_is_a_no_op() {
        let tsa_a = TrackingHeap::new();
        let heap_a = tsa_a.init(None);
        let tsa_b = TrackingHeap::new();
        let heap_b = tsa_b.init(None);

        let p = heap_a.alloc(16).unwrap();
        unsafe { heap_b.free(Some(p)) };
        assert_eq!(heap_a.count(), 1);
        assert_eq!(heap_b.count(), 0);

        unsafe { heap_a.free(Some(p)) };
        assert_eq!(heap_a.count(), 0);
    }

    #[test]
    fn end_reports_leak_and_clears_handle() {
        let tsa = TrackingHeap::new();
        let heap = tsa.init(None);
        let _a = heap.alloc(8).unwrap();
        let b = heap.alloc(8).unwrap();
        let _c = heap.alloc(8).unwrap();
        unsafe { heap.free(Some(b)) };

        let mut stats = Stats::default();
        heap.end(Some(&mut stats));
        assert_eq!(stats.count, 2);
        assert_eq!(heap.count(), 0);
    }
}
