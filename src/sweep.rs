//! Sweep generation counter and the sweeper entry point.
//!
//! Free-standing rather than a field on `PageHeap`: the original runtime reads
//! `mheap.sweepgen` without ever taking the heap lock, and nesting it inside
//! `PageHeap`'s `SpinMutex` here would force every sweepgen read to pay for an
//! unrelated lock. See DESIGN.md.

use crate::central_free_list::{self, CentralFreeList};
use crate::mark;
use crate::span::{FreeObject, Span};
use crate::sync::SpinMutex;
use core::sync::atomic::{AtomicU32, Ordering};
#[cfg(feature = "debug")]
use std::println;

use crate::stat_inc;

/// Global sweep generation. Advances by 2 each cycle so a span's `sweepgen`
/// can encode "swept this generation" / "swept last generation" / "needs
/// sweeping" in the tri-state scheme the central list's `cache_span`
/// consults (current, current - 1, current - 2).
pub struct SweepGeneration(AtomicU32);

impl SweepGeneration {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to the next sweep generation. Called once per sweep cycle by
    /// whatever drives the sweeper (a background scheduler is explicitly out
    /// of scope, see SPEC_FULL.md's Non-goals — callers invoke this directly).
    pub fn advance(&self) -> u32 {
        self.0.fetch_add(2, Ordering::AcqRel) + 2
    }
}

impl Default for SweepGeneration {
    fn default() -> Self {
        Self::new()
    }
}

pub static SWEEP_GEN: SweepGeneration = SweepGeneration::new();

/// Sweep a single span: reclaim every object slot that is allocated but not
/// marked live, splicing it back into the span's freelist/freebuf. Slots
/// already on the free list are skipped. Publishes `span.sweepgen` to
/// `target_gen` only after every list relocation this sweep performs is
/// done, and — critically — *before* handing a now-fully-free span back to
/// the page heap: `reclaim_empty_span` may let the page heap coalesce and
/// recycle the `Span` struct itself, so nothing here may touch `span` again
/// once that call is made. See spec.md §4.3's "publish last, then hand to
/// heap" ordering.
///
/// # Safety
///
/// `span` must be a valid, in-use span belonging to `cfl_lock`'s size class,
/// and the caller must hold `cfl_lock` locked for the duration of this call
/// (sweeping touches the same lists `free_span` links spans into).
pub unsafe fn span_sweep(
    span: *mut Span,
    cfl: &mut CentralFreeList,
    page_heap: &SpinMutex<crate::page_heap::PageHeap>,
    pagemap: &crate::pagemap::PageMap,
    target_gen: u32,
) {
    let _ = pagemap;
    let elem_size = unsafe { (*span).elem_size };
    let total_count = unsafe { (*span).total_count } as usize;
    let base = unsafe { (*span).start_addr() };

    // Slots already free are exactly the ones reachable from `freelist`.
    // MARK_BITS_WORDS (see span.rs) bounds total_count, so a bitset this size
    // is always sufficient.
    let mut already_free = [0u64; crate::span::MARK_BITS_WORDS];
    unsafe {
        let mut node = (*span).freelist;
        while !node.is_null() {
            let idx = (node as usize - base as usize) / elem_size;
            already_free[idx / 64] |= 1u64 << (idx % 64);
            node = (*node).next;
        }
    }

    let mut freed = 0usize;
    let mut now_empty = false;
    for idx in 0..total_count {
        if already_free[idx / 64] & (1u64 << (idx % 64)) != 0 {
            continue;
        }
        let live = unsafe { mark::is_marked(span, idx) };
        if live {
            continue;
        }
        let obj = unsafe { base.add(idx * elem_size) } as *mut FreeObject;
        unsafe {
            now_empty = central_free_list::splice_free_object(span, obj, cfl);
            mark::mark_free(span, idx);
        }
        freed += 1;
    }

    #[cfg(feature = "debug")]
    println!("[sweep] span freed={}", freed);
    stat_inc!(sweeper_spans_swept);
    for _ in 0..freed {
        stat_inc!(sweeper_objects_freed);
    }

    // Publish before any potential return-to-heap below — see the
    // function-level doc comment.
    unsafe { (*span).sweepgen.store(target_gen, Ordering::Release) };

    if now_empty {
        unsafe { central_free_list::reclaim_empty_span(span, cfl, page_heap) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central_free_list::CentralCache;
    use crate::mark;
    use crate::page_heap::PageHeap;
    use crate::pagemap::PageMap;
    use std::boxed::Box;

    fn make_test_env() -> (&'static PageMap, SpinMutex<PageHeap>, CentralCache) {
        let pm = Box::leak(Box::new(PageMap::new()));
        let heap = SpinMutex::new(PageHeap::new(pm));
        let cache = CentralCache::new();
        (pm, heap, cache)
    }

    #[test]
    fn test_sweep_generation_advances_by_two() {
        let gen = SweepGeneration::new();
        let g0 = gen.load();
        let g1 = gen.advance();
        assert_eq!(g1, g0 + 2);
    }

    #[test]
    fn test_span_sweep_reclaims_dead_unmarked_objects() {
        let (pm, heap, cache) = make_test_env();
        let cfl_lock = cache.get(1); // 8-byte class
        unsafe {
            // Cache a span so we have a concrete pointer to sweep.
            let span = central_free_list::cache_span(cfl_lock, 1, &heap, pm, 0);
            assert!(!span.is_null());

            // Simulate: every remaining free-list object is "allocated" for
            // this test by emptying the free list, then mark half the slots
            // live and leave the rest dead.
            (*span).freelist = core::ptr::null_mut();
            let total = (*span).total_count as usize;
            for idx in 0..total {
                if idx % 2 == 0 {
                    mark::mark_span(span, idx);
                }
            }

            let mut cfl = cfl_lock.lock();
            span_sweep(span, &mut cfl, &heap, pm, 2);

            // Half the objects should now be back on the free list.
            let mut count = 0;
            let mut node = (*span).freelist;
            while !node.is_null() {
                count += 1;
                node = (*node).next;
            }
            assert_eq!(count, total - total.div_ceil(2));
            assert_eq!((*span).sweepgen.load(Ordering::Acquire), 2);
        }
    }
}
