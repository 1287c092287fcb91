//! Mark bitmap: the minimal liveness state `span_sweep` needs per object slot.
//!
//! This is not a tracing collector — it does no reachability analysis. It is
//! the connective tissue between a real mark phase (external to this crate)
//! and the sweeper: something sets live bits for objects it found reachable,
//! and `span_sweep` consults them to tell "allocated and still live" apart
//! from "allocated and dead" for every slot in a span. See SPEC_FULL.md's
//! SUPPLEMENTAL section.

use crate::span::{MARK_BITS_WORDS, Span};
use core::sync::atomic::Ordering;

/// Mark object slot `index` (0-based, within the span's `live_bits`) as live.
///
/// # Safety
///
/// `span` must be a valid, in-use span, and `index` must be `< total_count`.
pub unsafe fn mark_span(span: *mut Span, index: usize) {
    let word = index / 64;
    let bit = index % 64;
    debug_assert!(word < MARK_BITS_WORDS, "mark index out of range for span");
    unsafe {
        (*span).live_bits[word].fetch_or(1u64 << bit, Ordering::Relaxed);
    }
}

/// Clear the live bit for object slot `index`. Used by `free_list`/`free_span`
/// so a slot that has been freed and reused doesn't carry a stale live bit
/// into the next mark/sweep cycle.
///
/// # Safety
///
/// `span` must be a valid, in-use span, and `index` must be `< total_count`.
pub unsafe fn mark_free(span: *mut Span, index: usize) {
    let word = index / 64;
    let bit = index % 64;
    debug_assert!(word < MARK_BITS_WORDS, "mark index out of range for span");
    unsafe {
        (*span).live_bits[word].fetch_and(!(1u64 << bit), Ordering::Relaxed);
    }
}

/// Test whether object slot `index` is currently marked live.
///
/// # Safety
///
/// `span` must be a valid, in-use span, and `index` must be `< total_count`.
pub unsafe fn is_marked(span: *mut Span, index: usize) -> bool {
    let word = index / 64;
    let bit = index % 64;
    unsafe { (*span).live_bits[word].load(Ordering::Relaxed) & (1u64 << bit) != 0 }
}

/// Clear every live bit in a span's bitmap. Called by `span_sweep` once it
/// has finished consuming a generation's marks, and by `grow` when carving a
/// freshly-allocated span (its bitmap is already zero, but this documents the
/// invariant at the call site rather than relying on zero-init silently).
///
/// # Safety
///
/// `span` must be a valid, in-use span.
pub unsafe fn unmark_span(span: *mut Span) {
    unsafe {
        for word in (*span).live_bits.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span;

    #[test]
    fn test_mark_and_clear() {
        let s = span::alloc_span();
        assert!(!s.is_null());
        unsafe {
            assert!(!is_marked(s, 5));
            mark_span(s, 5);
            assert!(is_marked(s, 5));
            mark_free(s, 5);
            assert!(!is_marked(s, 5));
            span::dealloc_span(s);
        }
    }

    #[test]
    fn test_unmark_span_clears_all() {
        let s = span::alloc_span();
        assert!(!s.is_null());
        unsafe {
            for i in [0usize, 63, 64, 1023] {
                mark_span(s, i);
            }
            unmark_span(s);
            for i in [0usize, 63, 64, 1023] {
                assert!(!is_marked(s, i));
            }
            span::dealloc_span(s);
        }
    }

    #[test]
    fn test_mark_bits_word_boundary() {
        let s = span::alloc_span();
        assert!(!s.is_null());
        unsafe {
            mark_span(s, 63);
            mark_span(s, 64);
            assert!(is_marked(s, 63));
            assert!(is_marked(s, 64));
            assert!(!is_marked(s, 62));
            assert!(!is_marked(s, 65));
            span::dealloc_span(s);
        }
    }
}
