//! C-ABI exports for external linking (e.g., from bench via build.rs).
//!
//! Gated behind `features = ["ffi"]`. Built as part of the staticlib.
//! With `testing` feature, export names are prefixed by variant:
//!   - `percpu`  → `rtcentral_percpu_*`
//!   - `nightly` → `rtcentral_nightly_*`
//!   - `std`     → `rtcentral_std_*`
//!   - neither   → `rtcentral_nostd_*`
//! Without `testing`, exports plain `rtcentral_*` names.

use crate::allocator::RtCentral;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: RtCentral = RtCentral;

// Note: percpu implies nightly, so the percpu check must come first.

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "percpu"),
    unsafe(export_name = "rtcentral_percpu_alloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "nightly", not(feature = "percpu")),
    unsafe(export_name = "rtcentral_nightly_alloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        feature = "std",
        not(any(feature = "nightly", feature = "percpu"))
    ),
    unsafe(export_name = "rtcentral_std_alloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        not(any(feature = "nightly", feature = "std", feature = "percpu"))
    ),
    unsafe(export_name = "rtcentral_nostd_alloc")
)]
pub unsafe extern "C" fn rtcentral_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.alloc(layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "percpu"),
    unsafe(export_name = "rtcentral_percpu_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "nightly", not(feature = "percpu")),
    unsafe(export_name = "rtcentral_nightly_dealloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        feature = "std",
        not(any(feature = "nightly", feature = "percpu"))
    ),
    unsafe(export_name = "rtcentral_std_dealloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        not(any(feature = "nightly", feature = "std", feature = "percpu"))
    ),
    unsafe(export_name = "rtcentral_nostd_dealloc")
)]
pub unsafe extern "C" fn rtcentral_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "percpu"),
    unsafe(export_name = "rtcentral_percpu_realloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "nightly", not(feature = "percpu")),
    unsafe(export_name = "rtcentral_nightly_realloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        feature = "std",
        not(any(feature = "nightly", feature = "percpu"))
    ),
    unsafe(export_name = "rtcentral_std_realloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        not(any(feature = "nightly", feature = "std", feature = "percpu"))
    ),
    unsafe(export_name = "rtcentral_nostd_realloc")
)]
pub unsafe extern "C" fn rtcentral_realloc(
    ptr: *mut u8,
    size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.realloc(ptr, layout, new_size) }
}
