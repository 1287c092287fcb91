#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]

//! rtcentral: A tcmalloc-style memory allocator for Rust.
//!
//! Implements Google's tcmalloc architecture with three tiers:
//! - Thread-local caches (fast path, no locks) — requires `nightly` feature
//! - Central free lists (per-size-class locking)
//! - Page heap (span management, OS interface)
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: rtcentral::RtCentral = rtcentral::RtCentral;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod central_free_list;
pub mod config;
#[cfg(feature = "percpu")]
pub mod cpu_cache;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod histogram;
pub mod macros;
pub mod mark;
pub mod page_heap;
pub mod pagemap;
pub mod platform;
pub mod size_class;
pub mod span;
pub mod stats;
pub mod sweep;
pub mod sync;
pub mod thread_cache;
pub mod transfer_cache;

/// Page size used by the allocator, resolved at build time from
/// `rtcentral.toml` (see `config.rs`) — re-exported here rather than
/// hardcoded so every module agrees with the configured page size instead
/// of two independently-editable constants silently disagreeing.
pub use config::{PAGE_SHIFT, PAGE_SIZE};

// Re-export the allocator at crate root for convenience
pub use allocator::RtCentral;

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
