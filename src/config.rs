//! Build-time tunables, generated from `rtcentral.toml` by `build.rs`.
//!
//! Per-size-class tables live in [`crate::size_class`] instead — this module
//! only carries the page size and thread-cache/transfer tunables.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
