use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

// Per-size-class (size, pages, batch_size) tables are NOT generated here.
// `src/size_class.rs` carries one hardcoded `SIZE_CLASSES` table as the single
// source of truth; this file only resolves the tunables below (thread cache
// sizing, transfer slot bounds, page size). An earlier version of this build
// script also tried to generate a competing `SIZE_CLASSES` array from
// `rtcentral.toml`'s `classes`/`[[class]]` entries — dropped, since two
// independently-editable tables for the same data disagree silently. See
// DESIGN.md.

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    thread_cache_size: Option<usize>,
    min_per_thread_cache: Option<usize>,
    steal_amount: Option<usize>,
    max_free_list_length: Option<u32>,
    max_overages: Option<u32>,
    max_transfer_slots: Option<usize>,
    max_pages: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    thread_cache_size: usize,
    min_per_thread_cache: usize,
    steal_amount: usize,
    max_free_list_length: u32,
    max_overages: u32,
    max_transfer_slots: usize,
    max_pages: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(8192);
    assert!(
        page_size > 0 && page_size.is_power_of_two(),
        "page_size ({}) must be a power of 2",
        page_size
    );
    assert!(
        page_size >= 4096,
        "page_size ({}) must be >= 4096",
        page_size
    );

    let thread_cache_size = cfg.thread_cache_size.unwrap_or(32 * 1024 * 1024);
    let min_per_thread_cache = cfg.min_per_thread_cache.unwrap_or(512 * 1024);
    let steal_amount = cfg.steal_amount.unwrap_or(64 * 1024);
    let max_free_list_length = cfg.max_free_list_length.unwrap_or(8192);
    let max_overages = cfg.max_overages.unwrap_or(3);
    let max_transfer_slots = cfg.max_transfer_slots.unwrap_or(64);
    let max_pages = cfg.max_pages.unwrap_or(128);

    assert!(thread_cache_size > 0, "thread_cache_size must be > 0");
    assert!(min_per_thread_cache > 0, "min_per_thread_cache must be > 0");
    assert!(
        thread_cache_size >= min_per_thread_cache,
        "thread_cache_size ({}) must be >= min_per_thread_cache ({})",
        thread_cache_size,
        min_per_thread_cache
    );
    assert!(steal_amount > 0, "steal_amount must be > 0");
    assert!(max_free_list_length > 0, "max_free_list_length must be > 0");
    assert!(max_overages > 0, "max_overages must be > 0");
    assert!(max_transfer_slots > 0, "max_transfer_slots must be > 0");
    assert!(max_pages > 0, "max_pages must be > 0");

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        thread_cache_size,
        min_per_thread_cache,
        steal_amount,
        max_free_list_length,
        max_overages,
        max_transfer_slots,
        max_pages,
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/rtcentral.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const OVERALL_THREAD_CACHE_SIZE: usize = {};\n\
         pub const MIN_PER_THREAD_CACHE_SIZE: usize = {};\n\
         pub const STEAL_AMOUNT: usize = {};\n\
         pub const MAX_DYNAMIC_FREE_LIST_LENGTH: u32 = {};\n\
         pub const MAX_OVERAGES: u32 = {};\n\
         pub const MAX_TRANSFER_SLOTS: usize = {};\n\
         pub const MAX_PAGES: usize = {};\n",
        cfg.page_shift,
        cfg.page_size,
        cfg.thread_cache_size,
        cfg.min_per_thread_cache,
        cfg.steal_amount,
        cfg.max_free_list_length,
        cfg.max_overages,
        cfg.max_transfer_slots,
        cfg.max_pages,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=RTCENTRAL_CLASSES");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("RTCENTRAL_CLASSES").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
