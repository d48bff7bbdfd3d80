//! Shared test helpers
//!
//! `RUST_LOG=tierkv=debug cargo test` shows the engine's tracing output for
//! a failing test.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use tierkv::config::{Config, ConfigBuilder, Durability, LogSyncStrategy};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Small, fence-only geometry with the background coordinator off
pub fn test_builder(dir: &Path) -> ConfigBuilder {
    Config::builder()
        .data_dir(dir)
        .durability(Durability::Fence)
        .numa_nodes(1)
        .modules_per_node(2)
        .workers_per_node(2)
        .max_threads(8)
        .log_capacity(1024)
        .staging_watermark(8)
        .log_sync_strategy(LogSyncStrategy::Watermark)
        .checkpoint_threshold(1 << 20)
        .background_checkpoint(false)
        .leaf_capacity(2048)
        .inode_capacity(8192)
}

pub fn test_config(dir: &Path) -> Config {
    test_builder(dir).build()
}

/// Fixed-width key so byte order matches numeric order
pub fn key(n: u64) -> Vec<u8> {
    format!("key-{:08}", n).into_bytes()
}

pub fn value(n: u64) -> Vec<u8> {
    format!("value-{}", n).into_bytes()
}
