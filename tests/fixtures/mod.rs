//! Test fixtures
//!
//! - [`MockColdStorage`]: in-memory storage service with fault injection
//! - helpers for fast contexts and scratch files

mod mock_storage;

pub use mock_storage::{MockColdStorage, Operation};

use permafrost_core::{Context, TransferConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Chunk size used by the fixtures (1 MiB, the smallest legal size)
pub const TEST_CHUNK: u64 = 1024 * 1024;

/// Configuration tuned for tests: fast ticks, short polls, small chunks
pub fn fast_config(maximum_active_parts: usize) -> TransferConfig {
    TransferConfig {
        chunk_size_in_bytes: TEST_CHUNK,
        maximum_active_parts,
        requests_per_second: 1000,
        retry_limit: 3,
        poll_interval_ms: 5,
    }
}

/// Started in-memory context over `remote`
pub fn memory_context(remote: Arc<MockColdStorage>, maximum_active_parts: usize) -> Arc<Context> {
    let ctx = Context::in_memory(fast_config(maximum_active_parts), remote)
        .expect("test config is valid");
    ctx.start();
    ctx
}

/// Deterministic, non-repeating test content
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 251) as u8).wrapping_mul(31) ^ (i as u8) ^ seed)
        .collect()
}

/// Write `data` into a fresh file inside `dir`
pub fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).expect("write test file");
    path
}
