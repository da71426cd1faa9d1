//! Build session hooks and per-fetch statistics

use crate::process::{CompressionPolicy, ObjFileCompression, ProcessStartInfo};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Accumulated count and time of one kind of work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    /// Number of timed sections
    pub count: u32,
    /// Total time spent
    pub time: Duration,
}

impl Timer {
    /// Record a section that started at `started`
    pub fn add_since(&mut self, started: Instant) {
        self.count += 1;
        self.time += started.elapsed();
    }
}

/// Statistics of one fetch attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requesting candidate entries
    pub fetch_entries: Timer,
    /// Pulling server tables
    pub fetch_cas_table: Timer,
    /// Normalizing and hashing local files
    pub normalize_file: Timer,
    /// Testing candidate entries
    pub test_entry: Timer,
    /// Downloading outputs
    pub fetch_output: Timer,
    /// Bytes of outputs written to disk
    pub fetch_bytes_raw: u64,
    /// Bytes of outputs received
    pub fetch_bytes_comp: u64,
}

/// Hooks into the surrounding build session.
///
/// Every method has a no-op default so embedders implement only what they
/// trace.
pub trait BuildSession: Send + Sync {
    /// Allocate an id for a fetch trace
    fn create_process_id(&self) -> u32 {
        0
    }

    /// A fetch for `description` started
    fn cache_begin_fetch(&self, _fetch_id: u32, _description: &str) {}

    /// A fetch finished
    fn cache_end_fetch(&self, _fetch_id: u32, _success: bool, _stats: &CacheStats) {}

    /// A write for `process_id` started
    fn cache_begin_write(&self, _process_id: u32) {}

    /// A write finished
    fn cache_end_write(&self, _process_id: u32, _success: bool, _bytes_sent: u64) {}

    /// A file was materialized from the cache
    fn register_new_file(&self, _path: &Path) -> bool {
        true
    }

    /// Whether object files are kept compressed at all
    fn should_store_obj_files_compressed(&self) -> bool {
        false
    }

    /// Compression rules for a command without its own
    fn compression_policy(&self, _info: &ProcessStartInfo) -> Arc<dyn CompressionPolicy> {
        Arc::new(ObjFileCompression)
    }
}

/// Session without tracing
#[derive(Debug, Default)]
pub struct NullSession {
    next_id: AtomicU32,
}

impl BuildSession for NullSession {
    fn create_process_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}
