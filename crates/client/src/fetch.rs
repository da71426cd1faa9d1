//! Looking up and materializing a cached execution
//!
//! The server answers a fetch with every candidate entry for a command key.
//! Inputs common to all candidates form a shared list that is tested once and
//! collapsed into matching byte ranges; each candidate then only needs its
//! required ranges to fall inside a matching range, plus a test of its few
//! entry-specific inputs. The first candidate that passes wins.

use crate::binary::BinaryReader;
use crate::bucket::Bucket;
use crate::client::CacheClient;
use crate::process::{LogLinesType, ProcessLogLine, ProcessStartInfo, decode_log_lines};
use crate::roots::RootPaths;
use crate::session::{BuildSession, CacheStats};
use crate::transport::MessageType;
use crate::{Error, Result};
use buildcache_cas::CasKey;
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, trace};

/// Outcome of a fetch attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheResult {
    /// An entry matched and its outputs were materialized
    pub hit: bool,
    /// Log lines recorded for the reused execution
    pub log_lines: Vec<ProcessLogLine>,
    /// Why candidates were rejected, when miss reasons are reported
    pub misses: Vec<MissInfo>,
}

impl CacheResult {
    fn miss(misses: Vec<MissInfo>) -> Self {
        Self {
            hit: false,
            log_lines: Vec::new(),
            misses,
        }
    }
}

/// An input whose local content differed from a cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissInfo {
    /// Local path of the input
    pub path: String,
    /// Candidate that required it; shared inputs report 0
    pub entry_index: u32,
    /// Key recorded in the cache
    pub cache: CasKey,
    /// Key of the local file, zero when it is missing
    pub local: CasKey,
}

/// Closes the fetch trace on every exit path
struct FetchTrace<'a> {
    session: &'a dyn BuildSession,
    fetch_id: u32,
    stats: CacheStats,
    success: bool,
}

impl Drop for FetchTrace<'_> {
    fn drop(&mut self) {
        // Table pulls and normalization run inside entry tests; report them once
        let nested = self.stats.fetch_cas_table.time + self.stats.normalize_file.time;
        self.stats.test_entry.time = self.stats.test_entry.time.saturating_sub(nested);
        self.session.cache_end_fetch(self.fetch_id, self.success, &self.stats);
    }
}

/// Compares server cas-table entries with local files, caching results
struct HitTester<'a> {
    client: &'a CacheClient,
    roots: &'a RootPaths,
    info: &'a ProcessStartInfo,
    bucket: &'a Bucket,
    normalized_keys: HashMap<String, CasKey>,
    match_cache: HashMap<u32, bool>,
    misses: Vec<MissInfo>,
}

impl HitTester<'_> {
    fn is_match(&mut self, stats: &mut CacheStats, offset: u32, entry_index: u32, use_lookup: bool) -> Result<bool> {
        if use_lookup && let Some(&cached) = self.match_cache.get(&offset) {
            return Ok(cached);
        }

        self.client.fetch_cas_table(self.bucket, stats, offset)?;
        let (path, cache_key) = self.client.server_path_and_key(self.roots, self.bucket, offset)?;

        let local_key = if cache_key.is_normalized() {
            if let Some(&key) = self.normalized_keys.get(&path) {
                key
            } else {
                let started = Instant::now();
                let key = self
                    .roots
                    .normalize_and_hash_file(Path::new(&path))
                    .unwrap_or(CasKey::ZERO);
                stats.normalize_file.add_since(started);
                self.normalized_keys.insert(path.clone(), key);
                key
            }
        } else {
            let file_is_compressed = self.client.is_file_compressed(self.info, &path);
            match self.client.store.store_cas_key(Path::new(&path), file_is_compressed) {
                Ok(key) => key.unwrap_or(CasKey::ZERO),
                Err(e) => {
                    debug!(path = %path, error = %e, "Failed to hash local input");
                    CasKey::ZERO
                }
            }
        };

        let is_match = local_key == cache_key;
        if use_lookup {
            self.match_cache.insert(offset, is_match);
        }
        if !is_match && self.client.config.report_miss_reason {
            self.misses.push(MissInfo {
                path,
                entry_index,
                cache: cache_key,
                local: local_key,
            });
        }
        Ok(is_match)
    }
}

/// Collapse the shared offset list into byte ranges whose offsets all match.
///
/// When nothing matches the result is the single empty range `0..0`, so
/// entries requiring only the empty span still pass.
pub(crate) fn shared_matching_ranges<F>(shared: &[u8], mut is_match: F) -> Result<Vec<Range<u32>>>
where
    F: FnMut(u32) -> Result<bool>,
{
    let mut ranges = Vec::new();
    let mut begin = None;
    let mut reader = BinaryReader::new(shared);
    while !reader.is_empty() {
        let position = reader.position() as u32;
        let offset = reader.read_7bit_u32()?;
        match (is_match(offset)?, begin) {
            (true, None) => begin = Some(position),
            (false, Some(start)) => {
                ranges.push(start..position);
                begin = None;
            }
            _ => {}
        }
    }
    if let Some(start) = begin {
        ranges.push(start..reader.position() as u32);
    }
    if ranges.is_empty() {
        ranges.push(0..0);
    }
    Ok(ranges)
}

/// Returns true if every `[begin, end)` pair in `required` lies inside a
/// single matching range. Both lists are sorted.
pub(crate) fn ranges_covered(matching: &[Range<u32>], required: &[u8]) -> Result<bool> {
    let mut reader = BinaryReader::new(required);
    let mut index = 0;
    while !reader.is_empty() {
        let begin = reader.read_7bit()?;
        let end = reader.read_7bit()?;
        while index + 1 < matching.len() && u64::from(matching[index].end) <= begin {
            index += 1;
        }
        let Some(range) = matching.get(index) else {
            return Ok(false);
        };
        if u64::from(range.start) > begin || u64::from(range.end) < end {
            return Ok(false);
        }
    }
    Ok(true)
}

impl CacheClient {
    /// Look for a cached execution of `info` in bucket `bucket_id` and
    /// materialize its outputs.
    ///
    /// A miss is `Ok` with `hit == false`. Errors are reserved for transport,
    /// protocol and materialization failures.
    #[instrument(skip_all, fields(bucket = bucket_id, process = %info.label()))]
    pub fn fetch_from_cache(&self, roots: &RootPaths, bucket_id: u32, info: &ProcessStartInfo) -> Result<CacheResult> {
        if !self.is_connected() {
            return Ok(CacheResult::default());
        }

        let cmd_key = self.cmd_key(roots, info)?;

        let fetch_id = self.session.create_process_id();
        self.session.cache_begin_fetch(fetch_id, info.label());
        let mut trace = FetchTrace {
            session: self.session.as_ref(),
            fetch_id,
            stats: CacheStats::default(),
            success: false,
        };

        let bucket = self.bucket(bucket_id);

        let started = Instant::now();
        let mut writer = self.writer();
        writer.write_7bit(bucket.wire_id)?;
        writer.write_cas_key(cmd_key)?;
        let response = self.send(MessageType::FetchEntries, &writer)?;
        trace.stats.fetch_entries.add_since(started);

        let mut reader = BinaryReader::new(&response);
        let entry_count = u32::from(reader.read_u16()?);
        if entry_count == 0 {
            debug!(cmd_key = %cmd_key, "No cache entries");
            return Ok(CacheResult::default());
        }

        let mut tester = HitTester {
            client: self,
            roots,
            info,
            bucket: &bucket,
            normalized_keys: HashMap::new(),
            match_cache: HashMap::new(),
            misses: Vec::new(),
        };

        let started = Instant::now();
        let shared = reader.read_sized()?;
        let shared_log_lines = reader.read_sized()?;
        let stats = &mut trace.stats;
        let matching = shared_matching_ranges(shared, |offset| tester.is_match(stats, offset, 0, false))?;
        trace.stats.test_entry.add_since(started);
        trace!(ranges = ?matching, "Shared inputs tested");

        for entry_index in 0..entry_count {
            let entry_id = reader.read_7bit_u32()?;
            let extra = reader.read_sized()?;
            let ranges = reader.read_sized()?;
            let outputs = reader.read_sized()?;
            let log_lines_type = LogLinesType::from_u8(reader.read_u8()?)
                .ok_or_else(|| Error::protocol("unknown log lines type"))?;

            let started = Instant::now();
            let mut is_match = ranges_covered(&matching, ranges)?;
            let mut extra_reader = BinaryReader::new(extra);
            while is_match && !extra_reader.is_empty() {
                let offset = extra_reader.read_7bit_u32()?;
                is_match = tester.is_match(&mut trace.stats, offset, entry_index, true)?;
            }
            trace.stats.test_entry.add_since(started);
            if !is_match {
                continue;
            }

            if !self.config.use_cache_hit {
                debug!(entry = entry_id, "Cache hit ignored");
                return Ok(CacheResult::default());
            }

            let mut log_lines = Vec::new();
            if log_lines_type == LogLinesType::Shared {
                decode_log_lines(shared_log_lines, &mut log_lines)?;
            }
            self.report_used_entry(&bucket, cmd_key, entry_id, log_lines_type == LogLinesType::Owned, &mut log_lines)?;

            self.materialize_outputs(roots, &bucket, info, outputs, &mut trace.stats)?;
            trace.success = true;
            debug!(cmd_key = %cmd_key, entry = entry_id, "Cache hit");
            return Ok(CacheResult {
                hit: true,
                log_lines,
                misses: Vec::new(),
            });
        }

        for miss in &tester.misses {
            info!(
                path = %miss.path,
                entry = miss.entry_index,
                local = %miss.local,
                cache = %miss.cache,
                "Cache miss on {} because of mismatch",
                info.label()
            );
        }
        debug!(cmd_key = %cmd_key, candidates = entry_count, "Cache miss");
        Ok(CacheResult::miss(tester.misses))
    }

    pub(crate) fn server_path_and_key(&self, roots: &RootPaths, bucket: &Bucket, offset: u32) -> Result<(String, CasKey)> {
        let keys = bucket.server_keys.read();
        let paths = bucket.server_paths.read();
        self.local_path_and_key(roots, &keys, &paths, offset)
    }

    fn report_used_entry(
        &self,
        bucket: &Bucket,
        cmd_key: CasKey,
        entry_id: u32,
        owned_log_lines: bool,
        log_lines: &mut Vec<ProcessLogLine>,
    ) -> Result<()> {
        let mut writer = self.writer();
        writer.write_7bit(bucket.wire_id)?;
        writer.write_cas_key(cmd_key)?;
        writer.write_7bit(u64::from(entry_id))?;
        let response = self.send(MessageType::ReportUsedEntry, &writer)?;
        if owned_log_lines {
            decode_log_lines(&response, log_lines)?;
        }
        Ok(())
    }

    /// Download every output of the accepted entry, restoring root paths in
    /// normalized content
    fn materialize_outputs(
        &self,
        roots: &RootPaths,
        bucket: &Bucket,
        info: &ProcessStartInfo,
        outputs: &[u8],
        stats: &mut CacheStats,
    ) -> Result<()> {
        let mut reader = BinaryReader::new(outputs);
        while !reader.is_empty() {
            let offset = reader.read_7bit_u32()?;
            self.fetch_cas_table(bucket, stats, offset)?;

            let started = Instant::now();
            let (path, key) = self.server_path_and_key(roots, bucket, offset)?;
            let fs_path = Path::new(&path);
            let (content, received) = self.download_content(key)?;

            let (file_bytes, local_key) = if key.is_normalized() {
                let restored = roots.denormalize(&content)?;
                let local_key = CasKey::from_content(&restored).as_compressed(true);
                (restored, local_key)
            } else if self.is_file_compressed(info, &path) {
                (buildcache_cas::compress(&content)?, key)
            } else {
                (content, key)
            };

            if let Some(parent) = fs_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            std::fs::write(fs_path, &file_bytes).map_err(|e| Error::io(e, fs_path, "write"))?;
            let metadata = std::fs::metadata(fs_path).map_err(|e| Error::io(e, fs_path, "metadata"))?;
            let last_written = metadata.modified().map_err(|e| Error::io(e, fs_path, "metadata"))?;

            stats.fetch_bytes_raw += metadata.len();
            stats.fetch_bytes_comp += received as u64;

            self.store.fake_copy(local_key, fs_path, metadata.len(), last_written)?;
            if !self.session.register_new_file(fs_path) {
                return Err(Error::store_inconsistent(path, "session rejected materialized file"));
            }
            stats.fetch_output.add_since(started);
            trace!(path = %fs_path.display(), key = %local_key, "Materialized output");
        }
        Ok(())
    }
}
