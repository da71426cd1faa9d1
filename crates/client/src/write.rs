//! Publishing a finished command execution to the cache

use crate::binary::{BinaryReader, varint_len};
use crate::bucket::Bucket;
use crate::client::CacheClient;
use crate::process::{ProcessLogLine, ProcessStartInfo, encode_log_lines};
use crate::roots::RootPaths;
use crate::session::BuildSession;
use crate::transport::MessageType;
use crate::{Error, Result};
use buildcache_cas::CasKey;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Extensions of files that may embed absolute paths in their content
const NORMALIZED_EXTENSIONS: [&str; 5] = [".dep.json", ".d", ".tlh", ".rsp", ".bat"];

/// Closes the write trace on every exit path
struct WriteTrace<'a> {
    session: &'a dyn BuildSession,
    process_id: Option<u32>,
    finished: bool,
    bytes_sent: u64,
}

impl<'a> WriteTrace<'a> {
    fn begin(session: &'a dyn BuildSession, process_id: Option<u32>) -> Self {
        if let Some(id) = process_id {
            session.cache_begin_write(id);
        }
        Self {
            session,
            process_id,
            finished: false,
            bytes_sent: 0,
        }
    }
}

impl Drop for WriteTrace<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.process_id {
            self.session.cache_end_write(id, self.finished, self.bytes_sent);
        }
    }
}

/// Offsets of one side of an entry: send path offset -> send cas offset
type EntryFiles = BTreeMap<u32, u32>;

impl CacheClient {
    /// Record a finished execution of `info` in bucket `bucket_id`.
    ///
    /// Outputs are walked before inputs; a path that is also an output is
    /// dropped from the inputs. Returns `Ok(false)` without contacting the
    /// server when the client is disconnected or there are no inputs. Any
    /// error means no entry was published.
    #[instrument(skip_all, fields(bucket = bucket_id, process = %info.label()))]
    pub fn write_to_cache(
        &self,
        roots: &RootPaths,
        bucket_id: u32,
        info: &ProcessStartInfo,
        inputs: &[String],
        outputs: &[String],
        log_lines: &[ProcessLogLine],
        process_id: Option<u32>,
    ) -> Result<bool> {
        if !self.is_connected() || inputs.is_empty() {
            return Ok(false);
        }

        let cmd_key = self.cmd_key(roots, info)?;
        let mut trace = WriteTrace::begin(self.session.as_ref(), process_id);
        let bucket = self.bucket(bucket_id);

        let mut input_files = EntryFiles::new();
        let mut output_files = EntryFiles::new();
        let mut required_path_size = 0u32;
        let mut required_cas_size = 0u32;
        let mut first_error = None;

        let walk = outputs.iter().map(|p| (p, true)).chain(inputs.iter().map(|p| (p, false)));
        for (original, is_output) in walk {
            let (path, normalized_key) = match self.prepare_path(roots, info, original) {
                Ok(prepared) => prepared,
                Err(e) if e.is_configuration() => {
                    info!(path = %original, error = %e, "Skipping cache write");
                    first_error.get_or_insert(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let qualified = if self.config.use_roots {
                match roots.qualify(&path) {
                    Ok(Some(qualified)) => qualified,
                    Ok(None) => continue,
                    Err(e) => {
                        info!(path = %path, "File without root");
                        first_error.get_or_insert(e);
                        continue;
                    }
                }
            } else {
                path.clone()
            };

            let path_slot = bucket.send_paths.write().add(&qualified)?;
            required_path_size = required_path_size.max(path_slot.end);

            // Outputs were walked first: a file the command rewrote is not an input
            if !is_output && output_files.contains_key(&path_slot.offset) {
                continue;
            }
            let files = if is_output { &mut output_files } else { &mut input_files };
            if files.contains_key(&path_slot.offset) {
                continue;
            }

            let key = match normalized_key {
                Some(key) => key,
                None => match self.hash_entry_file(info, &path, is_output)? {
                    Some(key) => key,
                    None => continue,
                },
            };

            let cas_slot = bucket.send_keys.write().add(key.as_compressed(true), path_slot.offset)?;
            required_cas_size = required_cas_size.max(cas_slot.end);
            files.insert(path_slot.offset, cas_slot.offset);
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if output_files.is_empty() {
            warn!("No outputs from process");
        }

        // The server must be able to resolve every offset the entry carries
        self.send_path_table(&bucket, required_path_size)?;
        self.send_cas_table(&bucket, required_cas_size)?;

        trace.bytes_sent = self.send_cache_entry(&bucket, roots, cmd_key, &input_files, &output_files, log_lines)?;
        trace.finished = true;
        debug!(cmd_key = %cmd_key, inputs = input_files.len(), outputs = output_files.len(), "Wrote cache entry");
        Ok(true)
    }

    /// Resolve relative tool binaries and pre-hash files that embed paths
    fn prepare_path(
        &self,
        roots: &RootPaths,
        info: &ProcessStartInfo,
        path: &str,
    ) -> Result<(String, Option<CasKey>)> {
        if path.len() < 2 {
            return Err(Error::invalid_path(path, format!("malformed path from {}", info.label())));
        }

        let lower = path.to_ascii_lowercase();
        if !Path::new(path).is_absolute()
            && path.as_bytes()[1] != b':'
            && (lower.ends_with(".dll") || lower.ends_with(".exe"))
        {
            let found = which::which(path).map_err(|_| Error::ExecutableNotFound {
                name: path.to_string(),
            })?;
            return Ok((found.to_string_lossy().into_owned(), None));
        }

        if self.should_normalize(&lower) {
            let key = roots.normalize_and_hash_file(Path::new(path))?;
            // Without any root inside, the plain store key is used
            return Ok((path.to_string(), key.is_normalized().then_some(key)));
        }

        if path.ends_with(':') {
            return Err(Error::invalid_path(path, "unknown relative path"));
        }
        Ok((path.to_string(), None))
    }

    fn should_normalize(&self, lower_path: &str) -> bool {
        self.config.use_roots && NORMALIZED_EXTENSIONS.iter().any(|ext| lower_path.ends_with(ext))
    }

    /// Key of an entry file from the content store, validated against disk
    /// when configured. `None` means the file vanished (a temporary output).
    fn hash_entry_file(&self, info: &ProcessStartInfo, path: &str, is_output: bool) -> Result<Option<CasKey>> {
        let should_validate = if is_output {
            self.config.validate_cache_writes_output
        } else {
            self.config.validate_cache_writes_input
        };
        let file_is_compressed = self.is_file_compressed(info, path);
        let fs_path = Path::new(path);

        let key = if is_output {
            self.store.store_cas_file(fs_path, file_is_compressed)?
        } else {
            self.store.store_cas_key(fs_path, file_is_compressed)?
        };

        let Some(key) = key else {
            if should_validate && fs_path.exists() {
                warn!(path, process = %info.label(), "Content store claims file does not exist but it does. Will not populate cache");
                return Err(Error::store_inconsistent(path, "store reports missing file that exists"));
            }
            return Ok(None);
        };

        if should_validate {
            let data = std::fs::read(fs_path).map_err(|e| {
                warn!(path, process = %info.label(), "Content store claims file exists but it can't be opened. Will not populate cache");
                Error::io(e, fs_path, "read")
            })?;
            let stored = key.as_compressed(false);
            let actual = CasKey::for_file_bytes(&data, file_is_compressed)?;
            if stored != actual {
                warn!(path, %stored, %actual, process = %info.label(), "Content store key differs from file on disk. Will not populate cache");
                return Err(Error::ValidationMismatch {
                    path: path.to_string(),
                    stored,
                    actual,
                });
            }
        }
        Ok(Some(key))
    }

    /// Send the entry and upload whatever content the server lacks
    fn send_cache_entry(
        &self,
        bucket: &Bucket,
        roots: &RootPaths,
        cmd_key: CasKey,
        inputs: &EntryFiles,
        outputs: &EntryFiles,
        log_lines: &[ProcessLogLine],
    ) -> Result<u64> {
        let mut writer = self.writer();
        writer.write_7bit(bucket.wire_id)?;
        writer.write_cas_key(cmd_key)?;
        writer.write_7bit(inputs.len() as u64)?;
        writer.write_7bit(outputs.len() as u64)?;
        for &offset in outputs.values() {
            writer.write_7bit(u64::from(offset))?;
        }
        for &offset in inputs.values() {
            writer.write_7bit(u64::from(offset))?;
        }
        let log_bytes = encode_log_lines(log_lines)?;
        if !log_bytes.is_empty() && writer.capacity_left() > log_bytes.len() + varint_len(log_bytes.len() as u64) {
            writer.write_bytes(&log_bytes)?;
        }

        let missing = self.send(MessageType::StoreEntry, &writer)?;
        if missing.is_empty() {
            return Ok(0);
        }

        let uploaded = self.upload_missing_content(bucket, roots, &missing);

        let mut done = self.writer();
        done.write_7bit(bucket.wire_id)?;
        done.write_cas_key(cmd_key)?;
        done.write_bool(uploaded.is_ok())?;
        let acknowledged = self.send(MessageType::StoreEntryDone, &done);

        let bytes_sent = uploaded?;
        acknowledged?;
        Ok(bytes_sent)
    }

    fn upload_missing_content(&self, bucket: &Bucket, roots: &RootPaths, missing: &[u8]) -> Result<u64> {
        let mut bytes_sent = 0u64;
        let mut reader = BinaryReader::new(missing);
        while !reader.is_empty() {
            let offset = reader.read_7bit_u32()?;
            let (path, key) = {
                let keys = bucket.send_keys.read();
                let paths = bucket.send_paths.read();
                self.local_path_and_key(roots, &keys, &paths, offset)?
            };
            let key = key.as_compressed(true);

            if self.store.has_cas_file(key) {
                let file_name = self
                    .store
                    .cas_file_name(key)
                    .ok_or_else(|| Error::store_inconsistent(&path, "stored content has no file"))?;
                let payload = std::fs::read(&file_name).map_err(|e| Error::io(e, &file_name, "read"))?;
                self.upload_content(key, &payload)?;
                bytes_sent += payload.len() as u64;
            } else if key.is_normalized() {
                // Content with roots substituted so any machine can restore it
                let data = std::fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?;
                let blob = roots.build_normalized_blob(&data);
                let payload = buildcache_cas::compress(&blob)?;
                self.upload_content(key, &payload)?;
                bytes_sent += payload.len() as u64;
            } else {
                return Err(Error::store_inconsistent(path, "can't find output file to send to cache server"));
            }
        }
        Ok(bytes_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheClientConfig;
    use crate::session::NullSession;
    use crate::transport::{Transport, TransportError};
    use buildcache_cas::DiskStore;
    use std::sync::Arc;

    struct Offline;

    impl Transport for Offline {
        fn send(&self, _: u8, _: u8, _: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
            Err(TransportError::Disconnected)
        }
        fn max_message_size(&self) -> usize {
            64 * 1024
        }
        fn upload_blob(&self, _: CasKey, _: &[u8]) -> std::result::Result<(), TransportError> {
            Err(TransportError::Disconnected)
        }
        fn download_blob(&self, key: CasKey) -> std::result::Result<Vec<u8>, TransportError> {
            Err(TransportError::BlobNotFound(key))
        }
    }

    fn client(use_roots: bool) -> CacheClient {
        let config = CacheClientConfig {
            use_roots,
            ..CacheClientConfig::default()
        };
        CacheClient::new(
            config,
            Arc::new(DiskStore::new(std::env::temp_dir().join("buildcache-write-tests"))),
            Arc::new(Offline),
            Arc::new(NullSession::default()),
        )
    }

    #[test]
    fn test_should_normalize_extensions() {
        let client = client(true);
        assert!(client.should_normalize("/out/a.dep.json"));
        assert!(client.should_normalize("/out/a.d"));
        assert!(client.should_normalize("/out/a.rsp"));
        assert!(!client.should_normalize("/out/a.obj"));
        assert!(!self::client(false).should_normalize("/out/a.d"));
    }

    #[test]
    fn test_prepare_path_rejects_malformed() {
        let client = client(true);
        let roots = RootPaths::with_case_insensitive(false);
        let info = ProcessStartInfo::new("/bin/cc", "");
        assert!(matches!(client.prepare_path(&roots, &info, "a"), Err(Error::InvalidPath { .. })));
        assert!(matches!(client.prepare_path(&roots, &info, "c:"), Err(Error::InvalidPath { .. })));
        let (path, key) = client.prepare_path(&roots, &info, "/work/a.cpp").unwrap();
        assert_eq!(path, "/work/a.cpp");
        assert!(key.is_none());
    }

    #[test]
    fn test_prepare_path_missing_relative_tool() {
        let client = client(true);
        let roots = RootPaths::with_case_insensitive(false);
        let info = ProcessStartInfo::new("/bin/cc", "");
        let err = client
            .prepare_path(&roots, &info, "definitely-not-a-real-tool-4711.exe")
            .unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound { .. }));
    }

    #[test]
    fn test_disconnected_write_is_a_no_op() {
        let client = client(true);
        let roots = RootPaths::with_case_insensitive(false);
        let info = ProcessStartInfo::new("/bin/cc", "");
        let written = client
            .write_to_cache(&roots, 1, &info, &["/a.cpp".to_string()], &[], &[], None)
            .unwrap();
        assert!(!written);
    }
}
