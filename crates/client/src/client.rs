//! Cache client: connection lifecycle, buckets and shared helpers

use crate::binary::{BinaryReader, BinaryWriter};
use crate::bucket::{Bucket, make_id};
use crate::config::CacheClientConfig;
use crate::process::ProcessStartInfo;
use crate::roots::RootPaths;
use crate::session::BuildSession;
use crate::tables::{CompactCasKeyTable, CompactPathTable};
use crate::transport::{CACHE_NETWORK_VERSION, CACHE_SERVICE_ID, MessageType, Transport};
use crate::{Error, Result};
use backoff::backoff::Constant;
use buildcache_cas::{CasKey, CasKeyHasher, ContentStore};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Connection state of a [`CacheClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet, or the transport dropped
    Disconnected,
    /// Handshake accepted
    Connected,
    /// The server stayed busy through every retry; no further attempts
    GaveUp,
}

/// Why a handshake attempt did not connect
enum ConnectAttempt {
    Busy,
    Failed(Error),
}

/// Client for a remote build cache.
///
/// Shared between build-step threads through an `Arc`. Every call blocks the
/// calling thread for its network round-trips. When the client is not
/// connected, writes and fetches return immediately without caching.
pub struct CacheClient {
    pub(crate) config: CacheClientConfig,
    pub(crate) store: Arc<dyn ContentStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) session: Arc<dyn BuildSession>,
    state: Mutex<ConnectionState>,
    buckets: RwLock<HashMap<u32, Arc<Bucket>>>,
    pub(crate) send_one_at_a_time: Mutex<()>,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .field("buckets", &self.buckets.read().len())
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    /// Create a disconnected client
    #[must_use]
    pub fn new(
        config: CacheClientConfig,
        store: Arc<dyn ContentStore>,
        transport: Arc<dyn Transport>,
        session: Arc<dyn BuildSession>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            session,
            state: Mutex::new(ConnectionState::Disconnected),
            buckets: RwLock::new(HashMap::new()),
            send_one_at_a_time: Mutex::new(()),
        }
    }

    /// Client configuration
    #[must_use]
    pub const fn config(&self) -> &CacheClientConfig {
        &self.config
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Returns true once the handshake was accepted
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Perform the version handshake.
    ///
    /// A busy server is retried a bounded number of times with a fixed delay.
    /// Only the first busy reason is logged. When every retry is rejected the
    /// client gives up for the rest of the session and later calls return
    /// `Ok(false)` without contacting the server.
    #[instrument(skip(self))]
    pub fn connect(&self) -> Result<bool> {
        match self.state() {
            ConnectionState::Connected => return Ok(true),
            ConnectionState::GaveUp => return Ok(false),
            ConnectionState::Disconnected => {}
        }

        let retry_count = self.config.connect_retry_count;
        let mut attempts = 0;
        let outcome = if retry_count == 0 {
            Err(backoff::Error::permanent(ConnectAttempt::Busy))
        } else {
            let interval = Constant::new(self.config.connect_retry_delay());
            backoff::retry(interval, || {
                attempts += 1;
                match self.try_connect() {
                    Ok(None) => Ok(()),
                    Ok(Some(reason)) => {
                        if attempts == 1 {
                            info!(reason = %reason, "Cache server busy, retrying...");
                        }
                        if attempts >= retry_count {
                            Err(backoff::Error::permanent(ConnectAttempt::Busy))
                        } else {
                            Err(backoff::Error::transient(ConnectAttempt::Busy))
                        }
                    }
                    Err(e) => Err(backoff::Error::permanent(ConnectAttempt::Failed(e))),
                }
            })
        };

        match outcome {
            Ok(()) => {
                if attempts > 1 {
                    info!("Connected to cache server");
                }
                *self.state.lock() = ConnectionState::Connected;
                Ok(true)
            }
            Err(backoff::Error::Permanent(ConnectAttempt::Failed(e))) => {
                info!(error = %e, "Failed to send connect message to cache server. Version mismatch?");
                Err(e)
            }
            Err(_) => {
                info!(retries = attempts, "Failed to connect to cache server. Giving up.");
                *self.state.lock() = ConnectionState::GaveUp;
                Ok(false)
            }
        }
    }

    /// One handshake. Returns the busy reason when the server declined
    fn try_connect(&self) -> Result<Option<String>> {
        let mut writer = self.writer();
        writer.write_u32(CACHE_NETWORK_VERSION)?;
        let response = self.send(MessageType::Connect, &writer)?;
        let mut reader = BinaryReader::new(&response);
        if reader.read_bool()? {
            return Ok(None);
        }
        Ok(Some(reader.read_string().unwrap_or_default()))
    }

    /// Transport lost its connection
    pub fn on_disconnected(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connected {
            debug!("Cache server disconnected");
            *state = ConnectionState::Disconnected;
        }
    }

    /// Wire id for `bucket_id` under this client's configuration
    #[must_use]
    pub const fn make_id(&self, bucket_id: u32) -> u64 {
        make_id(bucket_id, self.config.case_insensitive_fs, self.config.use_roots)
    }

    /// Bucket for `bucket_id`, created on first use
    pub fn bucket(&self, bucket_id: u32) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().get(&bucket_id) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write();
        Arc::clone(buckets.entry(bucket_id).or_insert_with(|| {
            Arc::new(Bucket::new(
                bucket_id,
                self.make_id(bucket_id),
                self.config.case_insensitive_fs,
            ))
        }))
    }

    pub(crate) fn writer(&self) -> BinaryWriter {
        BinaryWriter::with_limit(self.transport.max_message_size())
    }

    pub(crate) fn send(&self, message_type: MessageType, writer: &BinaryWriter) -> Result<Vec<u8>> {
        self.transport
            .send(CACHE_SERVICE_ID, message_type as u8, writer.as_slice())
            .map_err(|e| Error::transport(message_type, e.to_string()))
    }

    /// Key identifying the execution signature of `info`: the tool binary,
    /// the arguments and the response file. Arguments and response file are
    /// normalized only when roots are in use.
    pub fn cmd_key(&self, roots: &RootPaths, info: &ProcessStartInfo) -> Result<CasKey> {
        let mut hasher = CasKeyHasher::new();

        // cmd.exe differs between OS versions but behaves the same, so only its name counts
        if is_cmd_exe(&info.application) {
            hasher.update(b"cmd.exe");
        } else {
            let key = self
                .store
                .store_cas_key(Path::new(&info.application), false)?
                .ok_or_else(|| Error::ExecutableNotFound {
                    name: info.application.clone(),
                })?;
            hasher.update(key.as_bytes());
        }

        if self.config.use_roots {
            roots.normalize_string(info.arguments.as_bytes(), |chunk, _| hasher.update(chunk));
        } else {
            hasher.update(info.arguments.as_bytes());
        }

        if let Some(rsp) = info.response_file() {
            let rsp_key = if self.config.use_roots {
                roots.normalize_and_hash_file(&rsp)?
            } else {
                let data = std::fs::read(&rsp).map_err(|e| Error::io(e, &rsp, "read"))?;
                CasKey::from_content(&data)
            };
            hasher.update(rsp_key.as_bytes());
        }

        Ok(hasher.finish(false))
    }

    /// Whether `path` is kept compressed on disk for `info`
    pub(crate) fn is_file_compressed(&self, info: &ProcessStartInfo, path: &str) -> bool {
        if !self.session.should_store_obj_files_compressed() {
            return false;
        }
        match &info.rules {
            Some(rules) => rules.store_file_compressed(path),
            None => self.session.compression_policy(info).store_file_compressed(path),
        }
    }

    /// Resolve a cas-table offset to a local path and its key
    pub(crate) fn local_path_and_key(
        &self,
        roots: &RootPaths,
        keys: &CompactCasKeyTable,
        paths: &CompactPathTable,
        offset: u32,
    ) -> Result<(String, CasKey)> {
        let (stored, key) = keys.get_path_and_key(offset, paths)?;
        if self.config.use_roots {
            Ok((roots.resolve(&stored)?, key))
        } else {
            Ok((stored, key))
        }
    }

    /// Download the payload of `key` and return the file content plus the
    /// number of bytes received
    pub(crate) fn download_content(&self, key: CasKey) -> Result<(Vec<u8>, usize)> {
        let payload = self
            .transport
            .download_blob(key)
            .map_err(|e| Error::blob_transfer(key, e.to_string()))?;
        let received = payload.len();
        if key.is_compressed() {
            Ok((buildcache_cas::decompress(&payload)?, received))
        } else {
            Ok((payload, received))
        }
    }

    /// Upload one payload, one at a time
    pub(crate) fn upload_content(&self, key: CasKey, payload: &[u8]) -> Result<()> {
        let _guard = self.send_one_at_a_time.lock();
        self.transport
            .upload_blob(key, payload)
            .map_err(|e| Error::blob_transfer(key, e.to_string()))
    }

    /// Ask the server to shut down; returns whether it accepted
    #[instrument(skip(self))]
    pub fn request_server_shutdown(&self, reason: &str) -> Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        let mut writer = self.writer();
        writer.write_string(reason)?;
        let response = self.send(MessageType::RequestShutdown, &writer)?;
        BinaryReader::new(&response).read_bool()
    }

    /// Run an administrative command on the server (`status`, `content`,
    /// `maintenance`, `obliterate`).
    ///
    /// The server answers with the key of a text blob. With a `destination`
    /// the blob is written there and no lines are returned; otherwise its
    /// lines are returned.
    #[instrument(skip(self, destination))]
    pub fn execute_command(
        &self,
        command: &str,
        destination: Option<&Path>,
        additional_info: &str,
    ) -> Result<Vec<String>> {
        let mut writer = self.writer();
        writer.write_string(command)?;
        writer.write_string(additional_info)?;
        let response = self.send(MessageType::ExecuteCommand, &writer)?;
        let status_key = BinaryReader::new(&response).read_cas_key()?;
        if status_key.is_zero() {
            return Err(Error::protocol(format!("server produced no output for command '{command}'")));
        }

        let (content, _) = self.download_content(status_key)?;
        if let Some(destination) = destination {
            std::fs::write(destination, &content).map_err(|e| Error::io(e, destination, "write"))?;
            return Ok(Vec::new());
        }
        Ok(status_lines(&content))
    }
}

fn is_cmd_exe(application: &str) -> bool {
    application.to_ascii_lowercase().contains("cmd.exe")
}

/// Lines of a status blob: optional UTF-8 BOM, lines split on `\n`, text
/// ends at the first zero byte
fn status_lines(content: &[u8]) -> Vec<String> {
    let content = content.strip_prefix(&[0xef, 0xbb, 0xbf]).unwrap_or(content);
    let end = content.iter().position(|&b| b == 0).unwrap_or(content.len());
    let text = String::from_utf8_lossy(&content[..end]);
    text.split('\n')
        .map(|line| line.trim_end_matches('\r').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}
