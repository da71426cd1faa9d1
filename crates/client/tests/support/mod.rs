//! In-memory cache server and fixtures for integration tests
//!
//! The mock speaks the client's wire protocol: it keeps the tables each
//! connection pushes, re-interns published entries into per-bucket server
//! tables, and answers fetches with a shared offset section computed from all
//! entries of a command key.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use buildcache_cas::{CasKey, DiskStore};
use buildcache_client::binary::{BinaryReader, BinaryWriter, push_7bit};
use buildcache_client::process::LogLinesType;
use buildcache_client::tables::{CompactCasKeyTable, CompactPathTable};
use buildcache_client::transport::CACHE_NETWORK_VERSION;
use buildcache_client::{
    BuildSession, CacheClient, CacheClientConfig, CacheStats, MessageType, ProcessStartInfo,
    RootPaths, Transport, TransportError,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Server state
// =============================================================================

#[derive(Debug, Clone)]
struct ServerEntry {
    id: u32,
    inputs: Vec<u32>,
    outputs: Vec<u32>,
    log_lines: Vec<u8>,
    log_lines_type: LogLinesType,
}

#[derive(Debug, Default)]
struct CommandEntries {
    /// Newest first
    entries: Vec<ServerEntry>,
    shared_log_lines: Vec<u8>,
}

#[derive(Debug)]
struct ServerBucket {
    paths: CompactPathTable,
    keys: CompactCasKeyTable,
    commands: HashMap<CasKey, CommandEntries>,
}

impl Default for ServerBucket {
    fn default() -> Self {
        Self {
            paths: CompactPathTable::new(false),
            keys: CompactCasKeyTable::new(),
            commands: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct ClientTables {
    paths: CompactPathTable,
    keys: CompactCasKeyTable,
}

impl Default for ClientTables {
    fn default() -> Self {
        Self {
            paths: CompactPathTable::mirror(),
            keys: CompactCasKeyTable::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    next_connection: u32,
    next_entry_id: u32,
    busy_remaining: u32,
    busy_reason: String,
    fail_on: Option<MessageType>,
    messages: Vec<MessageType>,
    client_tables: HashMap<(u32, u64), ClientTables>,
    buckets: HashMap<u64, ServerBucket>,
    pending: HashMap<(u32, u64, CasKey), ServerEntry>,
    blobs: HashMap<CasKey, Vec<u8>>,
    uploads: Vec<CasKey>,
    used_entries: Vec<u32>,
    shutdown_reason: Option<String>,
}

/// Cache server living in the test process
#[derive(Debug)]
pub struct MockCacheServer {
    state: Mutex<ServerState>,
    max_message_size: usize,
}

impl MockCacheServer {
    pub fn new() -> Arc<Self> {
        Self::with_max_message_size(64 * 1024)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            max_message_size,
        })
    }

    /// New connection with its own client tables
    pub fn connect(self: &Arc<Self>) -> Arc<MockConnection> {
        let mut state = self.state.lock();
        state.next_connection += 1;
        Arc::new(MockConnection {
            server: Arc::clone(self),
            id: state.next_connection,
        })
    }

    /// Reject the next `count` connect attempts as busy
    pub fn set_busy(&self, count: u32, reason: &str) {
        let mut state = self.state.lock();
        state.busy_remaining = count;
        state.busy_reason = reason.to_string();
    }

    /// Fail every message of `message_type`
    pub fn fail_on(&self, message_type: Option<MessageType>) {
        self.state.lock().fail_on = message_type;
    }

    pub fn messages(&self) -> Vec<MessageType> {
        self.state.lock().messages.clone()
    }

    pub fn count(&self, message_type: MessageType) -> usize {
        self.state.lock().messages.iter().filter(|m| **m == message_type).count()
    }

    pub fn clear_messages(&self) {
        self.state.lock().messages.clear();
    }

    pub fn uploads(&self) -> Vec<CasKey> {
        self.state.lock().uploads.clone()
    }

    pub fn used_entries(&self) -> Vec<u32> {
        self.state.lock().used_entries.clone()
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.state.lock().shutdown_reason.clone()
    }

    pub fn entry_count(&self, wire_id: u64, cmd_key: CasKey) -> usize {
        self.state
            .lock()
            .buckets
            .get(&wire_id)
            .and_then(|bucket| bucket.commands.get(&cmd_key))
            .map_or(0, |command| command.entries.len())
    }

    /// Qualified (input, output) paths of the newest entry for `cmd_key`
    pub fn latest_entry_paths(&self, wire_id: u64, cmd_key: CasKey) -> Option<(Vec<String>, Vec<String>)> {
        let state = self.state.lock();
        let bucket = state.buckets.get(&wire_id)?;
        let entry = bucket.commands.get(&cmd_key)?.entries.first()?;
        let resolve = |offsets: &[u32]| {
            offsets
                .iter()
                .map(|&offset| bucket.keys.get_path_and_key(offset, &bucket.paths).unwrap().0)
                .collect::<Vec<_>>()
        };
        Some((resolve(&entry.inputs), resolve(&entry.outputs)))
    }

    fn handle(&self, connection: u32, message_type: MessageType, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        state.messages.push(message_type);
        if state.fail_on == Some(message_type) {
            return Err(TransportError::Failed("injected failure".to_string()));
        }
        let mut reader = BinaryReader::new(payload);
        let mut out = BinaryWriter::unbounded();
        let result = match message_type {
            MessageType::Connect => state.connect(&mut reader, &mut out),
            MessageType::StorePathTable | MessageType::StoreCasTable => {
                let id = reader.read_7bit().unwrap();
                let tables = state.client_tables.entry((connection, id)).or_default();
                if message_type == MessageType::StorePathTable {
                    tables.paths.append_bytes(reader.remaining()).unwrap();
                } else {
                    tables.keys.append_bytes(reader.remaining()).unwrap();
                }
                Ok(())
            }
            MessageType::FetchPathTable | MessageType::FetchCasTable => {
                let id = reader.read_7bit().unwrap();
                let have = reader.read_u32().unwrap() as usize;
                let bucket = state.buckets.entry(id).or_default();
                let memory = if message_type == MessageType::FetchPathTable {
                    bucket.paths.memory()
                } else {
                    bucket.keys.memory()
                };
                let end = memory.len().min(have + self.max_message_size);
                out.write_u32(memory.len() as u32).unwrap();
                out.write_bytes(&memory[have.min(end)..end]).unwrap();
                Ok(())
            }
            MessageType::StoreEntry => state.store_entry(connection, &mut reader, &mut out),
            MessageType::StoreEntryDone => {
                let id = reader.read_7bit().unwrap();
                let cmd_key = reader.read_cas_key().unwrap();
                let success = reader.read_bool().unwrap();
                if let Some(entry) = state.pending.remove(&(connection, id, cmd_key)) {
                    if success {
                        state.commit(id, cmd_key, entry);
                    }
                }
                Ok(())
            }
            MessageType::FetchEntries => state.fetch_entries(&mut reader, &mut out),
            MessageType::ReportUsedEntry => {
                let id = reader.read_7bit().unwrap();
                let cmd_key = reader.read_cas_key().unwrap();
                let entry_id = reader.read_7bit().unwrap() as u32;
                state.used_entries.push(entry_id);
                let owned = state
                    .buckets
                    .get(&id)
                    .and_then(|bucket| bucket.commands.get(&cmd_key))
                    .and_then(|command| command.entries.iter().find(|e| e.id == entry_id))
                    .filter(|entry| entry.log_lines_type == LogLinesType::Owned)
                    .map(|entry| entry.log_lines.clone());
                if let Some(lines) = owned {
                    out.write_bytes(&lines).unwrap();
                }
                Ok(())
            }
            MessageType::RequestShutdown => {
                state.shutdown_reason = Some(reader.read_string().unwrap());
                out.write_bool(true).unwrap();
                Ok(())
            }
            MessageType::ExecuteCommand => state.execute_command(&mut reader, &mut out),
        };
        result.map(|()| out.into_inner())
    }
}

impl ServerState {
    fn connect(&mut self, reader: &mut BinaryReader<'_>, out: &mut BinaryWriter) -> Result<(), TransportError> {
        if reader.read_u32().unwrap() != CACHE_NETWORK_VERSION {
            return Err(TransportError::Failed("version mismatch".to_string()));
        }
        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            out.write_bool(false).unwrap();
            out.write_string(&self.busy_reason).unwrap();
        } else {
            out.write_bool(true).unwrap();
        }
        Ok(())
    }

    fn store_entry(&mut self, connection: u32, reader: &mut BinaryReader<'_>, out: &mut BinaryWriter) -> Result<(), TransportError> {
        let id = reader.read_7bit().unwrap();
        let cmd_key = reader.read_cas_key().unwrap();
        let input_count = reader.read_7bit().unwrap();
        let output_count = reader.read_7bit().unwrap();
        let outputs: Vec<u32> = (0..output_count).map(|_| reader.read_7bit_u32().unwrap()).collect();
        let inputs: Vec<u32> = (0..input_count).map(|_| reader.read_7bit_u32().unwrap()).collect();
        let log_lines = reader.remaining().to_vec();

        let tables = self
            .client_tables
            .get(&(connection, id))
            .ok_or_else(|| TransportError::Failed("entry references unknown tables".to_string()))?;
        let resolved = |offsets: &[u32]| -> Vec<(String, CasKey, u32)> {
            offsets
                .iter()
                .map(|&offset| {
                    let (path, key) = tables.keys.get_path_and_key(offset, &tables.paths).unwrap();
                    (path, key, offset)
                })
                .collect()
        };
        let resolved_inputs = resolved(&inputs);
        let resolved_outputs = resolved(&outputs);

        let bucket = self.buckets.entry(id).or_default();
        let mut intern = |(path, key, _): &(String, CasKey, u32)| {
            let path_offset = bucket.paths.add(path).unwrap().offset;
            bucket.keys.add(*key, path_offset).unwrap().offset
        };
        let server_inputs: Vec<u32> = resolved_inputs.iter().map(&mut intern).collect();
        let server_outputs: Vec<u32> = resolved_outputs.iter().map(&mut intern).collect();

        let mut missing = false;
        for (_, key, client_offset) in &resolved_outputs {
            if !self.blobs.contains_key(key) {
                out.write_7bit(u64::from(*client_offset)).unwrap();
                missing = true;
            }
        }

        self.next_entry_id += 1;
        let entry = ServerEntry {
            id: self.next_entry_id,
            inputs: server_inputs,
            outputs: server_outputs,
            log_lines,
            log_lines_type: LogLinesType::Empty,
        };
        if missing {
            self.pending.insert((connection, id, cmd_key), entry);
        } else {
            self.commit(id, cmd_key, entry);
        }
        Ok(())
    }

    fn commit(&mut self, id: u64, cmd_key: CasKey, mut entry: ServerEntry) {
        let command = self.buckets.entry(id).or_default().commands.entry(cmd_key).or_default();
        entry.log_lines_type = if entry.log_lines.is_empty() {
            LogLinesType::Empty
        } else if command.shared_log_lines.is_empty() && entry.log_lines.len() < 150 {
            command.shared_log_lines = entry.log_lines.clone();
            LogLinesType::Shared
        } else if command.shared_log_lines == entry.log_lines {
            LogLinesType::Shared
        } else {
            LogLinesType::Owned
        };
        command.entries.insert(0, entry);
    }

    fn fetch_entries(&mut self, reader: &mut BinaryReader<'_>, out: &mut BinaryWriter) -> Result<(), TransportError> {
        let id = reader.read_7bit().unwrap();
        let cmd_key = reader.read_cas_key().unwrap();
        let Some(command) = self.buckets.get(&id).and_then(|bucket| bucket.commands.get(&cmd_key)) else {
            out.write_u16(0).unwrap();
            return Ok(());
        };

        // Inputs used by at least two entries (or every input of a lone entry) are shared
        let threshold = command.entries.len().min(2);
        let mut usage: HashMap<u32, usize> = HashMap::new();
        for entry in &command.entries {
            for &input in entry.inputs.iter().collect::<BTreeSet<_>>() {
                *usage.entry(input).or_default() += 1;
            }
        }
        let shared: Vec<u32> = usage
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(offset, _)| *offset)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut shared_bytes = Vec::new();
        let mut positions = Vec::new();
        for &offset in &shared {
            let begin = shared_bytes.len() as u64;
            push_7bit(&mut shared_bytes, u64::from(offset));
            positions.push((begin, shared_bytes.len() as u64));
        }

        out.write_u16(command.entries.len() as u16).unwrap();
        out.write_7bit(shared_bytes.len() as u64).unwrap();
        out.write_bytes(&shared_bytes).unwrap();
        out.write_7bit(command.shared_log_lines.len() as u64).unwrap();
        out.write_bytes(&command.shared_log_lines).unwrap();

        for entry in &command.entries {
            let inputs: BTreeSet<u32> = entry.inputs.iter().copied().collect();

            let mut extra = Vec::new();
            for &input in &inputs {
                if shared.binary_search(&input).is_err() {
                    push_7bit(&mut extra, u64::from(input));
                }
            }

            let mut ranges = Vec::new();
            let mut run: Option<(u64, u64)> = None;
            for (index, offset) in shared.iter().enumerate() {
                if inputs.contains(offset) {
                    let (begin, end) = positions[index];
                    run = Some(run.map_or((begin, end), |(start, _)| (start, end)));
                } else if let Some((start, end)) = run.take() {
                    push_7bit(&mut ranges, start);
                    push_7bit(&mut ranges, end);
                }
            }
            if let Some((start, end)) = run {
                push_7bit(&mut ranges, start);
                push_7bit(&mut ranges, end);
            }

            let mut outputs = Vec::new();
            for &output in &entry.outputs {
                push_7bit(&mut outputs, u64::from(output));
            }

            out.write_7bit(u64::from(entry.id)).unwrap();
            out.write_7bit(extra.len() as u64).unwrap();
            out.write_bytes(&extra).unwrap();
            out.write_7bit(ranges.len() as u64).unwrap();
            out.write_bytes(&ranges).unwrap();
            out.write_7bit(outputs.len() as u64).unwrap();
            out.write_bytes(&outputs).unwrap();
            out.write_u8(entry.log_lines_type as u8).unwrap();
        }
        Ok(())
    }

    fn execute_command(&mut self, reader: &mut BinaryReader<'_>, out: &mut BinaryWriter) -> Result<(), TransportError> {
        let command = reader.read_string().unwrap();
        let _info = reader.read_string().unwrap();
        let text = match command.as_str() {
            "status" => {
                let populated = self.buckets.values().filter(|bucket| !bucket.commands.is_empty());
                let buckets = populated.clone().count();
                let entries: usize = populated
                    .flat_map(|bucket| bucket.commands.values())
                    .map(|command| command.entries.len())
                    .sum();
                format!("Buckets: {buckets}\nEntries: {entries}\n")
            }
            other => format!("Unknown command: {other}\n"),
        };
        let mut blob = vec![0xef, 0xbb, 0xbf];
        blob.extend_from_slice(text.as_bytes());
        blob.push(0);
        let key = CasKey::from_content(&blob).as_compressed(true);
        self.blobs.insert(key, buildcache_cas::compress(&blob).unwrap());
        out.write_cas_key(key).unwrap();
        Ok(())
    }
}

/// One client's connection to the mock server
#[derive(Debug)]
pub struct MockConnection {
    server: Arc<MockCacheServer>,
    id: u32,
}

impl Transport for MockConnection {
    fn send(&self, service_id: u8, message_type: u8, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        assert_eq!(service_id, buildcache_client::transport::CACHE_SERVICE_ID);
        let message_type = MessageType::from_u8(message_type)
            .ok_or_else(|| TransportError::Failed(format!("unknown message {message_type}")))?;
        assert!(
            payload.len() <= self.server.max_message_size,
            "{message_type} payload of {} bytes exceeds message size",
            payload.len()
        );
        self.server.handle(self.id, message_type, payload)
    }

    fn max_message_size(&self) -> usize {
        self.server.max_message_size
    }

    fn upload_blob(&self, key: CasKey, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.server.state.lock();
        state.uploads.push(key);
        state.blobs.insert(key, payload.to_vec());
        Ok(())
    }

    fn download_blob(&self, key: CasKey) -> Result<Vec<u8>, TransportError> {
        self.server
            .state
            .lock()
            .blobs
            .get(&key)
            .cloned()
            .ok_or(TransportError::BlobNotFound(key))
    }
}

// =============================================================================
// Session and machine fixtures
// =============================================================================

/// Session recording every trace call
#[derive(Debug, Default)]
pub struct RecordingSession {
    next_id: Mutex<u32>,
    pub fetches: Mutex<Vec<(u32, bool, CacheStats)>>,
    pub writes: Mutex<Vec<(u32, bool, u64)>>,
    pub new_files: Mutex<Vec<PathBuf>>,
}

impl BuildSession for RecordingSession {
    fn create_process_id(&self) -> u32 {
        let mut next = self.next_id.lock();
        *next += 1;
        *next
    }

    fn cache_end_fetch(&self, fetch_id: u32, success: bool, stats: &CacheStats) {
        self.fetches.lock().push((fetch_id, success, *stats));
    }

    fn cache_end_write(&self, process_id: u32, success: bool, bytes_sent: u64) {
        self.writes.lock().push((process_id, success, bytes_sent));
    }

    fn register_new_file(&self, path: &Path) -> bool {
        self.new_files.lock().push(path.to_path_buf());
        true
    }
}

/// A build machine: its own workspace root, store, session and client
pub struct Machine {
    pub dir: TempDir,
    pub workspace: PathBuf,
    pub roots: RootPaths,
    pub store: Arc<DiskStore>,
    pub session: Arc<RecordingSession>,
    pub client: CacheClient,
}

/// Route client logs to the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> CacheClientConfig {
    CacheClientConfig {
        case_insensitive_fs: false,
        connect_retry_delay_ms: 0,
        ..CacheClientConfig::default()
    }
}

impl Machine {
    pub fn new(server: &Arc<MockCacheServer>) -> Self {
        Self::with_config(server, test_config())
    }

    pub fn with_config(server: &Arc<MockCacheServer>, config: CacheClientConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(workspace.join("tools")).unwrap();
        std::fs::write(workspace.join("tools/cc"), b"compiler v1").unwrap();

        let mut roots = RootPaths::with_case_insensitive(false);
        roots.register_root(workspace.to_str().unwrap(), true).unwrap();

        let store = Arc::new(DiskStore::new(dir.path().join("cas")));
        let session = Arc::new(RecordingSession::default());
        let client = CacheClient::new(config, store.clone(), server.connect(), session.clone());
        Self {
            dir,
            workspace,
            roots,
            store,
            session,
            client,
        }
    }

    /// Absolute path of a workspace file
    pub fn path(&self, relative: &str) -> String {
        self.workspace.join(relative).to_str().unwrap().to_string()
    }

    pub fn write_file(&self, relative: &str, content: &[u8]) -> String {
        let path = self.workspace.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path.to_str().unwrap().to_string()
    }

    pub fn read_file(&self, relative: &str) -> Vec<u8> {
        std::fs::read(self.workspace.join(relative)).unwrap()
    }

    pub fn compile_info(&self, arguments: &str) -> ProcessStartInfo {
        ProcessStartInfo::new(self.path("tools/cc"), arguments)
            .with_working_dir(self.workspace.to_str().unwrap())
            .with_description("Compile a.cpp")
    }
}
