//! Message transport collaborator and the cache message catalogue

use buildcache_cas::CasKey;
use std::fmt;
use thiserror::Error;

/// Protocol version sent in the connect handshake
pub const CACHE_NETWORK_VERSION: u32 = 5;

/// Service id the cache messages are addressed to
pub const CACHE_SERVICE_ID: u8 = 3;

/// Messages understood by the cache service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Version handshake
    Connect = 0,
    /// Candidate entries for a command key
    FetchEntries = 1,
    /// Pull a suffix of the server cas-key table
    FetchCasTable = 2,
    /// Pull a suffix of the server path table
    FetchPathTable = 3,
    /// Push a chunk of the local path table
    StorePathTable = 4,
    /// Push a chunk of the local cas-key table
    StoreCasTable = 5,
    /// Publish an entry
    StoreEntry = 6,
    /// Finish an entry whose content had to be uploaded
    StoreEntryDone = 7,
    /// Tell the server which entry satisfied a fetch
    ReportUsedEntry = 8,
    /// Ask the server to shut down
    RequestShutdown = 9,
    /// Run an administrative command on the server
    ExecuteCommand = 10,
}

impl MessageType {
    /// Every message type, in wire order
    pub const ALL: [Self; 11] = [
        Self::Connect,
        Self::FetchEntries,
        Self::FetchCasTable,
        Self::FetchPathTable,
        Self::StorePathTable,
        Self::StoreCasTable,
        Self::StoreEntry,
        Self::StoreEntryDone,
        Self::ReportUsedEntry,
        Self::RequestShutdown,
        Self::ExecuteCommand,
    ];

    /// Decode a wire byte
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Failure reported by a transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is gone
    #[error("not connected")]
    Disconnected,
    /// The request was not answered
    #[error("{0}")]
    Failed(String),
    /// The storage service has no blob for the key
    #[error("blob {0} not found")]
    BlobNotFound(CasKey),
}

/// Blocking request/response transport to the cache and storage services.
///
/// Calls are made from build-step threads; implementations must be safe to
/// call concurrently.
pub trait Transport: Send + Sync {
    /// Send one request and wait for its response payload
    fn send(
        &self,
        service_id: u8,
        message_type: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError>;

    /// Largest request payload the transport accepts
    fn max_message_size(&self) -> usize;

    /// Store a content payload under `key` on the storage service
    fn upload_blob(&self, key: CasKey, payload: &[u8]) -> Result<(), TransportError>;

    /// Retrieve the content payload stored under `key`
    fn download_blob(&self, key: CasKey) -> Result<Vec<u8>, TransportError>;
}
