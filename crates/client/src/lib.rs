//! Client for a distributed build cache
//!
//! A build worker uses [`CacheClient`] to publish the inputs and outputs of a
//! finished command ([`CacheClient::write_to_cache`]) and, before running a
//! command, to look for an equivalent earlier execution and restore its
//! outputs ([`CacheClient::fetch_from_cache`]).
//!
//! Entries are described by offsets into per-bucket path and cas-key tables
//! that are synchronized incrementally with the server. Paths and file
//! contents are made machine independent by substituting registered roots
//! ([`RootPaths`]) with marker bytes.
//!
//! The client depends on three collaborators supplied by the embedder:
//! - [`Transport`]: request/response messages and content blobs
//! - [`ContentStore`](buildcache_cas::ContentStore): local hashing and storage
//! - [`BuildSession`]: tracing hooks and compression rules

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod binary;
pub mod bucket;
mod client;
pub mod config;
mod error;
mod fetch;
pub mod process;
pub mod roots;
pub mod session;
mod sync;
pub mod tables;
pub mod transport;
mod write;

pub use bucket::{Bucket, make_id};
pub use client::{CacheClient, ConnectionState};
pub use config::CacheClientConfig;
pub use error::{Error, Result};
pub use fetch::{CacheResult, MissInfo};
pub use process::{
    CompressionPolicy, LogEntryType, LogLinesType, ObjFileCompression, ProcessLogLine,
    ProcessStartInfo,
};
pub use roots::{RootEntry, RootPaths};
pub use session::{BuildSession, CacheStats, NullSession, Timer};
pub use transport::{MessageType, Transport, TransportError};

pub use buildcache_cas::{CasKey, ContentStore};
