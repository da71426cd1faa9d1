//! Error types for the cache client
//!
//! A cache miss is never an error. Everything here describes a cache operation
//! that could not complete; callers treat it as "caching unavailable for this
//! step" and keep building.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::transport::MessageType;
use buildcache_cas::CasKey;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache client operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A path matched none of the configured roots
    #[error("File without root: {path}")]
    #[diagnostic(
        code(buildcache::client::outside_roots),
        help("Register a root covering this path, or disable root substitution")
    )]
    OutsideRoots {
        /// The offending path
        path: String,
    },

    /// A cache entry references a root index this machine has not registered
    #[error("Cache entry uses root index {index} which is not registered")]
    #[diagnostic(
        code(buildcache::client::missing_root),
        help("The entry was written with more roots than are configured here")
    )]
    MissingRoot {
        /// Root index carried by the marker byte
        index: u8,
    },

    /// A path handed to the client cannot be used
    #[error("Invalid path '{path}': {reason}")]
    #[diagnostic(code(buildcache::client::invalid_path))]
    InvalidPath {
        /// The path as received
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// A relative tool binary could not be found on the search path
    #[error("Can't find file: {name}")]
    #[diagnostic(
        code(buildcache::client::executable_not_found),
        help("Ensure the tool is on PATH or pass an absolute path")
    )]
    ExecutableNotFound {
        /// Name that was searched for
        name: String,
    },

    /// Invalid client configuration
    #[error("Configuration error: {message}")]
    #[diagnostic(code(buildcache::client::config))]
    Configuration {
        /// Description of the problem
        message: String,
    },

    /// Re-hashing a file from disk disagreed with the content store
    #[error("Content store claims {path} has key {stored} but recalculating it gives {actual}")]
    #[diagnostic(
        code(buildcache::client::validation_mismatch),
        help("The file changed after it was hashed; the entry will not be written")
    )]
    ValidationMismatch {
        /// File that was validated
        path: String,
        /// Key held by the content store
        stored: CasKey,
        /// Key recomputed from disk
        actual: CasKey,
    },

    /// The content store disagrees with the file system
    #[error("Content store is inconsistent for {path}: {message}")]
    #[diagnostic(code(buildcache::client::store_inconsistent))]
    StoreInconsistent {
        /// File involved
        path: String,
        /// What disagreed
        message: String,
    },

    /// A message could not be delivered or got no response
    #[error("Failed to send {message_type:?} message: {message}")]
    #[diagnostic(
        code(buildcache::client::transport),
        help("Check the connection to the cache server")
    )]
    Transport {
        /// Message that failed
        message_type: MessageType,
        /// Transport error description
        message: String,
    },

    /// Moving content to or from the storage service failed
    #[error("Failed to transfer content {key}: {message}")]
    #[diagnostic(
        code(buildcache::client::blob_transfer),
        help("Check the connection to the storage service")
    )]
    BlobTransfer {
        /// Key of the content
        key: CasKey,
        /// Transport error description
        message: String,
    },

    /// A response did not match the expected layout
    #[error("Protocol error: {message}")]
    #[diagnostic(code(buildcache::client::protocol))]
    Protocol {
        /// Description of the malformed data
        message: String,
    },

    /// A request payload exceeds the transport's message size
    #[error("Message too large: {size} bytes exceeds limit of {limit}")]
    #[diagnostic(code(buildcache::client::entry_too_large))]
    EntryTooLarge {
        /// Bytes that needed to be written
        size: usize,
        /// Writer capacity
        limit: usize,
    },

    /// I/O error with path context
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(buildcache::client::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed
        operation: String,
    },

    /// Content store error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cas(#[from] buildcache_cas::Error),
}

impl Error {
    /// Create an outside-roots error
    #[must_use]
    pub fn outside_roots(path: impl Into<String>) -> Self {
        Self::OutsideRoots { path: path.into() }
    }

    /// Create an invalid path error
    #[must_use]
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a store inconsistency error
    #[must_use]
    pub fn store_inconsistent(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StoreInconsistent {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a transport error
    #[must_use]
    pub fn transport(message_type: MessageType, msg: impl Into<String>) -> Self {
        Self::Transport {
            message_type,
            message: msg.into(),
        }
    }

    /// Create a content transfer error
    #[must_use]
    pub fn blob_transfer(key: CasKey, msg: impl Into<String>) -> Self {
        Self::BlobTransfer {
            key,
            message: msg.into(),
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Returns true for errors caused by root configuration
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::OutsideRoots { .. }
                | Self::MissingRoot { .. }
                | Self::InvalidPath { .. }
                | Self::ExecutableNotFound { .. }
                | Self::Configuration { .. }
        )
    }
}

/// Result type for cache client operations
pub type Result<T> = std::result::Result<T, Error>;
