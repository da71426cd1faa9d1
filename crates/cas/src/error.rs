//! Error types for the content store crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for content store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while hashing or storing content
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(buildcache::cas::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// A key string could not be parsed
    #[error("Invalid cas key: {message}")]
    #[diagnostic(code(buildcache::cas::invalid_key))]
    InvalidKey {
        /// Description of what was wrong with the key
        message: String,
    },

    /// Compressing or decompressing a payload failed
    #[error("Compression error: {message}")]
    #[diagnostic(
        code(buildcache::cas::compression),
        help("The payload may be truncated or was not produced by this store")
    )]
    Compression {
        /// Description of the codec failure
        message: String,
    },
}

impl Error {
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

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: msg.into(),
        }
    }

    /// Create a compression error
    #[must_use]
    pub fn compression(msg: impl Into<String>) -> Self {
        Self::Compression {
            message: msg.into(),
        }
    }

    /// Returns true when the underlying cause is a missing file
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type for content store operations
pub type Result<T> = std::result::Result<T, Error>;
