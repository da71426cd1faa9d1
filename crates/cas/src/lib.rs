//! Content keys and content storage for the buildcache client
//!
//! This crate provides the pieces of content addressing the cache client
//! depends on:
//! - [`CasKey`]: a fixed-size content hash carrying *compressed* and
//!   *normalized* tag bits
//! - [`ContentStore`]: the storage collaborator contract (hash, retain,
//!   look up and register files by key)
//! - [`DiskStore`]: a directory-backed reference store
//! - zstd helpers for compressed payloads

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

mod compression;
mod error;
mod key;
pub mod store;

pub use compression::{compress, decompress};
pub use error::{Error, Result};
pub use key::{CAS_KEY_SIZE, CasKey, CasKeyHasher};
pub use store::{ContentStore, DiskStore};
