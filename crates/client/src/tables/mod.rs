//! Append-only tables referenced by byte offset
//!
//! Cache entries never carry path strings or keys directly. They carry
//! offsets into two tables owned per bucket: a path table and a cas-key table
//! whose entries point back into the path table. Both tables only ever grow at
//! the tail, so any prefix of a table is a valid table and synchronization is
//! a matter of shipping the bytes past the last known size.

mod cas_key;
mod path;

pub use cas_key::CompactCasKeyTable;
pub use path::CompactPathTable;

/// Largest path table a bucket may grow to
pub const PATH_TABLE_MAX_SIZE: u32 = 256 * 1024 * 1024;

/// Largest cas-key table a bucket may grow to
pub const CAS_KEY_TABLE_MAX_SIZE: u32 = 128 * 1024 * 1024;

/// Position of an interned entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableSlot {
    /// Byte offset of the entry
    pub offset: u32,
    /// Table size needed for the entry to be resolvable
    pub end: u32,
}
