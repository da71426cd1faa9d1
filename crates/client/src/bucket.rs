//! Per command-class table state

use crate::roots::ROOT_PATHS_VERSION;
use crate::tables::{CompactCasKeyTable, CompactPathTable};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::AtomicU32;

/// Wire id of a bucket.
///
/// The low 32 bits are the bucket id. The high half folds in everything that
/// changes how table contents are interpreted: bit 0 is set for case
/// sensitive file systems, the root-paths version starts at bit 1, and bit 2
/// is set when root substitution is off.
#[must_use]
pub const fn make_id(bucket_id: u32, case_insensitive: bool, use_roots: bool) -> u64 {
    let flags = (!case_insensitive) as u64 + (ROOT_PATHS_VERSION << 1) + (((!use_roots) as u64) << 2);
    bucket_id as u64 | (flags << 32)
}

/// Tables and sync counters for one bucket.
///
/// The send tables are grown by this process and pushed to the server; the
/// server tables mirror what the server has published. Each direction of
/// each table is synchronized under its own lock.
#[derive(Debug)]
pub struct Bucket {
    /// Bucket id as given by the caller
    pub id: u32,
    /// Id sent on the wire, see [`make_id`]
    pub wire_id: u64,

    pub(crate) send_paths: RwLock<CompactPathTable>,
    pub(crate) send_keys: RwLock<CompactCasKeyTable>,
    pub(crate) server_paths: RwLock<CompactPathTable>,
    pub(crate) server_keys: RwLock<CompactCasKeyTable>,

    /// Bytes of the send path table the server holds
    pub(crate) path_table_sent: Mutex<u32>,
    /// Bytes of the send cas-key table the server holds
    pub(crate) cas_table_sent: Mutex<u32>,
    /// Serializes pulls of the server tables
    pub(crate) receive_lock: Mutex<()>,
    /// Server cas-key table size whose path references are resolvable
    pub(crate) available_cas_table_size: AtomicU32,
}

impl Bucket {
    /// Create empty state for `id`
    #[must_use]
    pub fn new(id: u32, wire_id: u64, case_insensitive: bool) -> Self {
        Self {
            id,
            wire_id,
            send_paths: RwLock::new(CompactPathTable::new(case_insensitive)),
            send_keys: RwLock::new(CompactCasKeyTable::new()),
            server_paths: RwLock::new(CompactPathTable::mirror()),
            server_keys: RwLock::new(CompactCasKeyTable::new()),
            path_table_sent: Mutex::new(0),
            cas_table_sent: Mutex::new(0),
            receive_lock: Mutex::new(()),
            available_cas_table_size: AtomicU32::new(0),
        }
    }

    /// Bytes of the local path table pushed so far
    #[must_use]
    pub fn path_table_sent(&self) -> u32 {
        *self.path_table_sent.lock()
    }

    /// Bytes of the local cas-key table pushed so far
    #[must_use]
    pub fn cas_table_sent(&self) -> u32 {
        *self.cas_table_sent.lock()
    }

    /// Bytes of the server cas-key table pulled so far
    #[must_use]
    pub fn server_cas_table_size(&self) -> u32 {
        self.server_keys.read().size()
    }

    /// Bytes of the server path table pulled so far
    #[must_use]
    pub fn server_path_table_size(&self) -> u32 {
        self.server_paths.read().size()
    }
}
