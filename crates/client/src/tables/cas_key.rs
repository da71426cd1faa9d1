use super::{CAS_KEY_TABLE_MAX_SIZE, CompactPathTable, TableSlot};
use crate::binary::{BinaryReader, push_7bit, varint_len};
use crate::{Error, Result};
use buildcache_cas::{CAS_KEY_SIZE, CasKey};
use std::collections::HashMap;

/// Interned (path offset, key) pairs, each stored as
/// `varint path_offset, key bytes`
#[derive(Debug, Clone, Default)]
pub struct CompactCasKeyTable {
    memory: Vec<u8>,
    lookup: HashMap<(CasKey, u32), u32>,
}

impl CompactCasKeyTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current size in bytes
    #[must_use]
    pub fn size(&self) -> u32 {
        self.memory.len() as u32
    }

    /// Backing bytes
    #[must_use]
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Append bytes received from the table owner
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let size = self.memory.len() + bytes.len();
        if size > CAS_KEY_TABLE_MAX_SIZE as usize {
            return Err(Error::EntryTooLarge {
                size,
                limit: CAS_KEY_TABLE_MAX_SIZE as usize,
            });
        }
        self.memory.extend_from_slice(bytes);
        Ok(())
    }

    /// Intern `key` for the path at `path_offset`
    pub fn add(&mut self, key: CasKey, path_offset: u32) -> Result<TableSlot> {
        if let Some(&offset) = self.lookup.get(&(key, path_offset)) {
            let end = offset + (varint_len(u64::from(path_offset)) + CAS_KEY_SIZE) as u32;
            return Ok(TableSlot { offset, end });
        }
        let offset = self.size();
        let mut entry = Vec::with_capacity(CAS_KEY_SIZE + 5);
        push_7bit(&mut entry, u64::from(path_offset));
        entry.extend_from_slice(key.as_bytes());
        self.append_bytes(&entry)?;
        self.lookup.insert((key, path_offset), offset);
        Ok(TableSlot {
            offset,
            end: self.size(),
        })
    }

    /// End of the entry at `offset`, if it lies fully within the table
    #[must_use]
    pub fn entry_end(&self, offset: u32) -> Option<u32> {
        let start = offset as usize;
        if start >= self.memory.len() {
            return None;
        }
        let mut reader = BinaryReader::new(&self.memory[start..]);
        reader.read_7bit().ok()?;
        (reader.left() >= CAS_KEY_SIZE).then(|| offset + (reader.position() + CAS_KEY_SIZE) as u32)
    }

    /// Returns true if the entry at `offset` lies fully within the table
    #[must_use]
    pub fn has_entry(&self, offset: u32) -> bool {
        self.entry_end(offset).is_some()
    }

    /// Decode the entry at `offset`
    pub fn get(&self, offset: u32) -> Result<(u32, CasKey)> {
        let start = offset as usize;
        if start >= self.memory.len() {
            return Err(Error::protocol(format!(
                "cas offset {offset} outside table of {} bytes",
                self.memory.len()
            )));
        }
        let mut reader = BinaryReader::new(&self.memory[start..]);
        let path_offset = reader.read_7bit_u32()?;
        let key = reader.read_cas_key()?;
        Ok((path_offset, key))
    }

    /// Resolve the entry at `offset` to its path and key
    pub fn get_path_and_key(&self, offset: u32, paths: &CompactPathTable) -> Result<(String, CasKey)> {
        let (path_offset, key) = self.get(offset)?;
        Ok((paths.get(path_offset)?, key))
    }
}
