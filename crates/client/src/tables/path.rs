use super::{PATH_TABLE_MAX_SIZE, TableSlot};
use crate::binary::{BinaryReader, push_7bit};
use crate::{Error, Result};
use std::collections::HashMap;

/// Interned path strings.
///
/// A path is stored as a chain of segments. Each entry is
/// `varint parent_offset, varint byte_len, bytes`; the first segment has
/// parent 0, which is never a valid entry because every table starts with a
/// single zero byte. A segment keeps its leading separator, so concatenating
/// the chain reproduces the original string exactly.
#[derive(Debug, Clone)]
pub struct CompactPathTable {
    memory: Vec<u8>,
    lookup: HashMap<(u32, String), u32>,
    case_insensitive: bool,
}

impl CompactPathTable {
    /// Table that interns local paths
    #[must_use]
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            memory: vec![0],
            lookup: HashMap::new(),
            case_insensitive,
        }
    }

    /// Empty mirror filled from another table's bytes
    #[must_use]
    pub fn mirror() -> Self {
        Self {
            memory: Vec::new(),
            lookup: HashMap::new(),
            case_insensitive: false,
        }
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
        if size > PATH_TABLE_MAX_SIZE as usize {
            return Err(Error::EntryTooLarge {
                size,
                limit: PATH_TABLE_MAX_SIZE as usize,
            });
        }
        self.memory.extend_from_slice(bytes);
        Ok(())
    }

    /// Intern `path`, reusing existing segments
    pub fn add(&mut self, path: &str) -> Result<TableSlot> {
        if path.is_empty() {
            return Err(Error::invalid_path(path, "empty path"));
        }
        let mut parent = 0u32;
        let mut slot = TableSlot { offset: 0, end: 0 };
        for segment in split_segments(path) {
            let key = if self.case_insensitive {
                segment.to_lowercase()
            } else {
                segment.to_string()
            };
            slot = if let Some(&offset) = self.lookup.get(&(parent, key.clone())) {
                TableSlot {
                    offset,
                    end: self.entry_end(offset)?,
                }
            } else {
                let offset = self.push_entry(parent, segment)?;
                self.lookup.insert((parent, key), offset);
                TableSlot {
                    offset,
                    end: self.size(),
                }
            };
            parent = slot.offset;
        }
        Ok(slot)
    }

    fn push_entry(&mut self, parent: u32, segment: &str) -> Result<u32> {
        let offset = self.size();
        let mut entry = Vec::with_capacity(segment.len() + 8);
        push_7bit(&mut entry, u64::from(parent));
        push_7bit(&mut entry, segment.len() as u64);
        entry.extend_from_slice(segment.as_bytes());
        self.append_bytes(&entry)?;
        Ok(offset)
    }

    fn read_entry(&self, offset: u32) -> Result<(u32, &[u8], u32)> {
        let start = offset as usize;
        if start == 0 || start >= self.memory.len() {
            return Err(Error::protocol(format!(
                "path offset {offset} outside table of {} bytes",
                self.memory.len()
            )));
        }
        let mut reader = BinaryReader::new(&self.memory[start..]);
        let parent = reader.read_7bit_u32()?;
        let segment = reader.read_sized()?;
        let end = offset + reader.position() as u32;
        if parent >= offset {
            return Err(Error::protocol(format!(
                "path entry {offset} has forward parent {parent}"
            )));
        }
        Ok((parent, segment, end))
    }

    fn entry_end(&self, offset: u32) -> Result<u32> {
        Ok(self.read_entry(offset)?.2)
    }

    /// Resolve an offset to its full path
    pub fn get(&self, offset: u32) -> Result<String> {
        if offset == 0 {
            return Err(Error::protocol("path offset 0 is the table sentinel"));
        }
        let mut segments = Vec::new();
        let mut current = offset;
        while current != 0 {
            let (parent, segment, _) = self.read_entry(current)?;
            segments.push(segment);
            current = parent;
        }
        let mut bytes = Vec::new();
        for segment in segments.iter().rev() {
            bytes.extend_from_slice(segment);
        }
        String::from_utf8(bytes)
            .map_err(|e| Error::protocol(format!("path entry {offset} is not UTF-8: {e}")))
    }
}

/// Split before every separator; the first segment may start with one
fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    let mut start = 0;
    let mut bounds = Vec::new();
    for (index, ch) in path.char_indices() {
        if (ch == '/' || ch == '\\') && index > start {
            bounds.push((start, index));
            start = index;
        }
    }
    bounds.push((start, path.len()));
    bounds.into_iter().map(move |(begin, end)| &path[begin..end])
}
