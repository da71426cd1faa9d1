//! Root-path substitution
//!
//! A root is an absolute directory prefix registered under a small index.
//! Paths and file contents are made portable by replacing a root prefix
//! (trailing separator included) with one marker byte,
//! [`ROOT_START_BYTE`]` + index`. Another machine registering its own
//! directories under the same indices can then match and materialize the
//! entry with its own layout.

use crate::binary::{BinaryReader, push_7bit};
use crate::{Error, Result};
use buildcache_cas::{CasKey, CasKeyHasher};
use std::path::Path;
use tracing::trace;

/// Marker byte value of root index 0
pub const ROOT_START_BYTE: u8 = 0x01;

/// Maximum number of registered roots, variants included
pub const MAX_ROOTS: usize = 31;

/// Bumped whenever the marker scheme changes; folded into bucket ids
pub const ROOT_PATHS_VERSION: u64 = 1;

/// A registered root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    /// Prefix, always ending with a separator
    pub path: String,
    /// Index carried by the marker byte
    pub index: u8,
    /// Whether paths under this root are part of cache entries
    pub include_in_key: bool,
}

impl RootEntry {
    /// Marker byte standing in for this root
    #[must_use]
    pub const fn marker(&self) -> u8 {
        ROOT_START_BYTE + self.index
    }
}

/// Ordered set of roots for one build step
#[derive(Debug, Clone)]
pub struct RootPaths {
    roots: Vec<RootEntry>,
    case_insensitive: bool,
}

impl Default for RootPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl RootPaths {
    /// Empty set matching with the platform's case rules
    #[must_use]
    pub fn new() -> Self {
        Self::with_case_insensitive(cfg!(windows))
    }

    /// Empty set with explicit case rules
    #[must_use]
    pub const fn with_case_insensitive(case_insensitive: bool) -> Self {
        Self {
            roots: Vec::new(),
            case_insensitive,
        }
    }

    /// Registered roots, in index order
    #[must_use]
    pub fn roots(&self) -> &[RootEntry] {
        &self.roots
    }

    /// Returns true when no root is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Register `path` as the next root and return its index.
    ///
    /// Backslash roots also register a forward-slash and an escaped
    /// (`\\`) variant, since tools write paths into files in all three
    /// spellings. Variants occupy the indices after the returned one.
    pub fn register_root(&mut self, path: &str, include_in_key: bool) -> Result<u8> {
        if path.is_empty() {
            return Err(Error::invalid_path(path, "root path is empty"));
        }
        let mut root = path.to_string();
        if !root.ends_with(['/', '\\']) {
            root.push(if root.contains('\\') { '\\' } else { '/' });
        }

        let mut variants = vec![root.clone()];
        if root.contains('\\') {
            variants.push(root.replace('\\', "/"));
            variants.push(root.replace('\\', "\\\\"));
        }
        if self.roots.len() + variants.len() > MAX_ROOTS {
            return Err(Error::configuration(format!(
                "cannot register root {root}: at most {MAX_ROOTS} roots are supported"
            )));
        }

        let first = self.roots.len() as u8;
        for (offset, variant) in variants.into_iter().enumerate() {
            self.roots.push(RootEntry {
                path: variant,
                index: first + offset as u8,
                include_in_key,
            });
        }
        trace!(root = %root, index = first, "Registered root");
        Ok(first)
    }

    /// Root registered under `index`
    #[must_use]
    pub fn root(&self, index: u8) -> Option<&RootEntry> {
        self.roots.get(usize::from(index))
    }

    fn prefix_matches(&self, haystack: &[u8], prefix: &[u8]) -> bool {
        haystack.len() >= prefix.len()
            && if self.case_insensitive {
                haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
            } else {
                &haystack[..prefix.len()] == prefix
            }
    }

    fn match_at(&self, data: &[u8]) -> Option<&RootEntry> {
        self.roots
            .iter()
            .filter(|root| self.prefix_matches(data, root.path.as_bytes()))
            .max_by_key(|root| root.path.len())
    }

    /// Root with the longest prefix of `path`
    #[must_use]
    pub fn find_root(&self, path: &str) -> Option<&RootEntry> {
        self.match_at(path.as_bytes())
    }

    /// Scan `data` and replace every root prefix with its marker byte.
    ///
    /// `on_chunk` receives literal runs with `None` and each marker byte with
    /// `Some(position)`, the marker's position in the rewritten stream.
    pub fn normalize_string<F>(&self, data: &[u8], mut on_chunk: F)
    where
        F: FnMut(&[u8], Option<usize>),
    {
        let mut literal_start = 0;
        let mut written = 0;
        let mut pos = 0;
        while pos < data.len() {
            let Some(root) = self.match_at(&data[pos..]) else {
                pos += 1;
                continue;
            };
            if pos > literal_start {
                on_chunk(&data[literal_start..pos], None);
                written += pos - literal_start;
            }
            on_chunk(&[root.marker()], Some(written));
            written += 1;
            pos += root.path.len();
            literal_start = pos;
        }
        if literal_start < data.len() {
            on_chunk(&data[literal_start..], None);
        }
    }

    /// Hash the content of `path` after root substitution.
    ///
    /// The key is tagged normalized and compressed when at least one root was
    /// substituted; otherwise it is the compressed-tagged plain content key.
    pub fn normalize_and_hash_file(&self, path: &Path) -> Result<CasKey> {
        let data = std::fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
        let mut hasher = CasKeyHasher::new();
        let mut normalized = false;
        self.normalize_string(&data, |chunk, marker| {
            normalized |= marker.is_some();
            hasher.update(chunk);
        });
        Ok(hasher.finish(true).as_normalized(normalized))
    }

    /// Build the portable blob for `data`:
    /// `[u32 marker_table_start][content with markers][varint marker positions]`
    #[must_use]
    pub fn build_normalized_blob(&self, data: &[u8]) -> Vec<u8> {
        let mut blob = Vec::with_capacity(data.len() + 16);
        blob.extend_from_slice(&[0; 4]);
        let mut positions = Vec::new();
        self.normalize_string(data, |chunk, marker| {
            blob.extend_from_slice(chunk);
            if let Some(position) = marker {
                positions.push(position);
            }
        });
        let table_start = blob.len() as u32;
        blob[..4].copy_from_slice(&table_start.to_le_bytes());
        for position in positions {
            push_7bit(&mut blob, position as u64);
        }
        blob
    }

    /// Reconstruct file content from a portable blob using this machine's
    /// roots
    pub fn denormalize(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let mut header = BinaryReader::new(blob);
        let table_start = header.read_u32()? as usize;
        if table_start < 4 || table_start > blob.len() {
            return Err(Error::protocol(format!(
                "normalized blob marker table at {table_start} outside {} bytes",
                blob.len()
            )));
        }
        let content = &blob[4..table_start];
        let mut positions = BinaryReader::new(&blob[table_start..]);

        let mut out = Vec::with_capacity(content.len() + 256);
        let mut last = 0usize;
        while !positions.is_empty() {
            let position = usize::try_from(positions.read_7bit()?)
                .map_err(|_| Error::protocol("marker position exceeds address space"))?;
            if position < last || position >= content.len() {
                return Err(Error::protocol(format!("marker position {position} out of order")));
            }
            out.extend_from_slice(&content[last..position]);
            let index = content[position].wrapping_sub(ROOT_START_BYTE);
            let root = self.root(index).ok_or(Error::MissingRoot { index })?;
            out.extend_from_slice(root.path.as_bytes());
            last = position + 1;
        }
        out.extend_from_slice(&content[last..]);
        Ok(out)
    }

    /// Map `path` to its portable form.
    ///
    /// Returns `Ok(None)` when the owning root is excluded from keys.
    pub fn qualify(&self, path: &str) -> Result<Option<String>> {
        let root = self.find_root(path).ok_or_else(|| Error::outside_roots(path))?;
        if !root.include_in_key {
            return Ok(None);
        }
        let mut qualified = String::with_capacity(path.len() - root.path.len() + 1);
        qualified.push(char::from(root.marker()));
        qualified.push_str(&path[root.path.len()..]);
        Ok(Some(qualified))
    }

    /// Map a portable path back to a local path
    pub fn resolve(&self, qualified: &str) -> Result<String> {
        let Some(&first) = qualified.as_bytes().first() else {
            return Err(Error::invalid_path(qualified, "empty qualified path"));
        };
        let index = first.wrapping_sub(ROOT_START_BYTE);
        if usize::from(index) >= MAX_ROOTS {
            return Err(Error::invalid_path(qualified, "missing root marker"));
        }
        let root = self.root(index).ok_or(Error::MissingRoot { index })?;
        Ok(format!("{}{}", root.path, &qualified[1..]))
    }
}
