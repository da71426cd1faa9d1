//! Description of one command execution and its captured log output

use crate::binary::{BinaryReader, BinaryWriter};
use crate::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Decides whether a file produced or read by a command is kept compressed
/// on disk.
pub trait CompressionPolicy: Send + Sync {
    /// Returns true if `path` should be stored compressed
    fn store_file_compressed(&self, path: &str) -> bool;
}

/// Keeps object files compressed, everything else raw
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjFileCompression;

impl CompressionPolicy for ObjFileCompression {
    fn store_file_compressed(&self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        lower.ends_with(".obj") || lower.ends_with(".o")
    }
}

/// A single command execution
#[derive(Clone, Default)]
pub struct ProcessStartInfo {
    /// Absolute path of the tool binary
    pub application: String,
    /// Full argument string
    pub arguments: String,
    /// Directory the command runs in
    pub working_dir: String,
    /// Human readable label used in logs
    pub description: String,
    /// Per-file compression rules; the session's rules apply when absent
    pub rules: Option<Arc<dyn CompressionPolicy>>,
}

impl fmt::Debug for ProcessStartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessStartInfo")
            .field("application", &self.application)
            .field("arguments", &self.arguments)
            .field("working_dir", &self.working_dir)
            .field("description", &self.description)
            .field("rules", &self.rules.is_some())
            .finish()
    }
}

impl ProcessStartInfo {
    /// Create a start info for `application` with `arguments`
    #[must_use]
    pub fn new(application: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            arguments: arguments.into(),
            ..Self::default()
        }
    }

    /// Set the working directory
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the compression rules
    #[must_use]
    pub fn with_rules(mut self, rules: Arc<dyn CompressionPolicy>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Label for log lines: the description, or the application when unset
    #[must_use]
    pub fn label(&self) -> &str {
        if self.description.is_empty() {
            &self.application
        } else {
            &self.description
        }
    }

    /// Response file referenced as `@"file"` in the arguments, resolved
    /// against the working directory
    #[must_use]
    pub fn response_file(&self) -> Option<PathBuf> {
        let start = self.arguments.find('@')?;
        let rest = self.arguments[start + 1..].strip_prefix('"')?;
        let end = rest.find('"')?;
        let rsp = Path::new(&rest[..end]);
        if rsp.is_absolute() || self.working_dir.is_empty() {
            Some(rsp.to_path_buf())
        } else {
            Some(Path::new(&self.working_dir).join(rsp))
        }
    }
}

/// Severity of a captured log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum LogEntryType {
    /// Error
    Error = 0,
    /// Warning
    Warning = 1,
    /// Informational
    #[default]
    Info = 2,
    /// Detailed
    Detail = 3,
    /// Debug
    Debug = 4,
}

impl LogEntryType {
    /// Decode a wire byte; unknown values map to `Info`
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Error,
            1 => Self::Warning,
            3 => Self::Detail,
            4 => Self::Debug,
            _ => Self::Info,
        }
    }
}

/// A line of output captured from a command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ProcessLogLine {
    /// Line text
    pub text: String,
    /// Severity
    pub kind: LogEntryType,
}

impl ProcessLogLine {
    /// Create a log line
    #[must_use]
    pub fn new(text: impl Into<String>, kind: LogEntryType) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

/// Where the log lines of a fetched entry come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogLinesType {
    /// The entry produced no output
    Empty = 0,
    /// The entry shares the log lines stored once for its command key
    Shared = 1,
    /// The entry owns its log lines; they arrive with the used-entry report
    Owned = 2,
}

impl LogLinesType {
    /// Decode a wire byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Empty),
            1 => Some(Self::Shared),
            2 => Some(Self::Owned),
            _ => None,
        }
    }
}

/// Encode log lines as repeated (string, kind byte)
pub fn encode_log_lines(lines: &[ProcessLogLine]) -> Result<Vec<u8>> {
    let mut writer = BinaryWriter::unbounded();
    for line in lines {
        writer.write_string(&line.text)?;
        writer.write_u8(line.kind as u8)?;
    }
    Ok(writer.into_inner())
}

/// Decode log lines and append them to `out`
pub fn decode_log_lines(data: &[u8], out: &mut Vec<ProcessLogLine>) -> Result<()> {
    let mut reader = BinaryReader::new(data);
    while !reader.is_empty() {
        let text = reader.read_string()?;
        let kind = LogEntryType::from_u8(reader.read_u8()?);
        out.push(ProcessLogLine { text, kind });
    }
    Ok(())
}
