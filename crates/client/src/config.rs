//! Cache client configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the table holding client settings in a config document
pub const CONFIG_TABLE: &str = "CacheClient";

/// Configuration for [`CacheClient`](crate::CacheClient)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct CacheClientConfig {
    /// Substitute root markers for machine-specific path prefixes
    pub use_roots: bool,

    /// Accept matching entries. When false a match is still searched for
    /// but reported as a miss.
    pub use_cache_hit: bool,

    /// Re-hash inputs from disk before writing an entry
    pub validate_cache_writes_input: bool,

    /// Re-hash outputs from disk before writing an entry
    pub validate_cache_writes_output: bool,

    /// Collect and log the reason for every miss
    pub report_miss_reason: bool,

    /// Treat paths as case insensitive when interning them
    pub case_insensitive_fs: bool,

    /// Connect attempts made while the server reports busy
    pub connect_retry_count: u32,

    /// Fixed delay between busy retries, in milliseconds
    pub connect_retry_delay_ms: u64,
}

impl Default for CacheClientConfig {
    fn default() -> Self {
        Self {
            use_roots: true,
            use_cache_hit: true,
            validate_cache_writes_input: false,
            validate_cache_writes_output: false,
            report_miss_reason: false,
            case_insensitive_fs: default_case_insensitive_fs(),
            connect_retry_count: default_connect_retry_count(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
        }
    }
}

const fn default_case_insensitive_fs() -> bool {
    cfg!(windows)
}

const fn default_connect_retry_count() -> u32 {
    10
}

const fn default_connect_retry_delay_ms() -> u64 {
    1000
}

#[derive(Deserialize)]
struct ConfigDocument {
    #[serde(rename = "CacheClient")]
    cache_client: Option<CacheClientConfig>,
}

impl CacheClientConfig {
    /// Parse a config document and apply its `[CacheClient]` table.
    ///
    /// Other tables are ignored; a document without the table yields the
    /// defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let doc: ConfigDocument = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid {CONFIG_TABLE} config: {e}")))?;
        Ok(doc.cache_client.unwrap_or_default())
    }

    /// Delay between busy retries
    #[must_use]
    pub const fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}
