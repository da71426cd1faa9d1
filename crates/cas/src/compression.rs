//! zstd payload codec for compressed-tagged content

use crate::{Error, Result};

const COMPRESSION_LEVEL: i32 = 3;

/// Compress `data` into a single zstd frame
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, COMPRESSION_LEVEL)
        .map_err(|e| Error::compression(format!("zstd encode failed: {e}")))
}

/// Decompress a payload produced by [`compress`]
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| Error::compression(format!("zstd decode failed: {e}")))
}
