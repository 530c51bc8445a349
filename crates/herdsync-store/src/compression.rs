//! zlib compression for large cached payloads.
//!
//! Compressed payloads are stored inside JSON entries, so the binary output
//! is carried as standard base64 text.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{StoreError, StoreResult};

/// Compress UTF-8 text and return the base64-encoded zlib stream.
pub fn compress(text: &str) -> StoreResult<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| StoreError::Compression(format!("zlib write failed: {e}")))?;
    let bytes = encoder
        .finish()
        .map_err(|e| StoreError::Compression(format!("zlib finish failed: {e}")))?;
    Ok(STANDARD.encode(bytes))
}

/// Reverse [`compress`].
pub fn decompress(blob: &str) -> StoreResult<String> {
    let bytes = STANDARD
        .decode(blob)
        .map_err(|e| StoreError::Compression(format!("invalid base64: {e}")))?;
    let mut text = String::new();
    ZlibDecoder::new(bytes.as_slice())
        .read_to_string(&mut text)
        .map_err(|e| StoreError::Compression(format!("zlib read failed: {e}")))?;
    Ok(text)
}
