//! Threshold-based zlib + base64 compression for patch payloads.

use crate::error::{Result, SyncError};
use crate::patch::JsonPatch;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Configuration for payload compression.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Payloads up to this many bytes are passed through untouched.
    pub threshold: usize,
    /// zlib level, 0-9.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            threshold: 1024,
            level: 6,
        }
    }
}

/// A payload that may or may not have been compressed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedData {
    /// Either the original text or base64 of the zlib stream.
    pub data: String,
    pub compressed: bool,
    pub original_size: usize,
}

impl CompressedData {
    fn plain(text: String) -> Self {
        let original_size = text.len();
        CompressedData {
            data: text,
            compressed: false,
            original_size,
        }
    }

    /// Compressed size over original size; 1.0 when passed through.
    pub fn ratio(&self) -> f64 {
        if !self.compressed || self.original_size == 0 {
            return 1.0;
        }
        self.data.len() as f64 / self.original_size as f64
    }
}

#[derive(Clone, Debug, Default)]
pub struct PatchCompressor {
    config: CompressionConfig,
}

impl PatchCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        PatchCompressor { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Whether a payload of `len` bytes would be compressed.
    pub fn should_compress(&self, len: usize) -> bool {
        len > self.config.threshold
    }

    /// Compress text above the threshold. Never fails: if the encoder errors
    /// the text is returned uncompressed.
    pub fn compress_str(&self, text: &str) -> CompressedData {
        if !self.should_compress(text.len()) {
            return CompressedData::plain(text.to_string());
        }
        match self.deflate(text.as_bytes()) {
            Ok(bytes) => CompressedData {
                data: BASE64.encode(bytes),
                compressed: true,
                original_size: text.len(),
            },
            Err(e) => {
                tracing::warn!(error = %e, size = text.len(), "compression failed, sending uncompressed");
                CompressedData::plain(text.to_string())
            }
        }
    }

    /// Exact inverse of [`compress_str`](Self::compress_str).
    pub fn decompress_str(&self, payload: &CompressedData) -> Result<String> {
        if !payload.compressed {
            return Ok(payload.data.clone());
        }
        self.inflate(&payload.data)
    }

    /// Inflate a base64 zlib blob.
    pub fn inflate(&self, encoded: &str) -> Result<String> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| SyncError::Compression(format!("invalid base64: {e}")))?;
        let mut decoder = ZlibDecoder::new(bytes.as_slice());
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| SyncError::Compression(e.to_string()))?;
        Ok(text)
    }

    pub fn compress_patches(&self, patches: &[JsonPatch]) -> Result<CompressedData> {
        let text = serde_json::to_string(patches)?;
        Ok(self.compress_str(&text))
    }

    pub fn decompress_patches(&self, payload: &CompressedData) -> Result<Vec<JsonPatch>> {
        let text = self.decompress_str(payload)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn deflate(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let level = Compression::new(self.config.level.min(9));
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), level);
        encoder.write_all(bytes)?;
        encoder.finish()
    }
}
