//! zstd compression of stored bytes.
//!
//! One algorithm, configurable level. Reads sniff the zstd frame magic so
//! legacy uncompressed payloads written before compression was enabled can
//! still be served during migration.

use std::io::{Read, Write};

use crate::error::{CResult, Error};

/// The zstd frame magic, little-endian 0xFD2FB528 on disk.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// zstd compressor/decompressor with a fixed level.
#[derive(Clone, Debug)]
pub struct Compressor {
    level: i32,
}

impl Compressor {
    /// Creates a compressor. Level must be in [1, 22].
    pub fn new(level: i32) -> CResult<Self> {
        if !(1..=22).contains(&level) {
            return Err(Error::InvalidArgument(format!(
                "compression level must be in [1, 22], got {}",
                level
            )));
        }
        Ok(Compressor { level })
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn compress(&self, data: &[u8]) -> CResult<Vec<u8>> {
        Ok(zstd::encode_all(data, self.level)?)
    }

    pub fn decompress(&self, data: &[u8]) -> CResult<Vec<u8>> {
        zstd::decode_all(data).map_err(|err| Error::DataCorruption(format!("zstd: {}", err)))
    }

    /// Decompresses when `data` carries a zstd frame, otherwise returns the
    /// bytes unchanged (legacy uncompressed payload).
    pub fn decompress_opportunistic(&self, data: &[u8]) -> CResult<Vec<u8>> {
        if is_zstd(data) {
            self.decompress(data)
        } else {
            Ok(data.to_vec())
        }
    }

    /// Streaming encode for large payloads.
    pub fn compress_stream<R: Read, W: Write>(&self, reader: R, writer: W) -> CResult<()> {
        Ok(zstd::stream::copy_encode(reader, writer, self.level)?)
    }

    /// Streaming decode for large payloads.
    pub fn decompress_stream<R: Read, W: Write>(&self, reader: R, writer: W) -> CResult<()> {
        zstd::stream::copy_decode(reader, writer)
            .map_err(|err| Error::DataCorruption(format!("zstd: {}", err)))
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Compressor { level: 1 }
    }
}

/// Returns true if `data` starts with a zstd frame magic.
pub fn is_zstd(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}
