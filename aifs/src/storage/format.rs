//! The on-disk chunk file format, version 1.
//!
//! ```text
//! magic "AIFS" (4B) ‖ version u8 ‖ plaintext_size u64 ‖
//! kms_key_id_len u16 ‖ kms_key_id ‖ wrap_nonce 12B ‖
//! wrapped_data_key_len u16 ‖ wrapped_data_key ‖
//! data_nonce 12B ‖ ciphertext_and_tag
//! ```
//!
//! Integers are little-endian. Everything before `data_nonce` is the header;
//! the ciphertext is AES-256-GCM over the zstd-compressed plaintext under
//! the per-chunk data key, with the asset ID as associated data.
//!
//! `plaintext_size` is part of the version-1 wire contract: size queries
//! must not decrypt, and AES-GCM cannot reveal a plaintext length without
//! authenticating the whole body, so the size travels in the header. Any
//! layout change bumps `version`.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CResult, Error};

pub const MAGIC: [u8; 4] = *b"AIFS";
pub const VERSION: u8 = 1;

/// Decoded chunk header.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkHeader {
    pub plaintext_size: u64,
    pub kms_key_id: String,
    pub wrap_nonce: [u8; 12],
    pub wrapped_data_key: Vec<u8>,
    pub data_nonce: [u8; 12],
}

impl ChunkHeader {
    pub fn encode(&self) -> CResult<Vec<u8>> {
        let key_id = self.kms_key_id.as_bytes();
        if key_id.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument("kms key id too long".to_string()));
        }
        if self.wrapped_data_key.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument("wrapped data key too long".to_string()));
        }

        let mut out = Vec::with_capacity(4 + 1 + 8 + 2 + key_id.len() + 12 + 2 + self.wrapped_data_key.len() + 12);
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.write_u64::<LittleEndian>(self.plaintext_size)?;
        out.write_u16::<LittleEndian>(key_id.len() as u16)?;
        out.extend_from_slice(key_id);
        out.extend_from_slice(&self.wrap_nonce);
        out.write_u16::<LittleEndian>(self.wrapped_data_key.len() as u16)?;
        out.extend_from_slice(&self.wrapped_data_key);
        out.extend_from_slice(&self.data_nonce);
        Ok(out)
    }

    /// Decodes the header; returns it and the offset where the ciphertext
    /// begins. Any malformation is DataCorruption: this is data the engine
    /// wrote itself.
    pub fn decode(data: &[u8]) -> CResult<(ChunkHeader, usize)> {
        let corrupt = |what: &str| Error::DataCorruption(format!("chunk file: {}", what));

        let mut cursor = Cursor::new(data);
        let mut magic = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut magic).map_err(|_| corrupt("truncated magic"))?;
        if magic != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = cursor.read_u8().map_err(|_| corrupt("truncated version"))?;
        if version != VERSION {
            return Err(corrupt(&format!("unsupported version {}", version)));
        }

        let plaintext_size = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| corrupt("truncated size"))?;

        let key_id_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| corrupt("truncated key id length"))? as usize;
        let mut key_id = vec![0u8; key_id_len];
        std::io::Read::read_exact(&mut cursor, &mut key_id).map_err(|_| corrupt("truncated key id"))?;
        let kms_key_id = String::from_utf8(key_id).map_err(|_| corrupt("key id is not utf-8"))?;

        let mut wrap_nonce = [0u8; 12];
        std::io::Read::read_exact(&mut cursor, &mut wrap_nonce)
            .map_err(|_| corrupt("truncated wrap nonce"))?;

        let wrapped_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| corrupt("truncated data key length"))? as usize;
        let mut wrapped_data_key = vec![0u8; wrapped_len];
        std::io::Read::read_exact(&mut cursor, &mut wrapped_data_key)
            .map_err(|_| corrupt("truncated data key"))?;

        let mut data_nonce = [0u8; 12];
        std::io::Read::read_exact(&mut cursor, &mut data_nonce)
            .map_err(|_| corrupt("truncated data nonce"))?;

        let header = ChunkHeader { plaintext_size, kms_key_id, wrap_nonce, wrapped_data_key, data_nonce };
        Ok((header, cursor.position() as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkHeader {
        ChunkHeader {
            plaintext_size: 12345,
            kms_key_id: "default".to_string(),
            wrap_nonce: [1u8; 12],
            wrapped_data_key: vec![2u8; 48],
            data_nonce: [3u8; 12],
        }
    }

    #[test]
    fn roundtrip() -> CResult<()> {
        let header = sample();
        let mut encoded = header.encode()?;
        encoded.extend_from_slice(b"ciphertext follows");

        let (decoded, offset) = ChunkHeader::decode(&encoded)?;
        assert_eq!(decoded, header);
        assert_eq!(&encoded[offset..], b"ciphertext follows");
        Ok(())
    }

    #[test]
    fn rejects_bad_magic_and_version() -> CResult<()> {
        let mut encoded = sample().encode()?;
        encoded[0] = b'X';
        assert!(matches!(ChunkHeader::decode(&encoded), Err(Error::DataCorruption(_))));

        let mut encoded = sample().encode()?;
        encoded[4] = 99;
        assert!(matches!(ChunkHeader::decode(&encoded), Err(Error::DataCorruption(_))));
        Ok(())
    }

    #[test]
    fn rejects_truncation_at_every_boundary() -> CResult<()> {
        let encoded = sample().encode()?;
        for len in 0..encoded.len() {
            assert!(
                ChunkHeader::decode(&encoded[..len]).is_err(),
                "decode succeeded on a {}-byte prefix",
                len
            );
        }
        Ok(())
    }
}
