//! Asset kind codecs.
//!
//! Each kind is an `encode`/`decode`/`validate` triple over a little-endian,
//! length-prefixed frame. Decoders reject truncated frames and trailing
//! garbage; nothing is silently dropped.

pub mod artifact;
pub mod blob;
pub mod embedding;
pub mod tensor;

use std::io::Cursor;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// The four asset kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Blob,
    Tensor,
    Embedding,
    Artifact,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Blob => "blob",
            AssetKind::Tensor => "tensor",
            AssetKind::Embedding => "embedding",
            AssetKind::Artifact => "artifact",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssetKind {
    type Err = Error;

    fn from_str(s: &str) -> CResult<Self> {
        match s {
            "blob" => Ok(AssetKind::Blob),
            "tensor" => Ok(AssetKind::Tensor),
            "embedding" => Ok(AssetKind::Embedding),
            "artifact" => Ok(AssetKind::Artifact),
            other => Err(Error::InvalidArgument(format!("unsupported asset kind {:?}", other))),
        }
    }
}

/// A codec for one asset kind.
pub trait Codec {
    type Value;

    fn encode(value: &Self::Value) -> CResult<Vec<u8>>;

    fn decode(data: &[u8]) -> CResult<Self::Value>;

    /// True iff `data` is a well-formed frame for this kind.
    fn validate(data: &[u8]) -> bool {
        Self::decode(data).is_ok()
    }
}

/// Validates `data` against the codec for `kind`.
pub fn validate(kind: AssetKind, data: &[u8]) -> bool {
    match kind {
        AssetKind::Blob => blob::BlobCodec::validate(data),
        AssetKind::Tensor => tensor::TensorCodec::validate(data),
        AssetKind::Embedding => embedding::EmbeddingCodec::validate(data),
        AssetKind::Artifact => artifact::ArtifactCodec::validate(data),
    }
}

/// Reads exactly `len` bytes, with the length checked against the remaining
/// input first so a corrupt length prefix cannot trigger a huge allocation.
pub(crate) fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize, what: &str) -> CResult<Vec<u8>> {
    let remaining = cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(Error::InvalidArgument(format!(
            "truncated frame: {} wants {} bytes, {} left",
            what, len, remaining
        )));
    }
    let start = cursor.position() as usize;
    let bytes = cursor.get_ref()[start..start + len].to_vec();
    cursor.set_position((start + len) as u64);
    Ok(bytes)
}

/// Fails unless the cursor consumed its whole input.
pub(crate) fn expect_consumed(cursor: &Cursor<&[u8]>, what: &str) -> CResult<()> {
    let remaining = cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize);
    if remaining != 0 {
        return Err(Error::InvalidArgument(format!(
            "{} frame has {} trailing bytes",
            what, remaining
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_roundtrip() -> CResult<()> {
        for kind in [AssetKind::Blob, AssetKind::Tensor, AssetKind::Embedding, AssetKind::Artifact] {
            assert_eq!(kind.as_str().parse::<AssetKind>()?, kind);
        }
        assert!("tensors".parse::<AssetKind>().is_err());
        assert!("".parse::<AssetKind>().is_err());
        Ok(())
    }

    #[test]
    fn validate_dispatches() {
        // An empty payload is a valid blob and an invalid tensor.
        assert!(validate(AssetKind::Blob, b""));
        assert!(!validate(AssetKind::Tensor, b""));
        assert!(!validate(AssetKind::Embedding, b"\x01"));
        assert!(!validate(AssetKind::Artifact, b"{}"));
    }
}
