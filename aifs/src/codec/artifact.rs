//! Artifact codec: a JSON manifest plus a ZIP archive, digest-bound.
//!
//! ```text
//! manifest_len(u32) ‖ manifest_json ‖ zip_len(u64) ‖ zip_bytes ‖ zip_blake3(32B)
//! ```
//!
//! Files listed in the manifest are themselves content-addressed assets, so
//! an artifact is a sub-tree rooted in its own asset ID.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};

use crate::codec::{expect_consumed, read_bytes, Codec};
use crate::error::{CResult, Error};

/// One file entry in an artifact manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    pub asset_id: String,
    pub size: u64,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A declared dependency on another artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDependency {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub asset_id: Option<String>,
}

/// The artifact manifest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub files: Vec<ArtifactFile>,
    #[serde(default)]
    pub dependencies: Vec<ArtifactDependency>,
}

/// A decoded artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactValue {
    pub manifest: ArtifactManifest,
    pub zip_data: Vec<u8>,
}

pub struct ArtifactCodec;

impl Codec for ArtifactCodec {
    type Value = ArtifactValue;

    fn encode(value: &ArtifactValue) -> CResult<Vec<u8>> {
        let manifest = serde_json::to_vec(&value.manifest)?;
        if manifest.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument("artifact manifest too large".to_string()));
        }
        let digest = blake3::hash(&value.zip_data);

        let mut out = Vec::with_capacity(4 + manifest.len() + 8 + value.zip_data.len() + 32);
        out.write_u32::<LittleEndian>(manifest.len() as u32)?;
        out.extend_from_slice(&manifest);
        out.write_u64::<LittleEndian>(value.zip_data.len() as u64)?;
        out.extend_from_slice(&value.zip_data);
        out.extend_from_slice(digest.as_bytes());
        Ok(out)
    }

    fn decode(data: &[u8]) -> CResult<ArtifactValue> {
        let mut cursor = Cursor::new(data);
        let manifest_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated artifact frame".to_string()))?;
        let manifest_bytes = read_bytes(&mut cursor, manifest_len as usize, "artifact manifest")?;
        let manifest: ArtifactManifest = serde_json::from_slice(&manifest_bytes)?;

        let zip_len = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated artifact frame".to_string()))?;
        let zip_data = read_bytes(&mut cursor, zip_len as usize, "artifact zip")?;

        let digest = read_bytes(&mut cursor, 32, "artifact digest")?;
        expect_consumed(&cursor, "artifact")?;

        if blake3::hash(&zip_data).as_bytes() != digest.as_slice() {
            return Err(Error::InvalidArgument(
                "artifact zip digest does not match its payload".to_string(),
            ));
        }
        Ok(ArtifactValue { manifest, zip_data })
    }
}
