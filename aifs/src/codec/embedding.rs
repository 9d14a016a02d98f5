//! Embedding codec.
//!
//! ```text
//! model_len(u16) ‖ model ‖ dimension(u32) ‖ metric_len(u16) ‖ metric ‖
//! vec_len(u64) ‖ f32 LE × dimension ‖ meta_len(u32) ‖ metadata_json
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};

use crate::codec::{expect_consumed, read_bytes, Codec};
use crate::error::{CResult, Error};

/// Distance metric the vector was produced for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    Euclidean,
    DotProduct,
    Manhattan,
    Hamming,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
            Metric::DotProduct => "dot_product",
            Metric::Manhattan => "manhattan",
            Metric::Hamming => "hamming",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> CResult<Self> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            "dot_product" => Ok(Metric::DotProduct),
            "manhattan" => Ok(Metric::Manhattan),
            "hamming" => Ok(Metric::Hamming),
            other => Err(Error::InvalidArgument(format!("unsupported metric {:?}", other))),
        }
    }
}

/// A decoded embedding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingValue {
    pub model: String,
    pub metric: Metric,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

pub struct EmbeddingCodec;

impl Codec for EmbeddingCodec {
    type Value = EmbeddingValue;

    fn encode(value: &EmbeddingValue) -> CResult<Vec<u8>> {
        let model = value.model.as_bytes();
        if model.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument("model name too long".to_string()));
        }
        let metric = value.metric.as_str().as_bytes();
        let meta = serde_json::to_vec(&value.metadata)?;

        let mut out = Vec::with_capacity(2 + model.len() + 4 + 2 + metric.len() + 8 + value.vector.len() * 4 + 4 + meta.len());
        out.write_u16::<LittleEndian>(model.len() as u16)?;
        out.extend_from_slice(model);
        out.write_u32::<LittleEndian>(value.vector.len() as u32)?;
        out.write_u16::<LittleEndian>(metric.len() as u16)?;
        out.extend_from_slice(metric);
        out.write_u64::<LittleEndian>(value.vector.len() as u64 * 4)?;
        for &x in &value.vector {
            out.write_f32::<LittleEndian>(x)?;
        }
        out.write_u32::<LittleEndian>(meta.len() as u32)?;
        out.extend_from_slice(&meta);
        Ok(out)
    }

    fn decode(data: &[u8]) -> CResult<EmbeddingValue> {
        let mut cursor = Cursor::new(data);
        let model_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated embedding frame".to_string()))?;
        let model = String::from_utf8(read_bytes(&mut cursor, model_len as usize, "embedding model")?)
            .map_err(|_| Error::InvalidArgument("embedding model is not utf-8".to_string()))?;

        let dimension = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated embedding frame".to_string()))?;

        let metric_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated embedding frame".to_string()))?;
        let metric: Metric =
            String::from_utf8(read_bytes(&mut cursor, metric_len as usize, "embedding metric")?)
                .map_err(|_| Error::InvalidArgument("embedding metric is not utf-8".to_string()))?
                .parse()?;

        let vec_len = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated embedding frame".to_string()))?;
        if vec_len != dimension as u64 * 4 {
            return Err(Error::InvalidArgument(format!(
                "embedding vector is {} bytes, dimension {} wants {}",
                vec_len,
                dimension,
                dimension as u64 * 4
            )));
        }
        let raw = read_bytes(&mut cursor, vec_len as usize, "embedding vector")?;
        let mut vector = Vec::with_capacity(dimension as usize);
        for chunk in raw.chunks_exact(4) {
            vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        let meta_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated embedding frame".to_string()))?;
        let meta_bytes = read_bytes(&mut cursor, meta_len as usize, "embedding metadata")?;
        let metadata: serde_json::Value = serde_json::from_slice(&meta_bytes)?;
        expect_consumed(&cursor, "embedding")?;

        Ok(EmbeddingValue { model, metric, vector, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> EmbeddingValue {
        EmbeddingValue {
            model: "text-embedding-3-small".to_string(),
            metric: Metric::Cosine,
            vector: vec![0.25, -1.5, 3.0, 0.0],
            metadata: json!({"framework": "custom", "confidence": 0.9}),
        }
    }

    #[test]
    fn roundtrip() -> CResult<()> {
        let value = sample();
        let encoded = EmbeddingCodec::encode(&value)?;
        assert_eq!(EmbeddingCodec::decode(&encoded)?, value);
        Ok(())
    }

    #[test]
    fn all_metrics_roundtrip() -> CResult<()> {
        for metric in [Metric::Cosine, Metric::Euclidean, Metric::DotProduct, Metric::Manhattan, Metric::Hamming] {
            let mut value = sample();
            value.metric = metric;
            assert_eq!(EmbeddingCodec::decode(&EmbeddingCodec::encode(&value)?)?, value);
        }
        Ok(())
    }

    #[test]
    fn rejects_dimension_mismatch() -> CResult<()> {
        let mut encoded = EmbeddingCodec::encode(&sample())?;
        // Bump the declared dimension without adding vector bytes.
        let model_len = u16::from_le_bytes([encoded[0], encoded[1]]) as usize;
        let dim_at = 2 + model_len;
        encoded[dim_at..dim_at + 4].copy_from_slice(&8u32.to_le_bytes());
        assert!(EmbeddingCodec::decode(&encoded).is_err());
        Ok(())
    }

    #[test]
    fn rejects_trailing_garbage() -> CResult<()> {
        let mut encoded = EmbeddingCodec::encode(&sample())?;
        encoded.extend_from_slice(b"oops");
        assert!(EmbeddingCodec::decode(&encoded).is_err());
        Ok(())
    }
}
