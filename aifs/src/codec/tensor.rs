//! Tensor codec: a self-describing binary frame.
//!
//! ```text
//! dtype_len(u16) ‖ dtype ‖ rank(u32) ‖ dims[rank](u64) ‖
//! data_len(u64) ‖ data ‖ meta_len(u32) ‖ metadata_json ‖
//! bitmap_len(u32) ‖ null_bitmap
//! ```
//!
//! All integers little-endian. `data_len` must equal the element count times
//! the dtype width; a `bitmap_len` of zero means the tensor is not nullable.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};

use crate::codec::{expect_consumed, read_bytes, Codec};
use crate::error::{CResult, Error};

/// Supported element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    Float32,
    Float64,
    Complex64,
    Complex128,
}

impl Dtype {
    /// Width of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Dtype::Bool | Dtype::Int8 | Dtype::Uint8 => 1,
            Dtype::Int16 | Dtype::Uint16 | Dtype::Float16 => 2,
            Dtype::Int32 | Dtype::Uint32 | Dtype::Float32 => 4,
            Dtype::Int64 | Dtype::Uint64 | Dtype::Float64 | Dtype::Complex64 => 8,
            Dtype::Complex128 => 16,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Bool => "bool",
            Dtype::Int8 => "int8",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Uint8 => "uint8",
            Dtype::Uint16 => "uint16",
            Dtype::Uint32 => "uint32",
            Dtype::Uint64 => "uint64",
            Dtype::Float16 => "float16",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Complex64 => "complex64",
            Dtype::Complex128 => "complex128",
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dtype {
    type Err = Error;

    fn from_str(s: &str) -> CResult<Self> {
        match s {
            "bool" => Ok(Dtype::Bool),
            "int8" => Ok(Dtype::Int8),
            "int16" => Ok(Dtype::Int16),
            "int32" => Ok(Dtype::Int32),
            "int64" => Ok(Dtype::Int64),
            "uint8" => Ok(Dtype::Uint8),
            "uint16" => Ok(Dtype::Uint16),
            "uint32" => Ok(Dtype::Uint32),
            "uint64" => Ok(Dtype::Uint64),
            "float16" => Ok(Dtype::Float16),
            "float32" => Ok(Dtype::Float32),
            "float64" => Ok(Dtype::Float64),
            "complex64" => Ok(Dtype::Complex64),
            "complex128" => Ok(Dtype::Complex128),
            other => Err(Error::InvalidArgument(format!("unsupported dtype {:?}", other))),
        }
    }
}

/// A decoded tensor: raw element bytes plus their typed interpretation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    /// Raw element bytes, row-major, little-endian.
    pub data: Vec<u8>,
    pub metadata: serde_json::Value,
    /// One bit per element when the tensor is nullable.
    pub null_bitmap: Option<Vec<u8>>,
}

impl TensorValue {
    pub fn element_count(&self) -> CResult<u64> {
        self.shape.iter().try_fold(1u64, |acc, &dim| {
            acc.checked_mul(dim)
                .ok_or_else(|| Error::InvalidArgument("tensor shape overflows u64".to_string()))
        })
    }

    fn check(&self) -> CResult<()> {
        let elements = self.element_count()?;
        let expected = elements
            .checked_mul(self.dtype.size() as u64)
            .ok_or_else(|| Error::InvalidArgument("tensor byte size overflows u64".to_string()))?;
        if self.data.len() as u64 != expected {
            return Err(Error::InvalidArgument(format!(
                "tensor data is {} bytes, shape {:?} of {} wants {}",
                self.data.len(),
                self.shape,
                self.dtype,
                expected
            )));
        }
        if let Some(bitmap) = &self.null_bitmap {
            let want = (elements as usize + 7) / 8;
            if bitmap.len() != want {
                return Err(Error::InvalidArgument(format!(
                    "null bitmap is {} bytes, {} elements want {}",
                    bitmap.len(),
                    elements,
                    want
                )));
            }
        }
        Ok(())
    }
}

pub struct TensorCodec;

impl Codec for TensorCodec {
    type Value = TensorValue;

    fn encode(value: &TensorValue) -> CResult<Vec<u8>> {
        value.check()?;
        let dtype = value.dtype.as_str().as_bytes();
        let meta = serde_json::to_vec(&value.metadata)?;
        let bitmap = value.null_bitmap.as_deref().unwrap_or(&[]);

        let mut out = Vec::with_capacity(2 + dtype.len() + 4 + value.shape.len() * 8 + 8 + value.data.len() + 4 + meta.len() + 4 + bitmap.len());
        out.write_u16::<LittleEndian>(dtype.len() as u16)?;
        out.extend_from_slice(dtype);
        out.write_u32::<LittleEndian>(value.shape.len() as u32)?;
        for &dim in &value.shape {
            out.write_u64::<LittleEndian>(dim)?;
        }
        out.write_u64::<LittleEndian>(value.data.len() as u64)?;
        out.extend_from_slice(&value.data);
        out.write_u32::<LittleEndian>(meta.len() as u32)?;
        out.extend_from_slice(&meta);
        out.write_u32::<LittleEndian>(bitmap.len() as u32)?;
        out.extend_from_slice(bitmap);
        Ok(out)
    }

    fn decode(data: &[u8]) -> CResult<TensorValue> {
        let mut cursor = Cursor::new(data);
        let dtype_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated tensor frame".to_string()))?;
        let dtype_bytes = read_bytes(&mut cursor, dtype_len as usize, "tensor dtype")?;
        let dtype: Dtype = String::from_utf8(dtype_bytes)
            .map_err(|_| Error::InvalidArgument("tensor dtype is not utf-8".to_string()))?
            .parse()?;

        let rank = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated tensor frame".to_string()))?;
        let mut shape = Vec::with_capacity(rank.min(4096) as usize);
        for _ in 0..rank {
            shape.push(
                cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|_| Error::InvalidArgument("truncated tensor shape".to_string()))?,
            );
        }

        let data_len = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated tensor frame".to_string()))?;
        let elements = read_bytes(&mut cursor, data_len as usize, "tensor data")?;

        let meta_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated tensor frame".to_string()))?;
        let meta_bytes = read_bytes(&mut cursor, meta_len as usize, "tensor metadata")?;
        let metadata: serde_json::Value = serde_json::from_slice(&meta_bytes)?;

        let bitmap_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("truncated tensor frame".to_string()))?;
        let null_bitmap = if bitmap_len == 0 {
            None
        } else {
            Some(read_bytes(&mut cursor, bitmap_len as usize, "tensor null bitmap")?)
        };
        expect_consumed(&cursor, "tensor")?;

        let value = TensorValue { dtype, shape, data: elements, metadata, null_bitmap };
        value.check()?;
        Ok(value)
    }
}
