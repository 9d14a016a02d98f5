use crate::codec::Codec;
use crate::error::CResult;

/// The identity codec: a blob's bytes are its payload. Empty blobs are
/// valid.
pub struct BlobCodec;

impl Codec for BlobCodec {
    type Value = Vec<u8>;

    fn encode(value: &Vec<u8>) -> CResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(data: &[u8]) -> CResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn validate(_data: &[u8]) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity() -> CResult<()> {
        for data in [&b""[..], b"hello", &[0u8, 255, 7]] {
            assert_eq!(BlobCodec::decode(&BlobCodec::encode(&data.to_vec())?)?, data);
        }
        Ok(())
    }
}
