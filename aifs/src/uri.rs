//! Canonical AIFS identifier URIs.
//!
//! - `aifs://<asset_id>` for assets
//! - `aifs-snap://<snapshot_id>` for snapshots
//!
//! Both IDs are exactly 64 lowercase hex characters (a BLAKE3 digest).
//! Parsers reject anything that does not match that character class;
//! generators always emit lowercase.

use crate::error::{CResult, Error};

const ASSET_SCHEME: &str = "aifs://";
const SNAPSHOT_SCHEME: &str = "aifs-snap://";

/// Returns true if `id` is a well-formed content ID: 64 lowercase hex chars.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Validates an ID, returning it unchanged, or InvalidArgument.
pub fn validate_id(id: &str) -> CResult<&str> {
    if is_valid_id(id) {
        Ok(id)
    } else {
        Err(Error::InvalidArgument(format!(
            "not a 64-char lowercase hex id: {:?}",
            id
        )))
    }
}

/// Formats an asset ID as an `aifs://` URI.
pub fn asset_uri(asset_id: &str) -> CResult<String> {
    Ok(format!("{}{}", ASSET_SCHEME, validate_id(asset_id)?))
}

/// Formats a snapshot ID as an `aifs-snap://` URI.
pub fn snapshot_uri(snapshot_id: &str) -> CResult<String> {
    Ok(format!("{}{}", SNAPSHOT_SCHEME, validate_id(snapshot_id)?))
}

/// Parses an `aifs://` URI into an asset ID.
pub fn parse_asset_uri(uri: &str) -> CResult<String> {
    match uri.strip_prefix(ASSET_SCHEME) {
        Some(id) if is_valid_id(id) => Ok(id.to_string()),
        _ => Err(Error::InvalidArgument(format!("invalid asset uri: {:?}", uri))),
    }
}

/// Parses an `aifs-snap://` URI into a snapshot ID.
pub fn parse_snapshot_uri(uri: &str) -> CResult<String> {
    match uri.strip_prefix(SNAPSHOT_SCHEME) {
        Some(id) if is_valid_id(id) => Ok(id.to_string()),
        _ => Err(Error::InvalidArgument(format!(
            "invalid snapshot uri: {:?}",
            uri
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24";

    #[test]
    fn roundtrip() -> CResult<()> {
        let uri = asset_uri(ID)?;
        assert_eq!(uri, format!("aifs://{}", ID));
        assert_eq!(parse_asset_uri(&uri)?, ID);

        let uri = snapshot_uri(ID)?;
        assert_eq!(uri, format!("aifs-snap://{}", ID));
        assert_eq!(parse_snapshot_uri(&uri)?, ID);
        Ok(())
    }

    #[test]
    fn rejects_bad_ids() {
        // Too short, uppercase, non-hex, and empty are all invalid.
        let upper = ID.to_uppercase();
        let nonhex = ID.replace('d', "g");
        for id in ["abc", upper.as_str(), nonhex.as_str(), ""] {
            assert!(!is_valid_id(id));
            assert!(asset_uri(id).is_err());
        }
        // Exact length with a trailing newline must not pass.
        assert!(!is_valid_id(&format!("{}\n", &ID[..63])));
    }

    #[test]
    fn rejects_cross_scheme() {
        let uri = format!("aifs-snap://{}", ID);
        assert!(parse_asset_uri(&uri).is_err());
        let uri = format!("aifs://{}", ID);
        assert!(parse_snapshot_uri(&uri).is_err());
    }
}
