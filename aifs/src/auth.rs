//! Capability-token authorization.
//!
//! A token is a capability bag: a set of permitted operations, an optional
//! namespace restriction, and an expiry, tagged under a server-held secret
//! (keyed BLAKE3). Verification: parse, check expiry, check that the
//! required permissions are a subset of the granted ones, check the
//! namespace restriction, validate the tag. Missing or forged tokens are
//! Unauthenticated; scope mismatches are PermissionDenied.
//!
//! Wire form: `base64url(claims_json) . hex(mac)`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Operations a token can grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Put,
    Get,
    Delete,
    List,
    Search,
    Subscribe,
    Snapshot,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Put => "put",
            Permission::Get => "get",
            Permission::Delete => "delete",
            Permission::List => "list",
            Permission::Search => "search",
            Permission::Subscribe => "subscribe",
            Permission::Snapshot => "snapshot",
            Permission::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> CResult<Self> {
        match s {
            "put" => Ok(Permission::Put),
            "get" => Ok(Permission::Get),
            "delete" => Ok(Permission::Delete),
            "list" => Ok(Permission::List),
            "search" => Ok(Permission::Search),
            "subscribe" => Ok(Permission::Subscribe),
            "snapshot" => Ok(Permission::Snapshot),
            "admin" => Ok(Permission::Admin),
            other => Err(Error::InvalidArgument(format!("unknown permission {:?}", other))),
        }
    }
}

/// The signed token body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub token_id: String,
    pub permissions: Vec<Permission>,
    /// When set, the token only covers this namespace.
    pub namespace: Option<String>,
    /// Unix seconds; None means no expiry.
    pub expires_at: Option<i64>,
}

/// Issues and verifies capability tokens under one server secret.
pub struct TokenAuthority {
    secret: [u8; 32],
}

impl TokenAuthority {
    pub fn new(secret: [u8; 32]) -> Self {
        TokenAuthority { secret }
    }

    /// A fresh random secret, for single-process deployments.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        TokenAuthority { secret }
    }

    fn mac(&self, payload: &[u8]) -> String {
        blake3::keyed_hash(&self.secret, payload).to_hex().to_string()
    }

    /// Issues a token carrying `permissions`, optionally restricted to one
    /// namespace, expiring after `ttl_secs`.
    pub fn issue(
        &self,
        permissions: &[Permission],
        namespace: Option<&str>,
        ttl_secs: Option<i64>,
    ) -> CResult<String> {
        let mut token_id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut token_id);
        let claims = TokenClaims {
            token_id: hex::encode(token_id),
            permissions: permissions.to_vec(),
            namespace: namespace.map(|ns| ns.to_string()),
            expires_at: ttl_secs.map(|ttl| chrono::Utc::now().timestamp() + ttl),
        };
        let payload = serde_json::to_vec(&claims)?;
        Ok(format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), self.mac(&payload)))
    }

    /// Verifies a token against the permissions an operation requires and
    /// the namespace it targets. Returns the claims on success.
    pub fn verify(
        &self,
        token: &str,
        required: &[Permission],
        namespace: Option<&str>,
    ) -> CResult<TokenClaims> {
        let unauthenticated = || Error::Unauthenticated("missing or invalid token".to_string());

        let (payload_b64, tag) = token.split_once('.').ok_or_else(unauthenticated)?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| unauthenticated())?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| unauthenticated())?;

        if let Some(expires_at) = claims.expires_at {
            if chrono::Utc::now().timestamp() > expires_at {
                return Err(Error::Unauthenticated("token expired".to_string()));
            }
        }
        for permission in required {
            if !claims.permissions.contains(permission) {
                return Err(Error::PermissionDenied(format!(
                    "token lacks {:?} permission",
                    permission.as_str()
                )));
            }
        }
        if let (Some(scope), Some(target)) = (claims.namespace.as_deref(), namespace) {
            if scope != target {
                return Err(Error::PermissionDenied(format!(
                    "token is scoped to namespace {:?}",
                    scope
                )));
            }
        }
        if self.mac(&payload) != tag {
            return Err(unauthenticated());
        }
        Ok(claims)
    }
}
