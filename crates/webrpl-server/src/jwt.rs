//! HS256 session tokens.
//!
//! Notes:
//! - Only `HS256` is accepted. The header's `alg` is compared against the pinned value
//!   before the signature is checked, so `none` or asymmetric algorithms never verify.
//! - Uses base64url encoding WITHOUT padding.
//! - Claims decode into [`SessionClaims`]; any other shape is rejected.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{AuthError, Error, Result};
use crate::util::now_ts;

const ALGORITHM: &str = "HS256";

/// Session lifetime: 72 hours.
pub const SESSION_TTL_SECS: i64 = 72 * 60 * 60;

/// Coarse authorization tier carried in every session token.
///
/// Encoded as the same integer stored in `users.role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Tier {
    Participant,
    Administrator,
    Committee,
}

impl Tier {
    pub fn code(self) -> i32 {
        match self {
            Tier::Participant => 0,
            Tier::Administrator => 1,
            Tier::Committee => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Tier::Participant),
            1 => Some(Tier::Administrator),
            2 => Some(Tier::Committee),
            _ => None,
        }
    }

    pub fn is_admin(self) -> bool {
        self == Tier::Administrator
    }
}

impl TryFrom<i32> for Tier {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        Tier::from_code(code).ok_or_else(|| format!("unknown tier code {code}"))
    }
}

impl From<Tier> for i32 {
    fn from(tier: Tier) -> Self {
        tier.code()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionClaims {
    pub email: String,
    pub tier: Tier,
    /// Issued at, Unix seconds.
    pub iat: i64,
    /// Expires at, Unix seconds.
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn b64url_decode(s: &str) -> std::result::Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(s.as_bytes())
        .map_err(|_| AuthError::Invalid)
}

fn new_mac(secret: &[u8]) -> std::result::Result<Hmac<Sha256>, hmac::digest::InvalidLength> {
    Hmac::<Sha256>::new_from_slice(secret)
}

/// Encode claims as an HS256-signed JWT.
pub fn encode_hs256<T: Serialize>(secret: &[u8], claims: &T) -> Result<String> {
    let header = JwtHeader {
        alg: ALGORITHM.to_string(),
        typ: Some("JWT".to_string()),
    };

    let header_json = serde_json::to_vec(&header)
        .map_err(|e| Error::Signing(format!("failed to serialize JWT header: {e}")))?;
    let claims_json = serde_json::to_vec(claims)
        .map_err(|e| Error::Signing(format!("failed to serialize JWT claims: {e}")))?;

    let header_b64 = b64url_encode(&header_json);
    let claims_b64 = b64url_encode(&claims_json);
    let signing_input = format!("{header_b64}.{claims_b64}");

    let mut mac = new_mac(secret).map_err(|e| Error::Signing(format!("invalid HMAC key: {e}")))?;
    mac.update(signing_input.as_bytes());
    let signature = mac.finalize().into_bytes();
    let sig_b64 = b64url_encode(&signature);

    Ok(format!("{signing_input}.{sig_b64}"))
}

/// Decode an HS256 JWT and verify its signature.
///
/// This does not check `exp`; [`TokenIssuer::validate`] does that.
pub fn decode_hs256<T: DeserializeOwned>(
    secret: &[u8],
    token: &str,
) -> std::result::Result<T, AuthError> {
    let mut parts = token.trim().split('.');
    let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Invalid);
    };

    let header_raw = b64url_decode(header_b64)?;
    let header: JwtHeader = serde_json::from_slice(&header_raw).map_err(|_| AuthError::Invalid)?;
    if header.alg != ALGORITHM {
        return Err(AuthError::Invalid);
    }
    if let Some(typ) = header.typ.as_deref() {
        if !typ.eq_ignore_ascii_case("JWT") {
            return Err(AuthError::Invalid);
        }
    }

    // Verify signature.
    let signing_input = format!("{header_b64}.{payload_b64}");
    let sig = b64url_decode(sig_b64)?;

    let mut mac = new_mac(secret).map_err(|_| AuthError::Invalid)?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&sig).map_err(|_| AuthError::Invalid)?;

    let payload_raw = b64url_decode(payload_b64)?;
    serde_json::from_slice(&payload_raw).map_err(|_| AuthError::Invalid)
}

/// Mints and validates session tokens with the process-wide secret.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Arc<[u8]>,
    ttl_secs: i64,
}

impl TokenIssuer {
    /// Fails when the secret is empty; callers treat that as fatal at startup.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Signing("signing secret is not configured".to_string()));
        }
        Ok(Self {
            secret: Arc::from(secret.as_bytes()),
            ttl_secs: SESSION_TTL_SECS,
        })
    }

    pub fn issue(&self, email: &str, tier: Tier) -> Result<String> {
        self.issue_at(email, tier, now_ts())
    }

    pub fn issue_at(&self, email: &str, tier: Tier, now: i64) -> Result<String> {
        let claims = SessionClaims {
            email: email.to_string(),
            tier,
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode_hs256(&self.secret, &claims)
    }

    pub fn validate(&self, token: &str) -> std::result::Result<SessionClaims, AuthError> {
        self.validate_at(token, now_ts())
    }

    pub fn validate_at(&self, token: &str, now: i64) -> std::result::Result<SessionClaims, AuthError> {
        let claims: SessionClaims = decode_hs256(&self.secret, token)?;
        if claims.exp <= now {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}
