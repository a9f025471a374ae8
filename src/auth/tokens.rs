//! Credential issuance and validation
//!
//! Credentials are compact `header.payload.signature` strings. Each part is
//! URL-safe base64 without padding; the signature is HMAC-SHA256 over
//! `header.payload` keyed by the shared secret (the HS256 JWT layout).

use crate::auth::claims::{Claims, PrincipalKind, ThingClaims, UserClaims};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Subject used for admin credentials
pub const ADMIN_SUBJECT: &str = "0";

const ALGORITHM: &str = "HS256";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token claims do not match the requested principal kind")]
    WrongShape,
}

impl TokenError {
    /// Stable code used on the authority HTTP surface
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::Signing(_) => "signing",
            TokenError::Malformed => "malformed",
            TokenError::InvalidSignature => "invalid_signature",
            TokenError::Expired => "expired",
            TokenError::WrongShape => "wrong_shape",
        }
    }

    /// Inverse of [`TokenError::code`]
    pub fn from_code(code: &str, detail: &str) -> Option<TokenError> {
        match code {
            "signing" => Some(TokenError::Signing(detail.to_string())),
            "malformed" => Some(TokenError::Malformed),
            "invalid_signature" => Some(TokenError::InvalidSignature),
            "expired" => Some(TokenError::Expired),
            "wrong_shape" => Some(TokenError::WrongShape),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Seconds since the Unix epoch
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Issues and validates credentials for all principal kinds.
///
/// Holds nothing but the shared secret and the issuer tag, so it can be
/// shared freely across tasks.
#[derive(Clone)]
pub struct CredentialAuthority {
    secret: Vec<u8>,
    issuer: String,
}

impl CredentialAuthority {
    pub fn new(secret: impl Into<Vec<u8>>, issuer: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn issue_admin_token(&self) -> Result<String, TokenError> {
        self.issue_admin_token_at(unix_now())
    }

    pub fn issue_user_token(&self, user_id: &str) -> Result<String, TokenError> {
        self.issue_user_token_at(user_id, unix_now())
    }

    pub fn issue_thing_token(&self, thing_id: &str, user_id: &str) -> Result<String, TokenError> {
        self.issue_thing_token_at(thing_id, user_id, unix_now())
    }

    /// Validate a credential against the requested principal kind
    pub fn validate(&self, kind: PrincipalKind, token: &str) -> Result<Claims, TokenError> {
        self.validate_at(kind, token, unix_now())
    }

    /// Decode user-shaped claims regardless of whether the role is admin or user
    pub fn user_claims(&self, token: &str) -> Result<UserClaims, TokenError> {
        self.user_claims_at(token, unix_now())
    }

    pub(crate) fn issue_admin_token_at(&self, now: u64) -> Result<String, TokenError> {
        self.sign(&self.user_shaped(PrincipalKind::Admin, ADMIN_SUBJECT, now))
    }

    pub(crate) fn issue_user_token_at(&self, user_id: &str, now: u64) -> Result<String, TokenError> {
        self.sign(&self.user_shaped(PrincipalKind::User, user_id, now))
    }

    pub(crate) fn issue_thing_token_at(
        &self,
        thing_id: &str,
        user_id: &str,
        now: u64,
    ) -> Result<String, TokenError> {
        let claims = ThingClaims {
            role: PrincipalKind::Thing,
            sub: thing_id.to_string(),
            user_id: user_id.to_string(),
            iat: now,
            exp: now + PrincipalKind::Thing.ttl_secs(),
            iss: self.issuer.clone(),
        };
        self.sign(&claims)
    }

    pub(crate) fn validate_at(
        &self,
        kind: PrincipalKind,
        token: &str,
        now: u64,
    ) -> Result<Claims, TokenError> {
        let claims = match kind {
            PrincipalKind::Admin | PrincipalKind::User => {
                Claims::User(self.verify::<UserClaims>(token)?)
            }
            PrincipalKind::Thing => Claims::Thing(self.verify::<ThingClaims>(token)?),
        };

        if claims.kind() != kind {
            return Err(TokenError::WrongShape);
        }
        if claims.expires_at() <= now {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    pub(crate) fn user_claims_at(&self, token: &str, now: u64) -> Result<UserClaims, TokenError> {
        let claims = self.verify::<UserClaims>(token)?;
        if claims.role == PrincipalKind::Thing {
            return Err(TokenError::WrongShape);
        }
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn user_shaped(&self, role: PrincipalKind, subject: &str, now: u64) -> UserClaims {
        UserClaims {
            role,
            sub: subject.to_string(),
            iat: now,
            exp: now + role.ttl_secs(),
            iss: self.issuer.clone(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        if self.secret.is_empty() {
            return Err(TokenError::Signing("empty signing secret".to_string()));
        }
        HmacSha256::new_from_slice(&self.secret).map_err(|e| TokenError::Signing(e.to_string()))
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, TokenError> {
        let header = Header {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| TokenError::Signing(e.to_string()))?;
        let claims_json =
            serde_json::to_vec(claims).map_err(|e| TokenError::Signing(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Check the signature, then decode the payload into the requested schema
    fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, TokenError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac().map_err(|_| TokenError::InvalidSignature)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let header: Header = URL_SAFE_NO_PAD
            .decode(header_b64)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .ok_or(TokenError::Malformed)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::Malformed);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;

        // Signed JSON that does not fit the schema is a shape mismatch,
        // anything else is a malformed token.
        serde_json::from_slice::<T>(&payload).map_err(|e| {
            if e.is_data() {
                TokenError::WrongShape
            } else {
                TokenError::Malformed
            }
        })
    }
}

impl fmt::Debug for CredentialAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialAuthority")
            .field("secret", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// Shared key that callers of the authority listener present to have
/// credentials issued
#[derive(Clone)]
pub struct ServiceKey {
    key: String,
}

impl ServiceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn matches(&self, presented: &str) -> bool {
        // Constant time over the key length
        if presented.len() != self.key.len() {
            return false;
        }

        let mut diff = 0u8;
        for (a, b) in presented.bytes().zip(self.key.bytes()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceKey([REDACTED])")
    }
}

/// Short, log-safe prefix of a credential
pub fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(10) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}
