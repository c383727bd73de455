//! Bearer token issuing and verification.
//!
//! Wire format: `v1.<base64url(claims JSON)>.<base64url(HMAC-SHA256)>`,
//! unpadded. The signature covers the encoded payload. Verification
//! tolerates [`CLOCK_SKEW_SECS`] of clock skew on `iat`/`exp`.
//!
//! Key rotation is an operational concern: the secret comes from the
//! environment at startup, and changing it invalidates outstanding tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use tg_store::UserRecord;

type HmacSha256 = Hmac<Sha256>;

/// Tolerated clock skew, applied to both `exp` and `iat`.
pub const CLOCK_SKEW_SECS: i64 = 30;

const TOKEN_PREFIX: &str = "v1";

/// Identity claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the gateway `user_id`.
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    /// `"local"` or the OAuth provider id used to log in.
    pub provider: String,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
}

/// Errors from token verification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,
}

/// Signs and verifies the gateway's bearer tokens.
pub struct TokenIssuer {
    secret: Vec<u8>,
    ttl_secs: i64,
}

impl TokenIssuer {
    pub fn new(secret: Vec<u8>, ttl_secs: u64) -> Self {
        Self {
            secret,
            ttl_secs: ttl_secs as i64,
        }
    }

    /// Issue a token for a user who just authenticated via `provider`.
    pub fn issue(&self, user: &UserRecord, provider: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.user_id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            provider: provider.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        self.encode(&claims)
    }

    fn encode(&self, claims: &Claims) -> String {
        let payload = serde_json::to_vec(claims).expect("claims serialize to JSON");
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let sig_b64 = URL_SAFE_NO_PAD.encode(self.sign(payload_b64.as_bytes()));
        format!("{TOKEN_PREFIX}.{payload_b64}.{sig_b64}")
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (prefix, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(c), Some(s)) if parts.next().is_none() => (p, c, s),
            _ => return Err(TokenError::Malformed),
        };
        if prefix != TOKEN_PREFIX {
            return Err(TokenError::Malformed);
        }

        let provided_sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;
        let expected_sig = self.sign(payload_b64.as_bytes());
        // Constant-time comparison to prevent timing attacks.
        if provided_sig.ct_eq(expected_sig.as_slice()).unwrap_u8() != 1 {
            return Err(TokenError::BadSignature);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        let now = Utc::now().timestamp();
        if now > claims.exp + CLOCK_SKEW_SECS {
            return Err(TokenError::Expired);
        }
        if claims.iat - CLOCK_SKEW_SECS > now {
            return Err(TokenError::NotYetValid);
        }
        Ok(claims)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(b"test-secret".to_vec(), 3600)
    }

    fn user() -> UserRecord {
        UserRecord::new("alice@example.com", Some("Alice".into()), "local")
    }

    #[test]
    fn issue_then_verify_round_trips() {
        let issuer = issuer();
        let user = user();
        let token = issuer.issue(&user, "local");
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, user.user_id);
        assert_eq!(claims.email, "alice@example.com");
        assert_eq!(claims.provider, "local");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn tampered_payload_rejected() {
        let issuer = issuer();
        let token = issuer.issue(&user(), "local");
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(b"{\"sub\":\"evil\"}");
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert_eq!(
            issuer.verify(&forged_token).unwrap_err(),
            TokenError::BadSignature
        );
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issuer().issue(&user(), "local");
        let other = TokenIssuer::new(b"other-secret".to_vec(), 3600);
        assert_eq!(other.verify(&token).unwrap_err(), TokenError::BadSignature);
    }

    #[test]
    fn garbage_is_malformed() {
        let issuer = issuer();
        assert_eq!(issuer.verify("").unwrap_err(), TokenError::Malformed);
        assert_eq!(issuer.verify("a.b").unwrap_err(), TokenError::Malformed);
        assert_eq!(
            issuer.verify("v2.abc.def").unwrap_err(),
            TokenError::Malformed
        );
        assert_eq!(
            issuer.verify("v1.!!!.???").unwrap_err(),
            TokenError::Malformed
        );
    }

    #[test]
    fn expired_token_rejected_beyond_skew() {
        let issuer = issuer();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "u1".into(),
            email: "a@x.com".into(),
            name: None,
            provider: "local".into(),
            iat: now - 7200,
            exp: now - CLOCK_SKEW_SECS - 10,
        };
        let token = issuer.encode(&claims);
        assert_eq!(issuer.verify(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn expiry_within_skew_tolerated() {
        let issuer = issuer();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "u1".into(),
            email: "a@x.com".into(),
            name: None,
            provider: "local".into(),
            iat: now - 3600,
            exp: now - 5,
        };
        let token = issuer.encode(&claims);
        assert!(issuer.verify(&token).is_ok());
    }

    #[test]
    fn future_iat_beyond_skew_rejected() {
        let issuer = issuer();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "u1".into(),
            email: "a@x.com".into(),
            name: None,
            provider: "local".into(),
            iat: now + 300,
            exp: now + 3900,
        };
        let token = issuer.encode(&claims);
        assert_eq!(issuer.verify(&token).unwrap_err(), TokenError::NotYetValid);
    }
}
