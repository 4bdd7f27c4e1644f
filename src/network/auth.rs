//! Session Authentication
//!
//! Bearer-token check performed by the acceptor while handling `Hello`.
//! Tokens are issued elsewhere; this module only validates them.
//!
//! With no key configured every session is admitted anonymously. With a
//! key configured a valid token is mandatory.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::objects::account::AccountId;

/// Token validation settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Required `iss` claim, if any.
    pub issuer: Option<String>,
    /// Required `aud` claim, if any.
    pub audience: Option<String>,
    /// RS256 public key (PEM).
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Accept expired tokens (tests only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Read `AUTH_ISSUER`, `AUTH_AUDIENCE`, `AUTH_PUBLIC_KEY_PEM`,
    /// `AUTH_SECRET` and `AUTH_SKIP_EXPIRY`.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// HS256 config with the given secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Default::default()
        }
    }

    /// Whether a key is configured, making tokens mandatory.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }

    fn algorithm(&self) -> Algorithm {
        if self.public_key_pem.is_some() {
            Algorithm::RS256
        } else {
            Algorithm::HS256
        }
    }

    fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        match (&self.public_key_pem, &self.secret) {
            (Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e))),
            (None, Some(secret)) => Ok(DecodingKey::from_secret(secret.as_bytes())),
            (None, None) => Err(AuthError::NotConfigured),
        }
    }
}

/// Claims read from a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (provider user id).
    pub sub: String,
    /// Expiry, Unix seconds.
    #[serde(default)]
    pub exp: u64,
    /// Issued at, Unix seconds.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// Account the subject maps to.
    pub fn account_id(&self) -> AccountId {
        AccountId::derive(&self.sub)
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No key configured.
    #[error("authentication not configured")]
    NotConfigured,
    /// Key configured but the hello carried no token.
    #[error("token required")]
    MissingToken,
    /// Malformed token.
    #[error("invalid token format")]
    InvalidFormat,
    /// Signature check failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token expired.
    #[error("token expired")]
    Expired,
    /// `iss` mismatch.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// `aud` mismatch.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim absent.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Any other decode failure.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Decide whether a hello may open a session.
///
/// Returns the validated claims, or `None` when authentication is off.
pub fn authenticate(token: Option<&str>, config: &AuthConfig) -> Result<Option<TokenClaims>, AuthError> {
    if !config.is_configured() {
        return Ok(None);
    }

    let token = token.ok_or(AuthError::MissingToken)?;
    validate_token(token, config).map(Some)
}

/// Validate a token and extract its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let key = config.decoding_key()?;

    let mut validation = Validation::new(config.algorithm());
    validation.required_spec_claims = HashSet::new();
    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    match config.audience {
        Some(ref audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let data: TokenData<TokenClaims> = decode(token, &key, &validation).map_err(map_jwt_error)?;
    let claims = data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // exp is optional in the claim set, so the library check may not run.
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

/// Sign an HS256 token for `sub` (tests and the standalone binary).
pub fn issue_test_token(sub: &str, secret: &str, ttl_secs: u64) -> Result<String, AuthError> {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let claims = TokenClaims {
        sub: sub.to_string(),
        exp: now + ttl_secs,
        iat: now,
        iss: None,
        aud: None,
    };

    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AuthError::DecodeError(e.to_string()))
}

// =============================================================================
// TESTS
// =============================================================================
