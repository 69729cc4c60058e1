//! Caller authentication for the gateway
//!
//! Resolves `Authorization: Bearer <jwt>` credentials to an [`AuthResult`]
//! and checks operation scopes. Tokens are HS256 JWTs; scopes are read from
//! a `permissions` array or a space-separated `scope` claim.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use mcpstream_core::{AuthResult, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Credential resolution or scope check failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    Expired,

    #[error("insufficient scope: '{required}' is required")]
    InsufficientScope { required: Scope },
}

// ============================================================================
// Configuration
// ============================================================================

/// Token validation settings
#[derive(Clone)]
pub struct AuthConfig {
    /// HS256 signing secret; without it every bearer token is rejected
    pub jwt_secret: Option<Zeroizing<String>>,
    /// Expected `iss` claim, if any
    pub issuer: Option<String>,
    /// Expected `aud` claim, if any
    pub audience: Option<String>,
    /// Accept requests without a credential
    pub allow_anonymous: bool,
    /// Scopes granted to anonymous callers
    pub anonymous_scopes: Vec<String>,
    /// Clock skew tolerated on `exp`/`nbf`, in seconds
    pub leeway_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: None,
            audience: None,
            allow_anonymous: false,
            anonymous_scopes: vec![Scope::Read.as_str().to_string()],
            leeway_secs: 30,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("allow_anonymous", &self.allow_anonymous)
            .field("anonymous_scopes", &self.anonymous_scopes)
            .finish()
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Turns a raw credential into a caller identity
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, credential: Option<&str>) -> Result<AuthResult, AuthError>;
}

/// Resolve the credential and require `scope`
pub fn authorize(
    resolver: &dyn CredentialResolver,
    credential: Option<&str>,
    scope: Scope,
) -> Result<AuthResult, AuthError> {
    let auth = resolver.resolve(credential)?;
    if !auth.has_scope(scope) {
        debug!(
            user_id = %auth.user_id,
            required = %scope,
            "[Auth] Scope check failed"
        );
        return Err(AuthError::InsufficientScope { required: scope });
    }
    Ok(auth)
}

/// JWT claims understood by the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// String or array of strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl TokenClaims {
    fn scopes(&self) -> Vec<String> {
        if let Some(permissions) = &self.permissions {
            return permissions.clone();
        }
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }

    fn has_audience(&self, expected: &str) -> bool {
        match &self.aud {
            Some(Value::String(aud)) => aud == expected,
            Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expected)),
            _ => false,
        }
    }
}

/// HS256 bearer-token resolver
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    config: AuthConfig,
}

impl TokenAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Sign a token for `subject` valid for `ttl`
    pub fn issue_token(
        &self,
        subject: &str,
        scopes: &[&str],
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            sub: subject.to_string(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone().map(Value::String),
            exp: now + ttl.as_secs() as i64,
            nbf: None,
            iat: now,
            scope: Some(scopes.join(" ")),
            permissions: None,
        };
        self.sign(&claims)
    }

    /// Sign arbitrary claims with the configured secret
    pub fn sign(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        let secret = self.secret()?;
        let header = base64_url_encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = serde_json::to_vec(claims)
            .map_err(|e| AuthError::InvalidToken(format!("unserializable claims: {}", e)))?;
        let signing_input = format!("{}.{}", header, base64_url_encode(&payload));

        let signature = hmac_sign(secret.as_bytes(), signing_input.as_bytes())?;
        Ok(format!("{}.{}", signing_input, base64_url_encode(&signature)))
    }

    /// Verify a token and return its claims
    pub fn validate_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let secret = self.secret()?;

        let parts: Vec<&str> = token.split('.').collect();
        let [header_b64, payload_b64, signature_b64] = parts.as_slice() else {
            debug!(
                "[Auth] Invalid token format - expected 3 parts, got {}",
                parts.len()
            );
            return Err(AuthError::InvalidToken("malformed token".to_string()));
        };

        let header: Value = decode_json(header_b64)?;
        if header.get("alg").and_then(Value::as_str) != Some("HS256") {
            return Err(AuthError::InvalidToken("unsupported algorithm".to_string()));
        }

        let signature = base64_url_decode(signature_b64)
            .ok_or_else(|| AuthError::InvalidToken("malformed signature".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            debug!("[Auth] Invalid token signature");
            return Err(AuthError::InvalidToken("bad signature".to_string()));
        }

        let claims: TokenClaims = decode_json(payload_b64)?;

        let now = chrono::Utc::now().timestamp();
        if now > claims.exp + self.config.leeway_secs {
            debug!("[Auth] Token expired at {}, now is {}", claims.exp, now);
            return Err(AuthError::Expired);
        }
        if let Some(nbf) = claims.nbf {
            if now + self.config.leeway_secs < nbf {
                return Err(AuthError::InvalidToken("token not yet valid".to_string()));
            }
        }
        if let Some(issuer) = &self.config.issuer {
            if claims.iss.as_deref() != Some(issuer.as_str()) {
                return Err(AuthError::InvalidToken("unexpected issuer".to_string()));
            }
        }
        if let Some(audience) = &self.config.audience {
            if !claims.has_audience(audience) {
                return Err(AuthError::InvalidToken("unexpected audience".to_string()));
            }
        }

        Ok(claims)
    }

    fn secret(&self) -> Result<&Zeroizing<String>, AuthError> {
        self.config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| AuthError::InvalidToken("no signing secret configured".to_string()))
    }
}

impl CredentialResolver for TokenAuthenticator {
    fn resolve(&self, credential: Option<&str>) -> Result<AuthResult, AuthError> {
        let token = credential
            .map(|c| c.trim())
            .map(|c| c.strip_prefix("Bearer ").unwrap_or(c).trim())
            .filter(|c| !c.is_empty());

        let Some(token) = token else {
            if self.config.allow_anonymous {
                return Ok(AuthResult::anonymous(self.config.anonymous_scopes.clone()));
            }
            return Err(AuthError::MissingCredential);
        };

        let claims = self.validate_token(token)?;
        Ok(AuthResult::user(claims.sub.clone(), claims.scopes()))
    }
}

// ============================================================================
// Request extraction
// ============================================================================

/// Raw `Authorization` header value, if present
#[derive(Debug, Clone, Default)]
pub struct BearerCredential(pub Option<String>);

impl BearerCredential {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S> FromRequestParts<S> for BearerCredential
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(BearerCredential(
            parts
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        ))
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

pub(crate) fn hmac_sign(secret: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Base64 URL-safe encoding (no padding)
pub(crate) fn base64_url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Base64 URL-safe decoding
pub(crate) fn base64_url_decode(s: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(s).ok()
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, AuthError> {
    let bytes = base64_url_decode(segment)
        .ok_or_else(|| AuthError::InvalidToken("malformed segment".to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::InvalidToken(e.to_string()))
}
