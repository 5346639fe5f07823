//! Request authentication: Basic credentials and JWT bearer tokens.
//!
//! Validators implement [`AuthHandler`], so the host can plug its own scheme
//! (an API-key database, mTLS identity, anything) without touching the
//! pipeline. The two bundled handlers cover the configuration surface.

pub mod rbac;

use async_trait::async_trait;
use base64::Engine;
use http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::{errors::GatewayError, types::Principal};

/// Pluggable credential validator.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Validates the request's credentials and returns the principal.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Unauthenticated`] when credentials are missing or
    /// invalid.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, GatewayError>;
}

fn authorization_value<'h>(
    headers: &'h HeaderMap,
    expected_scheme: &str,
) -> Result<&'h str, GatewayError> {
    let raw = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Unauthenticated("missing authorization header".to_string()))?;

    raw.strip_prefix(expected_scheme).ok_or_else(|| {
        GatewayError::Unauthenticated(format!(
            "authorization header is not {} auth",
            expected_scheme.trim()
        ))
    })
}

/// Constant-credential Basic auth.
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    #[must_use]
    pub fn new(username: &str, password: &str) -> Self {
        Self { username: username.to_string(), password: password.to_string() }
    }
}

#[async_trait]
impl AuthHandler for BasicAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, GatewayError> {
        let encoded = authorization_value(headers, "Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| GatewayError::Unauthenticated("invalid base64 credentials".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| GatewayError::Unauthenticated("credentials are not utf-8".to_string()))?;

        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            GatewayError::Unauthenticated("credentials missing ':' separator".to_string())
        })?;

        if username != self.username || password != self.password {
            return Err(GatewayError::Unauthenticated("invalid username or password".to_string()));
        }

        Ok(Principal { id: username.to_string(), roles: Vec::new() })
    }
}

/// JWT validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSettings {
    pub secret: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "default_true")]
    pub verify_exp: bool,
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_true() -> bool {
    true
}

/// Claims the gateway reads from a token.
///
/// `roles` is optional and feeds RBAC when present; unknown claims are
/// ignored.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
}

/// HS256/384/512 bearer-token validation via `jsonwebtoken`.
pub struct JwtAuth {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    /// Builds a validator from settings.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] for an unsupported algorithm name;
    /// config validation reports this before the gateway starts.
    pub fn new(settings: &JwtSettings) -> Result<Self, GatewayError> {
        let algorithm = match settings.algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(GatewayError::Internal(format!(
                    "unsupported jwt algorithm {other:?}"
                )))
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = settings.verify_exp;
        if let Some(issuer) = &settings.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &settings.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            validation,
        })
    }
}

#[async_trait]
impl AuthHandler for JwtAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, GatewayError> {
        let token = authorization_value(headers, "Bearer ")?;

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| {
                let reason = match error.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => "token expired",
                    jsonwebtoken::errors::ErrorKind::InvalidIssuer => "invalid issuer",
                    jsonwebtoken::errors::ErrorKind::InvalidAudience => "invalid audience",
                    _ => "invalid token",
                };
                GatewayError::Unauthenticated(reason.to_string())
            })?;

        Ok(Principal { id: data.claims.sub, roles: data.claims.roles })
    }
}
