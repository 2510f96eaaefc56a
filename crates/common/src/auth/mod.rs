//! Authentication utilities
//!
//! Provides:
//! - JWT token validation (and generation, used by tooling and tests)
//! - Caller context extraction for axum handlers
//!
//! Handlers expect an `Arc<JwtManager>` in the request extensions, installed
//! by the gateway router with an `Extension` layer.

use crate::errors::{AppError, Result};
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::request::Parts,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Extracted authentication context available to handlers
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated user; owner of the articles it creates
    pub user_id: Uuid,

    /// Scopes/permissions
    pub scopes: Vec<String>,

    /// Request ID for tracing
    pub request_id: String,
}

impl AuthContext {
    /// Check if the context has a specific scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "admin")
    }

    /// Require a specific scope, returning error if not present
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AppError::Forbidden {
                message: format!("Missing required scope: {}", scope),
            })
        }
    }
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// JWT token manager
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_secs: i64,
}

impl JwtManager {
    /// Create a new JWT manager with the given secret
    pub fn new(secret: &str, expiration_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration_secs: expiration_secs as i64,
        }
    }

    /// Generate a new JWT token
    pub fn generate_token(&self, user_id: Uuid, scopes: Vec<String>) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.expiration_secs);

        let claims = JwtClaims {
            sub: user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            scopes,
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| AppError::Internal {
            message: format!("Failed to generate token: {}", e),
        })
    }

    /// Validate and decode a JWT token
    pub fn validate_token(&self, token: &str) -> Result<JwtClaims> {
        decode::<JwtClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AppError::ExpiredToken,
                _ => AppError::InvalidToken,
            })
    }

    /// Build the caller context from a bearer token
    pub fn authenticate(&self, token: &str, request_id: String) -> Result<AuthContext> {
        let claims = self.validate_token(token)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::InvalidToken)?;

        Ok(AuthContext {
            user_id,
            scopes: claims.scopes,
            request_id,
        })
    }
}

/// Extract the token from an `Authorization: Bearer ...` header value
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn request_id(parts: &Parts) -> String {
    parts
        .headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn jwt_manager(parts: &Parts) -> Result<Arc<JwtManager>> {
    parts
        .extensions
        .get::<Arc<JwtManager>>()
        .cloned()
        .ok_or_else(|| AppError::Configuration {
            message: "JWT manager missing from request extensions".to_string(),
        })
}

/// Axum extractor for AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized {
                message: "Missing Authorization header".to_string(),
            })?;

        let token = extract_bearer(auth_header).ok_or_else(|| AppError::Unauthorized {
            message: "Expected a bearer token".to_string(),
        })?;

        jwt_manager(parts)?.authenticate(token, request_id(parts))
    }
}

/// Anonymous callers get `None`; a present but invalid token is still rejected.
impl<S> OptionalFromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Option<Self>, Self::Rejection> {
        if !parts.headers.contains_key("authorization") {
            return Ok(None);
        }

        <AuthContext as FromRequestParts<S>>::from_request_parts(parts, state)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc.def"), Some("abc.def"));
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("Basic abc"), None);
    }

    #[test]
    fn test_jwt_roundtrip() {
        let manager = JwtManager::new("test_secret", 3600);

        let user_id = Uuid::new_v4();
        let scopes = vec!["write".to_string()];

        let token = manager.generate_token(user_id, scopes.clone()).unwrap();
        let ctx = manager.authenticate(&token, "req-1".to_string()).unwrap();

        assert_eq!(ctx.user_id, user_id);
        assert_eq!(ctx.scopes, scopes);
        assert!(ctx.has_scope("write"));
        assert!(ctx.require_scope("delete").is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtManager::new("secret-a", 3600);
        let verifier = JwtManager::new("secret-b", 3600);

        let token = issuer.generate_token(Uuid::new_v4(), vec![]).unwrap();
        assert!(matches!(
            verifier.validate_token(&token),
            Err(AppError::InvalidToken)
        ));
    }
}
