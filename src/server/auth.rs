//! JWT authentication
//!
//! Access tokens identify the owner of a conversation. The HTTP API checks
//! them in [`auth_middleware`]; the control WebSocket checks them in its
//! `authenticate` message, since browsers cannot set headers on upgrades.

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::AuthError;

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the owner id credits are charged to
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub jti: String,
}

/// Token settings
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// HS256 secret
    pub jwt_secret: String,
    pub access_token_expiry_minutes: i64,
}

impl From<&crate::config::AuthConfig> for AuthSettings {
    fn from(config: &crate::config::AuthConfig) -> Self {
        Self {
            jwt_secret: config.jwt_secret.clone().unwrap_or_else(generate_jwt_secret),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
        }
    }
}

pub struct AuthState {
    settings: AuthSettings,
}

impl AuthState {
    pub fn new(settings: AuthSettings) -> Arc<Self> {
        Arc::new(Self { settings })
    }

    /// Issue an access token for `user_id`
    pub fn generate_access_token(&self, user_id: &str, permissions: &[String]) -> Result<String> {
        let now = Utc::now();
        let expiry = now + Duration::minutes(self.settings.access_token_expiry_minutes);

        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: expiry.timestamp(),
            permissions: permissions.to_vec(),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.settings.jwt_secret.as_bytes()),
        )
        .context("Failed to encode JWT")
    }

    /// Validate and decode token
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.settings.jwt_secret.as_bytes()),
            &validation,
        )
        .context("Invalid token")?;
        Ok(token_data.claims)
    }

    /// Validate an access token and return its owner id
    pub fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        let claims = self
            .validate_token(token)
            .map_err(|e| AuthError::InvalidToken(format!("{:#}", e)))?;
        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("token has no subject".into()));
        }
        Ok(claims.sub)
    }
}

/// Generate a secure JWT secret
pub fn generate_jwt_secret() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

/// Axum middleware for JWT authentication
pub async fn auth_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = state.validate_token(token).map_err(|_| StatusCode::UNAUTHORIZED)?;

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}
