//! Bearer-token authentication.
//!
//! The validation strategy is an [`AuthValidator`] trait object chosen once at
//! startup: local JWT verification with a shared secret, or remote token
//! introspection. Handlers only see the resulting [`Principal`] through the
//! [`AuthUser`] and [`AdminUser`] extractors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use herald_common::config::{AppConfig, AuthMode};
use herald_common::error::AppError;
use herald_common::types::Principal;

use crate::state::AppState;

/// JWT claims accepted by the local validator.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject - the caller's identity
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Encode a JWT for a principal. Used by tooling and tests.
pub fn encode_jwt(principal: &Principal, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + chrono::Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: principal.subject.clone(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
        roles: principal.roles.clone(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))
}

/// Decode and validate a JWT.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<Principal, AppError>;
}

/// Verifies HS256 tokens signed with the shared secret.
pub struct LocalJwtValidator {
    secret: String,
}

impl LocalJwtValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl AuthValidator for LocalJwtValidator {
    async fn validate(&self, credential: &str) -> Result<Principal, AppError> {
        let claims = decode_jwt(credential, &self.secret)?;
        Ok(Principal {
            subject: claims.sub,
            roles: claims.roles,
        })
    }
}

/// Introspection endpoint reply (RFC 7662 plus a `roles` extension).
#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: bool,
    sub: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    /// Space-separated scopes
    scope: Option<String>,
}

const INTROSPECTION_CACHE_TTL: Duration = Duration::from_secs(60);

/// Asks the auth service whether a token is active. Active results are
/// cached briefly so bursts from one caller cost one round trip.
pub struct IntrospectionValidator {
    client: reqwest::Client,
    url: String,
    cache: Mutex<HashMap<String, (Instant, Principal)>>,
}

impl IntrospectionValidator {
    pub fn new(url: impl Into<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, credential: &str) -> Option<Principal> {
        let mut cache = self.cache.lock();
        cache.retain(|_, (at, _)| at.elapsed() < INTROSPECTION_CACHE_TTL);
        cache.get(credential).map(|(_, principal)| principal.clone())
    }
}

#[async_trait]
impl AuthValidator for IntrospectionValidator {
    async fn validate(&self, credential: &str) -> Result<Principal, AppError> {
        if let Some(principal) = self.cached(credential) {
            return Ok(principal);
        }

        let response = self
            .client
            .post(&self.url)
            .form(&[("token", credential)])
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Token introspection request failed");
                AppError::Auth("Token introspection failed".to_string())
            })?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Token introspection rejected");
            return Err(AppError::Auth("Token introspection failed".to_string()));
        }

        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| AppError::Auth(format!("Malformed introspection response: {}", e)))?;

        if !body.active {
            return Err(AppError::Auth("Token is not active".to_string()));
        }
        let subject = body
            .sub
            .ok_or_else(|| AppError::Auth("Introspection response has no subject".to_string()))?;

        let mut roles = body.roles;
        if let Some(scope) = body.scope {
            roles.extend(scope.split_whitespace().map(str::to_string));
        }
        let principal = Principal { subject, roles };

        self.cache
            .lock()
            .insert(credential.to_string(), (Instant::now(), principal.clone()));
        Ok(principal)
    }
}

/// Build the validator selected by `AUTH_MODE`.
pub fn validator_from_config(config: &AppConfig) -> Result<Arc<dyn AuthValidator>, AppError> {
    match config.auth_mode {
        AuthMode::Local => Ok(Arc::new(LocalJwtValidator::new(config.jwt_secret.clone()))),
        AuthMode::Introspection => {
            let url = config.auth_introspection_url.clone().ok_or_else(|| {
                AppError::Config("AUTH_INTROSPECTION_URL is required for introspection".to_string())
            })?;
            Ok(Arc::new(IntrospectionValidator::new(url)?))
        }
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Authenticated caller.
///
/// ```ignore
/// async fn handler(AuthUser(principal): AuthUser) -> impl IntoResponse { ... }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser(pub Principal);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        // Already validated by the principal-keyed rate limiter.
        if let Some(principal) = parts.extensions.get::<Principal>() {
            return Ok(AuthUser(principal.clone()));
        }

        let token = bearer_token(parts).ok_or_else(|| {
            AppError::Auth("Missing or invalid Authorization header. Use 'Bearer <token>'".to_string())
        })?;
        let principal = state.auth.validate(token).await?;
        Ok(AuthUser(principal))
    }
}

/// Authenticated caller holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub Principal);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthUser(principal) = AuthUser::from_request_parts(parts, state).await?;
        if !principal.is_admin() {
            tracing::warn!(subject = %principal.subject, "Non-admin caller refused");
            return Err(AppError::Forbidden("Admin role required".to_string()));
        }
        Ok(AdminUser(principal))
    }
}
