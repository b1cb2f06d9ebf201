use std::sync::Arc;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use budgetdb_core::{LedgerStore, Role, StorageError, UserRecord};
use rand::rngs::OsRng;
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::AuthConfig;

/// Authenticated caller identity, available to handlers via request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub name: String,
    pub role: Role,
}

impl CallerIdentity {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", Role::Admin)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Hashes a password with Argon2id and a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, password_hash: &str) -> Result<(), AuthError> {
    let parsed = PasswordHash::new(password_hash).map_err(|e| AuthError::Hash(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| AuthError::InvalidCredentials)
}

/// Users stored next to the ledger tables.
pub struct UserRegistry {
    storage: Arc<dyn LedgerStore>,
}

impl UserRegistry {
    pub fn new(storage: Arc<dyn LedgerStore>) -> Self {
        Self { storage }
    }

    pub fn register(&self, username: &str, password: &str, role: Role) -> Result<(), AuthError> {
        let record = UserRecord {
            username: username.to_string(),
            password_hash: hash_password(password)?,
            role,
        };
        match self.storage.insert_user(&record) {
            Ok(()) => {
                tracing::info!(user = %username, %role, "User registered");
                Ok(())
            }
            Err(StorageError::Constraint(_)) => Err(AuthError::UserExists(username.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<CallerIdentity, AuthError> {
        let user = self
            .storage
            .find_user(username)?
            .ok_or(AuthError::InvalidCredentials)?;
        verify_password(password, &user.password_hash)?;
        Ok(CallerIdentity::new(user.username, user.role))
    }
}

pub struct AuthState {
    pub config: AuthConfig,
    pub users: UserRegistry,
}

#[derive(Serialize)]
struct AuthFailure {
    success: bool,
    error: String,
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"budgetdb\"")],
        Json(AuthFailure {
            success: false,
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn basic_credentials(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn resolve_caller(state: &AuthState, headers: &axum::http::HeaderMap) -> Result<CallerIdentity, &'static str> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let api_key = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| authorization.and_then(|s| s.strip_prefix("Bearer ")));

    if let Some(key) = api_key {
        return state
            .config
            .api_keys
            .iter()
            .find(|entry| entry.key.as_bytes().ct_eq(key.as_bytes()).into())
            .map(|entry| CallerIdentity::new(entry.name.clone(), entry.role.parse().unwrap_or(Role::Viewer)))
            .ok_or("Invalid API key");
    }

    match authorization.and_then(basic_credentials) {
        Some((user, password)) => state.users.authenticate(&user, &password).map_err(|e| {
            tracing::warn!(user = %user, error = %e, "Login failed");
            "Invalid username or password"
        }),
        None => Err("Missing credentials. Provide HTTP Basic credentials, X-API-Key or Authorization: Bearer <key>"),
    }
}

pub async fn auth_middleware<B>(
    Extension(state): Extension<Arc<AuthState>>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    if !state.config.enabled {
        req.extensions_mut().insert(CallerIdentity::anonymous());
        return next.run(req).await;
    }

    // Basic credentials cost a full Argon2 verification plus a store lookup.
    let headers = req.headers().clone();
    let resolved = tokio::task::spawn_blocking(move || resolve_caller(&state, &headers)).await;
    let resolved = match resolved {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::error!(error = %e, "Credential check failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match resolved {
        Ok(caller) => {
            tracing::debug!(caller = %caller.name, role = %caller.role, "Authenticated request");
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(message) => unauthorized(message),
    }
}
