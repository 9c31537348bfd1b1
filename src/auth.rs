//! Accounts and access tokens.
//!
//! Passwords are stored as salted SHA-256 digests and compared in constant
//! time. Tokens are HS256 JWTs carrying the user's id, email and role.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::context::KeyValueStore;

pub const MIN_PASSWORD_LEN: usize = 8;

const USER_KEY_PREFIX: &str = "user:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Public view of an account. Never carries the password digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredUser {
    user: User,
    salt: String,
    /// Hex-encoded SHA-256 of `salt:password`.
    password_hash: String,
}

impl StoredUser {
    fn new(user: User, password: &str) -> Self {
        let salt = Uuid::new_v4().simple().to_string();
        let password_hash = to_hex(&hash_password(&salt, password));
        Self {
            user,
            salt,
            password_hash,
        }
    }

    fn verify(&self, password: &str) -> bool {
        let provided = to_hex(&hash_password(&self.salt, password));
        self.password_hash.as_bytes().ct_eq(provided.as_bytes()).into()
    }
}

fn hash_password(salt: &str, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Email and password are required")]
    MissingCredentials,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid email address")]
    InvalidEmail,

    #[error("Password must be at least {0} characters")]
    PasswordTooShort(usize),

    #[error("An account with this email already exists")]
    EmailTaken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Failed to issue token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("Failed to persist account: {0}")]
    Storage(#[from] anyhow::Error),
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

/// Check a registration before anything is written.
pub fn validate_registration(email: &str, password: &str) -> Result<(), AuthError> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    if !is_valid_email(&normalize_email(email)) {
        return Err(AuthError::InvalidEmail);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::PasswordTooShort(MIN_PASSWORD_LEN));
    }
    Ok(())
}

/// Accounts keyed by lowercased email.
///
/// The development account comes from configuration and always has the
/// admin role. Registered accounts get the user role and are written
/// through to the key/value store.
pub struct UserStore {
    dev: StoredUser,
    users: RwLock<HashMap<String, StoredUser>>,
    store: Arc<KeyValueStore>,
}

impl UserStore {
    /// Build the store, reloading any accounts already persisted in `store`.
    pub async fn new(config: &AuthConfig, store: Arc<KeyValueStore>) -> Self {
        let dev_email = normalize_email(&config.dev_email);
        let dev = StoredUser::new(
            User {
                // Same id on every start; preferences and usage are keyed by it
                id: Uuid::new_v5(&Uuid::NAMESPACE_OID, dev_email.as_bytes()).to_string(),
                email: dev_email,
                name: Some(config.dev_name.clone()),
                role: Role::Admin,
                created_at: Utc::now(),
            },
            &config.dev_password,
        );

        let mut users = HashMap::new();
        for (key, value) in store.entries_with_prefix(USER_KEY_PREFIX).await {
            match serde_json::from_value::<StoredUser>(value) {
                Ok(stored) => {
                    users.insert(stored.user.email.clone(), stored);
                }
                Err(e) => log::warn!("UserStore: skipping undecodable account {}: {}", key, e),
            }
        }
        log::info!("UserStore: {} registered accounts loaded", users.len());

        Self {
            dev,
            users: RwLock::new(users),
            store,
        }
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User, AuthError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let email = normalize_email(email);

        if email == self.dev.user.email {
            return match self.dev.verify(password) {
                true => Ok(self.dev.user.clone()),
                false => Err(AuthError::InvalidCredentials),
            };
        }

        let users = self.users.read().await;
        match users.get(&email) {
            Some(stored) if stored.verify(password) => Ok(stored.user.clone()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    pub async fn find_by_id(&self, id: &str) -> Option<User> {
        if self.dev.user.id == id {
            return Some(self.dev.user.clone());
        }
        self.users
            .read()
            .await
            .values()
            .find(|stored| stored.user.id == id)
            .map(|stored| stored.user.clone())
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<User, AuthError> {
        validate_registration(email, password)?;
        let email = normalize_email(email);

        let mut users = self.users.write().await;
        if email == self.dev.user.email || users.contains_key(&email) {
            return Err(AuthError::EmailTaken);
        }

        let stored = StoredUser::new(
            User {
                id: Uuid::new_v4().to_string(),
                email: email.clone(),
                name: name.map(str::trim).filter(|n| !n.is_empty()).map(String::from),
                role: Role::User,
                created_at: Utc::now(),
            },
            password,
        );

        self.store
            .set_as(&format!("{}{}", USER_KEY_PREFIX, email), &stored)
            .await?;

        let user = stored.user.clone();
        users.insert(email, stored);
        log::info!("UserStore: registered {}", user.email);
        Ok(user)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            ttl,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.jwt_secret, Duration::minutes(config.token_ttl_minutes))
    }

    pub fn issue(&self, user: &User) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            role: user.role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                log::debug!("TokenIssuer: rejected token: {}", e);
                AuthError::InvalidToken
            })
    }
}
