//! services/report_sync/src/adapters/password.rs
//!
//! Argon2 password hashing shared by the auth adapters.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use nippou_core::ports::{AuthError, AuthResult};
use tracing::error;

/// Passwords shorter than this are rejected as weak.
pub const MIN_PASSWORD_CHARS: usize = 6;

pub fn check_strength(password: &str) -> AuthResult<()> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(AuthError::WeakPassword);
    }
    Ok(())
}

pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("Failed to hash password: {:?}", e);
            AuthError::Other("failed to hash password".to_string())
        })
}

/// Checks `password` against a stored hash. A mismatch is an invalid credential.
pub fn verify_password(password: &str, stored_hash: &str) -> AuthResult<()> {
    let parsed_hash = PasswordHash::new(stored_hash).map_err(|e| {
        error!("Failed to parse password hash: {:?}", e);
        AuthError::Other("stored password hash is unreadable".to_string())
    })?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| AuthError::InvalidCredential)
}
