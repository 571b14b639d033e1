//! services/report_sync/src/adapters/memory_auth.rs
//!
//! An in-process implementation of the `AuthService` port. Used for local
//! development and as the test double of the real auth provider.

use async_trait::async_trait;
use nippou_core::domain::{Session, SignInMethod, UserId};
use nippou_core::ports::{AuthError, AuthResult, AuthService};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use super::password::{check_strength, hash_password, verify_password};

struct Account {
    user_id: UserId,
    email: String,
    hashed_password: String,
}

#[derive(Default)]
struct Accounts {
    by_email: HashMap<String, Account>,
    custom_tokens: HashMap<String, UserId>,
}

/// Accounts and custom tokens kept in memory.
#[derive(Default)]
pub struct MemoryAuthService {
    accounts: Mutex<Accounts>,
    fail_anonymous: AtomicBool,
}

impl MemoryAuthService {
    pub fn new() -> Self {
        Self::default()
    }

    fn accounts(&self) -> MutexGuard<'_, Accounts> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a token that `sign_in_with_custom_token` accepts for `user_id`.
    pub fn issue_custom_token(&self, user_id: &UserId) -> String {
        let token = Uuid::new_v4().to_string();
        self.accounts()
            .custom_tokens
            .insert(token.clone(), user_id.clone());
        token
    }

    /// Makes anonymous sign-in fail, e.g. when the provider has it disabled.
    pub fn set_fail_anonymous(&self, fail: bool) {
        self.fail_anonymous.store(fail, Ordering::SeqCst);
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl AuthService for MemoryAuthService {
    async fn sign_in_anonymously(&self) -> AuthResult<Session> {
        if self.fail_anonymous.load(Ordering::SeqCst) {
            return Err(AuthError::Other("anonymous sign-in is disabled".to_string()));
        }
        let user_id = UserId::new(Uuid::new_v4().simple().to_string());
        debug!("Anonymous session created for {}", user_id);
        Ok(Session {
            user_id,
            email: None,
            method: SignInMethod::Anonymous,
        })
    }

    async fn sign_in_with_custom_token(&self, token: &str) -> AuthResult<Session> {
        let user_id = self
            .accounts()
            .custom_tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidCredential)?;
        Ok(Session {
            user_id,
            email: None,
            method: SignInMethod::CustomToken,
        })
    }

    async fn create_user_with_email(&self, email: &str, password: &str) -> AuthResult<Session> {
        check_strength(password)?;
        let key = normalize_email(email);
        if self.accounts().by_email.contains_key(&key) {
            return Err(AuthError::EmailAlreadyInUse);
        }
        let hashed_password = hash_password(password)?;

        let mut accounts = self.accounts();
        // Re-check: another registration may have won while hashing.
        if accounts.by_email.contains_key(&key) {
            return Err(AuthError::EmailAlreadyInUse);
        }
        let account = Account {
            user_id: UserId::new(Uuid::new_v4().simple().to_string()),
            email: key.clone(),
            hashed_password,
        };
        let session = Session {
            user_id: account.user_id.clone(),
            email: Some(account.email.clone()),
            method: SignInMethod::EmailPassword,
        };
        accounts.by_email.insert(key, account);
        info!("Registered user {}", session.user_id);
        Ok(session)
    }

    async fn sign_in_with_email(&self, email: &str, password: &str) -> AuthResult<Session> {
        let (user_id, email, hashed_password) = {
            let accounts = self.accounts();
            let account = accounts
                .by_email
                .get(&normalize_email(email))
                .ok_or(AuthError::InvalidCredential)?;
            (
                account.user_id.clone(),
                account.email.clone(),
                account.hashed_password.clone(),
            )
        };
        verify_password(password, &hashed_password)?;
        Ok(Session {
            user_id,
            email: Some(email),
            method: SignInMethod::EmailPassword,
        })
    }

    async fn sign_out(&self, session: &Session) -> AuthResult<()> {
        debug!("Signed out {}", session.user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_login() {
        let auth = MemoryAuthService::new();
        let registered = auth.create_user_with_email("a@x.com", "secret1").await.unwrap();
        let logged_in = auth.sign_in_with_email("A@x.com ", "secret1").await.unwrap();
        assert_eq!(registered.user_id, logged_in.user_id);
        assert_eq!(logged_in.method, SignInMethod::EmailPassword);
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let auth = MemoryAuthService::new();
        auth.create_user_with_email("a@x.com", "secret1").await.unwrap();

        assert_eq!(
            auth.create_user_with_email("a@x.com", "secret1").await,
            Err(AuthError::EmailAlreadyInUse)
        );
        assert_eq!(
            auth.create_user_with_email("b@x.com", "123").await,
            Err(AuthError::WeakPassword)
        );
        assert_eq!(
            auth.sign_in_with_email("a@x.com", "wrong-password").await,
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(
            auth.sign_in_with_email("nobody@x.com", "secret1").await,
            Err(AuthError::InvalidCredential)
        );
    }

    #[tokio::test]
    async fn custom_tokens_resolve_to_their_user() {
        let auth = MemoryAuthService::new();
        let user = UserId::new("u-1");
        let token = auth.issue_custom_token(&user);
        let session = auth.sign_in_with_custom_token(&token).await.unwrap();
        assert_eq!(session.user_id, user);
        assert_eq!(
            auth.sign_in_with_custom_token("bogus").await,
            Err(AuthError::InvalidCredential)
        );
    }
}
