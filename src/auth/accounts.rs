use std::sync::Arc;

use tracing::{info, instrument};

use crate::auth::{
    audit::AuditLogger,
    error::AuthError,
    password::hash_password,
    repo::AuthStore,
    repo_types::{NewUser, TokenKind, User},
    services::{check_email, check_password, normalize_email},
    sessions::Identity,
    tokens::TokenIssuer,
};

/// User records: registration plus the staff-only reads and flag toggles.
#[derive(Clone)]
pub struct Accounts {
    store: Arc<dyn AuthStore>,
    audit: AuditLogger,
    tokens: TokenIssuer,
}

fn hash(password: &str) -> Result<String, AuthError> {
    hash_password(password).map_err(|e| AuthError::StoreUnavailable(e.to_string()))
}

fn validate_credentials(email: &str, password: &str) -> Result<(), AuthError> {
    let mut errors = Vec::new();
    check_email("email", email, &mut errors);
    check_password("password", password, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AuthError::Validation(errors))
    }
}

impl Accounts {
    pub fn new(store: Arc<dyn AuthStore>, audit: AuditLogger, tokens: TokenIssuer) -> Self {
        Self {
            store,
            audit,
            tokens,
        }
    }

    /// Creates an inactive user together with its activation token and
    /// returns the token value for delivery.
    #[instrument(skip(self, password))]
    pub async fn signup(&self, email: &str, password: &str) -> Result<(User, String), AuthError> {
        let email = normalize_email(email);
        validate_credentials(&email, password)?;
        let password_hash = hash(password)?;
        let activation = self.tokens.pending(TokenKind::Activation, None);
        let user = self
            .store
            .create_user(
                &NewUser {
                    email: &email,
                    password_hash: &password_hash,
                    is_active: false,
                    is_staff: false,
                },
                Some(&activation),
            )
            .await?;
        self.audit.record("user", "create", user.id, user.id).await;
        info!(user_id = user.id, "user signed up");
        Ok((user, activation.token))
    }

    /// Bootstrap path for the first staff account: active immediately, no
    /// token round-trip.
    #[instrument(skip(self, password))]
    pub async fn create_admin(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email = normalize_email(email);
        validate_credentials(&email, password)?;
        let password_hash = hash(password)?;
        let user = self
            .store
            .create_user(
                &NewUser {
                    email: &email,
                    password_hash: &password_hash,
                    is_active: true,
                    is_staff: true,
                },
                None,
            )
            .await?;
        self.audit
            .record("user", "create_admin", user.id, user.id)
            .await;
        info!(user_id = user.id, "admin created");
        Ok(user)
    }

    pub async fn me(&self, identity: &Identity) -> Result<User, AuthError> {
        self.store
            .find_user(identity.user_id)
            .await?
            .ok_or(AuthError::NoSession)
    }

    pub async fn read(&self, actor: &Identity, id: i64) -> Result<User, AuthError> {
        let user = self.store.find_user(id).await?.ok_or(AuthError::NotFound)?;
        self.audit.record("user", "read", id, actor.user_id).await;
        Ok(user)
    }

    pub async fn list(&self, actor: &Identity) -> Result<Vec<User>, AuthError> {
        let users = self.store.list_users().await?;
        self.audit.record("user", "list", 0, actor.user_id).await;
        Ok(users)
    }

    /// Deactivating takes effect on the user's next request: session
    /// validation re-reads the flag.
    #[instrument(skip(self, actor), fields(actor = actor.user_id))]
    pub async fn set_active(&self, actor: &Identity, id: i64, value: bool) -> Result<User, AuthError> {
        let user = self
            .store
            .set_active(id, value)
            .await?
            .ok_or(AuthError::NotFound)?;
        self.audit.record("user", "is_active", id, actor.user_id).await;
        info!(target_id = id, value, "is_active changed");
        Ok(user)
    }

    #[instrument(skip(self, actor), fields(actor = actor.user_id))]
    pub async fn set_staff(&self, actor: &Identity, id: i64, value: bool) -> Result<User, AuthError> {
        let user = self
            .store
            .set_staff(id, value)
            .await?
            .ok_or(AuthError::NotFound)?;
        self.audit.record("user", "is_staff", id, actor.user_id).await;
        info!(target_id = id, value, "is_staff changed");
        Ok(user)
    }
}
