use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        audit::AuditLogger,
        error::{AuthError, FieldError},
        password::{hash_password, verify_password},
        repo::AuthStore,
        repo_types::{ConfirmationToken, NewToken, Redemption, TokenEffect, TokenKind, User},
        services::{check_email, check_password, generate_token, normalize_email},
    },
    config::AuthConfig,
};

/// Issues and redeems single-use confirmation tokens.
///
/// Every flow is a request/confirm pair. Requesting a token of some kind
/// supersedes the user's earlier unconsumed token of that kind. Confirming
/// marks the token consumed and applies its effect as one store unit, so a
/// token yields at most one effect and a failed effect leaves it redeemable.
#[derive(Clone)]
pub struct TokenIssuer {
    store: Arc<dyn AuthStore>,
    audit: AuditLogger,
    config: AuthConfig,
}

impl TokenIssuer {
    pub fn new(store: Arc<dyn AuthStore>, audit: AuditLogger, config: &AuthConfig) -> Self {
        Self {
            store,
            audit,
            config: config.clone(),
        }
    }

    fn ttl(&self, kind: TokenKind) -> Duration {
        Duration::minutes(match kind {
            TokenKind::Activation => self.config.activation_ttl_minutes,
            TokenKind::EmailChange => self.config.email_change_ttl_minutes,
            TokenKind::PasswordReset => self.config.password_reset_ttl_minutes,
            TokenKind::AccountDeletion => self.config.account_deletion_ttl_minutes,
        })
    }

    /// A fresh token of `kind`, not yet stored.
    pub fn pending(&self, kind: TokenKind, payload: Option<String>) -> NewToken {
        let now = OffsetDateTime::now_utc();
        NewToken {
            token: generate_token(),
            kind,
            payload,
            issued_at: now,
            expires_at: now + self.ttl(kind),
        }
    }

    /// Stores a new token for `user_id`, superseding the previous one of the
    /// same kind, and returns its value for out-of-band delivery.
    #[instrument(skip(self, payload))]
    pub async fn request(
        &self,
        user_id: i64,
        kind: TokenKind,
        payload: Option<String>,
    ) -> Result<String, AuthError> {
        let token = self.pending(kind, payload).for_user(user_id);
        self.store.issue_token(&token).await?;
        self.audit
            .record("token", request_action(kind), user_id, user_id)
            .await;
        info!(user_id, %kind, "token issued");
        Ok(token.token)
    }

    async fn confirm(
        &self,
        token: &str,
        kind: TokenKind,
        effect: TokenEffect,
    ) -> Result<ConfirmationToken, AuthError> {
        let outcome = self
            .store
            .redeem_token(token, kind, OffsetDateTime::now_utc(), &effect)
            .await?;
        match outcome {
            Redemption::Redeemed(t) => Ok(t),
            Redemption::NotFound => Err(AuthError::TokenNotFound),
            Redemption::Expired => Err(AuthError::TokenExpired),
            Redemption::AlreadyConsumed => {
                warn!(%kind, "token replayed");
                Err(AuthError::TokenAlreadyConsumed)
            }
        }
    }

    async fn existing_user(&self, user_id: i64) -> Result<User, AuthError> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or(AuthError::NotFound)
    }

    /// Re-sends activation for an account that was never activated. An
    /// account deactivated by staff gets nothing.
    pub async fn request_activation(&self, email: &str) -> Result<Option<(User, String)>, AuthError> {
        let email = normalize_email(email);
        match self.store.find_user_by_email(&email).await? {
            Some(user) if !user.is_active && user.activated_at.is_none() => {
                let token = self.request(user.id, TokenKind::Activation, None).await?;
                Ok(Some((user, token)))
            }
            _ => Ok(None),
        }
    }

    #[instrument(skip_all)]
    pub async fn confirm_activation(&self, token: &str) -> Result<i64, AuthError> {
        let t = self.confirm(token, TokenKind::Activation, TokenEffect::Activate).await?;
        self.audit.record("user", "activate", t.user_id, t.user_id).await;
        info!(user_id = t.user_id, "account activated");
        Ok(t.user_id)
    }

    /// The token goes to the new address; the change lands on confirm.
    pub async fn request_email_change(
        &self,
        user_id: i64,
        new_email: &str,
    ) -> Result<String, AuthError> {
        let new_email = normalize_email(new_email);
        let mut errors = Vec::new();
        check_email("new_email", &new_email, &mut errors);
        if !errors.is_empty() {
            return Err(AuthError::Validation(errors));
        }
        let user = self.existing_user(user_id).await?;
        if user.email == new_email {
            return Err(AuthError::field("new_email", "is the current address"));
        }
        if self.store.find_user_by_email(&new_email).await?.is_some() {
            return Err(AuthError::DuplicateEmail);
        }
        self.request(user_id, TokenKind::EmailChange, Some(new_email))
            .await
    }

    /// Fails with `DuplicateEmail` if the address was taken after the
    /// request; the token stays unconsumed in that case.
    #[instrument(skip_all)]
    pub async fn confirm_email_change(&self, token: &str) -> Result<i64, AuthError> {
        let t = self
            .confirm(token, TokenKind::EmailChange, TokenEffect::ChangeEmail)
            .await?;
        self.audit
            .record("user", "change_email", t.user_id, t.user_id)
            .await;
        info!(user_id = t.user_id, "email changed");
        Ok(t.user_id)
    }

    /// Authenticated variant of the password flow: proves knowledge of the
    /// current password before a token is issued.
    #[instrument(skip(self, current_password))]
    pub async fn request_password_change(
        &self,
        user_id: i64,
        current_password: &str,
    ) -> Result<String, AuthError> {
        let user = self.existing_user(user_id).await?;
        if !verify_password(current_password, &user.password_hash).unwrap_or(false) {
            return Err(AuthError::InvalidCredentials);
        }
        self.request(user_id, TokenKind::PasswordReset, None).await
    }

    /// Unauthenticated. `None` for unknown addresses; callers must answer
    /// the same way in both cases.
    #[instrument(skip_all)]
    pub async fn request_password_reset(
        &self,
        email: &str,
    ) -> Result<Option<(User, String)>, AuthError> {
        let email = normalize_email(email);
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            return Ok(None);
        };
        let token = self.request(user.id, TokenKind::PasswordReset, None).await?;
        Ok(Some((user, token)))
    }

    /// Sets the new password and signs the user out everywhere.
    #[instrument(skip_all)]
    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<i64, AuthError> {
        let mut errors: Vec<FieldError> = Vec::new();
        check_password("new_password", new_password, &mut errors);
        if !errors.is_empty() {
            return Err(AuthError::Validation(errors));
        }
        let hash = hash_password(new_password)
            .map_err(|e| AuthError::StoreUnavailable(e.to_string()))?;
        let t = self
            .confirm(token, TokenKind::PasswordReset, TokenEffect::SetPasswordHash(hash))
            .await?;
        self.audit
            .record("user", "change_password", t.user_id, t.user_id)
            .await;
        info!(user_id = t.user_id, "password changed");
        Ok(t.user_id)
    }

    pub async fn request_account_deletion(&self, user_id: i64) -> Result<String, AuthError> {
        self.existing_user(user_id).await?;
        self.request(user_id, TokenKind::AccountDeletion, None).await
    }

    /// Deletes the user with its sessions and tokens. Audit history stays.
    #[instrument(skip_all)]
    pub async fn confirm_account_deletion(&self, token: &str) -> Result<i64, AuthError> {
        let t = self
            .confirm(token, TokenKind::AccountDeletion, TokenEffect::DeleteUser)
            .await?;
        self.audit.record("user", "delete", t.user_id, t.user_id).await;
        info!(user_id = t.user_id, "account deleted");
        Ok(t.user_id)
    }
}

fn request_action(kind: TokenKind) -> &'static str {
    match kind {
        TokenKind::Activation => "request_activation",
        TokenKind::EmailChange => "request_email_change",
        TokenKind::PasswordReset => "request_password_reset",
        TokenKind::AccountDeletion => "request_account_deletion",
    }
}
