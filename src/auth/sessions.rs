use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        audit::AuditLogger,
        error::AuthError,
        password::{verify_against_dummy, verify_password},
        repo::AuthStore,
        repo_types::Session,
        services::{generate_token, normalize_email},
    },
    config::AuthConfig,
};

/// Who a validated session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub email: String,
    pub is_staff: bool,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn AuthStore>,
    audit: AuditLogger,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn AuthStore>, audit: AuditLogger, config: &AuthConfig) -> Self {
        Self {
            store,
            audit,
            ttl: Duration::minutes(config.session_ttl_minutes),
        }
    }

    /// An unknown email, a wrong password and a malformed stored hash all
    /// come back as `InvalidCredentials`. `AccountInactive` is only reported
    /// once the password has matched.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = normalize_email(email);
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            verify_against_dummy(password);
            warn!("login unknown email");
            return Err(AuthError::InvalidCredentials);
        };

        let ok = match verify_password(password, &user.password_hash) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, user_id = user.id, "stored hash unreadable");
                false
            }
        };
        if !ok {
            warn!(user_id = user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            warn!(user_id = user.id, "login on inactive account");
            return Err(AuthError::AccountInactive);
        }

        let now = OffsetDateTime::now_utc();
        let session = Session {
            token: generate_token(),
            user_id: user.id,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.store.insert_session(&session).await?;
        self.audit.record("session", "create", user.id, user.id).await;

        info!(user_id = user.id, "user logged in");
        Ok(session)
    }

    /// Read-only: never extends `expires_at`.
    pub async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let Some((session, user)) = self.store.find_session(token).await? else {
            return Err(AuthError::NoSession);
        };
        if session.is_expired(OffsetDateTime::now_utc()) {
            return Err(AuthError::SessionExpired);
        }
        if !user.is_active {
            return Err(AuthError::NoSession);
        }
        Ok(Identity {
            user_id: user.id,
            email: user.email,
            is_staff: user.is_staff,
        })
    }

    #[instrument(skip_all)]
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let Some((session, _)) = self.store.find_session(token).await? else {
            return Err(AuthError::NoSession);
        };
        // a concurrent logout may have won
        if !self.store.delete_session(token).await? {
            return Err(AuthError::NoSession);
        }
        self.audit
            .record("session", "delete", session.user_id, session.user_id)
            .await;
        info!(user_id = session.user_id, "user logged out");
        Ok(())
    }

    pub async fn list(&self, actor: &Identity) -> Result<Vec<Session>, AuthError> {
        let sessions = self.store.list_sessions().await?;
        self.audit.record("session", "list", 0, actor.user_id).await;
        Ok(sessions)
    }

    /// Hygiene only; expiry is enforced at read time either way.
    pub async fn purge(&self) -> Result<u64, AuthError> {
        Ok(self.store.purge(OffsetDateTime::now_utc()).await?)
    }
}
