use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::auth::{
    error::StoreError,
    repo::AuthStore,
    repo_types::{
        AuditLogEntry, ConfirmationToken, NewAuditEntry, NewToken, NewUser, Redemption, Session,
        TokenEffect, TokenKind, User,
    },
};

#[derive(Default)]
struct Inner {
    users: BTreeMap<i64, User>,
    next_user_id: i64,
    sessions: HashMap<String, Session>,
    tokens: HashMap<String, ConfirmationToken>,
    audit: Vec<AuditLogEntry>,
    #[cfg(test)]
    fail_audit: bool,
}

impl Inner {
    fn email_taken(&self, email: &str, except: Option<i64>) -> bool {
        self.users
            .values()
            .any(|u| u.email == email && Some(u.id) != except)
    }

    #[cfg(test)]
    fn audit_blocked(&self) -> bool {
        self.fail_audit
    }

    #[cfg(not(test))]
    fn audit_blocked(&self) -> bool {
        false
    }

    /// Removes everything the user owns except the token that deleted them.
    fn drop_user_rows(&mut self, user_id: i64, redeemed: &str) {
        self.sessions.retain(|_, s| s.user_id != user_id);
        self.tokens
            .retain(|key, t| t.user_id != user_id || key.as_str() == redeemed);
    }
}

/// Process-local store. One lock covers every table, so each trait call
/// is trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn fail_audit_writes(&self, on: bool) {
        self.inner.lock().fail_audit = on;
    }

    #[cfg(test)]
    pub fn token(&self, token: &str) -> Option<ConfirmationToken> {
        self.inner.lock().tokens.get(token).cloned()
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn create_user(
        &self,
        user: &NewUser<'_>,
        pending: Option<&NewToken>,
    ) -> Result<User, StoreError> {
        let mut inner = self.inner.lock();
        if inner.email_taken(user.email, None) {
            return Err(StoreError::DuplicateEmail);
        }
        inner.next_user_id += 1;
        let now = OffsetDateTime::now_utc();
        let created = User {
            id: inner.next_user_id,
            email: user.email.to_string(),
            password_hash: user.password_hash.to_string(),
            is_active: user.is_active,
            is_staff: user.is_staff,
            activated_at: user.is_active.then_some(now),
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(created.id, created.clone());
        if let Some(pending) = pending {
            let token = pending.for_user(created.id);
            inner.tokens.insert(token.token.clone(), token);
        }
        Ok(created)
    }

    async fn find_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .lock()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.inner.lock().users.values().cloned().collect())
    }

    async fn set_active(&self, id: i64, value: bool) -> Result<Option<User>, StoreError> {
        let mut inner = self.inner.lock();
        let now = OffsetDateTime::now_utc();
        let Some(user) = inner.users.get_mut(&id).map(|u| {
            u.is_active = value;
            if value && u.activated_at.is_none() {
                u.activated_at = Some(now);
            }
            u.updated_at = now;
            u.clone()
        }) else {
            return Ok(None);
        };
        if !value {
            inner.tokens.retain(|_, t| {
                !(t.user_id == id && t.kind == TokenKind::Activation && t.consumed_at.is_none())
            });
        }
        Ok(Some(user))
    }

    async fn set_staff(&self, id: i64, value: bool) -> Result<Option<User>, StoreError> {
        let mut inner = self.inner.lock();
        Ok(inner.users.get_mut(&id).map(|u| {
            u.is_staff = value;
            u.updated_at = OffsetDateTime::now_utc();
            u.clone()
        }))
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.inner
            .lock()
            .sessions
            .insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<(Session, User)>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.sessions.get(token).and_then(|s| {
            inner
                .users
                .get(&s.user_id)
                .map(|u| (s.clone(), u.clone()))
        }))
    }

    async fn delete_session(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().sessions.remove(token).is_some())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self.inner.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn issue_token(&self, token: &ConfirmationToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.tokens.retain(|_, t| {
            !(t.user_id == token.user_id && t.kind == token.kind && t.consumed_at.is_none())
        });
        inner.tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn redeem_token(
        &self,
        token: &str,
        kind: TokenKind,
        now: OffsetDateTime,
        effect: &TokenEffect,
    ) -> Result<Redemption, StoreError> {
        let mut inner = self.inner.lock();
        let found = match inner.tokens.get(token) {
            Some(t) if t.kind == kind => t.clone(),
            _ => return Ok(Redemption::NotFound),
        };
        if found.is_expired(now) {
            return Ok(Redemption::Expired);
        }
        if found.consumed_at.is_some() {
            return Ok(Redemption::AlreadyConsumed);
        }

        // validate before touching anything so a failure leaves the token live
        let Some(owner) = inner.users.get(&found.user_id) else {
            return Ok(Redemption::NotFound);
        };
        if *effect == TokenEffect::Activate && owner.activated_at.is_some() {
            return Err(StoreError::AlreadyActivated);
        }
        if let TokenEffect::ChangeEmail = effect {
            let email = found
                .payload
                .as_deref()
                .ok_or_else(|| StoreError::Corrupt("email change token without payload".into()))?;
            if inner.email_taken(email, Some(found.user_id)) {
                return Err(StoreError::DuplicateEmail);
            }
        }

        if let Some(t) = inner.tokens.get_mut(token) {
            t.consumed_at = Some(now);
        }
        let user_id = found.user_id;
        match effect {
            TokenEffect::DeleteUser => {
                inner.users.remove(&user_id);
                inner.drop_user_rows(user_id, token);
            }
            TokenEffect::SetPasswordHash(hash) => {
                if let Some(u) = inner.users.get_mut(&user_id) {
                    u.password_hash = hash.clone();
                    u.updated_at = now;
                }
                inner.sessions.retain(|_, s| s.user_id != user_id);
            }
            TokenEffect::Activate => {
                if let Some(u) = inner.users.get_mut(&user_id) {
                    u.is_active = true;
                    u.activated_at = Some(now);
                    u.updated_at = now;
                }
            }
            TokenEffect::ChangeEmail => {
                let email = found.payload.clone().unwrap_or_default();
                if let Some(u) = inner.users.get_mut(&user_id) {
                    u.email = email;
                    u.updated_at = now;
                }
            }
        }

        let mut redeemed = found;
        redeemed.consumed_at = Some(now);
        Ok(Redemption::Redeemed(redeemed))
    }

    async fn append_audit(
        &self,
        entry: &NewAuditEntry,
        at: OffsetDateTime,
    ) -> Result<AuditLogEntry, StoreError> {
        let mut inner = self.inner.lock();
        if inner.audit_blocked() {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let row = AuditLogEntry {
            id: inner.audit.len() as i64 + 1,
            category: entry.category.to_string(),
            action: entry.action.to_string(),
            target_id: entry.target_id,
            actor_id: entry.actor_id,
            created_at: at,
        };
        inner.audit.push(row.clone());
        Ok(row)
    }

    async fn list_audit(&self) -> Result<Vec<AuditLogEntry>, StoreError> {
        Ok(self.inner.lock().audit.iter().rev().cloned().collect())
    }

    async fn purge(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.sessions.len() + inner.tokens.len();
        inner.sessions.retain(|_, s| !s.is_expired(now));
        inner
            .tokens
            .retain(|_, t| !t.is_expired(now) && t.consumed_at.is_none());
        Ok((before - inner.sessions.len() - inner.tokens.len()) as u64)
    }
}
