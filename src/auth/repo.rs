use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use crate::auth::{
    error::StoreError,
    repo_types::{
        AuditLogEntry, ConfirmationToken, NewAuditEntry, NewToken, NewUser, Redemption, Session,
        TokenEffect, TokenKind, User,
    },
};

/// Persistence used by the auth services. Every call is a complete unit:
/// implementations must make `issue_token` and `redeem_token` atomic.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Inserts the user and, when given, its first token in one unit.
    async fn create_user(
        &self,
        user: &NewUser<'_>,
        pending: Option<&NewToken>,
    ) -> Result<User, StoreError>;
    async fn find_user(&self, id: i64) -> Result<Option<User>, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    /// Deactivating also drops the user's pending activation tokens.
    async fn set_active(&self, id: i64, value: bool) -> Result<Option<User>, StoreError>;
    async fn set_staff(&self, id: i64, value: bool) -> Result<Option<User>, StoreError>;

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;
    /// Session together with its owner, as of this read.
    async fn find_session(&self, token: &str) -> Result<Option<(Session, User)>, StoreError>;
    async fn delete_session(&self, token: &str) -> Result<bool, StoreError>;
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    /// Drops any unconsumed token of the same kind for the same user, then
    /// stores `token`.
    async fn issue_token(&self, token: &ConfirmationToken) -> Result<(), StoreError>;
    /// Marks the token consumed only if it is unconsumed and unexpired, and
    /// applies `effect` in the same transaction. A failing effect leaves the
    /// token unconsumed. A consumed token stays readable after its owner is
    /// deleted, so a replay reports `AlreadyConsumed`.
    async fn redeem_token(
        &self,
        token: &str,
        kind: TokenKind,
        now: OffsetDateTime,
        effect: &TokenEffect,
    ) -> Result<Redemption, StoreError>;

    async fn append_audit(
        &self,
        entry: &NewAuditEntry,
        at: OffsetDateTime,
    ) -> Result<AuditLogEntry, StoreError>;
    async fn list_audit(&self) -> Result<Vec<AuditLogEntry>, StoreError>;

    /// Deletes expired sessions and spent tokens. Returns rows removed.
    async fn purge(&self, now: OffsetDateTime) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

#[derive(FromRow)]
struct TokenRow {
    token: String,
    kind: String,
    user_id: Option<i64>,
    payload: Option<String>,
    issued_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    consumed_at: Option<OffsetDateTime>,
}

impl TryFrom<TokenRow> for ConfirmationToken {
    type Error = StoreError;

    fn try_from(r: TokenRow) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: r.kind.parse().map_err(StoreError::Corrupt)?,
            user_id: r
                .user_id
                .ok_or_else(|| StoreError::Corrupt(format!("token {} has no owner", r.token)))?,
            token: r.token,
            payload: r.payload,
            issued_at: r.issued_at,
            expires_at: r.expires_at,
            consumed_at: r.consumed_at,
        })
    }
}

const USER_COLUMNS: &str =
    "id, email, password_hash, is_active, is_staff, activated_at, created_at, updated_at";
const TOKEN_COLUMNS: &str =
    "token, kind, user_id, payload, issued_at, expires_at, consumed_at";

fn map_unique(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateEmail,
        _ => StoreError::Database(err),
    }
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connect to database")?;
        Ok(Self { db })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db)
            .await
            .context("run migrations")?;
        Ok(())
    }

    async fn toggle_active(&self, id: i64, value: bool) -> Result<Option<User>, StoreError> {
        let mut tx = self.db.begin().await?;
        let sql = format!(
            r#"
            UPDATE users
            SET is_active = $2,
                activated_at = CASE WHEN $2 THEN COALESCE(activated_at, now()) ELSE activated_at END,
                updated_at = now()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(value)
            .fetch_optional(&mut *tx)
            .await?;
        if user.is_some() && !value {
            sqlx::query(
                r#"
                DELETE FROM confirmation_tokens
                WHERE user_id = $1 AND kind = $2 AND consumed_at IS NULL
                "#,
            )
            .bind(id)
            .bind(TokenKind::Activation.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(user)
    }

    async fn insert_token(
        tx: &mut Transaction<'_, Postgres>,
        token: &ConfirmationToken,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO confirmation_tokens (token, kind, user_id, payload, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&token.token)
        .bind(token.kind.as_str())
        .bind(token.user_id)
        .bind(&token.payload)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn apply_effect(
        tx: &mut Transaction<'_, Postgres>,
        token: &ConfirmationToken,
        now: OffsetDateTime,
        effect: &TokenEffect,
    ) -> Result<(), StoreError> {
        match effect {
            TokenEffect::Activate => {
                let res = sqlx::query(
                    r#"
                    UPDATE users SET is_active = TRUE, activated_at = $2, updated_at = $2
                    WHERE id = $1 AND activated_at IS NULL
                    "#,
                )
                .bind(token.user_id)
                .bind(now)
                .execute(&mut **tx)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(StoreError::AlreadyActivated);
                }
            }
            TokenEffect::ChangeEmail => {
                let email = token
                    .payload
                    .as_deref()
                    .ok_or_else(|| StoreError::Corrupt("email change token without payload".into()))?;
                sqlx::query("UPDATE users SET email = $2, updated_at = $3 WHERE id = $1")
                    .bind(token.user_id)
                    .bind(email)
                    .bind(now)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_unique)?;
            }
            TokenEffect::SetPasswordHash(hash) => {
                sqlx::query("UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1")
                    .bind(token.user_id)
                    .bind(hash)
                    .bind(now)
                    .execute(&mut **tx)
                    .await?;
                sqlx::query("DELETE FROM sessions WHERE user_id = $1")
                    .bind(token.user_id)
                    .execute(&mut **tx)
                    .await?;
            }
            TokenEffect::DeleteUser => {
                sqlx::query("DELETE FROM confirmation_tokens WHERE user_id = $1 AND token <> $2")
                    .bind(token.user_id)
                    .bind(&token.token)
                    .execute(&mut **tx)
                    .await?;
                // sessions cascade, the redeemed token keeps a NULL owner
                sqlx::query("DELETE FROM users WHERE id = $1")
                    .bind(token.user_id)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AuthStore for PgStore {
    async fn create_user(
        &self,
        user: &NewUser<'_>,
        pending: Option<&NewToken>,
    ) -> Result<User, StoreError> {
        let mut tx = self.db.begin().await?;
        let sql = format!(
            r#"
            INSERT INTO users (email, password_hash, is_active, is_staff, activated_at)
            VALUES ($1, $2, $3, $4, CASE WHEN $3 THEN now() END)
            RETURNING {USER_COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, User>(&sql)
            .bind(user.email)
            .bind(user.password_hash)
            .bind(user.is_active)
            .bind(user.is_staff)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_unique)?;
        if let Some(pending) = pending {
            Self::insert_token(&mut tx, &pending.for_user(created.id)).await?;
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn find_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY id");
        Ok(sqlx::query_as::<_, User>(&sql).fetch_all(&self.db).await?)
    }

    async fn set_active(&self, id: i64, value: bool) -> Result<Option<User>, StoreError> {
        self.toggle_active(id, value).await
    }

    async fn set_staff(&self, id: i64, value: bool) -> Result<Option<User>, StoreError> {
        let sql = format!(
            "UPDATE users SET is_staff = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(value)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (token, user_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&session.token)
        .bind(session.user_id)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<(Session, User)>, StoreError> {
        let session = sqlx::query_as::<_, Session>(
            r#"SELECT token, user_id, created_at, expires_at FROM sessions WHERE token = $1"#,
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        let Some(session) = session else {
            return Ok(None);
        };
        Ok(self
            .find_user(session.user_id)
            .await?
            .map(|user| (session, user)))
    }

    async fn delete_session(&self, token: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(sqlx::query_as::<_, Session>(
            r#"SELECT token, user_id, created_at, expires_at FROM sessions ORDER BY created_at DESC"#,
        )
        .fetch_all(&self.db)
        .await?)
    }

    async fn issue_token(&self, token: &ConfirmationToken) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM confirmation_tokens
            WHERE user_id = $1 AND kind = $2 AND consumed_at IS NULL
            "#,
        )
        .bind(token.user_id)
        .bind(token.kind.as_str())
        .execute(&mut *tx)
        .await?;
        Self::insert_token(&mut tx, token).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn redeem_token(
        &self,
        token: &str,
        kind: TokenKind,
        now: OffsetDateTime,
        effect: &TokenEffect,
    ) -> Result<Redemption, StoreError> {
        let mut tx = self.db.begin().await?;

        // A concurrent redeemer blocks on the row lock here and then sees
        // consumed_at set, so it matches nothing.
        let sql = format!(
            r#"
            UPDATE confirmation_tokens SET consumed_at = $3
            WHERE token = $1 AND kind = $2 AND consumed_at IS NULL AND expires_at > $3
              AND user_id IS NOT NULL
            RETURNING {TOKEN_COLUMNS}
            "#
        );
        let claimed = sqlx::query_as::<_, TokenRow>(&sql)
            .bind(token)
            .bind(kind.as_str())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = claimed else {
            let sql = format!(
                "SELECT {TOKEN_COLUMNS} FROM confirmation_tokens WHERE token = $1 AND kind = $2"
            );
            let existing = sqlx::query_as::<_, TokenRow>(&sql)
                .bind(token)
                .bind(kind.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Ok(match existing {
                None => Redemption::NotFound,
                Some(r) if r.expires_at <= now => Redemption::Expired,
                Some(_) => Redemption::AlreadyConsumed,
            });
        };

        let redeemed = ConfirmationToken::try_from(row)?;
        // dropping tx on error rolls the consume back
        Self::apply_effect(&mut tx, &redeemed, now, effect).await?;
        tx.commit().await?;
        Ok(Redemption::Redeemed(redeemed))
    }

    async fn append_audit(
        &self,
        entry: &NewAuditEntry,
        at: OffsetDateTime,
    ) -> Result<AuditLogEntry, StoreError> {
        Ok(sqlx::query_as::<_, AuditLogEntry>(
            r#"
            INSERT INTO audit_log (category, action, target_id, actor_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, category, action, target_id, actor_id, created_at
            "#,
        )
        .bind(entry.category)
        .bind(entry.action)
        .bind(entry.target_id)
        .bind(entry.actor_id)
        .bind(at)
        .fetch_one(&self.db)
        .await?)
    }

    async fn list_audit(&self) -> Result<Vec<AuditLogEntry>, StoreError> {
        Ok(sqlx::query_as::<_, AuditLogEntry>(
            r#"
            SELECT id, category, action, target_id, actor_id, created_at
            FROM audit_log
            ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.db)
        .await?)
    }

    async fn purge(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.db)
            .await?
            .rows_affected();
        let tokens = sqlx::query(
            "DELETE FROM confirmation_tokens WHERE expires_at <= $1 OR consumed_at IS NOT NULL",
        )
        .bind(now)
        .execute(&self.db)
        .await?
        .rows_affected();
        Ok(sessions + tokens)
    }
}
