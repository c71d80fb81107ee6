use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 hash, not exposed in JSON
    pub is_active: bool,
    pub is_staff: bool,
    /// Set the first time the account becomes active. Self-service
    /// activation is refused once it is set.
    pub activated_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub password_hash: &'a str,
    pub is_active: bool,
    pub is_staff: bool,
}

/// One authenticated login. Lives until `expires_at` or logout.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    #[serde(skip_serializing)]
    pub token: String,
    pub user_id: i64,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl Session {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Activation,
    EmailChange,
    PasswordReset,
    AccountDeletion,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Activation => "activation",
            TokenKind::EmailChange => "email_change",
            TokenKind::PasswordReset => "password_reset",
            TokenKind::AccountDeletion => "account_deletion",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activation" => Ok(TokenKind::Activation),
            "email_change" => Ok(TokenKind::EmailChange),
            "password_reset" => Ok(TokenKind::PasswordReset),
            "account_deletion" => Ok(TokenKind::AccountDeletion),
            other => Err(format!("unknown token kind: {other}")),
        }
    }
}

/// A pending request/confirm operation.
#[derive(Debug, Clone)]
pub struct ConfirmationToken {
    pub token: String,
    pub kind: TokenKind,
    pub user_id: i64,
    /// New email for `EmailChange`, otherwise empty.
    pub payload: Option<String>,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub consumed_at: Option<OffsetDateTime>,
}

/// A token not yet bound to a user id.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub token: String,
    pub kind: TokenKind,
    pub payload: Option<String>,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl NewToken {
    pub fn for_user(&self, user_id: i64) -> ConfirmationToken {
        ConfirmationToken {
            token: self.token.clone(),
            kind: self.kind,
            user_id,
            payload: self.payload.clone(),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            consumed_at: None,
        }
    }
}

impl ConfirmationToken {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// What confirming a token does to its owner, applied in the same
/// transaction that marks the token consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEffect {
    Activate,
    /// Takes the new address from the token payload.
    ChangeEmail,
    /// Also revokes every session of the user.
    SetPasswordHash(String),
    DeleteUser,
}

/// Outcome of a conditional redemption.
#[derive(Debug, Clone)]
pub enum Redemption {
    Redeemed(ConfirmationToken),
    NotFound,
    Expired,
    AlreadyConsumed,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditLogEntry {
    pub id: i64,
    pub category: String,
    pub action: String,
    pub target_id: i64,
    pub actor_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub category: &'static str,
    pub action: &'static str,
    pub target_id: i64,
    pub actor_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn token_kind_parses_its_own_name() {
        for kind in [
            TokenKind::Activation,
            TokenKind::EmailChange,
            TokenKind::PasswordReset,
            TokenKind::AccountDeletion,
        ] {
            assert_eq!(kind.as_str().parse::<TokenKind>(), Ok(kind));
        }
        assert!("session".parse::<TokenKind>().is_err());
    }

    #[test]
    fn user_json_never_contains_password_hash() {
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: 1,
            email: "a@x.com".into(),
            password_hash: "$argon2id$secret".into(),
            is_active: true,
            is_staff: false,
            activated_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("argon2"));
    }

    #[test]
    fn expiry_boundary_counts_as_expired() {
        let now = OffsetDateTime::now_utc();
        let token = ConfirmationToken {
            token: "t".into(),
            kind: TokenKind::Activation,
            user_id: 1,
            payload: None,
            issued_at: now - Duration::minutes(5),
            expires_at: now,
            consumed_at: None,
        };
        assert!(token.is_expired(now));
        assert!(!token.is_expired(now - Duration::seconds(1)));
    }
}
