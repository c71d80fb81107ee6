use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::auth::{
    error::FieldError,
    repo_types::{Session, User},
};

/// Shape checks run by `ValidJson` before a handler sees the body.
/// Semantic checks (email format, password length) live in the services.
pub trait Validate {
    fn validate(&self, errors: &mut Vec<FieldError>);
}

fn required(field: &'static str, value: &str, errors: &mut Vec<FieldError>) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "is required"));
    }
}

/// Request body for signup.
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

impl Validate for SignupRequest {
    fn validate(&self, errors: &mut Vec<FieldError>) {
        required("email", &self.email, errors);
        required("password", &self.password, errors);
    }
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl Validate for LoginRequest {
    fn validate(&self, errors: &mut Vec<FieldError>) {
        required("email", &self.email, errors);
        required("password", &self.password, errors);
    }
}

/// Any confirm step that carries nothing but the token.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

impl Validate for TokenRequest {
    fn validate(&self, errors: &mut Vec<FieldError>) {
        required("token", &self.token, errors);
    }
}

/// Unauthenticated requests keyed by address (reset, resend activation).
#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

impl Validate for EmailRequest {
    fn validate(&self, errors: &mut Vec<FieldError>) {
        required("email", &self.email, errors);
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangeEmailRequest {
    pub new_email: String,
}

impl Validate for ChangeEmailRequest {
    fn validate(&self, errors: &mut Vec<FieldError>) {
        required("new_email", &self.new_email, errors);
    }
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangeRequest {
    pub current_password: String,
}

impl Validate for PasswordChangeRequest {
    fn validate(&self, errors: &mut Vec<FieldError>) {
        required("current_password", &self.current_password, errors);
    }
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetConfirm {
    pub token: String,
    pub new_password: String,
}

impl Validate for PasswordResetConfirm {
    fn validate(&self, errors: &mut Vec<FieldError>) {
        required("token", &self.token, errors);
        required("new_password", &self.new_password, errors);
    }
}

/// Body of the admin flag toggles.
#[derive(Debug, Deserialize)]
pub struct SetFlagRequest {
    pub value: bool,
}

impl Validate for SetFlagRequest {
    fn validate(&self, _: &mut Vec<FieldError>) {}
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: i64,
    pub email: String,
    pub is_active: bool,
    pub is_staff: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            is_active: u.is_active,
            is_staff: u.is_staff,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

/// Session listing for staff. The token itself is never listed.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub user_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl From<Session> for SessionView {
    fn from(s: Session) -> Self {
        Self {
            user_id: s.user_id,
            created_at: s.created_at,
            expires_at: s.expires_at,
        }
    }
}

/// Response returned after login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: PublicUser,
}

/// Response returned after signup. The activation token goes out by mail,
/// not in the body.
#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub user: PublicUser,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

impl MessageResponse {
    pub fn new(message: &'static str) -> Self {
        Self { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_fields_are_reported_together() {
        let req = PasswordResetConfirm {
            token: " ".into(),
            new_password: String::new(),
        };
        let mut errors = Vec::new();
        req.validate(&mut errors);
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["token", "new_password"]);
    }

    #[test]
    fn public_user_has_no_hash() {
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
        let json = serde_json::to_string(&PublicUser::from(user)).unwrap();
        assert!(json.contains("a@x.com"));
        assert!(!json.contains("argon2"));
        assert!(!json.contains("password"));
    }
}
