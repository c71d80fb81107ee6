use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Failures raised by the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("account was already activated")]
    AlreadyActivated,

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account inactive")]
    AccountInactive,

    #[error("email already registered")]
    DuplicateEmail,

    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("no session")]
    NoSession,

    #[error("session expired")]
    SessionExpired,

    #[error("token not found")]
    TokenNotFound,

    #[error("token expired")]
    TokenExpired,

    #[error("token already consumed")]
    TokenAlreadyConsumed,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateEmail => AuthError::DuplicateEmail,
            // activation cannot undo a staff deactivation
            StoreError::AlreadyActivated => AuthError::AccountInactive,
            other => AuthError::StoreUnavailable(other.to_string()),
        }
    }
}

impl AuthError {
    pub fn field(field: &'static str, message: impl Into<String>) -> Self {
        AuthError::Validation(vec![FieldError::new(field, message)])
    }

    fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::AccountInactive => "account_inactive",
            AuthError::DuplicateEmail => "duplicate_email",
            AuthError::Validation(_) => "validation_error",
            AuthError::NoSession => "no_session",
            AuthError::SessionExpired => "session_expired",
            AuthError::TokenNotFound => "token_not_found",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenAlreadyConsumed => "token_already_consumed",
            AuthError::Unauthorized => "unauthorized",
            AuthError::Forbidden => "forbidden",
            AuthError::NotFound => "not_found",
            AuthError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredentials
            | AuthError::NoSession
            | AuthError::SessionExpired
            | AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::AccountInactive | AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::TokenNotFound | AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::TokenExpired => StatusCode::GONE,
            AuthError::TokenAlreadyConsumed | AuthError::DuplicateEmail => StatusCode::CONFLICT,
            AuthError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AuthError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Client-facing text. Never carries the underlying cause.
    fn public_message(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "Invalid credentials",
            AuthError::AccountInactive => "Account is not active",
            AuthError::DuplicateEmail => "Email already registered",
            AuthError::Validation(_) => "Request validation failed",
            AuthError::NoSession | AuthError::Unauthorized => "Authentication required",
            AuthError::SessionExpired => "Session expired",
            AuthError::TokenNotFound => "Token not found",
            AuthError::TokenExpired => "Token expired",
            AuthError::TokenAlreadyConsumed => "Token already used",
            AuthError::Forbidden => "Insufficient privileges",
            AuthError::NotFound => "Not found",
            AuthError::StoreUnavailable(_) => "Service temporarily unavailable",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a [FieldError]>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let AuthError::StoreUnavailable(cause) = &self {
            error!(error = %cause, "store unavailable");
        }
        let fields = match &self {
            AuthError::Validation(fields) => Some(fields.as_slice()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.kind(),
            message: self.public_message(),
            fields,
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(err: AuthError) -> (StatusCode, serde_json::Value) {
        let res = err.into_response();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), 1024 * 16)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn store_failure_does_not_leak_cause() {
        let (status, body) =
            body_of(AuthError::StoreUnavailable("password authentication failed for user \"root\"".into()))
                .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let text = body.to_string();
        assert!(!text.contains("root"));
        assert_eq!(body["error"], "store_unavailable");
    }

    #[tokio::test]
    async fn validation_lists_fields() {
        let (status, body) = body_of(AuthError::Validation(vec![
            FieldError::new("email", "invalid email"),
            FieldError::new("password", "too short"),
        ]))
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["fields"][0]["field"], "email");
        assert_eq!(body["fields"][1]["field"], "password");
    }

    #[test]
    fn token_failures_map_to_distinct_statuses() {
        assert_eq!(AuthError::TokenNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AuthError::TokenExpired.status(), StatusCode::GONE);
        assert_eq!(AuthError::TokenAlreadyConsumed.status(), StatusCode::CONFLICT);
        assert_eq!(AuthError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(AuthError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn store_errors_convert_by_kind() {
        assert!(matches!(
            AuthError::from(StoreError::DuplicateEmail),
            AuthError::DuplicateEmail
        ));
        assert!(matches!(
            AuthError::from(StoreError::AlreadyActivated),
            AuthError::AccountInactive
        ));
        assert!(matches!(
            AuthError::from(StoreError::Database(sqlx::Error::PoolTimedOut)),
            AuthError::StoreUnavailable(_)
        ));
    }
}
