use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Request},
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;

use super::{dto::Validate, error::AuthError, gates::bearer_token, sessions::Identity};
use crate::state::AppState;

/// Caller admitted by the authenticated pipeline.
pub struct CurrentUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        state.gates.authenticated.admit(parts).await.map(CurrentUser)
    }
}

/// Caller admitted by the staff pipeline.
pub struct AdminUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        state.gates.admin.admit(parts).await.map(AdminUser)
    }
}

/// Raw bearer token, unvalidated. Used where the handler reports session
/// errors itself.
pub struct BearerToken(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        bearer_token(&parts.headers)
            .map(|t| BearerToken(t.to_string()))
            .ok_or(AuthError::NoSession)
    }
}

/// `Json<T>` that answers malformed or incomplete bodies with a 422
/// validation error instead of axum's plain-text rejection.
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| AuthError::field("body", rejection.body_text()))?;
        let mut errors = Vec::new();
        value.validate(&mut errors);
        if errors.is_empty() {
            Ok(ValidJson(value))
        } else {
            Err(AuthError::Validation(errors))
        }
    }
}
