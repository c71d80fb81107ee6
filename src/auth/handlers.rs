use axum::{
    extract::{rejection::PathRejection, Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use tracing::{error, info, instrument};

use crate::{
    auth::{
        dto::{
            ChangeEmailRequest, EmailRequest, LoginRequest, LoginResponse, MessageResponse,
            PasswordChangeRequest, PasswordResetConfirm, PublicUser, SessionView, SetFlagRequest,
            SignupRequest, SignupResponse, TokenRequest,
        },
        error::AuthError,
        extractors::{AdminUser, BearerToken, CurrentUser, ValidJson},
        repo_types::{AuditLogEntry, TokenKind},
        services::normalize_email,
    },
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/auth/activate", post(activate))
        .route("/auth/activate/resend", post(resend_activation))
        .route("/auth/email/change-request", post(email_change_request))
        .route("/auth/email/change", post(email_change))
        .route("/auth/password/change-request", post(password_change_request))
        .route("/auth/password/change", post(password_reset))
        .route("/auth/password/reset-request", post(password_reset_request))
        .route("/auth/password/reset", post(password_reset))
        .route("/auth/account/delete-request", post(account_delete_request))
        .route("/auth/account/delete", post(account_delete))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id", get(get_user))
        .route("/admin/users/:id/active", put(set_active))
        .route("/admin/users/:id/staff", put(set_staff))
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/logs", get(list_logs))
}

/// Delivery failures are logged only; the token stays valid and the user can
/// request a new one.
async fn send_token(state: &AppState, to: &str, kind: TokenKind, token: &str) {
    if let Err(e) = state.mailer.deliver(to, kind, token).await {
        error!(error = %e, to, %kind, "token delivery failed");
    }
}

fn path_id(path: Result<Path<i64>, PathRejection>) -> Result<i64, AuthError> {
    path.map(|Path(id)| id)
        .map_err(|rejection| AuthError::field("id", rejection.body_text()))
}

// --- public ---

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<SignupRequest>,
) -> Result<(StatusCode, Json<SignupResponse>), AuthError> {
    let (user, token) = state.accounts.signup(&payload.email, &payload.password).await?;
    send_token(&state, &user.email, TokenKind::Activation, &token).await;
    Ok((
        StatusCode::OK,
        Json(SignupResponse {
            user: user.into(),
            message: "Check your inbox to activate the account",
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthError> {
    let session = state.sessions.login(&payload.email, &payload.password).await?;
    let identity = state.sessions.validate(&session.token).await?;
    let user = state.accounts.me(&identity).await?;
    Ok(Json(LoginResponse {
        token: session.token,
        expires_at: session.expires_at,
        user: user.into(),
    }))
}

/// Ends the session named by the bearer token. Not gated: a stale or
/// unknown token is reported as `NoSession` rather than `Unauthorized`.
#[instrument(skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<MessageResponse>, AuthError> {
    state.sessions.logout(&token).await?;
    Ok(Json(MessageResponse::new("Logged out")))
}

pub async fn me(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> Result<Json<PublicUser>, AuthError> {
    Ok(Json(state.accounts.me(&identity).await?.into()))
}

#[instrument(skip_all)]
pub async fn activate(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<TokenRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.tokens.confirm_activation(&payload.token).await?;
    Ok(Json(MessageResponse::new("Account activated")))
}

#[instrument(skip_all)]
pub async fn resend_activation(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<EmailRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    if let Some((user, token)) = state.tokens.request_activation(&payload.email).await? {
        send_token(&state, &user.email, TokenKind::Activation, &token).await;
    }
    Ok(Json(MessageResponse::new(
        "If the account exists and is not active, an activation link was sent",
    )))
}

#[instrument(skip_all)]
pub async fn password_reset_request(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<EmailRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    if let Some((user, token)) = state.tokens.request_password_reset(&payload.email).await? {
        send_token(&state, &user.email, TokenKind::PasswordReset, &token).await;
    }
    Ok(Json(MessageResponse::new(
        "If the account exists, a reset link was sent",
    )))
}

/// Confirms both the unauthenticated reset and the authenticated change.
#[instrument(skip_all)]
pub async fn password_reset(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<PasswordResetConfirm>,
) -> Result<Json<MessageResponse>, AuthError> {
    state
        .tokens
        .confirm_password_reset(&payload.token, &payload.new_password)
        .await?;
    Ok(Json(MessageResponse::new("Password changed")))
}

#[instrument(skip_all)]
pub async fn email_change(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<TokenRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.tokens.confirm_email_change(&payload.token).await?;
    Ok(Json(MessageResponse::new("Email changed")))
}

#[instrument(skip_all)]
pub async fn account_delete(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<TokenRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.tokens.confirm_account_deletion(&payload.token).await?;
    Ok(Json(MessageResponse::new("Account deleted")))
}

// --- authenticated ---

#[instrument(skip_all, fields(user_id = identity.user_id))]
pub async fn email_change_request(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    ValidJson(payload): ValidJson<ChangeEmailRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    let token = state
        .tokens
        .request_email_change(identity.user_id, &payload.new_email)
        .await?;
    let to = normalize_email(&payload.new_email);
    send_token(&state, &to, TokenKind::EmailChange, &token).await;
    Ok(Json(MessageResponse::new(
        "A confirmation link was sent to the new address",
    )))
}

#[instrument(skip_all, fields(user_id = identity.user_id))]
pub async fn password_change_request(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    ValidJson(payload): ValidJson<PasswordChangeRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    let token = state
        .tokens
        .request_password_change(identity.user_id, &payload.current_password)
        .await?;
    send_token(&state, &identity.email, TokenKind::PasswordReset, &token).await;
    Ok(Json(MessageResponse::new("A confirmation link was sent")))
}

#[instrument(skip_all, fields(user_id = identity.user_id))]
pub async fn account_delete_request(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> Result<Json<MessageResponse>, AuthError> {
    let token = state
        .tokens
        .request_account_deletion(identity.user_id)
        .await?;
    send_token(&state, &identity.email, TokenKind::AccountDeletion, &token).await;
    Ok(Json(MessageResponse::new("A confirmation link was sent")))
}

// --- staff ---

pub async fn list_users(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
) -> Result<Json<Vec<PublicUser>>, AuthError> {
    let users = state.accounts.list(&actor).await?;
    Ok(Json(users.into_iter().map(PublicUser::from).collect()))
}

pub async fn get_user(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<PublicUser>, AuthError> {
    let id = path_id(path)?;
    Ok(Json(state.accounts.read(&actor, id).await?.into()))
}

#[instrument(skip_all, fields(actor = actor.user_id))]
pub async fn set_active(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
    path: Result<Path<i64>, PathRejection>,
    ValidJson(payload): ValidJson<SetFlagRequest>,
) -> Result<Json<PublicUser>, AuthError> {
    let id = path_id(path)?;
    let user = state.accounts.set_active(&actor, id, payload.value).await?;
    Ok(Json(user.into()))
}

#[instrument(skip_all, fields(actor = actor.user_id))]
pub async fn set_staff(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
    path: Result<Path<i64>, PathRejection>,
    ValidJson(payload): ValidJson<SetFlagRequest>,
) -> Result<Json<PublicUser>, AuthError> {
    let id = path_id(path)?;
    let user = state.accounts.set_staff(&actor, id, payload.value).await?;
    Ok(Json(user.into()))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
) -> Result<Json<Vec<SessionView>>, AuthError> {
    let sessions = state.sessions.list(&actor).await?;
    Ok(Json(sessions.into_iter().map(SessionView::from).collect()))
}

/// Newest first. The read is itself recorded after the listing is taken.
pub async fn list_logs(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
) -> Result<Json<Vec<AuditLogEntry>>, AuthError> {
    let entries = state.audit.list().await?;
    state.audit.record("log", "list", 0, actor.user_id).await;
    info!(actor = actor.user_id, count = entries.len(), "audit log read");
    Ok(Json(entries))
}
