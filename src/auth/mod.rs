use crate::state::AppState;
use axum::Router;

pub mod accounts;
pub mod audit;
pub mod dto;
pub mod error;
pub(crate) mod extractors;
pub mod gates;
pub mod handlers;
pub mod mailer;
pub mod password;
pub mod repo;
pub mod repo_memory;
pub mod repo_types;
pub mod services;
pub mod sessions;
pub mod tokens;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::admin_routes())
}
