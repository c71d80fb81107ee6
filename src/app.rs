use std::{net::SocketAddr, time::Duration};

use axum::{routing::get, Router};
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::auth;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .merge(auth::router())
                .route("/health", get(|| async { "ok" })),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!(
                        "http_request",
                        %method,
                        uri = %uri,
                        status = tracing::field::Empty
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, _latency: Duration, span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        if status.is_server_error() {
                            tracing::error!(%status, "response");
                        } else {
                            tracing::info!(%status, "response");
                        }
                    },
                ),
        )
}

/// Periodically drops expired sessions and tokens. `None` when the interval
/// is configured as 0.
pub fn spawn_purge(state: &AppState) -> Option<JoinHandle<()>> {
    let minutes = state.config.auth.purge_interval_minutes;
    if minutes <= 0 {
        info!("expired-row purge disabled");
        return None;
    }
    let sessions = state.sessions.clone();
    let period = Duration::from_secs(minutes as u64 * 60);
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        info!(every_minutes = minutes, "purge loop started");
        loop {
            interval.tick().await;
            match sessions.purge().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "purged expired rows"),
                Err(e) => error!(error = %e, "purge failed"),
            }
        }
    }))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let purge = spawn_purge(&state);
    let app = build_app(state);

    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app).await;
    if let Some(handle) = purge {
        handle.abort();
    }
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        auth::{mailer::LogMailer, repo::AuthStore, repo_memory::MemoryStore, repo_types::Session},
        config::{AppConfig, AuthConfig},
    };
    use time::OffsetDateTime;

    #[tokio::test]
    async fn purge_disabled_at_zero() {
        let config = AppConfig {
            auth: AuthConfig {
                purge_interval_minutes: 0,
                ..AuthConfig::default()
            },
            ..AppConfig::default()
        };
        assert!(spawn_purge(&AppState::in_memory(config)).is_none());
    }

    #[tokio::test]
    async fn purge_loop_drops_expired_sessions() {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::from_parts(
            Arc::new(AppConfig::default()),
            store.clone(),
            Arc::new(LogMailer),
        );
        let past = OffsetDateTime::now_utc() - time::Duration::hours(1);
        store
            .insert_session(&Session {
                token: "stale".into(),
                user_id: 1,
                created_at: past,
                expires_at: past,
            })
            .await
            .unwrap();

        let handle = spawn_purge(&state).unwrap();
        // first tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.list_sessions().await.unwrap().is_empty());
        handle.abort();
    }
}
