use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::auth::{
    accounts::Accounts,
    audit::AuditLogger,
    gates::Pipeline,
    mailer::{LogMailer, TokenMailer},
    repo::{AuthStore, PgStore},
    repo_memory::MemoryStore,
    sessions::SessionManager,
    tokens::TokenIssuer,
};
use crate::config::AppConfig;

/// Admission pipelines, built once at startup.
#[derive(Clone)]
pub struct Gates {
    pub authenticated: Pipeline,
    pub admin: Pipeline,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: SessionManager,
    pub tokens: TokenIssuer,
    pub accounts: Accounts,
    pub audit: AuditLogger,
    pub mailer: Arc<dyn TokenMailer>,
    pub gates: Gates,
}

impl AppState {
    /// Postgres-backed state. Runs pending migrations before returning.
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let url = config
            .database_url
            .clone()
            .context("DATABASE_URL is not set")?;
        let store = PgStore::connect(&url).await?;
        store.migrate().await?;
        Ok(Self::from_parts(
            Arc::new(config),
            Arc::new(store),
            Arc::new(LogMailer),
        ))
    }

    /// Process-local state; everything is lost on exit.
    pub fn in_memory(config: AppConfig) -> Self {
        Self::from_parts(
            Arc::new(config),
            Arc::new(MemoryStore::new()),
            Arc::new(LogMailer),
        )
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        store: Arc<dyn AuthStore>,
        mailer: Arc<dyn TokenMailer>,
    ) -> Self {
        let audit = AuditLogger::new(store.clone());
        let sessions = SessionManager::new(store.clone(), audit.clone(), &config.auth);
        let tokens = TokenIssuer::new(store.clone(), audit.clone(), &config.auth);
        let accounts = Accounts::new(store, audit.clone(), tokens.clone());
        let gates = Gates {
            authenticated: Pipeline::authenticated(&sessions),
            admin: Pipeline::admin(&sessions),
        };
        debug!(
            authenticated = ?gates.authenticated.names(),
            admin = ?gates.admin.names(),
            "admission pipelines"
        );
        Self {
            config,
            sessions,
            tokens,
            accounts,
            audit,
            mailer,
            gates,
        }
    }
}
