use async_trait::async_trait;
use tracing::{debug, info};

use crate::auth::repo_types::TokenKind;

/// Out-of-band delivery of confirmation tokens.
#[async_trait]
pub trait TokenMailer: Send + Sync {
    async fn deliver(&self, to: &str, kind: TokenKind, token: &str) -> anyhow::Result<()>;
}

/// Development mailer: writes the token to the log instead of sending it.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl TokenMailer for LogMailer {
    async fn deliver(&self, to: &str, kind: TokenKind, token: &str) -> anyhow::Result<()> {
        info!(to, %kind, "token delivery");
        debug!(to, %kind, token, "token value");
        Ok(())
    }
}
