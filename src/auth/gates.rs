use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, request::Parts, HeaderMap};
use tracing::debug;

use crate::auth::{
    error::AuthError,
    sessions::{Identity, SessionManager},
};

/// Pulls `<token>` out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

/// One admission step. Receives whatever identity the earlier gates
/// resolved and either passes an identity on or refuses the request.
#[async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;

    async fn admit(
        &self,
        parts: &Parts,
        admitted: Option<Identity>,
    ) -> Result<Identity, AuthError>;
}

/// Resolves the bearer token to a live session.
pub struct RequireAuth {
    sessions: SessionManager,
}

impl RequireAuth {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Gate for RequireAuth {
    fn name(&self) -> &'static str {
        "require_auth"
    }

    async fn admit(&self, parts: &Parts, _: Option<Identity>) -> Result<Identity, AuthError> {
        let token = bearer_token(&parts.headers).ok_or(AuthError::Unauthorized)?;
        match self.sessions.validate(token).await {
            Ok(identity) => Ok(identity),
            Err(e @ AuthError::StoreUnavailable(_)) => Err(e),
            Err(e) => {
                debug!(reason = %e, "session rejected");
                Err(AuthError::Unauthorized)
            }
        }
    }
}

/// Staff only. Must come after `RequireAuth`.
pub struct RequireAdmin;

#[async_trait]
impl Gate for RequireAdmin {
    fn name(&self) -> &'static str {
        "require_admin"
    }

    async fn admit(&self, _: &Parts, admitted: Option<Identity>) -> Result<Identity, AuthError> {
        let identity = admitted.ok_or(AuthError::Unauthorized)?;
        if !identity.is_staff {
            debug!(user_id = identity.user_id, "non-staff refused");
            return Err(AuthError::Forbidden);
        }
        Ok(identity)
    }
}

/// Gates run in order; the first refusal wins. An empty pipeline admits
/// nobody.
#[derive(Clone)]
pub struct Pipeline {
    gates: Arc<[Arc<dyn Gate>]>,
}

impl Pipeline {
    pub fn new(gates: Vec<Arc<dyn Gate>>) -> Self {
        Self {
            gates: gates.into(),
        }
    }

    pub fn authenticated(sessions: &SessionManager) -> Self {
        Self::new(vec![Arc::new(RequireAuth::new(sessions.clone())) as Arc<dyn Gate>])
    }

    pub fn admin(sessions: &SessionManager) -> Self {
        Self::new(vec![
            Arc::new(RequireAuth::new(sessions.clone())) as Arc<dyn Gate>,
            Arc::new(RequireAdmin),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub async fn admit(&self, parts: &Parts) -> Result<Identity, AuthError> {
        let mut admitted = None;
        for gate in self.gates.iter() {
            match gate.admit(parts, admitted.take()).await {
                Ok(identity) => admitted = Some(identity),
                Err(e) => {
                    debug!(gate = gate.name(), error = %e, "admission refused");
                    return Err(e);
                }
            }
        }
        admitted.ok_or(AuthError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{
            audit::AuditLogger, password::hash_password, repo::AuthStore,
            repo_memory::MemoryStore, repo_types::NewUser,
        },
        config::AuthConfig,
    };
    use axum::http::Request;

    fn parts(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(v) = auth {
            builder = builder.header(AUTHORIZATION, v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    async fn sessions_with(staff: bool) -> (SessionManager, String) {
        let store = Arc::new(MemoryStore::new());
        let hash = hash_password("password1").unwrap();
        store
            .create_user(
                &NewUser {
                    email: "a@x.com",
                    password_hash: &hash,
                    is_active: true,
                    is_staff: staff,
                },
                None,
            )
            .await
            .unwrap();
        let sessions = SessionManager::new(
            store.clone(),
            AuditLogger::new(store),
            &AuthConfig::default(),
        );
        let token = sessions.login("a@x.com", "password1").await.unwrap().token;
        (sessions, token)
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token(&parts(Some("Bearer abc")).headers), Some("abc"));
        assert_eq!(bearer_token(&parts(Some("bearer abc")).headers), Some("abc"));
        assert_eq!(bearer_token(&parts(Some("Basic abc")).headers), None);
        assert_eq!(bearer_token(&parts(Some("Bearer ")).headers), None);
        assert_eq!(bearer_token(&parts(None).headers), None);
    }

    #[tokio::test]
    async fn auth_gate_resolves_identity() {
        let (sessions, token) = sessions_with(false).await;
        let identity = Pipeline::authenticated(&sessions)
            .admit(&parts(Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        assert_eq!(identity.email, "a@x.com");
    }

    #[tokio::test]
    async fn auth_gate_rejects_missing_and_bogus_tokens() {
        let (sessions, _) = sessions_with(false).await;
        let pipeline = Pipeline::authenticated(&sessions);
        assert!(matches!(
            pipeline.admit(&parts(None)).await.unwrap_err(),
            AuthError::Unauthorized
        ));
        assert!(matches!(
            pipeline.admit(&parts(Some("Bearer forged"))).await.unwrap_err(),
            AuthError::Unauthorized
        ));
    }

    #[tokio::test]
    async fn admin_pipeline_forbids_non_staff() {
        let (sessions, token) = sessions_with(false).await;
        let err = Pipeline::admin(&sessions)
            .admit(&parts(Some(&format!("Bearer {token}"))))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden));
    }

    #[tokio::test]
    async fn admin_pipeline_admits_staff() {
        let (sessions, token) = sessions_with(true).await;
        let pipeline = Pipeline::admin(&sessions);
        assert_eq!(pipeline.names(), vec!["require_auth", "require_admin"]);
        let identity = pipeline
            .admit(&parts(Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        assert!(identity.is_staff);
    }

    #[tokio::test]
    async fn admin_gate_alone_has_no_identity_to_check() {
        let pipeline = Pipeline::new(vec![Arc::new(RequireAdmin) as Arc<dyn Gate>]);
        assert!(matches!(
            pipeline.admit(&parts(None)).await.unwrap_err(),
            AuthError::Unauthorized
        ));
        assert!(matches!(
            Pipeline::new(vec![]).admit(&parts(None)).await.unwrap_err(),
            AuthError::Unauthorized
        ));
    }
}
