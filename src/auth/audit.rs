use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error};

use crate::auth::{
    error::AuthError,
    repo::AuthStore,
    repo_types::{AuditLogEntry, NewAuditEntry},
};

/// Append-only trail of security-relevant actions.
///
/// Writes happen after the primary mutation has committed and are not
/// coupled to it: a failed write is logged under the `audit` target and
/// swallowed, so a crash or store error between the two leaves a gap in the
/// trail rather than undoing the mutation.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuthStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuthStore>) -> Self {
        Self { store }
    }

    /// `target_id` is 0 when the action has no single target.
    pub async fn record(
        &self,
        category: &'static str,
        action: &'static str,
        target_id: i64,
        actor_id: i64,
    ) -> Option<AuditLogEntry> {
        let entry = NewAuditEntry {
            category,
            action,
            target_id,
            actor_id,
        };
        match self.store.append_audit(&entry, OffsetDateTime::now_utc()).await {
            Ok(row) => {
                debug!(target: "audit", id = row.id, category, action, target_id, actor_id, "recorded");
                Some(row)
            }
            Err(e) => {
                error!(
                    target: "audit",
                    error = %e, category, action, target_id, actor_id,
                    "audit write failed; entry lost"
                );
                None
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<AuditLogEntry>, AuthError> {
        Ok(self.store.list_audit().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_memory::MemoryStore;

    #[tokio::test]
    async fn entries_list_newest_first() {
        let audit = AuditLogger::new(Arc::new(MemoryStore::new()));
        audit.record("user", "create", 1, 1).await.unwrap();
        audit.record("session", "create", 0, 1).await.unwrap();

        let entries = audit.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].category, "session");
        assert_eq!(entries[1].action, "create");
        assert_eq!(entries[1].target_id, 1);
    }

    #[tokio::test]
    async fn failed_write_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_audit_writes(true);
        let audit = AuditLogger::new(store.clone());
        assert!(audit.record("user", "delete", 3, 3).await.is_none());

        store.fail_audit_writes(false);
        assert!(audit.list().await.unwrap().is_empty());
    }
}
