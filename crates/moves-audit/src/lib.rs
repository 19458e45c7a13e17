//! Append-only audit trail (spec C14). Every state-changing operation in the
//! other engines calls `AuditLog::record` inside the same transaction as the
//! state change it is recording, mirroring how `risk-manager::manager`
//! writes trade outcomes alongside the position update they describe.

use anyhow::Result;
use moves_store::models::{now_iso, AuditEntry, ActorType};
use moves_store::Store;
use sqlx::sqlite::Sqlite;

#[derive(Clone)]
pub struct AuditLog {
    store: Store,
}

impl AuditLog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append an entry using the pool directly (no caller-held transaction).
    pub async fn record(
        &self,
        actor: ActorType,
        action: &str,
        detail: &str,
        entity_type: &str,
        entity_id: Option<i64>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO audit_log (actor, action, detail, entity_type, entity_id, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(actor.to_string())
        .bind(action)
        .bind(detail)
        .bind(entity_type)
        .bind(entity_id)
        .bind(now_iso())
        .fetch_one(self.store.pool())
        .await?;
        Ok(id)
    }

    /// Append an entry inside a transaction already owned by the caller, so
    /// the audit row commits or rolls back atomically with the state change.
    pub async fn record_tx<'a>(
        tx: &mut sqlx::Transaction<'a, Sqlite>,
        actor: ActorType,
        action: &str,
        detail: &str,
        entity_type: &str,
        entity_id: Option<i64>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO audit_log (actor, action, detail, entity_type, entity_id, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(actor.to_string())
        .bind(action)
        .bind(detail)
        .bind(entity_type)
        .bind(entity_id)
        .bind(now_iso())
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Read entries in chronological (ascending id) order.
    pub async fn list(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditEntryRow>(
            "SELECT id, actor, action, detail, entity_type, entity_id, timestamp
             FROM audit_log ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn for_entity(&self, entity_type: &str, entity_id: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditEntryRow>(
            "SELECT id, actor, action, detail, entity_type, entity_id, timestamp
             FROM audit_log WHERE entity_type = ? AND entity_id = ? ORDER BY id ASC",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct AuditEntryRow {
    id: i64,
    actor: String,
    action: String,
    detail: String,
    entity_type: String,
    entity_id: Option<i64>,
    timestamp: String,
}

impl From<AuditEntryRow> for AuditEntry {
    fn from(r: AuditEntryRow) -> Self {
        Self {
            id: r.id,
            actor: r.actor.parse().unwrap_or(ActorType::Engine),
            action: r.action,
            detail: r.detail,
            entity_type: r.entity_type,
            entity_id: r.entity_id,
            timestamp: r.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn record_and_list_is_chronological() {
        let log = AuditLog::new(store().await);
        log.record(ActorType::Engine, "created", "", "signal", Some(1))
            .await
            .unwrap();
        log.record(ActorType::User, "approved", "", "signal", Some(1))
            .await
            .unwrap();
        let entries = log.list(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "created");
        assert_eq!(entries[1].action, "approved");
    }

    #[tokio::test]
    async fn for_entity_filters() {
        let log = AuditLog::new(store().await);
        log.record(ActorType::Engine, "created", "", "signal", Some(1))
            .await
            .unwrap();
        log.record(ActorType::Engine, "created", "", "signal", Some(2))
            .await
            .unwrap();
        let entries = log.for_entity("signal", 1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_id, Some(1));
    }
}
