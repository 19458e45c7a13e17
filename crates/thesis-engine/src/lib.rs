//! Thesis CRUD and status state machine (spec C4), grounded on the same
//! transaction-per-mutation shape as `risk-manager::manager`'s parameter and
//! position updates, plus the append-only version log pattern used
//! throughout the teacher's audit-adjacent tables.

use anyhow::Result;
use moves_audit::AuditLog;
use moves_store::models::{now_iso, ActorType, ThesisStatus};
use moves_store::{Store, StoreError};
use sqlx::Row;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThesisError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("thesis not found: {0}")]
    NotFound(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct ThesisEngine {
    store: Store,
    audit: AuditLog,
}

fn allowed_transitions(from: ThesisStatus) -> &'static [ThesisStatus] {
    use ThesisStatus::*;
    match from {
        Draft => &[Active, Archived],
        Active => &[Strengthening, Weakening, Confirmed, Invalidated, Archived],
        Strengthening => &[Active, Confirmed, Weakening, Invalidated, Archived],
        Weakening => &[Active, Strengthening, Invalidated, Archived],
        Confirmed => &[Strengthening, Weakening, Invalidated, Archived],
        Invalidated => &[Archived],
        Archived => &[],
    }
}

impl ThesisEngine {
    pub fn new(store: Store, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    pub async fn create_thesis(
        &self,
        title: &str,
        narrative: &str,
        strategy: &str,
        symbols: &[String],
        conviction: f64,
        start_active: bool,
    ) -> Result<i64, ThesisError> {
        let initial = if start_active { ThesisStatus::Active } else { ThesisStatus::Draft };
        let symbols_json = serde_json::to_string(symbols).unwrap_or_else(|_| "[]".to_string());

        let mut tx = self.store.transaction().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO theses (title, narrative, strategy, status, symbols, conviction)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(title)
        .bind(narrative)
        .bind(strategy)
        .bind(initial.to_string())
        .bind(symbols_json)
        .bind(conviction)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO thesis_versions (thesis_id, old_status, new_status, reason) VALUES (?, ?, ?, 'created')",
        )
        .bind(id)
        .bind(initial.to_string())
        .bind(initial.to_string())
        .execute(&mut *tx)
        .await?;

        moves_audit::AuditLog::record_tx(&mut tx, ActorType::User, "thesis_created", title, "thesis", Some(id))
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<ThesisRow, ThesisError> {
        let row = sqlx::query(
            "SELECT id, title, narrative, strategy, status, symbols, conviction, created_at, updated_at
             FROM theses WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or(ThesisError::NotFound(id))?;

        Ok(ThesisRow {
            id: row.get("id"),
            title: row.get("title"),
            narrative: row.get("narrative"),
            strategy: row.get("strategy"),
            status: ThesisStatus::from_str(row.get("status")).unwrap_or(ThesisStatus::Draft),
            symbols: serde_json::from_str(row.get("symbols")).unwrap_or_default(),
            conviction: row.get("conviction"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    pub async fn add_symbols(&self, id: i64, new_symbols: &[String]) -> Result<(), ThesisError> {
        let current = self.get(id).await?;
        let mut merged = current.symbols;
        for sym in new_symbols {
            if !merged.contains(sym) {
                merged.push(sym.clone());
            }
        }
        let json = serde_json::to_string(&merged).unwrap_or_else(|_| "[]".to_string());
        sqlx::query("UPDATE theses SET symbols = ?, updated_at = ? WHERE id = ?")
            .bind(json)
            .bind(now_iso())
            .bind(id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Transition `id` to `new_status`, failing with `InvalidTransition` if
    /// the move is not in the allowed-transitions graph (spec 4.4). Writes a
    /// `ThesisVersion` row inside the same transaction as the status update.
    pub async fn transition(
        &self,
        id: i64,
        new_status: ThesisStatus,
        reason: &str,
        evidence: Option<&str>,
    ) -> Result<(), ThesisError> {
        let current = self.get(id).await?;
        if !allowed_transitions(current.status).contains(&new_status) {
            return Err(ThesisError::InvalidTransition {
                from: current.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let mut tx = self.store.transaction().await?;
        sqlx::query("UPDATE theses SET status = ?, updated_at = ? WHERE id = ?")
            .bind(new_status.to_string())
            .bind(now_iso())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO thesis_versions (thesis_id, old_status, new_status, reason, evidence) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(current.status.to_string())
        .bind(new_status.to_string())
        .bind(reason)
        .bind(evidence)
        .execute(&mut *tx)
        .await?;

        moves_audit::AuditLog::record_tx(
            &mut tx,
            ActorType::Engine,
            "thesis_transition",
            &format!("{} -> {} ({reason})", current.status, new_status),
            "thesis",
            Some(id),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn versions(&self, thesis_id: i64) -> Result<Vec<VersionRow>, ThesisError> {
        let rows = sqlx::query(
            "SELECT id, thesis_id, old_status, new_status, reason, evidence, timestamp
             FROM thesis_versions WHERE thesis_id = ? ORDER BY id ASC",
        )
        .bind(thesis_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| VersionRow {
                id: r.get("id"),
                thesis_id: r.get("thesis_id"),
                old_status: r.get("old_status"),
                new_status: r.get("new_status"),
                reason: r.get("reason"),
                evidence: r.get("evidence"),
                timestamp: r.get("timestamp"),
            })
            .collect())
    }

    /// Active theses not updated within `stale_days`, used by the scheduler's
    /// `stale_thesis_check` job (spec 4.12).
    pub async fn stale_active(&self, stale_days: i64) -> Result<Vec<i64>, ThesisError> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM theses WHERE status = 'active'
             AND julianday('now') - julianday(updated_at) >= ?",
        )
        .bind(stale_days as f64)
        .fetch_all(self.store.pool())
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

pub struct ThesisRow {
    pub id: i64,
    pub title: String,
    pub narrative: String,
    pub strategy: String,
    pub status: ThesisStatus,
    pub symbols: Vec<String>,
    pub conviction: f64,
    pub created_at: String,
    pub updated_at: String,
}

pub struct VersionRow {
    pub id: i64,
    pub thesis_id: i64,
    pub old_status: String,
    pub new_status: String,
    pub reason: String,
    pub evidence: Option<String>,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> ThesisEngine {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let audit = AuditLog::new(store.clone());
        ThesisEngine::new(store, audit)
    }

    #[tokio::test]
    async fn full_status_lifecycle_records_versions() {
        let engine = engine().await;
        let id = engine
            .create_thesis("NVDA AI demand", "", "long", &["NVDA".to_string()], 0.7, true)
            .await
            .unwrap();

        engine
            .transition(id, ThesisStatus::Weakening, "demand data disappointing", None)
            .await
            .unwrap();
        engine
            .transition(id, ThesisStatus::Invalidated, "earnings miss", None)
            .await
            .unwrap();

        let versions = engine.versions(id).await.unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[1].old_status, "active");
        assert_eq!(versions[1].new_status, "weakening");
        assert_eq!(versions[2].new_status, "invalidated");
    }

    #[tokio::test]
    async fn rejects_invalid_transition() {
        let engine = engine().await;
        let id = engine
            .create_thesis("t", "", "long", &[], 0.5, true)
            .await
            .unwrap();
        engine.transition(id, ThesisStatus::Invalidated, "bad", None).await.unwrap();
        let err = engine.transition(id, ThesisStatus::Active, "nope", None).await;
        assert!(matches!(err, Err(ThesisError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn add_symbols_deduplicates() {
        let engine = engine().await;
        let id = engine
            .create_thesis("t", "", "long", &["NVDA".to_string()], 0.5, true)
            .await
            .unwrap();
        engine.add_symbols(id, &["NVDA".to_string(), "AMD".to_string()]).await.unwrap();
        let thesis = engine.get(id).await.unwrap();
        assert_eq!(thesis.symbols, vec!["NVDA".to_string(), "AMD".to_string()]);
    }
}
