//! Signal CRUD, confidence scoring, status transitions, and source-win-rate
//! tracking (spec C6). The status DAG enforcement mirrors
//! `thesis-engine`'s transition table; confidence scoring is this crate's
//! own formula chain, grounded on the teacher's `confidence-calibrator`
//! crate's shape of "several multipliers combined, then clamped."

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use moves_audit::AuditLog;
use moves_store::models::{now_iso, ActorType, SignalAction, SignalSource, SignalStatus, ThesisStatus};
use moves_store::{Store, StoreError};
use pricing_service::PricingService;
use principles_engine::Principle;
use rust_decimal::prelude::*;
use sqlx::Row;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("signal not found: {0}")]
    NotFound(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct ScoringInputs<'a> {
    pub raw_confidence: f64,
    pub thesis_status: Option<ThesisStatus>,
    pub domain: Option<&'a str>,
    pub expertise_domains: &'a [String],
    pub principles: &'a [Principle],
    pub source_wins: i64,
    pub source_total: i64,
}

fn thesis_mult(status: Option<ThesisStatus>) -> f64 {
    use ThesisStatus::*;
    match status {
        Some(Strengthening) => 1.10,
        Some(Confirmed) => 1.15,
        Some(Active) => 1.00,
        Some(Weakening) => 0.80,
        Some(Invalidated) => 0.00,
        Some(Draft) => 0.90,
        Some(Archived) | None => 1.00,
    }
}

fn domain_mult(domain: Option<&str>, expertise: &[String]) -> f64 {
    match domain {
        None => 1.00,
        Some(d) => {
            if expertise.iter().any(|e| e.eq_ignore_ascii_case(d)) {
                1.15
            } else {
                0.90
            }
        }
    }
}

/// Shrinkage estimator `(wins + 1) / (total + 2)` scaled into [0.9, 1.1].
fn source_mult(wins: i64, total: i64) -> f64 {
    let win_rate = (wins as f64 + 1.0) / (total as f64 + 2.0);
    0.9 + win_rate * 0.2
}

/// Final score = clamp(c * thesis_mult * domain_mult * source_mult + principle_adj, 0, 1).
pub fn score_confidence(inputs: &ScoringInputs, principles_engine: &principles_engine::PrinciplesEngine) -> f64 {
    let t = thesis_mult(inputs.thesis_status);
    let d = domain_mult(inputs.domain, inputs.expertise_domains);
    let s = source_mult(inputs.source_wins, inputs.source_total);
    let principle_adj = principles_engine.apply_to_score(inputs.principles);
    (inputs.raw_confidence * t * d * s + principle_adj).clamp(0.0, 1.0)
}

fn allowed_transitions(from: SignalStatus) -> &'static [SignalStatus] {
    use SignalStatus::*;
    match from {
        Pending => &[Approved, Rejected, Ignored, Cancelled],
        Approved => &[Executed, Cancelled],
        Executed | Rejected | Ignored | Cancelled => &[],
    }
}

pub struct SignalEngine {
    store: Store,
    audit: AuditLog,
    pricing: Arc<PricingService>,
}

impl SignalEngine {
    pub fn new(store: Store, audit: AuditLog, pricing: Arc<PricingService>) -> Self {
        Self { store, audit, pricing }
    }

    pub async fn create_signal(
        &self,
        action: SignalAction,
        symbol: &str,
        thesis_id: Option<i64>,
        confidence: f64,
        source: SignalSource,
        horizon: &str,
        size_pct: Option<f64>,
        reasoning: &str,
    ) -> Result<i64, SignalError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO signals (action, symbol, thesis_id, confidence, source, horizon, status, size_pct, reasoning)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            RETURNING id
            "#,
        )
        .bind(action.to_string())
        .bind(symbol)
        .bind(thesis_id)
        .bind(confidence)
        .bind(source.to_string())
        .bind(horizon)
        .bind(size_pct)
        .bind(reasoning)
        .fetch_one(self.store.pool())
        .await?;

        self.audit
            .record(ActorType::Engine, "signal_created", symbol, "signal", Some(id))
            .await?;
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<SignalRow, SignalError> {
        let row = sqlx::query(
            "SELECT id, action, symbol, thesis_id, confidence, source, horizon, status, size_pct, reasoning, created_at
             FROM signals WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or(SignalError::NotFound(id))?;

        Ok(SignalRow {
            id: row.get("id"),
            action: SignalAction::from_str(row.get("action")).unwrap_or(SignalAction::Buy),
            symbol: row.get("symbol"),
            thesis_id: row.get("thesis_id"),
            confidence: row.get("confidence"),
            source: SignalSource::from_str(row.get("source")).unwrap_or(SignalSource::Manual),
            horizon: row.get("horizon"),
            status: SignalStatus::from_str(row.get("status")).unwrap_or(SignalStatus::Pending),
            size_pct: row.get("size_pct"),
            reasoning: row.get("reasoning"),
            created_at: row.get("created_at"),
        })
    }

    pub async fn transition(&self, id: i64, new_status: SignalStatus) -> Result<(), SignalError> {
        let current = self.get(id).await?;
        if !allowed_transitions(current.status).contains(&new_status) {
            return Err(SignalError::InvalidTransition {
                from: current.status.to_string(),
                to: new_status.to_string(),
            });
        }

        sqlx::query("UPDATE signals SET status = ?, decided_at = ? WHERE id = ? AND status = ?")
            .bind(new_status.to_string())
            .bind(now_iso())
            .bind(id)
            .bind(current.status.to_string())
            .execute(self.store.pool())
            .await?;

        self.audit
            .record(
                ActorType::Engine,
                "signal_transition",
                &format!("{} -> {}", current.status, new_status),
                "signal",
                Some(id),
            )
            .await?;

        if matches!(new_status, SignalStatus::Rejected | SignalStatus::Ignored) {
            self.record_what_if(id, &current.symbol, new_status).await?;
        }

        Ok(())
    }

    async fn record_what_if(&self, signal_id: i64, symbol: &str, status: SignalStatus) -> Result<()> {
        let decision = match status {
            SignalStatus::Rejected => "rejected",
            SignalStatus::Ignored => "ignored",
            _ => return Ok(()),
        };
        let quote = self.pricing.get_price(symbol).await;
        sqlx::query(
            "INSERT INTO what_ifs (signal_id, decision, price_at_pass) VALUES (?, ?, ?)",
        )
        .bind(signal_id)
        .bind(decision)
        .bind(quote.price.to_f64().unwrap_or(0.0))
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Transitions every PENDING signal older than `max_age_hours` to
    /// IGNORED, recording a WhatIf for each (scheduler `signal_expiry` job,
    /// spec 4.12, invariant 6).
    pub async fn expire_stale(&self, max_age_hours: i64) -> Result<Vec<i64>, SignalError> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM signals WHERE status = 'pending'
             AND (julianday('now') - julianday(created_at)) * 24 >= ?",
        )
        .bind(max_age_hours as f64)
        .fetch_all(self.store.pool())
        .await?;

        let mut expired = Vec::new();
        for (id,) in ids {
            self.transition(id, SignalStatus::Ignored).await?;
            expired.push(id);
        }
        Ok(expired)
    }

    pub async fn record_source_outcome(&self, source: SignalSource, win: bool, pnl: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_stats (source, wins, total, total_pnl)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(source) DO UPDATE SET
                wins = source_stats.wins + excluded.wins,
                total = source_stats.total + 1,
                total_pnl = source_stats.total_pnl + excluded.total_pnl
            "#,
        )
        .bind(source.to_string())
        .bind(if win { 1 } else { 0 })
        .bind(pnl)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn source_stats(&self, source: SignalSource) -> Result<(i64, i64)> {
        let row: Option<(i64, i64)> = sqlx::query_as("SELECT wins, total FROM source_stats WHERE source = ?")
            .bind(source.to_string())
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row.unwrap_or((0, 0)))
    }
}

pub struct SignalRow {
    pub id: i64,
    pub action: SignalAction,
    pub symbol: String,
    pub thesis_id: Option<i64>,
    pub confidence: f64,
    pub source: SignalSource,
    pub horizon: String,
    pub status: SignalStatus,
    pub size_pct: Option<f64>,
    pub reasoning: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use pricing_service::{Bar, Fundamentals, PriceError, Quote, QuoteSource, QuoteSourceKind};
    use rust_decimal::Decimal;

    struct FixedSource;
    #[async_trait]
    impl QuoteSource for FixedSource {
        async fn fetch_quote(&self, symbol: &str) -> Result<Quote, PriceError> {
            Ok(Quote {
                symbol: symbol.to_string(),
                price: Decimal::from(100),
                change: Decimal::ZERO,
                change_pct: 0.0,
                volume: 0,
                timestamp: Utc::now(),
                source: QuoteSourceKind::Primary,
                error: None,
            })
        }
        async fn fetch_history(&self, _: &str, _: &str) -> Result<Vec<Bar>, PriceError> {
            Ok(Vec::new())
        }
        async fn fetch_fundamentals(&self, symbol: &str) -> Result<Fundamentals, PriceError> {
            Ok(Fundamentals { symbol: symbol.to_string(), market_cap: None, pe_ratio: None, eps: None, sector: None })
        }
    }

    async fn engine() -> SignalEngine {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let audit = AuditLog::new(store.clone());
        let pricing = Arc::new(PricingService::new(Arc::new(FixedSource)));
        SignalEngine::new(store, audit, pricing)
    }

    #[tokio::test]
    async fn pending_to_executed_requires_approved_first() {
        let engine = engine().await;
        let id = engine
            .create_signal(SignalAction::Buy, "NVDA", None, 0.7, SignalSource::Manual, "3m", Some(0.05), "")
            .await
            .unwrap();
        let err = engine.transition(id, SignalStatus::Executed).await;
        assert!(matches!(err, Err(SignalError::InvalidTransition { .. })));
        engine.transition(id, SignalStatus::Approved).await.unwrap();
        engine.transition(id, SignalStatus::Executed).await.unwrap();
    }

    #[tokio::test]
    async fn rejection_records_what_if() {
        let engine = engine().await;
        let id = engine
            .create_signal(SignalAction::Buy, "NVDA", None, 0.7, SignalSource::Manual, "3m", None, "")
            .await
            .unwrap();
        engine.transition(id, SignalStatus::Rejected).await.unwrap();
        let row: (String, f64) =
            sqlx::query_as("SELECT decision, price_at_pass FROM what_ifs WHERE signal_id = ?")
                .bind(id)
                .fetch_one(engine.store.pool())
                .await
                .unwrap();
        assert_eq!(row.0, "rejected");
        assert_eq!(row.1, 100.0);
    }

    #[tokio::test]
    async fn expire_stale_transitions_old_pending_signals() {
        let engine = engine().await;
        let id = engine
            .create_signal(SignalAction::Buy, "NVDA", None, 0.7, SignalSource::Manual, "3m", None, "")
            .await
            .unwrap();
        sqlx::query("UPDATE signals SET created_at = datetime('now', '-25 hours') WHERE id = ?")
            .bind(id)
            .execute(engine.store.pool())
            .await
            .unwrap();

        let expired = engine.expire_stale(24).await.unwrap();
        assert_eq!(expired, vec![id]);
        let row = engine.get(id).await.unwrap();
        assert_eq!(row.status, SignalStatus::Ignored);
    }

    #[test]
    fn confidence_monotone_in_thesis_status() {
        let weak = thesis_mult(Some(ThesisStatus::Weakening));
        let confirmed = thesis_mult(Some(ThesisStatus::Confirmed));
        assert!(weak < confirmed);
    }

    #[test]
    fn source_mult_is_bounded() {
        assert!(source_mult(0, 0) >= 0.9 && source_mult(0, 0) <= 1.1);
        assert!(source_mult(1000, 1000) <= 1.1);
    }
}
