//! Signal approval routing (spec C8), grounded on
//! `original_source/moves/engine/approval.py`'s three auto-approve rules.

use anyhow::Result;
use sqlx::Row;

use moves_audit::AuditLog;
use moves_store::models::{ActorType, SignalSource, SignalStatus};
use moves_store::Store;
use signal_engine::{SignalEngine, SignalError, SignalRow};

const DEFAULT_MAX_AUTO_VALUE: f64 = 500.0;
const DEFAULT_MIN_AUTO_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    AutoApproved,
    Pending,
}

pub struct ApprovalWorkflow {
    store: Store,
    audit: AuditLog,
    signals: SignalEngine,
}

impl ApprovalWorkflow {
    pub fn new(store: Store, audit: AuditLog, signals: SignalEngine) -> Self {
        Self { store, audit, signals }
    }

    async fn setting(&self, key: &str, default: f64) -> Result<f64> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row
            .and_then(|r| r.get::<String, _>("value").parse::<f64>().ok())
            .unwrap_or(default))
    }

    async fn latest_nav(&self) -> Result<Option<f64>> {
        let row = sqlx::query("SELECT total_value FROM portfolio_values ORDER BY date DESC LIMIT 1")
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row.map(|r| r.get("total_value")))
    }

    async fn thesis_is_confirmed(&self, thesis_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT status FROM theses WHERE id = ?")
            .bind(thesis_id)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row.map(|r| r.get::<String, _>("status") == "confirmed").unwrap_or(false))
    }

    /// Any one of three rules is sufficient: low trade notional, high
    /// confidence with a confirmed thesis, or a rebalance signal.
    pub async fn should_auto_approve(&self, signal: &SignalRow) -> Result<bool> {
        let max_value = self.setting("auto_approve_max_value", DEFAULT_MAX_AUTO_VALUE).await?;
        if let (Some(size_pct), Some(nav)) = (signal.size_pct, self.latest_nav().await?) {
            let trade_value = nav * size_pct;
            if trade_value < max_value {
                return Ok(true);
            }
        }

        let min_confidence = self
            .setting("auto_approve_min_confidence", DEFAULT_MIN_AUTO_CONFIDENCE)
            .await?;
        if signal.confidence >= min_confidence {
            if let Some(thesis_id) = signal.thesis_id {
                if self.thesis_is_confirmed(thesis_id).await? {
                    return Ok(true);
                }
            }
        }

        if matches!(signal.source, SignalSource::Rebalance) {
            return Ok(true);
        }

        Ok(false)
    }

    pub async fn process_signal(&self, signal_id: i64) -> Result<ApprovalOutcome> {
        let signal = self.signals.get(signal_id).await?;

        if self.should_auto_approve(&signal).await? {
            self.signals.transition(signal_id, SignalStatus::Approved).await?;
            self.audit
                .record(
                    ActorType::Engine,
                    "signal_auto_approved",
                    &format!("{} {}", signal.action, signal.symbol),
                    "signal",
                    Some(signal_id),
                )
                .await?;
            return Ok(ApprovalOutcome::AutoApproved);
        }

        self.audit
            .record(
                ActorType::Engine,
                "signal_pending_approval",
                &format!("{} {} awaiting manual review", signal.action, signal.symbol),
                "signal",
                Some(signal_id),
            )
            .await?;
        Ok(ApprovalOutcome::Pending)
    }

    /// Updates size and/or limit price on a PENDING signal; at least one
    /// field must be provided. Limit price is stashed in `funding_plan` as
    /// JSON, mirroring the schema's lack of a dedicated column.
    pub async fn modify_signal(
        &self,
        signal_id: i64,
        size_override: Option<f64>,
        price_override: Option<f64>,
    ) -> Result<(), ModifyError> {
        if size_override.is_none() && price_override.is_none() {
            return Err(ModifyError::NoFieldsProvided);
        }

        let signal = self.signals.get(signal_id).await.map_err(ModifyError::Signal)?;
        if signal.status != SignalStatus::Pending {
            return Err(ModifyError::NotPending(signal.status.to_string()));
        }

        if let Some(size_pct) = size_override {
            sqlx::query("UPDATE signals SET size_pct = ? WHERE id = ?")
                .bind(size_pct)
                .bind(signal_id)
                .execute(self.store.pool())
                .await
                .map_err(ModifyError::Store)?;
        }

        if let Some(limit_price) = price_override {
            let funding_plan = serde_json::json!({ "limit_price": limit_price }).to_string();
            sqlx::query("UPDATE signals SET funding_plan = ? WHERE id = ?")
                .bind(funding_plan)
                .bind(signal_id)
                .execute(self.store.pool())
                .await
                .map_err(ModifyError::Store)?;
        }

        let detail = format!(
            "Signal {signal_id} modified: size_pct={size_override:?} limit_price={price_override:?}"
        );
        self.audit
            .record(ActorType::Engine, "signal_modified", &detail, "signal", Some(signal_id))
            .await
            .map_err(ModifyError::Store)?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModifyError {
    #[error("no modifications specified")]
    NoFieldsProvided,
    #[error("signal is {0}, cannot modify")]
    NotPending(String),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
