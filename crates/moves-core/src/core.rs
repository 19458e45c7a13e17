//! Central orchestrator (spec C13), grounded on
//! `original_source/moves/engine/core.py::MoneyMovesCore`. Wires every
//! engine crate together and exposes the signal processing pipeline plus
//! startup/health endpoints `moves-core`'s binary drives the scheduler with.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sqlx::Row;

use approval_workflow::{ApprovalOutcome, ApprovalWorkflow};
use broker_core::{Broker, FillStatus, OrderRequest};
use moves_audit::AuditLog;
use moves_store::models::{ActorType, SignalStatus};
use moves_store::Store;
use pricing_service::PricingService;
use risk_manager::{GateResult, RiskManager, TradeContext};
use signal_engine::SignalEngine;

use crate::config::Mode;
use crate::error::CoreError;

pub struct ProcessResult {
    pub status: &'static str,
    pub signal_id: i64,
    pub reason: Option<String>,
    pub order_id: Option<String>,
    pub filled_price: Option<f64>,
}

pub struct SystemStatus {
    pub db_connected: bool,
    pub kill_switch_active: bool,
    pub pending_signals: i64,
    pub portfolio_value: f64,
    pub cash: f64,
    pub mode: &'static str,
}

pub struct StartupReport {
    pub status: &'static str,
    pub kill_switch_active: bool,
    pub pending_signals: i64,
    pub risk_limits_count: i64,
    pub warnings: Vec<String>,
}

pub struct CoreOrchestrator {
    store: Store,
    audit: AuditLog,
    broker: Arc<dyn Broker>,
    pricing: Arc<PricingService>,
    account_id: i64,
    mode: Mode,
    pub signals: SignalEngine,
    pub risk: RiskManager,
    pub approval: ApprovalWorkflow,
}

impl CoreOrchestrator {
    pub fn new(
        store: Store,
        audit: AuditLog,
        broker: Arc<dyn Broker>,
        account_id: i64,
        mode: Mode,
        pricing: Arc<PricingService>,
        earnings: Arc<dyn risk_manager::EarningsSource>,
    ) -> Self {
        let signals = SignalEngine::new(store.clone(), audit.clone(), Arc::clone(&pricing));
        let risk = RiskManager::new(store.clone(), audit.clone(), Arc::clone(&pricing), earnings);
        let approval = ApprovalWorkflow::new(
            store.clone(),
            audit.clone(),
            SignalEngine::new(store.clone(), audit.clone(), Arc::clone(&pricing)),
        );
        Self { store, audit, broker, pricing, account_id, mode, signals, risk, approval }
    }

    pub async fn startup(&self) -> Result<StartupReport> {
        let mut warnings = Vec::new();

        if sqlx::query("SELECT 1").execute(self.store.pool()).await.is_err() {
            return Ok(StartupReport {
                status: "error",
                kill_switch_active: false,
                pending_signals: 0,
                risk_limits_count: 0,
                warnings: vec!["database connectivity check failed".to_string()],
            });
        }

        if let Err(e) = self.broker.get_account_balance().await {
            warnings.push(format!("broker connection issue: {e}"));
        }

        let risk_limits_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM risk_limits").fetch_one(self.store.pool()).await?;
        if risk_limits_count == 0 {
            warnings.push("no risk limits configured".to_string());
        }

        let kill_switch_active = self.risk.is_kill_switch_active().await?;
        if kill_switch_active {
            warnings.push("kill switch is ACTIVE - trading halted".to_string());
        }

        let pending_signals: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM signals WHERE status = 'pending'")
                .fetch_one(self.store.pool())
                .await?;

        self.audit
            .record(
                ActorType::Engine,
                "system_startup",
                &format!("mode: {:?}, warnings: {}", self.mode, warnings.len()),
                "system",
                None,
            )
            .await?;

        Ok(StartupReport {
            status: if warnings.is_empty() { "ok" } else { "ok_with_warnings" },
            kill_switch_active,
            pending_signals,
            risk_limits_count,
            warnings,
        })
    }

    /// Full pipeline: load signal, run the pre-trade risk gates, route
    /// through approval, execute if auto-approved.
    pub async fn process_signal(&self, signal_id: i64) -> Result<ProcessResult, CoreError> {
        let signal = self.signals.get(signal_id).await.map_err(|e| CoreError::NotFound(e.to_string()))?;

        if signal.status != SignalStatus::Pending {
            return Err(CoreError::StateConflict(format!(
                "signal {signal_id} is {}, expected pending",
                signal.status
            )));
        }

        let nav: f64 = sqlx::query_scalar("SELECT total_value FROM portfolio_values ORDER BY date DESC LIMIT 1")
            .fetch_optional(self.store.pool())
            .await?
            .unwrap_or(0.0);
        let size_pct = signal.size_pct.unwrap_or(0.0);
        let notional = Decimal::from_f64(nav * size_pct).unwrap_or_default();

        let trade = TradeContext {
            symbol: signal.symbol.clone(),
            sector: None,
            size_pct,
            signed_notional: match signal.action {
                moves_store::models::SignalAction::Buy | moves_store::models::SignalAction::Cover => notional,
                moves_store::models::SignalAction::Sell | moves_store::models::SignalAction::Short => -notional,
            },
        };

        let gate: GateResult = self.risk.pre_trade_check(self.account_id, &trade).await?;
        if !gate.passed {
            self.signals
                .transition(signal_id, SignalStatus::Cancelled)
                .await
                .map_err(|e| CoreError::StateConflict(e.to_string()))?;
            return Ok(ProcessResult {
                status: "risk_blocked",
                signal_id,
                reason: gate.reason,
                order_id: None,
                filled_price: None,
            });
        }

        let outcome = self.approval.process_signal(signal_id).await?;
        if outcome != ApprovalOutcome::AutoApproved {
            return Ok(ProcessResult {
                status: "pending_approval",
                signal_id,
                reason: None,
                order_id: None,
                filled_price: None,
            });
        }

        let exec = self.execute_approved_signal(signal_id).await?;
        Ok(exec)
    }

    pub async fn execute_approved_signal(&self, signal_id: i64) -> Result<ProcessResult, CoreError> {
        let signal = self.signals.get(signal_id).await.map_err(|e| CoreError::NotFound(e.to_string()))?;
        let shares = match self.estimate_shares(&signal).await {
            Ok(shares) => shares,
            Err(CoreError::UpstreamError(reason)) => {
                self.audit
                    .record(ActorType::Engine, "sizing_failed", &format!("signal {signal_id}: {reason}"), "signal", Some(signal_id))
                    .await?;
                return Err(CoreError::UpstreamError(reason));
            }
            Err(e) => return Err(e),
        };

        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            action: signal.action,
            shares: Decimal::from_f64(shares).unwrap_or(Decimal::ONE),
            order_type: moves_store::models::OrderType::Market,
            limit_price: None,
            signal_id: Some(signal_id),
        };

        let result = match self.broker.place_order(order).await {
            Ok(r) => r,
            Err(e) => {
                self.audit
                    .record(ActorType::Engine, "order_failed", &format!("signal {signal_id}: {e}"), "signal", Some(signal_id))
                    .await?;
                return Err(CoreError::BrokerError(e.to_string()));
            }
        };

        let filled = matches!(result.status, FillStatus::Filled | FillStatus::PartiallyFilled);

        if filled {
            self.signals
                .transition(signal_id, SignalStatus::Executed)
                .await
                .map_err(|e| CoreError::StateConflict(e.to_string()))?;
            self.audit
                .record(
                    ActorType::Engine,
                    "signal_executed",
                    &format!("signal {signal_id}: {} {} {}", signal.action, shares, signal.symbol),
                    "signal",
                    Some(signal_id),
                )
                .await?;
        }

        Ok(ProcessResult {
            status: if filled { "executed" } else { "not_filled" },
            signal_id,
            reason: result.message,
            order_id: Some(result.order_id),
            filled_price: result.filled_price.and_then(|p| p.to_f64()),
        })
    }

    async fn estimate_shares(&self, signal: &signal_engine::SignalRow) -> Result<f64, CoreError> {
        let Some(size_pct) = signal.size_pct else { return Ok(1.0) };
        let nav: f64 = sqlx::query("SELECT total_value FROM portfolio_values ORDER BY date DESC LIMIT 1")
            .fetch_optional(self.store.pool())
            .await
            .map_err(anyhow::Error::from)?
            .map(|r| r.get("total_value"))
            .unwrap_or(0.0);
        if nav <= 0.0 {
            return Ok(1.0);
        }
        let quote = self.pricing.get_price(&signal.symbol).await;
        if let Some(err) = quote.error {
            return Err(CoreError::UpstreamError(format!("price fetch for {} failed: {err}", signal.symbol)));
        }
        let price = quote.price.to_f64().unwrap_or(0.0);
        if price <= 0.0 {
            return Ok(1.0);
        }
        Ok((nav * size_pct / price).round().max(1.0))
    }

    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        let db_connected = sqlx::query("SELECT 1").execute(self.store.pool()).await.is_ok();
        let kill_switch_active = self.risk.is_kill_switch_active().await?;
        let pending_signals: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM signals WHERE status = 'pending'")
                .fetch_one(self.store.pool())
                .await?;
        let row = sqlx::query("SELECT total_value, cash FROM portfolio_values ORDER BY date DESC LIMIT 1")
            .fetch_optional(self.store.pool())
            .await?;

        Ok(SystemStatus {
            db_connected,
            kill_switch_active,
            pending_signals,
            portfolio_value: row.as_ref().map(|r| r.get("total_value")).unwrap_or(0.0),
            cash: row.as_ref().map(|r| r.get("cash")).unwrap_or(0.0),
            mode: match self.mode {
                Mode::Mock => "mock",
                Mode::Live => "live",
            },
        })
    }
}
