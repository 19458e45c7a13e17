use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sqlx::Row;

use moves_audit::AuditLog;
use moves_store::models::{now_iso, ActorType};
use moves_store::Store;
use pricing_service::PricingService;

use crate::earnings::{EarningsSource, DEFAULT_WINDOW_DAYS};
use crate::models::{ExposureSummary, GateResult, RiskLimits, TradeContext};

/// Eight-gate pre-trade check plus exposure/drawdown/kill-switch bookkeeping
/// (spec 4.7), grounded on the teacher's `RiskManager` shape but rebuilt
/// against the new store schema and a live pricing source.
pub struct RiskManager {
    store: Store,
    audit: AuditLog,
    pricing: Arc<PricingService>,
    earnings: Arc<dyn EarningsSource>,
}

struct HeldPosition {
    symbol: String,
    shares: Decimal,
    average_cost: Decimal,
    side: String,
}

impl RiskManager {
    pub fn new(
        store: Store,
        audit: AuditLog,
        pricing: Arc<PricingService>,
        earnings: Arc<dyn EarningsSource>,
    ) -> Self {
        Self { store, audit, pricing, earnings }
    }

    pub async fn limits(&self) -> Result<RiskLimits> {
        let rows = sqlx::query("SELECT limit_type, value FROM risk_limits")
            .fetch_all(self.store.pool())
            .await?;

        let mut limits = RiskLimits::default();
        for row in rows {
            let limit_type: String = row.get("limit_type");
            let value: f64 = row.get("value");
            match limit_type.as_str() {
                "max_position_pct" => limits.max_position_pct = value,
                "max_sector_pct" => limits.max_sector_pct = value,
                "max_gross_exposure" => limits.max_gross_exposure = value,
                "net_exposure_min" => limits.net_exposure_min = value,
                "net_exposure_max" => limits.net_exposure_max = value,
                "max_drawdown" => limits.max_drawdown = value,
                "daily_loss_limit" => limits.daily_loss_limit = value,
                _ => {}
            }
        }
        Ok(limits)
    }

    /// Inserts the default limits for any key not already present; called
    /// once at startup so a fresh store has usable gates immediately.
    pub async fn seed_default_limits(&self) -> Result<()> {
        let defaults = RiskLimits::default();
        let pairs = [
            ("max_position_pct", defaults.max_position_pct),
            ("max_sector_pct", defaults.max_sector_pct),
            ("max_gross_exposure", defaults.max_gross_exposure),
            ("net_exposure_min", defaults.net_exposure_min),
            ("net_exposure_max", defaults.net_exposure_max),
            ("max_drawdown", defaults.max_drawdown),
            ("daily_loss_limit", defaults.daily_loss_limit),
        ];
        for (limit_type, value) in pairs {
            sqlx::query(
                "INSERT INTO risk_limits (limit_type, value) VALUES (?, ?)
                 ON CONFLICT(limit_type) DO NOTHING",
            )
            .bind(limit_type)
            .bind(value)
            .execute(self.store.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn is_kill_switch_active(&self) -> Result<bool> {
        let row = sqlx::query("SELECT active FROM kill_switch_history ORDER BY id DESC LIMIT 1")
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("active") != 0).unwrap_or(false))
    }

    /// Activation is an append row; the latest row defines the current state.
    pub async fn activate_kill_switch(&self, reason: &str) -> Result<()> {
        sqlx::query("INSERT INTO kill_switch_history (active, reason) VALUES (1, ?)")
            .bind(reason)
            .execute(self.store.pool())
            .await?;
        self.audit
            .record(ActorType::Engine, "kill_switch_activated", reason, "kill_switch", None)
            .await?;
        Ok(())
    }

    pub async fn deactivate_kill_switch(&self) -> Result<()> {
        sqlx::query("INSERT INTO kill_switch_history (active, reason) VALUES (0, '')")
            .execute(self.store.pool())
            .await?;
        self.audit
            .record(ActorType::Engine, "kill_switch_deactivated", "", "kill_switch", None)
            .await?;
        Ok(())
    }

    async fn held_positions(&self, account_id: i64) -> Result<Vec<HeldPosition>> {
        let rows = sqlx::query(
            "SELECT symbol, shares, average_cost, side FROM positions WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HeldPosition {
                symbol: row.get("symbol"),
                shares: Decimal::from_f64(row.get::<f64, _>("shares")).unwrap_or_default(),
                average_cost: Decimal::from_f64(row.get::<f64, _>("average_cost")).unwrap_or_default(),
                side: row.get("side"),
            })
            .collect())
    }

    /// Side-signed {long, short, gross, net} across all positions, valued at
    /// the current quote and falling back to average cost when the quote
    /// source reports no price (spec 4.7).
    pub async fn calculate_exposure(&self, account_id: i64) -> Result<ExposureSummary> {
        let positions = self.held_positions(account_id).await?;

        let mut long_value = Decimal::ZERO;
        let mut short_value = Decimal::ZERO;
        for position in &positions {
            let quote = self.pricing.get_price(&position.symbol).await;
            let price = if quote.price > Decimal::ZERO { quote.price } else { position.average_cost };
            let value = position.shares * price;
            if position.side == "short" {
                short_value += value;
            } else {
                long_value += value;
            }
        }

        Ok(ExposureSummary {
            long_value: long_value.to_f64().unwrap_or(0.0),
            short_value: short_value.to_f64().unwrap_or(0.0),
            gross_value: (long_value + short_value).to_f64().unwrap_or(0.0),
            net_value: (long_value - short_value).to_f64().unwrap_or(0.0),
        })
    }

    /// Sums the current value of held positions whose fundamentals resolve
    /// to the given sector. Positions the pricing source can't classify are
    /// excluded, matching the conservative "no sector, no gate" reading.
    async fn sector_exposure(&self, account_id: i64, sector: &str) -> Result<f64> {
        let positions = self.held_positions(account_id).await?;
        let mut total = 0.0_f64;
        for position in &positions {
            let Some(fundamentals) = self.pricing.get_fundamentals(&position.symbol).await else {
                continue;
            };
            if fundamentals.sector.as_deref() != Some(sector) {
                continue;
            }
            let quote = self.pricing.get_price(&position.symbol).await;
            let price = if quote.price > Decimal::ZERO { quote.price } else { position.average_cost };
            total += (position.shares * price).to_f64().unwrap_or(0.0).abs();
        }
        Ok(total)
    }

    /// drawdown = (peak - current) / peak over recorded `portfolio_values`,
    /// peak being the running maximum through the latest snapshot.
    pub async fn current_drawdown(&self) -> Result<f64> {
        let rows = sqlx::query("SELECT total_value FROM portfolio_values ORDER BY date ASC")
            .fetch_all(self.store.pool())
            .await?;

        let mut peak = 0.0_f64;
        let mut current = 0.0_f64;
        for row in rows {
            let value: f64 = row.get("total_value");
            peak = peak.max(value);
            current = value;
        }

        if peak <= 0.0 {
            return Ok(0.0);
        }
        Ok(((peak - current) / peak).max(0.0))
    }

    async fn trading_window_allows(&self, symbol: &str) -> Result<bool> {
        let rows = sqlx::query("SELECT opens_at, closes_at FROM trading_windows WHERE symbol = ?")
            .bind(symbol)
            .fetch_all(self.store.pool())
            .await?;

        if rows.is_empty() {
            return Ok(true);
        }

        let now = now_iso();
        Ok(rows.iter().any(|row| {
            let opens_at: String = row.get("opens_at");
            let closes_at: String = row.get("closes_at");
            now.as_str() >= opens_at.as_str() && now.as_str() <= closes_at.as_str()
        }))
    }

    async fn nav(&self) -> Result<f64> {
        let row = sqlx::query("SELECT total_value FROM portfolio_values ORDER BY date DESC LIMIT 1")
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row.map(|r| r.get("total_value")).unwrap_or(0.0))
    }

    /// Runs the eight gates in spec order, short-circuiting on first failure.
    pub async fn pre_trade_check(
        &self,
        account_id: i64,
        trade: &TradeContext,
    ) -> Result<GateResult> {
        if self.is_kill_switch_active().await? {
            return Ok(GateResult::fail("kill_switch", "Kill switch is active"));
        }

        let limits = self.limits().await?;

        if trade.size_pct > limits.max_position_pct {
            return Ok(GateResult::fail(
                "position_size",
                format!(
                    "size_pct {:.4} exceeds max_position_pct {:.4}",
                    trade.size_pct, limits.max_position_pct
                ),
            ));
        }

        let nav = self.nav().await?.max(1.0);
        let notional = trade.signed_notional.to_f64().unwrap_or(0.0);

        if let Some(sector) = &trade.sector {
            let sector_value = self.sector_exposure(account_id, sector).await?;
            let projected = (sector_value + notional.abs()) / nav;
            if projected > limits.max_sector_pct {
                return Ok(GateResult::fail(
                    "sector_concentration",
                    format!(
                        "projected sector exposure {:.4} exceeds max_sector_pct {:.4}",
                        projected, limits.max_sector_pct
                    ),
                ));
            }
        }

        let exposure = self.calculate_exposure(account_id).await?;

        let gross_projected = (exposure.gross_value + notional.abs()) / nav;
        if gross_projected > limits.max_gross_exposure {
            return Ok(GateResult::fail(
                "gross_exposure",
                format!(
                    "projected gross exposure {:.4} exceeds max_gross_exposure {:.4}",
                    gross_projected, limits.max_gross_exposure
                ),
            ));
        }

        let net_projected = (exposure.net_value + notional) / nav;
        if net_projected < limits.net_exposure_min || net_projected > limits.net_exposure_max {
            return Ok(GateResult::fail(
                "net_exposure",
                format!(
                    "projected net exposure {:.4} outside [{:.4}, {:.4}]",
                    net_projected, limits.net_exposure_min, limits.net_exposure_max
                ),
            ));
        }

        let drawdown = self.current_drawdown().await?;
        if drawdown >= limits.max_drawdown {
            return Ok(GateResult::fail(
                "drawdown",
                format!(
                    "current drawdown {:.4} has reached max_drawdown {:.4}",
                    drawdown, limits.max_drawdown
                ),
            ));
        }

        if !self.trading_window_allows(&trade.symbol).await? {
            return Ok(GateResult::fail(
                "trading_window",
                format!("{} has no open trading window right now", trade.symbol),
            ));
        }

        let today = Utc::now().date_naive();
        if self.earnings.is_earnings_imminent(&trade.symbol, DEFAULT_WINDOW_DAYS, today) {
            return Ok(GateResult::fail(
                "earnings_proximity",
                format!("{} has earnings within the blocking window", trade.symbol),
            ));
        }

        Ok(GateResult::pass())
    }
}
