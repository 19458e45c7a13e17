//! Simulated broker with lot-level FIFO accounting (spec C3, the hard part
//! of the component design). Fills are instant at the `PricingService`'s
//! current cached price, as the original Python `MockBroker` does with
//! yfinance prices; every fill is one transaction covering trade + position
//! + lot + cash, grounded on `portfolio-manager::trades::TradeLogger`'s
//! pattern of wrapping related writes in a single `sqlx` call chain.

pub mod tests_scenarios;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_core::{
    AccountBalance, Broker, BrokerPosition, FillStatus, OrderPreview, OrderRequest, OrderResult,
    OrderStatusKind,
};
use chrono::Utc;
use moves_audit::AuditLog;
use moves_store::models::{now_iso, ActorType, SignalAction};
use pricing_service::PricingService;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sqlx::Row;

pub struct MockBroker {
    store: moves_store::Store,
    pricing: Arc<PricingService>,
    audit: AuditLog,
    account_id: i64,
}

impl MockBroker {
    pub fn new(
        store: moves_store::Store,
        pricing: Arc<PricingService>,
        audit: AuditLog,
        account_id: i64,
    ) -> Self {
        Self {
            store,
            pricing,
            audit,
            account_id,
        }
    }

    async fn current_cash(&self) -> Result<Decimal> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT cash FROM portfolio_values ORDER BY date DESC LIMIT 1")
                .fetch_optional(self.store.pool())
                .await?;
        Ok(row.map(|(c,)| Decimal::from_f64(c).unwrap_or_default()).unwrap_or_default())
    }

    async fn current_total(&self) -> Result<Decimal> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT total_value FROM portfolio_values ORDER BY date DESC LIMIT 1")
                .fetch_optional(self.store.pool())
                .await?;
        Ok(row.map(|(c,)| Decimal::from_f64(c).unwrap_or_default()).unwrap_or_default())
    }

    async fn set_cash<'a>(&self, tx: &mut sqlx::Transaction<'a, sqlx::Sqlite>, new_cash: Decimal, cash_delta: Decimal) -> Result<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let new_total = (self.current_total().await? + cash_delta)
            .to_f64()
            .unwrap_or(0.0);
        sqlx::query(
            r#"
            INSERT INTO portfolio_values (date, total_value, cash)
            VALUES (?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET cash = excluded.cash, total_value = excluded.total_value
            "#,
        )
        .bind(&today)
        .bind(new_total)
        .bind(new_cash.to_f64().unwrap_or(0.0))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn find_open_position<'a>(
        &self,
        tx: &mut sqlx::Transaction<'a, sqlx::Sqlite>,
        symbol: &str,
        side: &str,
    ) -> Result<Option<(i64, Decimal, Decimal)>> {
        let row = sqlx::query(
            "SELECT id, shares, average_cost FROM positions WHERE account_id = ? AND symbol = ? AND side = ?",
        )
        .bind(self.account_id)
        .bind(symbol)
        .bind(side)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|r| {
            let id: i64 = r.get("id");
            let shares: f64 = r.get("shares");
            let avg: f64 = r.get("average_cost");
            (id, Decimal::from_f64(shares).unwrap_or_default(), Decimal::from_f64(avg).unwrap_or_default())
        }))
    }

    /// Buy (open/add to long) or short (open/add to short), both opening new
    /// lots at the fill price.
    async fn open(
        &self,
        symbol: &str,
        shares: Decimal,
        side: &str,
        signal_id: Option<i64>,
    ) -> Result<OrderResult> {
        if shares <= Decimal::ZERO {
            return Ok(reject("shares must be positive"));
        }

        let quote = self.pricing.get_price(symbol).await;
        if quote.price <= Decimal::ZERO {
            return Ok(reject("price unavailable"));
        }
        let price = quote.price;
        let notional = shares * price;

        if side == "long" {
            let cash = self.current_cash().await?;
            if notional > cash {
                return Ok(reject("Insufficient cash"));
            }
        }

        let mut tx = self.store.transaction().await?;
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let existing = self.find_open_position(&mut tx, symbol, side).await?;
        let position_id = match existing {
            Some((id, old_shares, old_avg)) => {
                let new_shares = old_shares + shares;
                let new_avg = if new_shares > Decimal::ZERO {
                    (old_shares * old_avg + shares * price) / new_shares
                } else {
                    price
                };
                sqlx::query("UPDATE positions SET shares = ?, average_cost = ?, updated_at = ? WHERE id = ?")
                    .bind(new_shares.to_f64().unwrap_or(0.0))
                    .bind(new_avg.to_f64().unwrap_or(0.0))
                    .bind(now_iso())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO positions (account_id, symbol, shares, average_cost, side)
                    VALUES (?, ?, ?, ?, ?)
                    RETURNING id
                    "#,
                )
                .bind(self.account_id)
                .bind(symbol)
                .bind(shares.to_f64().unwrap_or(0.0))
                .bind(price.to_f64().unwrap_or(0.0))
                .bind(side)
                .fetch_one(&mut *tx)
                .await?;
                id
            }
        };

        sqlx::query(
            r#"
            INSERT INTO lots (position_id, account_id, symbol, shares, cost_basis, acquired_date, source, holding_period)
            VALUES (?, ?, ?, ?, ?, ?, 'trade', 'short')
            "#,
        )
        .bind(position_id)
        .bind(self.account_id)
        .bind(symbol)
        .bind(shares.to_f64().unwrap_or(0.0))
        .bind((shares * price).to_f64().unwrap_or(0.0))
        .bind(&today)
        .execute(&mut *tx)
        .await?;

        let action = if side == "long" { SignalAction::Buy } else { SignalAction::Short };
        sqlx::query(
            r#"
            INSERT INTO trades (signal_id, symbol, action, shares, price, total_value, fees, broker_label, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, 0, 'mock', ?)
            "#,
        )
        .bind(signal_id)
        .bind(symbol)
        .bind(action.to_string())
        .bind(shares.to_f64().unwrap_or(0.0))
        .bind(price.to_f64().unwrap_or(0.0))
        .bind(notional.to_f64().unwrap_or(0.0))
        .bind(now_iso())
        .execute(&mut *tx)
        .await?;

        // Buying consumes cash; shorting raises cash by the sale proceeds.
        let cash_delta = if side == "long" { -notional } else { notional };
        let new_cash = self.current_cash().await? + cash_delta;
        self.set_cash(&mut tx, new_cash, cash_delta).await?;

        moves_audit::AuditLog::record_tx(
            &mut tx,
            ActorType::Broker,
            "trade_filled",
            &format!("{action} {shares} {symbol} @ {price}"),
            "trade",
            Some(position_id),
        )
        .await?;

        tx.commit().await?;

        Ok(OrderResult {
            order_id: position_id.to_string(),
            status: FillStatus::Filled,
            filled_price: Some(price),
            filled_shares: Some(shares),
            message: None,
        })
    }

    /// Sell (close long, FIFO) or cover (close short, FIFO).
    async fn close(
        &self,
        symbol: &str,
        shares: Decimal,
        side: &str,
        signal_id: Option<i64>,
    ) -> Result<OrderResult> {
        if shares <= Decimal::ZERO {
            return Ok(reject("shares must be positive"));
        }

        let mut tx = self.store.transaction().await?;

        let existing = self.find_open_position(&mut tx, symbol, side).await?;
        let (position_id, position_shares) = match existing {
            Some((id, pos_shares, _)) if pos_shares >= shares => (id, pos_shares),
            _ => {
                tx.rollback().await.ok();
                return Ok(reject("insufficient shares"));
            }
        };

        let quote = self.pricing.get_price(symbol).await;
        if quote.price <= Decimal::ZERO {
            tx.rollback().await.ok();
            return Ok(reject("price unavailable"));
        }
        let price = quote.price;

        let lot_rows = sqlx::query(
            "SELECT id, shares, cost_basis FROM lots WHERE position_id = ? AND shares > 0
             ORDER BY acquired_date ASC, id ASC",
        )
        .bind(position_id)
        .fetch_all(&mut *tx)
        .await?;

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut remaining = shares;
        let mut realized_pnl = Decimal::ZERO;

        for row in lot_rows {
            if remaining <= Decimal::ZERO {
                break;
            }
            let lot_id: i64 = row.get("id");
            let lot_shares = Decimal::from_f64(row.get::<f64, _>("shares")).unwrap_or_default();
            let lot_cost_basis = Decimal::from_f64(row.get::<f64, _>("cost_basis")).unwrap_or_default();
            let lot_cost_per_share = if lot_shares > Decimal::ZERO {
                lot_cost_basis / lot_shares
            } else {
                Decimal::ZERO
            };

            let consume = remaining.min(lot_shares);
            let new_lot_shares = lot_shares - consume;
            let new_cost_basis = lot_cost_per_share * new_lot_shares;

            let pnl_per_unit = if side == "long" {
                price - lot_cost_per_share
            } else {
                lot_cost_per_share - price
            };
            realized_pnl += consume * pnl_per_unit;

            if new_lot_shares <= Decimal::ZERO {
                sqlx::query("UPDATE lots SET shares = 0, cost_basis = 0, closed_date = ? WHERE id = ?")
                    .bind(&today)
                    .bind(lot_id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query("UPDATE lots SET shares = ?, cost_basis = ? WHERE id = ?")
                    .bind(new_lot_shares.to_f64().unwrap_or(0.0))
                    .bind(new_cost_basis.to_f64().unwrap_or(0.0))
                    .bind(lot_id)
                    .execute(&mut *tx)
                    .await?;
            }

            remaining -= consume;
        }

        let new_position_shares = position_shares - shares;
        sqlx::query("UPDATE positions SET shares = ?, updated_at = ? WHERE id = ?")
            .bind(new_position_shares.to_f64().unwrap_or(0.0))
            .bind(now_iso())
            .bind(position_id)
            .execute(&mut *tx)
            .await?;

        let action = if side == "long" { SignalAction::Sell } else { SignalAction::Cover };
        let notional = shares * price;
        sqlx::query(
            r#"
            INSERT INTO trades (signal_id, symbol, action, shares, price, total_value, fees, broker_label, realized_pnl, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, 0, 'mock', ?, ?)
            "#,
        )
        .bind(signal_id)
        .bind(symbol)
        .bind(action.to_string())
        .bind(shares.to_f64().unwrap_or(0.0))
        .bind(price.to_f64().unwrap_or(0.0))
        .bind(notional.to_f64().unwrap_or(0.0))
        .bind(realized_pnl.to_f64().unwrap_or(0.0))
        .bind(now_iso())
        .execute(&mut *tx)
        .await?;

        // Selling raises cash; covering a short consumes it.
        let cash_delta = if side == "long" { notional } else { -notional };
        let new_cash = self.current_cash().await? + cash_delta;
        self.set_cash(&mut tx, new_cash, cash_delta).await?;

        moves_audit::AuditLog::record_tx(
            &mut tx,
            ActorType::Broker,
            "trade_filled",
            &format!("{action} {shares} {symbol} @ {price} pnl={realized_pnl}"),
            "trade",
            Some(position_id),
        )
        .await?;

        tx.commit().await?;

        Ok(OrderResult {
            order_id: position_id.to_string(),
            status: FillStatus::Filled,
            filled_price: Some(price),
            filled_shares: Some(shares),
            message: None,
        })
    }
}

fn reject(reason: &str) -> OrderResult {
    OrderResult {
        order_id: String::new(),
        status: FillStatus::Rejected,
        filled_price: None,
        filled_shares: None,
        message: Some(reason.to_string()),
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let rows = sqlx::query(
            "SELECT symbol, shares, side, average_cost FROM positions WHERE account_id = ? AND shares > 0",
        )
        .bind(self.account_id)
        .fetch_all(self.store.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let symbol: String = row.get("symbol");
            let shares = Decimal::from_f64(row.get::<f64, _>("shares")).unwrap_or_default();
            let average_cost = Decimal::from_f64(row.get::<f64, _>("average_cost")).unwrap_or_default();
            let quote = self.pricing.get_price(&symbol).await;
            out.push(BrokerPosition {
                symbol,
                shares,
                side: row.get("side"),
                average_cost,
                current_price: quote.price,
            });
        }
        Ok(out)
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        let cash = self.current_cash().await?;
        let total = self.current_total().await?;
        Ok(AccountBalance {
            cash,
            total_value: total,
            buying_power: cash,
        })
    }

    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult> {
        match order.action {
            SignalAction::Buy => self.open(&order.symbol, order.shares, "long", order.signal_id).await,
            SignalAction::Short => self.open(&order.symbol, order.shares, "short", order.signal_id).await,
            SignalAction::Sell => self.close(&order.symbol, order.shares, "long", order.signal_id).await,
            SignalAction::Cover => self.close(&order.symbol, order.shares, "short", order.signal_id).await,
        }
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusKind> {
        let id: i64 = order_id
            .parse()
            .map_err(|_| anyhow!("invalid order id"))?;
        let row: Option<(f64,)> = sqlx::query_as("SELECT shares FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(match row {
            Some(_) => OrderStatusKind::Filled,
            None => OrderStatusKind::Rejected,
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
        // Mock fills are instant; there is never a pending order to cancel.
        Ok(false)
    }

    async fn preview_order(&self, order: OrderRequest) -> Result<OrderPreview> {
        let quote = self.pricing.get_price(&order.symbol).await;
        let mut warnings = Vec::new();
        if quote.price <= Decimal::ZERO {
            warnings.push("price unavailable".to_string());
        }
        Ok(OrderPreview {
            estimated_price: quote.price,
            estimated_cost: order.shares * quote.price,
            commission: Decimal::ZERO,
            warnings,
        })
    }
}
