//! Live execution against the Schwab trading API (spec section 6). Module
//! layout and the bearer-token request style mirror `alpaca-broker`; OAuth2
//! client-credentials-plus-refresh-token handling and order-status string
//! mapping are this crate's own contribution, since the teacher's broker
//! adapters use static API keys rather than a refresh flow.

pub mod client;
pub mod models;

pub use client::SchwabClient;

use anyhow::Result;
use async_trait::async_trait;
use broker_core::{
    AccountBalance, Broker, BrokerPosition, FillStatus, OrderPreview, OrderRequest, OrderResult,
    OrderStatusKind,
};
use moves_store::models::SignalAction;
use rust_decimal::Decimal;

pub struct LiveBroker {
    client: SchwabClient,
}

impl LiveBroker {
    pub fn new(client: SchwabClient) -> Self {
        Self { client }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(SchwabClient::from_env()?))
    }

    /// Polls `get_order_fill` up to 5 times, 500ms apart, waiting for a
    /// terminal status (Filled/PartiallyFilled/Rejected/Cancelled). Returns
    /// the last read even if the order is still working when attempts run out.
    async fn poll_fill(&self, order_id: &str) -> Result<(OrderStatusKind, Decimal, Option<Decimal>)> {
        let mut last = (OrderStatusKind::Submitted, Decimal::ZERO, None);
        for attempt in 0..5 {
            last = self.client.get_order_fill(order_id).await?;
            if matches!(
                last.0,
                OrderStatusKind::Filled
                    | OrderStatusKind::PartiallyFilled
                    | OrderStatusKind::Rejected
                    | OrderStatusKind::Cancelled
            ) {
                break;
            }
            if attempt < 4 {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
        Ok(last)
    }
}

#[async_trait]
impl Broker for LiveBroker {
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let account = self.client.get_account().await?;
        Ok(account
            .positions
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.symbol,
                shares: p.long_quantity - p.short_quantity,
                side: if p.long_quantity >= p.short_quantity { "long" } else { "short" }.to_string(),
                average_cost: p.average_price,
                current_price: p.market_value,
            })
            .collect())
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        let account = self.client.get_account().await?;
        Ok(AccountBalance {
            cash: account.cash_balance,
            total_value: account.liquidation_value,
            buying_power: account.buying_power,
        })
    }

    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult> {
        let instruction = match order.action {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Short => "SELL_SHORT",
            SignalAction::Cover => "BUY_TO_COVER",
        };
        let order_id = self
            .client
            .submit_order(&order.symbol, instruction, order.shares, order.limit_price)
            .await?;

        // Schwab doesn't hand back fill details in the submission response;
        // poll briefly for the order to reach a terminal status before
        // reporting back whatever we have.
        let (status, filled_qty, avg_price) = self.poll_fill(&order_id).await?;

        Ok(OrderResult {
            order_id,
            status: map_fill_status(status),
            filled_price: avg_price,
            filled_shares: if filled_qty > Decimal::ZERO { Some(filled_qty) } else { None },
            message: None,
        })
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusKind> {
        self.client.get_order_status(order_id).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.client.cancel_order(order_id).await?;
        Ok(true)
    }

    async fn preview_order(&self, order: OrderRequest) -> Result<OrderPreview> {
        let account = self.client.get_account().await?;
        let quote = self.client.get_quote(&order.symbol).await.unwrap_or(Decimal::ZERO);
        Ok(OrderPreview {
            estimated_price: quote,
            estimated_cost: quote * order.shares,
            commission: Decimal::ZERO,
            warnings: if account.cash_balance < quote * order.shares {
                vec!["estimated cost exceeds cash balance".to_string()]
            } else {
                Vec::new()
            },
        })
    }
}

fn map_fill_status(status: OrderStatusKind) -> FillStatus {
    match status {
        OrderStatusKind::Filled => FillStatus::Filled,
        OrderStatusKind::PartiallyFilled => FillStatus::PartiallyFilled,
        OrderStatusKind::Rejected | OrderStatusKind::Cancelled => FillStatus::Rejected,
        OrderStatusKind::Pending | OrderStatusKind::Submitted => FillStatus::Submitted,
    }
}

/// Maps Schwab's order-status vocabulary onto the shared enum (spec section 6:
/// `FILLED`, `CANCELED -> CANCELLED`, `REJECTED`, `WORKING -> SUBMITTED`).
pub fn map_schwab_status(raw: &str) -> OrderStatusKind {
    match raw {
        "FILLED" => OrderStatusKind::Filled,
        "CANCELED" => OrderStatusKind::Cancelled,
        "REJECTED" => OrderStatusKind::Rejected,
        "WORKING" | "QUEUED" | "ACCEPTED" => OrderStatusKind::Submitted,
        "PENDING_ACTIVATION" => OrderStatusKind::Pending,
        _ => OrderStatusKind::Submitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_schwab_statuses() {
        assert_eq!(map_schwab_status("FILLED"), OrderStatusKind::Filled);
        assert_eq!(map_schwab_status("CANCELED"), OrderStatusKind::Cancelled);
        assert_eq!(map_schwab_status("WORKING"), OrderStatusKind::Submitted);
        assert_eq!(map_schwab_status("REJECTED"), OrderStatusKind::Rejected);
    }
}
