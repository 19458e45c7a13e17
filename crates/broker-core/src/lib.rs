//! Broker interface (spec C3). `MockBroker` (crate `mock-broker`) and
//! `LiveBroker` (crate `live-broker`) both implement this trait; callers
//! (the core orchestrator, the scheduler) depend only on `dyn Broker`,
//! mirroring `broker-trait::BrokerClient`'s role in the teacher workspace.

use anyhow::Result;
use async_trait::async_trait;
use moves_store::models::{OrderType, SignalAction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub cash: Decimal,
    pub total_value: Decimal,
    pub buying_power: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub shares: Decimal,
    pub side: String,
    pub average_cost: Decimal,
    pub current_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub action: SignalAction,
    pub shares: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub signal_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
    Rejected,
    Submitted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: FillStatus,
    pub filled_price: Option<Decimal>,
    pub filled_shares: Option<Decimal>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatusKind {
    Pending,
    Submitted,
    Filled,
    PartiallyFilled,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPreview {
    pub estimated_price: Decimal,
    pub estimated_cost: Decimal,
    pub commission: Decimal,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;
    async fn get_account_balance(&self) -> Result<AccountBalance>;
    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult>;
    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusKind>;
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;
    async fn preview_order(&self, order: OrderRequest) -> Result<OrderPreview>;
}

/// Lets callers hold a single `Arc<dyn Broker>` (the core orchestrator picks
/// mock vs. live once at startup) while still satisfying generic code like
/// `Reconciler<B: Broker>` that wants to own its broker by value.
#[async_trait]
impl Broker for std::sync::Arc<dyn Broker> {
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        (**self).get_positions().await
    }
    async fn get_account_balance(&self) -> Result<AccountBalance> {
        (**self).get_account_balance().await
    }
    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult> {
        (**self).place_order(order).await
    }
    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusKind> {
        (**self).get_order_status(order_id).await
    }
    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        (**self).cancel_order(order_id).await
    }
    async fn preview_order(&self, order: OrderRequest) -> Result<OrderPreview> {
        (**self).preview_order(order).await
    }
}
