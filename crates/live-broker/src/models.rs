use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct SchwabAccount {
    pub cash_balance: Decimal,
    pub liquidation_value: Decimal,
    pub buying_power: Decimal,
    #[serde(default)]
    pub positions: Vec<SchwabPosition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchwabPosition {
    pub symbol: String,
    pub long_quantity: Decimal,
    pub short_quantity: Decimal,
    pub average_price: Decimal,
    pub market_value: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchwabOrderRequest {
    #[serde(rename = "orderType")]
    pub order_type: String,
    pub session: String,
    pub duration: String,
    #[serde(rename = "orderStrategyType")]
    pub order_strategy_type: String,
    #[serde(rename = "orderLegCollection")]
    pub order_leg_collection: Vec<SchwabOrderLeg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchwabOrderLeg {
    pub instruction: String,
    pub quantity: Decimal,
    pub instrument: SchwabInstrument,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchwabInstrument {
    pub symbol: String,
    #[serde(rename = "assetType")]
    pub asset_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchwabOrderStatusResponse {
    pub status: String,
    #[serde(default, rename = "filledQuantity")]
    pub filled_quantity: Decimal,
    #[serde(default, rename = "orderActivityCollection")]
    pub order_activity_collection: Vec<SchwabOrderActivity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchwabOrderActivity {
    #[serde(default, rename = "executionLegs")]
    pub execution_legs: Vec<SchwabExecutionLeg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchwabExecutionLeg {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchwabTokenResponse {
    pub access_token: String,
    pub expires_in: u64,
}
