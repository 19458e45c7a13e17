//! Shared entity types (spec section 3). Money and share-quantity fields are
//! `Decimal` in the public structs; sqlite stores them as `REAL`, so each
//! money-bearing entity has a private `*Row` companion struct for `FromRow`
//! and a `From<Row>` conversion, mirroring the teacher's risk-manager models.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! db_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $(Self::$variant => $text),+
                };
                write!(f, "{s}")
            }
        }

        impl FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!(stringify!($name), " has no variant {}"), other)),
                }
            }
        }
    };
}

db_enum!(SignalAction { Buy => "buy", Sell => "sell", Short => "short", Cover => "cover" });

db_enum!(SignalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Ignored => "ignored",
    Executed => "executed",
    Cancelled => "cancelled",
});

db_enum!(SignalSource {
    ThesisUpdate => "thesis_update",
    NewsEvent => "news_event",
    CongressTrade => "congress_trade",
    PriceTrigger => "price_trigger",
    Manual => "manual",
    Rebalance => "rebalance",
});

db_enum!(ThesisStatus {
    Draft => "draft",
    Active => "active",
    Strengthening => "strengthening",
    Confirmed => "confirmed",
    Weakening => "weakening",
    Invalidated => "invalidated",
    Archived => "archived",
});

db_enum!(OrderType { Market => "market", Limit => "limit" });

db_enum!(OrderStatus {
    Pending => "pending",
    Submitted => "submitted",
    Filled => "filled",
    PartiallyFilled => "partially_filled",
    Rejected => "rejected",
    Cancelled => "cancelled",
});

db_enum!(ActorType { Engine => "engine", User => "user", Scheduler => "scheduler", Broker => "broker" });

db_enum!(PositionSide { Long => "long", Short => "short" });

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub broker_label: String,
    pub account_type: String,
    pub account_hash: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thesis {
    pub id: i64,
    pub title: String,
    pub narrative: String,
    pub strategy: String,
    pub status: ThesisStatus,
    pub symbols: Vec<String>,
    pub universe_keywords: Vec<String>,
    pub validation_criteria: Vec<String>,
    pub failure_criteria: Vec<String>,
    pub horizon: String,
    pub conviction: f64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThesisVersion {
    pub id: i64,
    pub thesis_id: i64,
    pub old_status: String,
    pub new_status: String,
    pub reason: String,
    pub evidence: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principle {
    pub id: i64,
    pub text: String,
    pub category: String,
    pub origin: String,
    pub validated_count: i64,
    pub invalidated_count: i64,
    pub weight: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub shares: Decimal,
    pub average_cost: Decimal,
    pub side: PositionSide,
    pub strategy: String,
    pub thesis_id: Option<i64>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct PositionRow {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub shares: f64,
    pub average_cost: f64,
    pub side: String,
    pub strategy: String,
    pub thesis_id: Option<i64>,
}

impl From<PositionRow> for Position {
    fn from(r: PositionRow) -> Self {
        Self {
            id: r.id,
            account_id: r.account_id,
            symbol: r.symbol,
            shares: Decimal::from_f64(r.shares).unwrap_or_default(),
            average_cost: Decimal::from_f64(r.average_cost).unwrap_or_default(),
            side: PositionSide::from_str(&r.side).unwrap_or(PositionSide::Long),
            strategy: r.strategy,
            thesis_id: r.thesis_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub id: i64,
    pub position_id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub shares: Decimal,
    pub cost_basis: Decimal,
    pub acquired_date: String,
    pub source: String,
    pub holding_period: String,
    pub closed_date: Option<String>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct LotRow {
    pub id: i64,
    pub position_id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub shares: f64,
    pub cost_basis: f64,
    pub acquired_date: String,
    pub source: String,
    pub holding_period: String,
    pub closed_date: Option<String>,
}

impl From<LotRow> for Lot {
    fn from(r: LotRow) -> Self {
        Self {
            id: r.id,
            position_id: r.position_id,
            account_id: r.account_id,
            symbol: r.symbol,
            shares: Decimal::from_f64(r.shares).unwrap_or_default(),
            cost_basis: Decimal::from_f64(r.cost_basis).unwrap_or_default(),
            acquired_date: r.acquired_date,
            source: r.source,
            holding_period: r.holding_period,
            closed_date: r.closed_date,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub action: SignalAction,
    pub shares: Decimal,
    pub price: Decimal,
    pub total_value: Decimal,
    pub fees: Decimal,
    pub broker_label: String,
    pub realized_pnl: Option<Decimal>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub action: SignalAction,
    pub order_type: OrderType,
    pub shares: Decimal,
    pub limit_price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_price: Option<Decimal>,
    pub filled_shares: Option<Decimal>,
    pub message: Option<String>,
    pub created_at: String,
    pub cancelled_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub action: SignalAction,
    pub symbol: String,
    pub thesis_id: Option<i64>,
    pub confidence: f64,
    pub source: SignalSource,
    pub horizon: String,
    pub status: SignalStatus,
    pub size_pct: Option<f64>,
    pub funding_plan: Option<String>,
    pub reasoning: String,
    pub created_at: String,
    pub decided_at: Option<String>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct SignalRow {
    pub id: i64,
    pub action: String,
    pub symbol: String,
    pub thesis_id: Option<i64>,
    pub confidence: f64,
    pub source: String,
    pub horizon: String,
    pub status: String,
    pub size_pct: Option<f64>,
    pub funding_plan: Option<String>,
    pub reasoning: String,
    pub created_at: String,
    pub decided_at: Option<String>,
}

impl From<SignalRow> for Signal {
    fn from(r: SignalRow) -> Self {
        Self {
            id: r.id,
            action: SignalAction::from_str(&r.action).unwrap_or(SignalAction::Buy),
            symbol: r.symbol,
            thesis_id: r.thesis_id,
            confidence: r.confidence,
            source: SignalSource::from_str(&r.source).unwrap_or(SignalSource::Manual),
            horizon: r.horizon,
            status: SignalStatus::from_str(&r.status).unwrap_or(SignalStatus::Pending),
            size_pct: r.size_pct,
            funding_plan: r.funding_plan,
            reasoning: r.reasoning,
            created_at: r.created_at,
            decided_at: r.decided_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatIf {
    pub id: i64,
    pub signal_id: i64,
    pub decision: String,
    pub price_at_pass: Decimal,
    pub current_price: Option<Decimal>,
    pub hypothetical_pnl: Option<Decimal>,
    pub hypothetical_pnl_pct: Option<f64>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioValue {
    pub date: String,
    pub total_value: Decimal,
    pub long_value: Decimal,
    pub short_value: Decimal,
    pub cash: Decimal,
    pub cost_basis: Decimal,
    pub daily_return_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureSnapshot {
    pub date: String,
    pub gross_value: Decimal,
    pub net_value: Decimal,
    pub long_value: Decimal,
    pub short_value: Decimal,
    pub by_sector: String,
    pub by_symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimit {
    pub limit_type: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownEvent {
    pub peak_date: String,
    pub peak_value: f64,
    pub trough_date: String,
    pub trough_value: f64,
    pub drawdown_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingWindow {
    pub id: i64,
    pub symbol: String,
    pub opens_at: String,
    pub closes_at: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub trigger_expr: String,
    pub status: String,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
    pub error_log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: ActorType,
    pub action: String,
    pub detail: String,
    pub entity_type: String,
    pub entity_id: Option<i64>,
    pub timestamp: String,
}

pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(&format!("{s}+0000"), "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
