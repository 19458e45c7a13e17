use std::sync::Arc;

use async_trait::async_trait;
use moves_audit::AuditLog;
use moves_store::Store;
use pricing_service::{Bar, Fundamentals, PriceError, PricingService, Quote, QuoteSource, QuoteSourceKind};
use rust_decimal::Decimal;

use crate::earnings::EarningsCalendar;
use crate::manager::RiskManager;
use crate::models::TradeContext;

struct FixedSource {
    price: Decimal,
    sector: Option<String>,
}

#[async_trait]
impl QuoteSource for FixedSource {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, PriceError> {
        Ok(Quote {
            symbol: symbol.to_string(),
            price: self.price,
            change: Decimal::ZERO,
            change_pct: 0.0,
            volume: 1000,
            timestamp: chrono::Utc::now(),
            source: QuoteSourceKind::Primary,
            error: None,
        })
    }
    async fn fetch_history(&self, _: &str, _: &str) -> Result<Vec<Bar>, PriceError> {
        Ok(Vec::new())
    }
    async fn fetch_fundamentals(&self, symbol: &str) -> Result<Fundamentals, PriceError> {
        Ok(Fundamentals {
            symbol: symbol.to_string(),
            market_cap: None,
            pe_ratio: None,
            eps: None,
            sector: self.sector.clone(),
        })
    }
}

async fn seeded_manager(nav: f64) -> (RiskManager, Store) {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    sqlx::query(
        "INSERT INTO accounts (id, name, broker_label, account_type) VALUES (1, 'main', 'mock', 'individual')",
    )
    .execute(store.pool())
    .await
    .unwrap();
    sqlx::query("INSERT INTO portfolio_values (date, total_value, cash) VALUES (date('now'), ?, ?)")
        .bind(nav)
        .bind(nav)
        .execute(store.pool())
        .await
        .unwrap();

    let audit = AuditLog::new(store.clone());
    let source = Arc::new(FixedSource { price: Decimal::from(100), sector: None });
    let pricing = Arc::new(PricingService::new(source));
    let earnings = Arc::new(EarningsCalendar::empty());
    let manager = RiskManager::new(store.clone(), audit, pricing, earnings);
    manager.seed_default_limits().await.unwrap();
    (manager, store)
}

fn trade(symbol: &str, size_pct: f64, notional: i64) -> TradeContext {
    TradeContext {
        symbol: symbol.to_string(),
        sector: None,
        size_pct,
        signed_notional: Decimal::from(notional),
    }
}

#[tokio::test]
async fn kill_switch_blocks_everything() {
    let (manager, _store) = seeded_manager(100_000.0).await;
    manager.activate_kill_switch("manual halt").await.unwrap();

    let result = manager.pre_trade_check(1, &trade("NVDA", 0.05, 5000)).await.unwrap();
    assert!(!result.passed);
    assert_eq!(result.gate.as_deref(), Some("kill_switch"));
}

#[tokio::test]
async fn deactivating_kill_switch_restores_trading() {
    let (manager, _store) = seeded_manager(100_000.0).await;
    manager.activate_kill_switch("manual halt").await.unwrap();
    manager.deactivate_kill_switch().await.unwrap();
    assert!(!manager.is_kill_switch_active().await.unwrap());

    let result = manager.pre_trade_check(1, &trade("NVDA", 0.05, 5000)).await.unwrap();
    assert!(result.passed);
}

#[tokio::test]
async fn position_size_gate_rejects_oversized_trade() {
    let (manager, _store) = seeded_manager(100_000.0).await;
    let result = manager.pre_trade_check(1, &trade("NVDA", 0.5, 5000)).await.unwrap();
    assert!(!result.passed);
    assert_eq!(result.gate.as_deref(), Some("position_size"));
}

#[tokio::test]
async fn gate_order_reports_first_failure_only() {
    // Kill switch active AND position size too large: kill switch must win,
    // since it is gate 1 and short-circuits the rest.
    let (manager, _store) = seeded_manager(100_000.0).await;
    manager.activate_kill_switch("halt").await.unwrap();
    let result = manager.pre_trade_check(1, &trade("NVDA", 0.9, 90_000)).await.unwrap();
    assert_eq!(result.gate.as_deref(), Some("kill_switch"));
}

#[tokio::test]
async fn drawdown_gate_blocks_once_threshold_reached() {
    let (manager, store) = seeded_manager(100_000.0).await;
    // Drop NAV by 25%, past the default 20% max_drawdown.
    sqlx::query("INSERT INTO portfolio_values (date, total_value, cash) VALUES (date('now', '+1 day'), 75000, 75000)")
        .execute(store.pool())
        .await
        .unwrap();

    let result = manager.pre_trade_check(1, &trade("NVDA", 0.05, 1000)).await.unwrap();
    assert!(!result.passed);
    assert_eq!(result.gate.as_deref(), Some("drawdown"));
}

#[tokio::test]
async fn drawdown_is_monotone_in_peak() {
    let (manager, store) = seeded_manager(100_000.0).await;
    let first = manager.current_drawdown().await.unwrap();
    assert_eq!(first, 0.0);

    sqlx::query("INSERT INTO portfolio_values (date, total_value, cash) VALUES (date('now', '+1 day'), 90000, 90000)")
        .execute(store.pool())
        .await
        .unwrap();
    let second = manager.current_drawdown().await.unwrap();
    assert!(second > first);

    sqlx::query("INSERT INTO portfolio_values (date, total_value, cash) VALUES (date('now', '+2 day'), 110000, 110000)")
        .execute(store.pool())
        .await
        .unwrap();
    let third = manager.current_drawdown().await.unwrap();
    assert_eq!(third, 0.0);
}

#[tokio::test]
async fn trading_window_gate_blocks_outside_open_window() {
    let (manager, store) = seeded_manager(100_000.0).await;
    sqlx::query(
        "INSERT INTO trading_windows (symbol, opens_at, closes_at, reason)
         VALUES ('NVDA', '2000-01-01T00:00:00', '2000-01-01T00:00:01', 'earnings blackout test')",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let result = manager.pre_trade_check(1, &trade("NVDA", 0.05, 1000)).await.unwrap();
    assert!(!result.passed);
    assert_eq!(result.gate.as_deref(), Some("trading_window"));
}

#[tokio::test]
async fn exposure_is_side_signed() {
    let (manager, store) = seeded_manager(100_000.0).await;
    sqlx::query(
        "INSERT INTO positions (account_id, symbol, shares, average_cost, side, strategy)
         VALUES (1, 'NVDA', 100, 90, 'long', 'core'),
                (1, 'TSLA', 50, 200, 'short', 'core')",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let exposure = manager.calculate_exposure(1).await.unwrap();
    // FixedSource always quotes 100: long = 100*100 = 10000, short = 50*100 = 5000.
    assert_eq!(exposure.long_value, 10_000.0);
    assert_eq!(exposure.short_value, 5_000.0);
    assert_eq!(exposure.gross_value, 15_000.0);
    assert_eq!(exposure.net_value, 5_000.0);
}
