//! Hypothetical outcome tracking for passed-on signals (spec C10), grounded
//! on `original_source/moves/engine/whatif.py`.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::prelude::*;
use sqlx::Row;
use thiserror::Error;

use moves_store::models::SignalAction;
use moves_store::Store;
use pricing_service::PricingService;

#[derive(Debug, Error)]
pub enum WhatIfError {
    #[error("decision must be 'rejected' or 'ignored', got '{0}'")]
    InvalidDecision(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WhatIfSummary {
    pub pass_accuracy: f64,
    pub reject_accuracy: f64,
    pub ignore_cost: f64,
    pub engagement_quality: f64,
    pub total_tracked: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WhatIfRecord {
    pub id: i64,
    pub signal_id: i64,
    pub symbol: String,
    pub action: String,
    pub decision: String,
    pub price_at_pass: f64,
    pub current_price: Option<f64>,
    pub hypothetical_pnl: Option<f64>,
    pub hypothetical_pnl_pct: Option<f64>,
}

pub struct WhatIfEngine {
    store: Store,
    pricing: Arc<PricingService>,
}

impl WhatIfEngine {
    pub fn new(store: Store, pricing: Arc<PricingService>) -> Self {
        Self { store, pricing }
    }

    pub async fn record_pass(&self, signal_id: i64, decision: &str, price_at_pass: f64) -> Result<(), WhatIfError> {
        if decision != "rejected" && decision != "ignored" {
            return Err(WhatIfError::InvalidDecision(decision.to_string()));
        }

        sqlx::query("INSERT INTO what_ifs (signal_id, decision, price_at_pass) VALUES (?, ?, ?)")
            .bind(signal_id)
            .bind(decision)
            .bind(price_at_pass)
            .execute(self.store.pool())
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// BUY/COVER: pnl = current - entry. SELL/SHORT: pnl = entry - current.
    fn hypothetical_pnl(action: SignalAction, entry: f64, current: f64) -> (f64, f64) {
        let pnl = match action {
            SignalAction::Buy | SignalAction::Cover => current - entry,
            SignalAction::Sell | SignalAction::Short => entry - current,
        };
        let pnl_pct = if entry > 0.0 { pnl / entry } else { 0.0 };
        (pnl, pnl_pct)
    }

    /// Refreshes every tracked what-if's current price and hypothetical P/L.
    /// A quote that resolves to zero (upstream failure) is skipped, leaving
    /// the previous snapshot in place.
    pub async fn update_all(&self) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT w.id, w.price_at_pass, s.symbol, s.action
             FROM what_ifs w JOIN signals s ON w.signal_id = s.id",
        )
        .fetch_all(self.store.pool())
        .await?;

        let mut updated = 0;
        for row in rows {
            let id: i64 = row.get("id");
            let price_at_pass: f64 = row.get("price_at_pass");
            let symbol: String = row.get("symbol");
            let action = SignalAction::from_str(&row.get::<String, _>("action")).unwrap_or(SignalAction::Buy);

            let quote = self.pricing.get_price(&symbol).await;
            let current_price = quote.price.to_f64().unwrap_or(0.0);
            if current_price <= 0.0 {
                continue;
            }

            let (pnl, pnl_pct) = Self::hypothetical_pnl(action, price_at_pass, current_price);
            sqlx::query(
                "UPDATE what_ifs SET current_price = ?, hypothetical_pnl = ?, hypothetical_pnl_pct = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%S', 'now')
                 WHERE id = ?",
            )
            .bind(current_price)
            .bind(pnl)
            .bind(pnl_pct)
            .bind(id)
            .execute(self.store.pool())
            .await?;
            updated += 1;
        }

        Ok(updated)
    }

    pub async fn get_summary(&self) -> Result<WhatIfSummary> {
        let rows = sqlx::query(
            "SELECT decision, hypothetical_pnl, hypothetical_pnl_pct FROM what_ifs
             WHERE hypothetical_pnl IS NOT NULL",
        )
        .fetch_all(self.store.pool())
        .await?;

        if rows.is_empty() {
            return Ok(WhatIfSummary::default());
        }

        let decisions: Vec<(String, f64, f64)> = rows
            .iter()
            .map(|r| {
                (
                    r.get::<String, _>("decision"),
                    r.get::<Option<f64>, _>("hypothetical_pnl").unwrap_or(0.0),
                    r.get::<Option<f64>, _>("hypothetical_pnl_pct").unwrap_or(0.0),
                )
            })
            .collect();

        let rejected: Vec<&(String, f64, f64)> = decisions.iter().filter(|(d, _, _)| d == "rejected").collect();
        let ignored: Vec<&(String, f64, f64)> = decisions.iter().filter(|(d, _, _)| d == "ignored").collect();

        let reject_accuracy = if rejected.is_empty() {
            0.0
        } else {
            rejected.iter().filter(|(_, pnl, _)| *pnl <= 0.0).count() as f64 / rejected.len() as f64
        };

        let pass_accuracy =
            decisions.iter().filter(|(_, pnl, _)| *pnl <= 0.0).count() as f64 / decisions.len() as f64;

        let ignore_cost = if ignored.is_empty() {
            0.0
        } else {
            ignored.iter().map(|(_, _, pct)| pct).sum::<f64>() / ignored.len() as f64
        };

        let ignore_accuracy = if ignored.is_empty() {
            0.0
        } else {
            ignored.iter().filter(|(_, pnl, _)| *pnl <= 0.0).count() as f64 / ignored.len() as f64
        };

        let engagement_quality =
            if !rejected.is_empty() && !ignored.is_empty() { reject_accuracy - ignore_accuracy } else { 0.0 };

        Ok(WhatIfSummary {
            pass_accuracy,
            reject_accuracy,
            ignore_cost,
            engagement_quality,
            total_tracked: decisions.len() as i64,
        })
    }

    pub async fn list_whatifs(&self, decision: Option<&str>) -> Result<Vec<WhatIfRecord>> {
        let query = match decision {
            Some(_) => {
                "SELECT w.id, w.signal_id, s.symbol, s.action, w.decision, w.price_at_pass,
                        w.current_price, w.hypothetical_pnl, w.hypothetical_pnl_pct
                 FROM what_ifs w JOIN signals s ON w.signal_id = s.id
                 WHERE w.decision = ? ORDER BY w.id DESC"
            }
            None => {
                "SELECT w.id, w.signal_id, s.symbol, s.action, w.decision, w.price_at_pass,
                        w.current_price, w.hypothetical_pnl, w.hypothetical_pnl_pct
                 FROM what_ifs w JOIN signals s ON w.signal_id = s.id ORDER BY w.id DESC"
            }
        };

        let mut q = sqlx::query(query);
        if let Some(decision) = decision {
            q = q.bind(decision);
        }
        let rows = q.fetch_all(self.store.pool()).await?;

        Ok(rows
            .into_iter()
            .map(|r| WhatIfRecord {
                id: r.get("id"),
                signal_id: r.get("signal_id"),
                symbol: r.get("symbol"),
                action: r.get("action"),
                decision: r.get("decision"),
                price_at_pass: r.get("price_at_pass"),
                current_price: r.get("current_price"),
                hypothetical_pnl: r.get("hypothetical_pnl"),
                hypothetical_pnl_pct: r.get("hypothetical_pnl_pct"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pricing_service::{Bar, Fundamentals, PriceError, Quote, QuoteSource, QuoteSourceKind};
    use rust_decimal::Decimal;

    struct FixedSource(Decimal);

    #[async_trait]
    impl QuoteSource for FixedSource {
        async fn fetch_quote(&self, symbol: &str) -> Result<Quote, PriceError> {
            Ok(Quote {
                symbol: symbol.to_string(),
                price: self.0,
                change: Decimal::ZERO,
                change_pct: 0.0,
                volume: 0,
                timestamp: chrono::Utc::now(),
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

    async fn setup(price: i64) -> (WhatIfEngine, Store) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let pricing = Arc::new(PricingService::new(Arc::new(FixedSource(Decimal::from(price)))));
        (WhatIfEngine::new(store.clone(), pricing), store)
    }

    async fn seed_signal(store: &Store, action: &str, symbol: &str) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO signals (action, symbol, confidence, source, status)
             VALUES (?, ?, 0.5, 'manual', 'rejected') RETURNING id",
        )
        .bind(action)
        .bind(symbol)
        .fetch_one(store.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_invalid_decision() {
        let (engine, _store) = setup(100).await;
        let result = engine.record_pass(1, "approved", 100.0).await;
        assert!(matches!(result, Err(WhatIfError::InvalidDecision(_))));
    }

    #[tokio::test]
    async fn buy_pnl_is_current_minus_entry() {
        let (engine, store) = setup(150).await;
        let signal_id = seed_signal(&store, "buy", "NVDA").await;
        engine.record_pass(signal_id, "rejected", 100.0).await.unwrap();

        let updated = engine.update_all().await.unwrap();
        assert_eq!(updated, 1);

        let records = engine.list_whatifs(None).await.unwrap();
        assert_eq!(records[0].hypothetical_pnl, Some(50.0));
        assert_eq!(records[0].hypothetical_pnl_pct, Some(0.5));
    }

    #[tokio::test]
    async fn sell_pnl_is_entry_minus_current() {
        let (engine, store) = setup(80).await;
        let signal_id = seed_signal(&store, "sell", "NVDA").await;
        engine.record_pass(signal_id, "ignored", 100.0).await.unwrap();
        engine.update_all().await.unwrap();

        let records = engine.list_whatifs(Some("ignored")).await.unwrap();
        assert_eq!(records[0].hypothetical_pnl, Some(20.0));
    }

    #[tokio::test]
    async fn summary_is_empty_with_no_tracked_records() {
        let (engine, _store) = setup(100).await;
        let summary = engine.get_summary().await.unwrap();
        assert_eq!(summary.total_tracked, 0);
        assert_eq!(summary.pass_accuracy, 0.0);
    }

    #[tokio::test]
    async fn reject_accuracy_counts_profitless_rejects() {
        let (engine, store) = setup(90).await;
        let losing = seed_signal(&store, "buy", "NVDA").await;
        engine.record_pass(losing, "rejected", 100.0).await.unwrap();
        engine.update_all().await.unwrap();

        let summary = engine.get_summary().await.unwrap();
        assert_eq!(summary.reject_accuracy, 1.0);
    }
}
