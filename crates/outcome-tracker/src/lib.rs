//! Realised-return vs. stated-conviction scoring for theses (spec C11).
//! No `original_source/moves/engine/outcome_tracker.py` file is present in
//! the retrieved pack (only `api/routes/outcomes.py` and
//! `tests/test_outcome_tracker.py` are) — the calibration curve and period
//! bucketing below are reconstructed from the test file's assertions rather
//! than ported line-for-line; see DESIGN.md.

use anyhow::Result;
use rust_decimal::prelude::*;
use serde::Serialize;
use sqlx::Row;

use moves_store::models::ThesisStatus;
use moves_store::Store;
use pricing_service::PricingService;
use std::sync::Arc;

fn is_live(status: ThesisStatus) -> bool {
    matches!(
        status,
        ThesisStatus::Active | ThesisStatus::Strengthening | ThesisStatus::Weakening | ThesisStatus::Confirmed
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolReturn {
    pub symbol: String,
    pub baseline_price: f64,
    pub current_price: f64,
    pub return_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThesisScorecard {
    pub thesis_id: i64,
    pub title: String,
    pub conviction: f64,
    pub avg_return_pct: f64,
    pub best: Option<SymbolReturn>,
    pub worst: Option<SymbolReturn>,
    pub calibration_score: f64,
    pub symbol_returns: Vec<SymbolReturn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeSnapshotRow {
    pub id: i64,
    pub thesis_id: i64,
    pub date: String,
    pub avg_return_pct: f64,
    pub best_symbol: Option<String>,
    pub best_return_pct: Option<f64>,
    pub worst_symbol: Option<String>,
    pub worst_return_pct: Option<f64>,
    pub calibration_score: f64,
    pub symbol_count: i64,
}

pub struct OutcomeTracker {
    store: Store,
    pricing: Arc<PricingService>,
}

impl OutcomeTracker {
    pub fn new(store: Store, pricing: Arc<PricingService>) -> Self {
        Self { store, pricing }
    }

    /// Conviction-weighted, direction-clamped score in [0, 100]. Conviction
    /// is the thesis's [0, 1] field; `return_pct` is a percentage (5.0 means
    /// 5%). A thesis that called its direction right scores above 50 in
    /// proportion to its stated conviction; called wrong, below 50.
    fn compute_calibration(conviction: f64, return_pct: f64) -> f64 {
        let direction = if return_pct > 0.0 {
            1.0
        } else if return_pct < 0.0 {
            -1.0
        } else {
            0.0
        };
        let magnitude = (return_pct.abs() / 20.0).min(1.0);
        let score = 50.0 + (conviction - 0.5) * 100.0 * direction * magnitude;
        score.clamp(0.0, 100.0)
    }

    /// Buckets a lookback window into the nearest history period coarse
    /// enough to cover it, matching `pricing_service::HISTORY_PERIODS`.
    fn days_to_period(days: i64) -> &'static str {
        match days {
            d if d <= 5 => "5d",
            d if d <= 30 => "1mo",
            d if d <= 90 => "3mo",
            d if d <= 180 => "6mo",
            d if d <= 365 => "1y",
            d if d <= 730 => "2y",
            d if d <= 1825 => "5y",
            _ => "max",
        }
    }

    async fn baseline_price(&self, symbol: &str, as_of: &str) -> Option<f64> {
        sqlx::query("SELECT close FROM price_history WHERE symbol = ? AND timestamp <= ? ORDER BY timestamp DESC LIMIT 1")
            .bind(symbol)
            .bind(as_of)
            .fetch_optional(self.store.pool())
            .await
            .ok()
            .flatten()
            .map(|row| row.get::<f64, _>("close"))
    }

    pub async fn score_thesis(&self, thesis_id: i64) -> Result<Option<ThesisScorecard>> {
        let row = sqlx::query(
            "SELECT id, title, status, symbols, conviction, created_at FROM theses WHERE id = ?",
        )
        .bind(thesis_id)
        .fetch_optional(self.store.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };

        let status: String = row.get("status");
        if !is_live(status.parse().unwrap_or(ThesisStatus::Draft)) {
            return Ok(None);
        }

        let title: String = row.get("title");
        let conviction: f64 = row.get("conviction");
        let created_at: String = row.get("created_at");
        let symbols: Vec<String> = serde_json::from_str(row.get("symbols")).unwrap_or_default();

        let mut symbol_returns = Vec::new();
        for symbol in &symbols {
            let Some(baseline) = self.baseline_price(symbol, &created_at).await else { continue };
            if baseline <= 0.0 {
                continue;
            }
            let quote = self.pricing.get_price(symbol).await;
            let current = quote.price.to_f64().unwrap_or(0.0);
            if current <= 0.0 {
                continue;
            }
            let return_pct = (current - baseline) / baseline * 100.0;
            symbol_returns.push(SymbolReturn {
                symbol: symbol.clone(),
                baseline_price: baseline,
                current_price: current,
                return_pct,
            });
        }

        if symbol_returns.is_empty() {
            return Ok(Some(ThesisScorecard {
                thesis_id,
                title,
                conviction,
                avg_return_pct: 0.0,
                best: None,
                worst: None,
                calibration_score: Self::compute_calibration(conviction, 0.0),
                symbol_returns,
            }));
        }

        let avg_return_pct =
            symbol_returns.iter().map(|s| s.return_pct).sum::<f64>() / symbol_returns.len() as f64;

        let best = symbol_returns
            .iter()
            .max_by(|a, b| a.return_pct.partial_cmp(&b.return_pct).unwrap())
            .cloned();
        let worst = symbol_returns
            .iter()
            .min_by(|a, b| a.return_pct.partial_cmp(&b.return_pct).unwrap())
            .cloned();

        let calibration_score = Self::compute_calibration(conviction, avg_return_pct);

        Ok(Some(ThesisScorecard {
            thesis_id,
            title,
            conviction,
            avg_return_pct,
            best,
            worst,
            calibration_score,
            symbol_returns,
        }))
    }

    pub async fn score_all(&self) -> Result<Vec<ThesisScorecard>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM theses WHERE status IN ('active', 'strengthening', 'weakening', 'confirmed')",
        )
        .fetch_all(self.store.pool())
        .await?;

        let mut scorecards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(card) = self.score_thesis(id).await? {
                scorecards.push(card);
            }
        }
        Ok(scorecards)
    }

    pub async fn persist_snapshot(&self, card: &ThesisScorecard) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outcome_snapshots
                (thesis_id, date, avg_return_pct, best_symbol, best_return_pct,
                 worst_symbol, worst_return_pct, calibration_score, symbol_count)
            VALUES (?, date('now'), ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(thesis_id, date) DO UPDATE SET
                avg_return_pct = excluded.avg_return_pct,
                best_symbol = excluded.best_symbol,
                best_return_pct = excluded.best_return_pct,
                worst_symbol = excluded.worst_symbol,
                worst_return_pct = excluded.worst_return_pct,
                calibration_score = excluded.calibration_score,
                symbol_count = excluded.symbol_count
            "#,
        )
        .bind(card.thesis_id)
        .bind(card.avg_return_pct)
        .bind(card.best.as_ref().map(|b| b.symbol.clone()))
        .bind(card.best.as_ref().map(|b| b.return_pct))
        .bind(card.worst.as_ref().map(|w| w.symbol.clone()))
        .bind(card.worst.as_ref().map(|w| w.return_pct))
        .bind(card.calibration_score)
        .bind(card.symbol_returns.len() as i64)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn get_history(&self, thesis_id: i64) -> Result<Vec<OutcomeSnapshotRow>> {
        let rows = sqlx::query(
            "SELECT id, thesis_id, date, avg_return_pct, best_symbol, best_return_pct,
                    worst_symbol, worst_return_pct, calibration_score, symbol_count
             FROM outcome_snapshots WHERE thesis_id = ? ORDER BY date ASC",
        )
        .bind(thesis_id)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| OutcomeSnapshotRow {
                id: r.get("id"),
                thesis_id: r.get("thesis_id"),
                date: r.get("date"),
                avg_return_pct: r.get("avg_return_pct"),
                best_symbol: r.get("best_symbol"),
                best_return_pct: r.get("best_return_pct"),
                worst_symbol: r.get("worst_symbol"),
                worst_return_pct: r.get("worst_return_pct"),
                calibration_score: r.get("calibration_score"),
                symbol_count: r.get("symbol_count"),
            })
            .collect())
    }

    /// Renders a short multi-line digest, grounded on the CLI-style summary
    /// tables `trading-agent` prints for daily runs.
    pub fn format_summary(scorecards: &[ThesisScorecard]) -> String {
        if scorecards.is_empty() {
            return "No active theses to score.".to_string();
        }
        let mut out = String::new();
        for card in scorecards {
            out.push_str(&format!(
                "#{} {} | conviction {:.2} | avg return {:.2}% | calibration {:.1}\n",
                card.thesis_id, card.title, card.conviction, card.avg_return_pct, card.calibration_score
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_rewards_correct_high_conviction_calls() {
        assert!(OutcomeTracker::compute_calibration(0.85, 20.0) > 60.0);
    }

    #[test]
    fn calibration_punishes_wrong_high_conviction_calls() {
        assert!(OutcomeTracker::compute_calibration(0.85, -20.0) < 40.0);
    }

    #[test]
    fn neutral_conviction_and_flat_return_is_exactly_midpoint() {
        assert_eq!(OutcomeTracker::compute_calibration(0.5, 0.0), 50.0);
    }

    #[test]
    fn calibration_is_bounded() {
        assert!((0.0..=100.0).contains(&OutcomeTracker::compute_calibration(1.0, 100.0)));
        assert!((0.0..=100.0).contains(&OutcomeTracker::compute_calibration(0.0, -100.0)));
        assert!((0.0..=100.0).contains(&OutcomeTracker::compute_calibration(1.0, -100.0)));
    }

    #[test]
    fn days_to_period_matches_known_buckets() {
        assert_eq!(OutcomeTracker::days_to_period(3), "5d");
        assert_eq!(OutcomeTracker::days_to_period(20), "1mo");
        assert_eq!(OutcomeTracker::days_to_period(60), "3mo");
        assert_eq!(OutcomeTracker::days_to_period(300), "1y");
        assert_eq!(OutcomeTracker::days_to_period(500), "2y");
        assert_eq!(OutcomeTracker::days_to_period(1000), "5y");
    }

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

    async fn seed_thesis(store: &Store, conviction: f64, baseline: f64) -> i64 {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO theses (title, status, symbols, conviction, created_at)
             VALUES ('Test thesis', 'active', '[\"NVDA\"]', ?, '2026-01-01T00:00:00')
             RETURNING id",
        )
        .bind(conviction)
        .fetch_one(store.pool())
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO price_history (symbol, timestamp, interval, open, high, low, close, volume)
             VALUES ('NVDA', '2026-01-01T00:00:00', '1d', ?, ?, ?, ?, 0)",
        )
        .bind(baseline)
        .bind(baseline)
        .bind(baseline)
        .bind(baseline)
        .execute(store.pool())
        .await
        .unwrap();

        id
    }

    #[tokio::test]
    async fn scores_a_winning_thesis_above_midpoint() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let thesis_id = seed_thesis(&store, 0.8, 100.0).await;
        let pricing = Arc::new(PricingService::new(Arc::new(FixedSource(Decimal::from(120)))));
        let tracker = OutcomeTracker::new(store.clone(), pricing);

        let card = tracker.score_thesis(thesis_id).await.unwrap().unwrap();
        assert!((card.avg_return_pct - 20.0).abs() < 1e-9);
        assert!(card.calibration_score > 50.0);
        assert_eq!(card.best.unwrap().symbol, "NVDA");
    }

    #[tokio::test]
    async fn archived_theses_are_not_scored() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let id = seed_thesis(&store, 0.5, 100.0).await;
        sqlx::query("UPDATE theses SET status = 'archived' WHERE id = ?")
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();
        let pricing = Arc::new(PricingService::new(Arc::new(FixedSource(Decimal::from(100)))));
        let tracker = OutcomeTracker::new(store.clone(), pricing);

        assert!(tracker.score_thesis(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persist_snapshot_is_idempotent_per_day() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let thesis_id = seed_thesis(&store, 0.8, 100.0).await;
        let pricing = Arc::new(PricingService::new(Arc::new(FixedSource(Decimal::from(110)))));
        let tracker = OutcomeTracker::new(store.clone(), pricing);

        let card = tracker.score_thesis(thesis_id).await.unwrap().unwrap();
        tracker.persist_snapshot(&card).await.unwrap();
        tracker.persist_snapshot(&card).await.unwrap();

        let history = tracker.get_history(thesis_id).await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
