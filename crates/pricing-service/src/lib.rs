//! Cached quote / history / fundamentals lookup (spec C2). Three independent
//! TTL layers keyed by (symbol, kind), each single-flighted so that a burst
//! of callers for the same symbol only issues one upstream call, grounded on
//! `analysis-orchestrator`'s `DashMap<String, CacheEntry<T>>` cache fields.

pub mod error;
pub mod finnhub;

pub use finnhub::FinnhubSource;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

pub use error::PriceError;

const QUOTE_TTL_SECS: i64 = 15;
const HISTORY_TTL_SECS: i64 = 24 * 3600;
const FUNDAMENTALS_TTL_SECS: i64 = 24 * 3600;

pub const HISTORY_PERIODS: &[&str] = &[
    "1d", "5d", "1mo", "3mo", "6mo", "1y", "2y", "5y", "10y", "ytd", "max",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteSourceKind {
    Primary,
    Fallback,
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,
    pub change: Decimal,
    pub change_pct: f64,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
    pub source: QuoteSourceKind,
    /// Set when this quote is a placeholder for an upstream failure rather
    /// than a real price (spec 4.2: callers must be able to tell the two
    /// apart instead of treating a failed fetch as a legitimate zero price).
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fundamentals {
    pub symbol: String,
    pub market_cap: Option<Decimal>,
    pub pe_ratio: Option<f64>,
    pub eps: Option<f64>,
    pub sector: Option<String>,
}

/// Upstream data provider seam. `finnhub::FinnhubSource` is the production
/// implementation; tests and the mock broker use a fixed-price stub instead.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, PriceError>;
    async fn fetch_history(&self, symbol: &str, period: &str) -> Result<Vec<Bar>, PriceError>;
    async fn fetch_fundamentals(&self, symbol: &str) -> Result<Fundamentals, PriceError>;
}

struct CacheEntry<T> {
    data: T,
    cached_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, ttl_secs: i64) -> bool {
        (Utc::now() - self.cached_at).num_seconds() < ttl_secs
    }
}

pub struct PricingService {
    source: Arc<dyn QuoteSource>,
    quote_cache: DashMap<String, CacheEntry<Quote>>,
    history_cache: DashMap<String, CacheEntry<Vec<Bar>>>,
    fundamentals_cache: DashMap<String, CacheEntry<Fundamentals>>,
    quote_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl PricingService {
    pub fn new(source: Arc<dyn QuoteSource>) -> Self {
        Self {
            source,
            quote_cache: DashMap::new(),
            history_cache: DashMap::new(),
            fundamentals_cache: DashMap::new(),
            quote_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.quote_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Returns an error record rather than propagating on upstream failure,
    /// per spec 4.2. Never panics from an upstream error.
    pub async fn get_price(&self, symbol: &str) -> Quote {
        let key = format!("quote:{symbol}");

        if let Some(entry) = self.quote_cache.get(symbol) {
            if entry.is_fresh(QUOTE_TTL_SECS) {
                let mut cached = entry.data.clone();
                cached.source = QuoteSourceKind::Cache;
                return cached;
            }
        }

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        // Re-check after acquiring the single-flight barrier.
        if let Some(entry) = self.quote_cache.get(symbol) {
            if entry.is_fresh(QUOTE_TTL_SECS) {
                let mut cached = entry.data.clone();
                cached.source = QuoteSourceKind::Cache;
                return cached;
            }
        }

        match self.source.fetch_quote(symbol).await {
            Ok(quote) => {
                self.quote_cache.insert(
                    symbol.to_string(),
                    CacheEntry {
                        data: quote.clone(),
                        cached_at: Utc::now(),
                    },
                );
                quote
            }
            Err(err) => {
                tracing::warn!(symbol, error = %err, "price upstream failure");
                Quote {
                    symbol: symbol.to_string(),
                    price: Decimal::ZERO,
                    change: Decimal::ZERO,
                    change_pct: 0.0,
                    volume: 0,
                    timestamp: Utc::now(),
                    source: QuoteSourceKind::Fallback,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Batch quote lookup; each entry independent (one symbol's failure does
    /// not affect another's).
    pub async fn get_prices(&self, symbols: &[String]) -> std::collections::HashMap<String, Quote> {
        let mut out = std::collections::HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            out.insert(symbol.clone(), self.get_price(symbol).await);
        }
        out
    }

    pub async fn get_history(&self, symbol: &str, period: &str) -> Vec<Bar> {
        if !HISTORY_PERIODS.contains(&period) {
            return Vec::new();
        }

        let cache_key = format!("{symbol}:{period}");
        if let Some(entry) = self.history_cache.get(&cache_key) {
            if entry.is_fresh(HISTORY_TTL_SECS) {
                return entry.data.clone();
            }
        }

        let lock = self.lock_for(&format!("history:{cache_key}"));
        let _guard = lock.lock().await;
        if let Some(entry) = self.history_cache.get(&cache_key) {
            if entry.is_fresh(HISTORY_TTL_SECS) {
                return entry.data.clone();
            }
        }

        match self.source.fetch_history(symbol, period).await {
            Ok(bars) => {
                self.history_cache.insert(
                    cache_key,
                    CacheEntry {
                        data: bars.clone(),
                        cached_at: Utc::now(),
                    },
                );
                bars
            }
            Err(err) => {
                tracing::warn!(symbol, period, error = %err, "history upstream failure");
                Vec::new()
            }
        }
    }

    pub async fn get_fundamentals(&self, symbol: &str) -> Option<Fundamentals> {
        if let Some(entry) = self.fundamentals_cache.get(symbol) {
            if entry.is_fresh(FUNDAMENTALS_TTL_SECS) {
                return Some(entry.data.clone());
            }
        }

        let lock = self.lock_for(&format!("fund:{symbol}"));
        let _guard = lock.lock().await;
        if let Some(entry) = self.fundamentals_cache.get(symbol) {
            if entry.is_fresh(FUNDAMENTALS_TTL_SECS) {
                return Some(entry.data.clone());
            }
        }

        match self.source.fetch_fundamentals(symbol).await {
            Ok(fundamentals) => {
                self.fundamentals_cache.insert(
                    symbol.to_string(),
                    CacheEntry {
                        data: fundamentals.clone(),
                        cached_at: Utc::now(),
                    },
                );
                Some(fundamentals)
            }
            Err(err) => {
                tracing::warn!(symbol, error = %err, "fundamentals upstream failure");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        price: Decimal,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QuoteSource for FixedSource {
        async fn fetch_quote(&self, symbol: &str) -> Result<Quote, PriceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Quote {
                symbol: symbol.to_string(),
                price: self.price,
                change: Decimal::ZERO,
                change_pct: 0.0,
                volume: 1000,
                timestamp: Utc::now(),
                source: QuoteSourceKind::Primary,
                error: None,
            })
        }

        async fn fetch_history(&self, _symbol: &str, _period: &str) -> Result<Vec<Bar>, PriceError> {
            Ok(Vec::new())
        }

        async fn fetch_fundamentals(&self, symbol: &str) -> Result<Fundamentals, PriceError> {
            Ok(Fundamentals {
                symbol: symbol.to_string(),
                market_cap: None,
                pe_ratio: None,
                eps: None,
                sector: None,
            })
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let source = Arc::new(FixedSource {
            price: Decimal::from(130),
            calls: AtomicUsize::new(0),
        });
        let service = PricingService::new(source.clone());

        let first = service.get_price("NVDA").await;
        let second = service.get_price("NVDA").await;

        assert_eq!(first.price, Decimal::from(130));
        assert_eq!(second.source, QuoteSourceKind::Cache);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    struct FailingSource;

    #[async_trait]
    impl QuoteSource for FailingSource {
        async fn fetch_quote(&self, _symbol: &str) -> Result<Quote, PriceError> {
            Err(PriceError::Connection("refused".to_string()))
        }

        async fn fetch_history(&self, _symbol: &str, _period: &str) -> Result<Vec<Bar>, PriceError> {
            Ok(Vec::new())
        }

        async fn fetch_fundamentals(&self, _symbol: &str) -> Result<Fundamentals, PriceError> {
            Err(PriceError::Connection("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn upstream_failure_sets_error_instead_of_a_fake_price() {
        let service = PricingService::new(Arc::new(FailingSource));
        let quote = service.get_price("NVDA").await;
        assert!(quote.error.is_some());
        assert_eq!(quote.source, QuoteSourceKind::Fallback);
    }

    #[tokio::test]
    async fn successful_quote_has_no_error() {
        let source = Arc::new(FixedSource {
            price: Decimal::from(130),
            calls: AtomicUsize::new(0),
        });
        let service = PricingService::new(source);
        let quote = service.get_price("NVDA").await;
        assert!(quote.error.is_none());
    }

    #[tokio::test]
    async fn unknown_period_short_circuits_without_upstream() {
        let source = Arc::new(FixedSource {
            price: Decimal::ONE,
            calls: AtomicUsize::new(0),
        });
        let service = PricingService::new(source);
        let bars = service.get_history("NVDA", "3w").await;
        assert!(bars.is_empty());
    }
}
