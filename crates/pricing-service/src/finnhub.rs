//! Finnhub-backed `QuoteSource`, grounded on `polygon-client::PolygonClient`'s
//! request shape (a single `reqwest::Client` plus query-string auth). yfinance
//! has no maintained Rust client, so `MOVES_FINNHUB_API_KEY` backs quotes and
//! `MOVES_YFINANCE_DELAY` is kept as the pacing knob between requests, matching
//! spec.md's configuration section naming.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{Bar, Fundamentals, PriceError, Quote, QuoteSource, QuoteSourceKind};

const BASE_URL: &str = "https://finnhub.io/api/v1";

pub struct FinnhubSource {
    api_key: String,
    client: reqwest::Client,
    delay: Duration,
    last_request: Mutex<Option<tokio::time::Instant>>,
}

impl FinnhubSource {
    pub fn new(api_key: String, delay: Duration) -> Self {
        Self {
            api_key,
            client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build().unwrap_or_default(),
            delay,
            last_request: Mutex::new(None),
        }
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }
}

#[derive(Deserialize)]
struct QuoteResponse {
    c: f64,
    d: Option<f64>,
    dp: Option<f64>,
    t: i64,
}

#[derive(Deserialize)]
struct CandleResponse {
    s: String,
    t: Vec<i64>,
    o: Vec<f64>,
    h: Vec<f64>,
    l: Vec<f64>,
    c: Vec<f64>,
    v: Vec<f64>,
}

#[derive(Deserialize)]
struct ProfileResponse {
    #[serde(rename = "marketCapitalization")]
    market_cap: Option<f64>,
    #[serde(rename = "finnhubIndustry")]
    industry: Option<String>,
}

fn period_to_candle_args(period: &str) -> (&'static str, i64) {
    match period {
        "1d" => ("5", 1),
        "5d" => ("15", 5),
        "1mo" => ("D", 31),
        "3mo" => ("D", 92),
        "6mo" => ("D", 183),
        "1y" => ("D", 366),
        "2y" => ("W", 731),
        "5y" => ("W", 1827),
        "10y" => ("M", 3653),
        _ => ("D", 365),
    }
}

#[async_trait]
impl QuoteSource for FinnhubSource {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, PriceError> {
        self.pace().await;
        let url = format!("{BASE_URL}/quote");
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("token", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| PriceError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PriceError::Connection(format!("HTTP {}", resp.status())));
        }

        let body: QuoteResponse = resp.json().await.map_err(|e| PriceError::Connection(e.to_string()))?;
        if body.c <= 0.0 {
            return Err(PriceError::NotFound(symbol.to_string()));
        }

        Ok(Quote {
            symbol: symbol.to_string(),
            price: Decimal::from_f64_retain(body.c).unwrap_or_default(),
            change: Decimal::from_f64_retain(body.d.unwrap_or(0.0)).unwrap_or_default(),
            change_pct: body.dp.unwrap_or(0.0),
            volume: 0,
            timestamp: Utc.timestamp_opt(body.t, 0).single().unwrap_or_else(Utc::now),
            source: QuoteSourceKind::Primary,
            error: None,
        })
    }

    async fn fetch_history(&self, symbol: &str, period: &str) -> Result<Vec<Bar>, PriceError> {
        self.pace().await;
        let (resolution, lookback_days) = period_to_candle_args(period);
        let to = Utc::now().timestamp();
        let from = to - lookback_days * 86_400;

        let url = format!("{BASE_URL}/stock/candle");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("resolution", resolution.to_string()),
                ("from", from.to_string()),
                ("to", to.to_string()),
                ("token", self.api_key.clone()),
            ])
            .send()
            .await
            .map_err(|e| PriceError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PriceError::Connection(format!("HTTP {}", resp.status())));
        }

        let body: CandleResponse = resp.json().await.map_err(|e| PriceError::Connection(e.to_string()))?;
        if body.s != "ok" {
            return Ok(Vec::new());
        }

        Ok(body
            .t
            .into_iter()
            .enumerate()
            .map(|(i, ts)| Bar {
                timestamp: DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now),
                open: Decimal::from_f64_retain(body.o.get(i).copied().unwrap_or(0.0)).unwrap_or_default(),
                high: Decimal::from_f64_retain(body.h.get(i).copied().unwrap_or(0.0)).unwrap_or_default(),
                low: Decimal::from_f64_retain(body.l.get(i).copied().unwrap_or(0.0)).unwrap_or_default(),
                close: Decimal::from_f64_retain(body.c.get(i).copied().unwrap_or(0.0)).unwrap_or_default(),
                volume: body.v.get(i).copied().unwrap_or(0.0) as u64,
            })
            .collect())
    }

    async fn fetch_fundamentals(&self, symbol: &str) -> Result<Fundamentals, PriceError> {
        self.pace().await;
        let url = format!("{BASE_URL}/stock/profile2");
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("token", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| PriceError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PriceError::Connection(format!("HTTP {}", resp.status())));
        }

        let body: ProfileResponse = resp.json().await.map_err(|e| PriceError::Connection(e.to_string()))?;
        Ok(Fundamentals {
            symbol: symbol.to_string(),
            market_cap: body.market_cap.and_then(Decimal::from_f64_retain),
            pe_ratio: None,
            eps: None,
            sector: body.industry,
        })
    }
}
