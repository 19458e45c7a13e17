use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use reqwest::Client;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::map_schwab_status;
use crate::models::*;
use broker_core::OrderStatusKind;

const TOKEN_URL: &str = "https://api.schwabapi.com/v1/oauth/token";
const TRADER_BASE: &str = "https://api.schwabapi.com/trader/v1";

struct TokenCache {
    access_token: String,
    expires_at: Instant,
}

pub struct SchwabClient {
    http: Client,
    app_key: String,
    app_secret: String,
    account_hash: String,
    refresh_token: String,
    token: Mutex<Option<TokenCache>>,
}

impl SchwabClient {
    pub fn new(app_key: String, app_secret: String, account_hash: String, refresh_token: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("building reqwest client"),
            app_key,
            app_secret,
            account_hash,
            refresh_token,
            token: Mutex::new(None),
        }
    }

    pub fn from_env() -> Result<Self> {
        let app_key =
            std::env::var("MOVES_SCHWAB_APP_KEY").map_err(|_| anyhow!("MOVES_SCHWAB_APP_KEY not set"))?;
        let app_secret =
            std::env::var("MOVES_SCHWAB_SECRET").map_err(|_| anyhow!("MOVES_SCHWAB_SECRET not set"))?;
        let account_hash = std::env::var("MOVES_SCHWAB_ACCOUNT_HASH")
            .map_err(|_| anyhow!("MOVES_SCHWAB_ACCOUNT_HASH not set"))?;
        let refresh_token = std::env::var("MOVES_SCHWAB_REFRESH_TOKEN")
            .map_err(|_| anyhow!("MOVES_SCHWAB_REFRESH_TOKEN not set"))?;
        Ok(Self::new(app_key, app_secret, account_hash, refresh_token))
    }

    /// OAuth2 client-credentials-plus-refresh-token flow: exchange the
    /// long-lived refresh token for a short-lived access token, cached until
    /// near expiry.
    async fn access_token(&self) -> Result<String> {
        let mut cache = self.token.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.app_key, Some(&self.app_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Schwab token refresh failed: {body}"));
        }

        let token: SchwabTokenResponse = response.json().await?;
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(30));
        let access_token = token.access_token.clone();
        *cache = Some(TokenCache {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }

    pub async fn get_account(&self) -> Result<SchwabAccount> {
        let token = self.access_token().await?;
        let url = format!("{TRADER_BASE}/accounts/{}?fields=positions", self.account_hash);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Schwab account fetch failed: {body}"));
        }
        Ok(response.json::<SchwabAccount>().await?)
    }

    pub async fn submit_order(
        &self,
        symbol: &str,
        instruction: &str,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<String> {
        let token = self.access_token().await?;
        let request = SchwabOrderRequest {
            order_type: if limit_price.is_some() { "LIMIT".to_string() } else { "MARKET".to_string() },
            session: "NORMAL".to_string(),
            duration: "DAY".to_string(),
            order_strategy_type: "SINGLE".to_string(),
            order_leg_collection: vec![SchwabOrderLeg {
                instruction: instruction.to_string(),
                quantity,
                instrument: SchwabInstrument {
                    symbol: symbol.to_string(),
                    asset_type: "EQUITY".to_string(),
                },
            }],
            price: limit_price,
        };

        let url = format!("{TRADER_BASE}/accounts/{}/orders", self.account_hash);
        let response = self.http.post(&url).bearer_auth(token).json(&request).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Schwab order submission failed: {body}"));
        }

        let order_id = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| loc.rsplit('/').next())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Schwab order response missing Location header"))?;
        Ok(order_id)
    }

    pub async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusKind> {
        Ok(self.get_order_fill(order_id).await?.0)
    }

    /// Order status plus fill details: total filled quantity and the
    /// volume-weighted average execution price across `orderActivityCollection`'s
    /// legs. `submit_order` returns before Schwab necessarily has a fill
    /// recorded, so callers poll this rather than trusting the first read.
    pub async fn get_order_fill(&self, order_id: &str) -> Result<(OrderStatusKind, Decimal, Option<Decimal>)> {
        let token = self.access_token().await?;
        let url = format!("{TRADER_BASE}/accounts/{}/orders/{order_id}", self.account_hash);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Ok((OrderStatusKind::Rejected, Decimal::ZERO, None));
        }
        let body = response.json::<SchwabOrderStatusResponse>().await?;
        let status = map_schwab_status(&body.status);

        let mut total_qty = Decimal::ZERO;
        let mut total_notional = Decimal::ZERO;
        for activity in &body.order_activity_collection {
            for leg in &activity.execution_legs {
                total_qty += leg.quantity;
                total_notional += leg.price * leg.quantity;
            }
        }
        let avg_price = if total_qty > Decimal::ZERO { Some(total_notional / total_qty) } else { None };
        Ok((status, body.filled_quantity, avg_price))
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let url = format!("{TRADER_BASE}/accounts/{}/orders/{order_id}", self.account_hash);
        let response = self.http.delete(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Schwab order cancellation failed: {body}"));
        }
        Ok(())
    }

    pub async fn get_quote(&self, symbol: &str) -> Result<Decimal> {
        let token = self.access_token().await?;
        let url = format!("https://api.schwabapi.com/marketdata/v1/{symbol}/quotes");
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("Schwab quote fetch failed"));
        }
        let body: serde_json::Value = response.json().await?;
        body[symbol]["quote"]["lastPrice"]
            .as_f64()
            .and_then(Decimal::from_f64)
            .ok_or_else(|| anyhow!("unexpected Schwab quote payload"))
    }
}
