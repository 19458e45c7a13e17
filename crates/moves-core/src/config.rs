//! Startup configuration, grounded on
//! `trading-agent::config::AgentConfig::from_env`'s shape (env-driven
//! fields, each with a sane default, validated once at process start
//! rather than lazily) and `original_source/moves/config/settings.py`'s
//! `MOVES_`-prefixed environment variable names.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mock,
    Live,
}

#[derive(Debug, Clone)]
pub struct MovesConfig {
    pub mode: Mode,
    pub db_path: String,
    pub yfinance_delay: Duration,
    pub finnhub_api_key: Option<String>,

    pub max_position_pct: f64,
    pub max_sector_pct: f64,
    pub max_gross_exposure: f64,
    pub net_exposure_min: f64,
    pub net_exposure_max: f64,
    pub max_drawdown: f64,
    pub daily_loss_limit: f64,

    pub expertise_domains: Vec<String>,
    pub domain_boost: f64,
    pub out_of_domain_penalty: f64,
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} is not a valid number: {v:?}")),
        Err(_) => Ok(default),
    }
}

impl MovesConfig {
    pub fn from_env() -> Result<Self> {
        let mode = match env::var("MOVES_MODE").unwrap_or_else(|_| "mock".to_string()).as_str() {
            "mock" => Mode::Mock,
            "live" => Mode::Live,
            other => bail!("MOVES_MODE must be 'mock' or 'live', got {other:?}"),
        };

        let config = Self {
            mode,
            db_path: env::var("MOVES_DB_PATH").unwrap_or_else(|_| "moves.db".to_string()),
            yfinance_delay: Duration::from_millis(
                env::var("MOVES_YFINANCE_DELAY")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(250),
            ),
            finnhub_api_key: env::var("MOVES_FINNHUB_API_KEY").ok(),

            max_position_pct: env_f64("MOVES_MAX_POSITION_PCT", 0.15)?,
            max_sector_pct: env_f64("MOVES_MAX_SECTOR_PCT", 0.35)?,
            max_gross_exposure: env_f64("MOVES_MAX_GROSS_EXPOSURE", 1.50)?,
            net_exposure_min: env_f64("MOVES_NET_EXPOSURE_MIN", -0.30)?,
            net_exposure_max: env_f64("MOVES_NET_EXPOSURE_MAX", 1.30)?,
            max_drawdown: env_f64("MOVES_MAX_DRAWDOWN", 0.20)?,
            daily_loss_limit: env_f64("MOVES_DAILY_LOSS_LIMIT", 0.03)?,

            expertise_domains: env::var("MOVES_EXPERTISE_DOMAINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            domain_boost: env_f64("MOVES_DOMAIN_BOOST", 0.05)?,
            out_of_domain_penalty: env_f64("MOVES_OUT_OF_DOMAIN_PENALTY", 0.05)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mode == Mode::Live {
            for key in [
                "MOVES_SCHWAB_APP_KEY",
                "MOVES_SCHWAB_SECRET",
                "MOVES_SCHWAB_ACCOUNT_HASH",
                "MOVES_SCHWAB_REFRESH_TOKEN",
            ] {
                if env::var(key).is_err() {
                    bail!("MOVES_MODE=live requires {key} to be set");
                }
            }
        }
        if !(0.0..=1.0).contains(&self.max_position_pct) {
            bail!("MOVES_MAX_POSITION_PCT must be in [0, 1], got {}", self.max_position_pct);
        }
        if self.net_exposure_min > self.net_exposure_max {
            bail!(
                "MOVES_NET_EXPOSURE_MIN ({}) must not exceed MOVES_NET_EXPOSURE_MAX ({})",
                self.net_exposure_min,
                self.net_exposure_max
            );
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_risk_limits_defaults() {
        // Isolated from the process environment; asserts the hardcoded
        // fallbacks, not whatever the test runner's env happens to have set.
        assert_eq!(env_f64("MOVES_CORE_TEST_UNSET_KEY", 0.15).unwrap(), 0.15);
    }

    #[test]
    fn bad_number_is_rejected() {
        std::env::set_var("MOVES_CORE_TEST_BAD_NUMBER", "not-a-number");
        let result = env_f64("MOVES_CORE_TEST_BAD_NUMBER", 0.1);
        std::env::remove_var("MOVES_CORE_TEST_BAD_NUMBER");
        assert!(result.is_err());
    }
}
