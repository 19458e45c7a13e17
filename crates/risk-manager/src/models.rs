use serde::{Deserialize, Serialize};

/// Default risk limits at first boot (`original_source/moves/config/settings.py`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_pct: f64,
    pub max_sector_pct: f64,
    pub max_gross_exposure: f64,
    pub net_exposure_min: f64,
    pub net_exposure_max: f64,
    pub max_drawdown: f64,
    pub daily_loss_limit: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_pct: 0.15,
            max_sector_pct: 0.35,
            max_gross_exposure: 1.50,
            net_exposure_min: -0.30,
            net_exposure_max: 1.30,
            max_drawdown: 0.20,
            daily_loss_limit: 0.03,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeContext {
    pub symbol: String,
    pub sector: Option<String>,
    pub size_pct: f64,
    /// Signed notional of the proposed trade: positive for buy/cover-closing-short
    /// that adds long exposure, negative for sell/short that adds short exposure.
    pub signed_notional: rust_decimal::Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureSummary {
    pub long_value: f64,
    pub short_value: f64,
    pub gross_value: f64,
    pub net_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub gate: Option<String>,
    pub reason: Option<String>,
}

impl GateResult {
    pub fn pass() -> Self {
        Self { passed: true, gate: None, reason: None }
    }

    pub fn fail(gate: &str, reason: impl Into<String>) -> Self {
        Self { passed: false, gate: Some(gate.to_string()), reason: Some(reason.into()) }
    }
}
