//! Earnings-proximity gate support (spec 4.7 gate 8), supplemented from
//! `original_source/moves/engine/earnings_calendar.py`: a small JSON-backed
//! lookup of `symbol -> [dates]`, with a trait seam so a real feed can be
//! substituted without touching `RiskManager`.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_WINDOW_DAYS: i64 = 5;

pub trait EarningsSource: Send + Sync {
    /// True if `symbol` has a scheduled earnings date within `window_days`
    /// of `reference_date` (inclusive, never in the past).
    fn is_earnings_imminent(&self, symbol: &str, window_days: i64, reference_date: NaiveDate) -> bool;
}

#[derive(Default)]
pub struct EarningsCalendar {
    dates: HashMap<String, Vec<NaiveDate>>,
}

impl EarningsCalendar {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads `{"SYMBOL": ["2025-01-01", ...]}` from `path`; missing or
    /// malformed files degrade to an empty calendar rather than failing
    /// the caller, matching the original's graceful fallback.
    pub fn load_from_file(path: impl AsRef<Path>) -> Self {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Self::empty();
        };
        let Ok(raw): Result<HashMap<String, Vec<String>>, _> = serde_json::from_str(&contents) else {
            return Self::empty();
        };

        let mut dates = HashMap::new();
        for (symbol, raw_dates) in raw {
            let parsed: Vec<NaiveDate> = raw_dates
                .iter()
                .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .collect();
            dates.insert(symbol, parsed);
        }
        Self { dates }
    }

    pub fn add_date(&mut self, symbol: &str, date: NaiveDate) {
        self.dates.entry(symbol.to_string()).or_default().push(date);
    }
}

impl EarningsSource for EarningsCalendar {
    fn is_earnings_imminent(&self, symbol: &str, window_days: i64, reference_date: NaiveDate) -> bool {
        let Some(dates) = self.dates.get(symbol) else { return false };
        dates.iter().any(|d| {
            let days_until = (*d - reference_date).num_days();
            (0..=window_days).contains(&days_until)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_symbol_with_date_inside_window() {
        let mut cal = EarningsCalendar::empty();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        cal.add_date("NVDA", today + chrono::Duration::days(3));
        assert!(cal.is_earnings_imminent("NVDA", DEFAULT_WINDOW_DAYS, today));
    }

    #[test]
    fn ignores_date_outside_window() {
        let mut cal = EarningsCalendar::empty();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        cal.add_date("NVDA", today + chrono::Duration::days(10));
        assert!(!cal.is_earnings_imminent("NVDA", DEFAULT_WINDOW_DAYS, today));
    }

    #[test]
    fn unknown_symbol_is_never_imminent() {
        let cal = EarningsCalendar::empty();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(!cal.is_earnings_imminent("ZZZZ", DEFAULT_WINDOW_DAYS, today));
    }
}
