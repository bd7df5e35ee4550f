//! Rolling price-move tracking per instrument.
//!
//! The move over the window is `(max - min) / min * 100`. The policy layer
//! blocks new risk when it exceeds the extreme-move threshold, and the score
//! derived from it scales exits, sizing and spreads.

use crate::config::RiskConfig;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use tracing::debug;

pub struct VolatilityTracker {
    window: Duration,
    full_scale_pct: Decimal,
    extreme_move_pct: Decimal,
    prices: DashMap<String, VecDeque<(DateTime<Utc>, Decimal)>>,
}

impl VolatilityTracker {
    pub fn new(window_secs: u64, full_scale_pct: Decimal, extreme_move_pct: Decimal) -> Self {
        Self {
            window: Duration::seconds(window_secs as i64),
            full_scale_pct,
            extreme_move_pct,
            prices: DashMap::new(),
        }
    }

    pub fn from_config(risk: &RiskConfig) -> Self {
        Self::new(
            risk.volatility_window_secs,
            risk.volatility_full_scale_pct,
            risk.extreme_move_pct,
        )
    }

    /// Record a mid price and drop observations outside the window.
    pub fn record(&self, instrument: &str, price: Decimal, now: DateTime<Utc>) {
        if price <= Decimal::ZERO {
            return;
        }
        let mut history = self.prices.entry(instrument.to_string()).or_default();
        history.push_back((now, price));

        let cutoff = now - self.window;
        while let Some((ts, _)) = history.front() {
            if *ts < cutoff {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Move across the window in percent, or `None` without observations.
    pub fn move_pct(&self, instrument: &str) -> Option<Decimal> {
        let history = self.prices.get(instrument)?;
        let min = history.iter().map(|(_, p)| *p).min()?;
        let max = history.iter().map(|(_, p)| *p).max()?;
        if min <= Decimal::ZERO {
            return None;
        }
        Some((max - min) / min * dec!(100))
    }

    /// Normalised volatility in [0, 1].
    pub fn score(&self, instrument: &str) -> f64 {
        let Some(move_pct) = self.move_pct(instrument) else {
            return 0.0;
        };
        if self.full_scale_pct <= Decimal::ZERO {
            return 1.0;
        }
        (move_pct / self.full_scale_pct)
            .min(Decimal::ONE)
            .to_f64()
            .unwrap_or(0.0)
    }

    /// False once the window's move exceeds the extreme threshold.
    pub fn is_safe(&self, instrument: &str) -> bool {
        match self.move_pct(instrument) {
            Some(move_pct) if move_pct > self.extreme_move_pct => {
                debug!(%instrument, %move_pct, threshold = %self.extreme_move_pct, "Extreme price move");
                false
            }
            _ => true,
        }
    }

    pub fn reconfigure(&mut self, risk: &RiskConfig) {
        self.window = Duration::seconds(risk.volatility_window_secs as i64);
        self.full_scale_pct = risk.volatility_full_scale_pct;
        self.extreme_move_pct = risk.extreme_move_pct;
    }
}
