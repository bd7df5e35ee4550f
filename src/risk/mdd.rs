//! Drawdown and realized-loss tracking.

use crate::strategy::StrategyId;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

/// Tracks peak equity and drawdown from it.
pub struct DrawdownTracker {
    /// Maximum allowed drawdown (0.10 = 10%)
    max_drawdown: Decimal,
    peak_equity: Decimal,
    /// Current drawdown from peak (fraction)
    current_drawdown: Decimal,
    /// Worst drawdown this session
    session_mdd: Decimal,
}

impl DrawdownTracker {
    pub fn new(max_drawdown: Decimal, initial_equity: Decimal) -> Self {
        Self {
            max_drawdown,
            peak_equity: initial_equity,
            current_drawdown: Decimal::ZERO,
            session_mdd: Decimal::ZERO,
        }
    }

    /// Update with new equity value.
    ///
    /// Returns true if drawdown reaches the maximum allowed.
    pub fn update(&mut self, equity: Decimal) -> bool {
        if equity > self.peak_equity {
            self.peak_equity = equity;
            self.current_drawdown = Decimal::ZERO;
        } else if self.peak_equity > Decimal::ZERO {
            self.current_drawdown = (self.peak_equity - equity) / self.peak_equity;

            if self.current_drawdown > self.session_mdd {
                self.session_mdd = self.current_drawdown;
                warn!(
                    mdd = %self.session_mdd,
                    peak = %self.peak_equity,
                    current = %equity,
                    "New maximum drawdown recorded"
                );
            }
        }

        self.current_drawdown >= self.max_drawdown
    }

    pub fn current_drawdown(&self) -> Decimal {
        self.current_drawdown
    }

    pub fn session_mdd(&self) -> Decimal {
        self.session_mdd
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    pub fn set_max_drawdown(&mut self, max_drawdown: Decimal) {
        self.max_drawdown = max_drawdown;
    }
}

/// Risk figures read by the policy layer and kill switch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskState {
    /// Drawdown from peak session equity (percent)
    pub current_drawdown_pct: Decimal,
    /// Worst drawdown this session (percent)
    pub session_mdd_pct: Decimal,
    /// Realized losses today (positive number)
    pub daily_loss: Decimal,
    /// Realized losses this session per strategy (positive numbers)
    pub strategy_loss: HashMap<StrategyId, Decimal>,
    pub realized_pnl: Decimal,
}

impl RiskState {
    pub fn strategy_loss(&self, strategy: StrategyId) -> Decimal {
        self.strategy_loss.get(&strategy).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Accumulates realized PnL and equity into a `RiskState`.
pub struct RiskTracker {
    drawdown: DrawdownTracker,
    state: RiskState,
    day: NaiveDate,
}

impl RiskTracker {
    /// `max_drawdown_pct` is in percent units.
    pub fn new(max_drawdown_pct: Decimal, initial_equity: Decimal) -> Self {
        Self {
            drawdown: DrawdownTracker::new(max_drawdown_pct / dec!(100), initial_equity),
            state: RiskState::default(),
            day: Utc::now().date_naive(),
        }
    }

    /// Record a realized PnL event. Losses accumulate; gains do not offset them.
    pub fn record_realized(&mut self, strategy: StrategyId, pnl: Decimal, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            info!(previous = %self.day, daily_loss = %self.state.daily_loss, "Daily loss accumulator reset");
            self.day = today;
            self.state.daily_loss = Decimal::ZERO;
        }

        self.state.realized_pnl += pnl;
        if pnl < Decimal::ZERO {
            self.state.daily_loss += -pnl;
            *self.state.strategy_loss.entry(strategy).or_insert(Decimal::ZERO) += -pnl;
        }
    }

    /// Feed current equity. Returns true when the drawdown limit is reached.
    pub fn update_equity(&mut self, equity: Decimal) -> bool {
        let exceeded = self.drawdown.update(equity);
        self.state.current_drawdown_pct = self.drawdown.current_drawdown() * dec!(100);
        self.state.session_mdd_pct = self.drawdown.session_mdd() * dec!(100);
        exceeded
    }

    pub fn set_max_drawdown_pct(&mut self, max_drawdown_pct: Decimal) {
        self.drawdown.set_max_drawdown(max_drawdown_pct / dec!(100));
    }

    pub fn state(&self) -> RiskState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_drawdown_tracking() {
        let mut tracker = DrawdownTracker::new(dec!(0.05), dec!(10000));

        assert!(!tracker.update(dec!(10500)));
        assert_eq!(tracker.peak_equity(), dec!(10500));
        assert_eq!(tracker.current_drawdown(), Decimal::ZERO);

        assert!(!tracker.update(dec!(10000)));
        // (10500 - 10000) / 10500 ≈ 4.76%
        assert!(tracker.current_drawdown() > dec!(0.04));
        assert!(tracker.current_drawdown() < dec!(0.05));

        assert!(tracker.update(dec!(9900)));
    }

    #[test]
    fn test_losses_accumulate_per_strategy() {
        let mut risk = RiskTracker::new(dec!(10), dec!(1000));
        let now = Utc::now();

        risk.record_realized(StrategyId::EventReactive, dec!(-5), now);
        risk.record_realized(StrategyId::EventReactive, dec!(3), now);
        risk.record_realized(StrategyId::Quoting, dec!(-2), now);

        let state = risk.state();
        assert_eq!(state.daily_loss, dec!(7));
        assert_eq!(state.strategy_loss(StrategyId::EventReactive), dec!(5));
        assert_eq!(state.strategy_loss(StrategyId::Quoting), dec!(2));
        assert_eq!(state.realized_pnl, dec!(-4));
    }

    #[test]
    fn test_daily_loss_resets_on_new_day() {
        let mut risk = RiskTracker::new(dec!(10), dec!(1000));
        let now = Utc::now();

        risk.record_realized(StrategyId::Quoting, dec!(-8), now);
        risk.record_realized(StrategyId::Quoting, dec!(-1), now + Duration::days(1));

        let state = risk.state();
        assert_eq!(state.daily_loss, dec!(1));
        assert_eq!(state.strategy_loss(StrategyId::Quoting), dec!(9));
    }

    #[test]
    fn test_equity_drawdown_in_percent() {
        let mut risk = RiskTracker::new(dec!(10), dec!(1000));

        assert!(!risk.update_equity(dec!(950)));
        assert_eq!(risk.state().current_drawdown_pct, dec!(5));
        assert!(risk.update_equity(dec!(900)));
    }
}
