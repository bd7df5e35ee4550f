//! Exit evaluation shared by both strategies.
//!
//! Targets scale with volatility as `base * (1 + score * k)`. Triggers are
//! checked in a fixed priority order, and nothing but the timeout can fire
//! before the minimum hold has elapsed.

use crate::config::{ExitConfig, ExitMode};
use crate::utils::decimal::from_score;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;

/// Share of the high-water mark that may be given back before the trailing
/// stop widens beyond its configured distance.
const TRAILING_HWM_FRACTION: Decimal = dec!(0.3);

/// Reason a position is closed, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    ProfitTarget,
    StopLoss,
    TrailingStop,
    Timeout,
}

impl fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitTrigger::ProfitTarget => "profit_target",
            ExitTrigger::StopLoss => "stop_loss",
            ExitTrigger::TrailingStop => "trailing_stop",
            ExitTrigger::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Exit parameters attached to a position when it opens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitPlan {
    pub config: ExitConfig,
    /// Volatility score observed at open; static plans keep using it
    pub volatility_at_open: f64,
}

impl ExitPlan {
    pub fn new(config: ExitConfig, volatility_at_open: f64) -> Self {
        Self {
            config,
            volatility_at_open,
        }
    }

    fn effective_volatility(&self, current: f64) -> f64 {
        match self.config.mode {
            ExitMode::Static => self.volatility_at_open,
            ExitMode::Dynamic => current,
        }
    }

    pub fn profit_target_pct(&self, volatility: f64) -> Decimal {
        scale(
            self.config.profit_target_pct,
            self.effective_volatility(volatility),
            self.config.volatility_k,
        )
    }

    pub fn stop_loss_pct(&self, volatility: f64) -> Decimal {
        scale(
            self.config.stop_loss_pct,
            self.effective_volatility(volatility),
            self.config.volatility_k,
        )
    }
}

/// `base * (1 + score * k)`
pub fn scale(base: Decimal, volatility: f64, k: Decimal) -> Decimal {
    base * (Decimal::ONE + from_score(volatility) * k)
}

/// True when profit has fallen from the high-water mark by more than
/// `max(trailing_pct, hwm_pct * 0.3)` percentage points.
pub fn trailing_stop_hit(trailing_pct: Decimal, hwm_pct: Decimal, current_pct: Decimal) -> bool {
    if hwm_pct <= Decimal::ZERO {
        return false;
    }
    let threshold = trailing_pct.max(hwm_pct * TRAILING_HWM_FRACTION);
    hwm_pct - current_pct > threshold
}

/// Position state an exit decision reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitInput {
    /// Unrealized profit in percent of entry
    pub pnl_pct: Decimal,
    /// Best `pnl_pct` since entry
    pub hwm_pct: Decimal,
    pub held_secs: u64,
    pub volatility: f64,
}

pub fn evaluate(plan: &ExitPlan, input: &ExitInput) -> Option<ExitTrigger> {
    let cfg = &plan.config;
    let timed_out = input.held_secs >= cfg.max_hold_secs;

    if input.held_secs < cfg.min_hold_secs {
        return timed_out.then_some(ExitTrigger::Timeout);
    }

    if input.pnl_pct >= plan.profit_target_pct(input.volatility) {
        return Some(ExitTrigger::ProfitTarget);
    }
    if input.pnl_pct <= -plan.stop_loss_pct(input.volatility) {
        return Some(ExitTrigger::StopLoss);
    }
    if trailing_stop_hit(cfg.trailing_stop_pct, input.hwm_pct, input.pnl_pct) {
        return Some(ExitTrigger::TrailingStop);
    }
    timed_out.then_some(ExitTrigger::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: ExitMode) -> ExitConfig {
        ExitConfig {
            profit_target_pct: dec!(1.5),
            stop_loss_pct: dec!(1.0),
            trailing_stop_pct: dec!(0.5),
            min_hold_secs: 5,
            max_hold_secs: 120,
            mode,
            volatility_k: dec!(0.5),
        }
    }

    fn input(pnl_pct: Decimal, hwm_pct: Decimal, held_secs: u64) -> ExitInput {
        ExitInput {
            pnl_pct,
            hwm_pct,
            held_secs,
            volatility: 0.0,
        }
    }

    #[test]
    fn test_volatility_scales_targets() {
        let plan = ExitPlan::new(config(ExitMode::Dynamic), 0.0);

        assert_eq!(plan.profit_target_pct(0.4), dec!(1.8));
        assert_eq!(plan.stop_loss_pct(0.4), dec!(1.2));
    }

    #[test]
    fn test_static_plan_keeps_open_volatility() {
        let plan = ExitPlan::new(config(ExitMode::Static), 0.4);

        assert_eq!(plan.profit_target_pct(1.0), dec!(1.8));
        assert_eq!(plan.stop_loss_pct(0.0), dec!(1.2));
    }

    #[test]
    fn test_trailing_stop_threshold() {
        // hwm 2% -> threshold max(0.5, 0.6) = 0.6
        assert!(!trailing_stop_hit(dec!(0.5), dec!(2), dec!(1.5)));
        assert!(trailing_stop_hit(dec!(0.5), dec!(2), dec!(1.3)));
        assert!(!trailing_stop_hit(dec!(0.5), Decimal::ZERO, dec!(-3)));
    }

    #[test]
    fn test_trailing_stop_monotonic_in_hwm() {
        let current = dec!(0.8);
        let mut tripped = false;
        for step in 0..60 {
            let hwm = Decimal::from(step) / dec!(10);
            let hit = trailing_stop_hit(dec!(0.5), hwm, current);
            assert!(!tripped || hit, "trip reverted at hwm {hwm}");
            tripped |= hit;
        }
        assert!(tripped);
    }

    #[test]
    fn test_trigger_priority() {
        let mut cfg = config(ExitMode::Dynamic);
        cfg.profit_target_pct = dec!(10);
        let plan = ExitPlan::new(cfg, 0.0);

        assert_eq!(
            evaluate(&plan, &input(dec!(1.3), dec!(2), 30)),
            Some(ExitTrigger::TrailingStop)
        );
        assert_eq!(evaluate(&plan, &input(dec!(1.5), dec!(2), 30)), None);
        // Stop loss outranks timeout
        assert_eq!(
            evaluate(&plan, &input(dec!(-2), Decimal::ZERO, 500)),
            Some(ExitTrigger::StopLoss)
        );
        assert_eq!(
            evaluate(&plan, &input(dec!(0.1), dec!(0.1), 120)),
            Some(ExitTrigger::Timeout)
        );

        let plan = ExitPlan::new(config(ExitMode::Dynamic), 0.0);
        assert_eq!(
            evaluate(&plan, &input(dec!(1.6), dec!(1.6), 30)),
            Some(ExitTrigger::ProfitTarget)
        );
    }

    #[test]
    fn test_min_hold_suppresses_triggers() {
        let plan = ExitPlan::new(config(ExitMode::Dynamic), 0.0);

        assert_eq!(evaluate(&plan, &input(dec!(-5), Decimal::ZERO, 2)), None);
        assert_eq!(
            evaluate(&plan, &input(dec!(-5), Decimal::ZERO, 5)),
            Some(ExitTrigger::StopLoss)
        );
    }
}
