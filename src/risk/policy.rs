//! Authorization gate for capital-affecting actions.
//!
//! `evaluate` is a pure function of the proposed action and a read-only
//! context. It consumes the action: an approval wraps it in an
//! `ApprovedAction`, the only form the execution engine accepts.

use super::capital::PoolSnapshot;
use super::kill_switch::KillSwitchState;
use super::mdd::RiskState;
use crate::config::Config;
use crate::strategy::{ProposedAction, StrategyId};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// Why an action was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    KillSwitchTripped,
    PoolFrozen,
    InsufficientCapital {
        requested: Decimal,
        available: Decimal,
    },
    DailyLossLimit {
        loss: Decimal,
        limit: Decimal,
    },
    StrategyLossLimit {
        strategy: StrategyId,
        loss: Decimal,
        limit: Decimal,
    },
    VolatilityBreached {
        move_pct: Decimal,
        threshold: Decimal,
    },
    DuplicateInflight,
    /// Structurally invalid action; reported as a policy violation
    LimitViolation {
        detail: String,
    },
}

impl RejectReason {
    /// Violations escalate to the kill switch.
    pub fn is_violation(&self) -> bool {
        matches!(self, RejectReason::LimitViolation { .. })
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::KillSwitchTripped => write!(f, "kill switch tripped"),
            RejectReason::PoolFrozen => write!(f, "capital pool frozen"),
            RejectReason::InsufficientCapital {
                requested,
                available,
            } => write!(f, "insufficient capital: need {requested}, have {available}"),
            RejectReason::DailyLossLimit { loss, limit } => {
                write!(f, "daily loss {loss} reached limit {limit}")
            }
            RejectReason::StrategyLossLimit {
                strategy,
                loss,
                limit,
            } => write!(f, "{strategy} loss {loss} reached limit {limit}"),
            RejectReason::VolatilityBreached {
                move_pct,
                threshold,
            } => write!(f, "price moved {move_pct}% (limit {threshold}%)"),
            RejectReason::DuplicateInflight => write!(f, "action already in flight for instrument"),
            RejectReason::LimitViolation { detail } => write!(f, "limit violation: {detail}"),
        }
    }
}

/// Action cleared by the policy layer.
#[derive(Debug, Clone)]
pub struct ApprovedAction(ProposedAction);

impl ApprovedAction {
    pub(crate) fn new(action: ProposedAction) -> Self {
        Self(action)
    }

    pub fn action(&self) -> &ProposedAction {
        &self.0
    }

    pub fn into_inner(self) -> ProposedAction {
        self.0
    }
}

#[derive(Debug, Clone)]
pub enum PolicyDecision {
    Approve(ApprovedAction),
    Reject {
        action: ProposedAction,
        reason: RejectReason,
    },
}

impl PolicyDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, PolicyDecision::Approve(_))
    }
}

/// Limits the policy layer enforces, taken from a config snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyLimits {
    pub max_daily_loss: Decimal,
    pub max_strategy_loss: Decimal,
    pub extreme_move_pct: Decimal,
    /// Hard cap on the notional of any opening action
    pub max_trade_size: Decimal,
}

impl PolicyLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_daily_loss: config.risk.max_daily_loss,
            max_strategy_loss: config.risk.max_strategy_loss,
            extreme_move_pct: config.risk.extreme_move_pct,
            max_trade_size: config.tier_settings().max_trade_size,
        }
    }
}

/// Everything the policy layer reads. Borrowed, never mutated.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub risk: &'a RiskState,
    pub pool: Option<PoolSnapshot>,
    pub kill_switch: &'a KillSwitchState,
    /// A non-terminal order already exists for the instrument
    pub instrument_inflight: bool,
    /// Price move inside the volatility window (percent)
    pub price_move_pct: Option<Decimal>,
    pub limits: &'a PolicyLimits,
}

/// Approve or reject a proposed action.
///
/// Closing actions are only checked for structure and duplication, so
/// exposure can always be reduced, including after a kill switch trip.
pub fn evaluate(action: ProposedAction, ctx: &PolicyContext<'_>) -> PolicyDecision {
    match check(&action, ctx) {
        Ok(()) => PolicyDecision::Approve(ApprovedAction::new(action)),
        Err(reason) => PolicyDecision::Reject { action, reason },
    }
}

fn check(action: &ProposedAction, ctx: &PolicyContext<'_>) -> Result<(), RejectReason> {
    if action.size <= Decimal::ZERO || action.limit_price <= Decimal::ZERO {
        return Err(RejectReason::LimitViolation {
            detail: format!(
                "non-positive size {} or price {}",
                action.size, action.limit_price
            ),
        });
    }

    if ctx.instrument_inflight {
        return Err(RejectReason::DuplicateInflight);
    }

    if !action.opens_risk() {
        return Ok(());
    }

    if ctx.kill_switch.is_tripped() {
        return Err(RejectReason::KillSwitchTripped);
    }

    let pool = match ctx.pool {
        Some(pool) if !pool.frozen => pool,
        _ => return Err(RejectReason::PoolFrozen),
    };

    let notional = action.notional();
    if notional > ctx.limits.max_trade_size {
        return Err(RejectReason::LimitViolation {
            detail: format!(
                "notional {} above hard cap {}",
                notional, ctx.limits.max_trade_size
            ),
        });
    }

    if ctx.risk.daily_loss >= ctx.limits.max_daily_loss {
        return Err(RejectReason::DailyLossLimit {
            loss: ctx.risk.daily_loss,
            limit: ctx.limits.max_daily_loss,
        });
    }

    let strategy_loss = ctx.risk.strategy_loss(action.strategy);
    if strategy_loss >= ctx.limits.max_strategy_loss {
        return Err(RejectReason::StrategyLossLimit {
            strategy: action.strategy,
            loss: strategy_loss,
            limit: ctx.limits.max_strategy_loss,
        });
    }

    if let Some(move_pct) = ctx.price_move_pct {
        if move_pct > ctx.limits.extreme_move_pct {
            return Err(RejectReason::VolatilityBreached {
                move_pct,
                threshold: ctx.limits.extreme_move_pct,
            });
        }
    }

    if notional > pool.available {
        return Err(RejectReason::InsufficientCapital {
            requested: notional,
            available: pool.available,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Side, TimeInForce};
    use crate::risk::TripReason;
    use crate::strategy::ActionKind;
    use rust_decimal_macros::dec;

    fn limits() -> PolicyLimits {
        PolicyLimits {
            max_daily_loss: dec!(50),
            max_strategy_loss: dec!(40),
            extreme_move_pct: dec!(2),
            max_trade_size: dec!(50),
        }
    }

    fn pool(available: Decimal) -> PoolSnapshot {
        PoolSnapshot {
            strategy: StrategyId::EventReactive,
            total: dec!(100),
            locked: dec!(100) - available,
            available,
            frozen: false,
        }
    }

    fn action(kind: ActionKind, size: Decimal, price: Decimal) -> ProposedAction {
        ProposedAction {
            strategy: StrategyId::EventReactive,
            instrument_id: "X".to_string(),
            side: Side::Buy,
            size,
            limit_price: price,
            time_in_force: TimeInForce::Gtc,
            kind,
            rationale: "test".to_string(),
            exit_plan: None,
        }
    }

    fn decide(action: ProposedAction, ctx: &PolicyContext<'_>) -> Result<(), RejectReason> {
        match evaluate(action, ctx) {
            PolicyDecision::Approve(_) => Ok(()),
            PolicyDecision::Reject { reason, .. } => Err(reason),
        }
    }

    #[test]
    fn test_open_within_limits_is_approved() {
        let risk = RiskState::default();
        let armed = KillSwitchState::Armed;
        let limits = limits();
        let ctx = PolicyContext {
            risk: &risk,
            pool: Some(pool(dec!(100))),
            kill_switch: &armed,
            instrument_inflight: false,
            price_move_pct: Some(dec!(0.5)),
            limits: &limits,
        };

        assert!(decide(action(ActionKind::Open, dec!(20), dec!(0.5)), &ctx).is_ok());
    }

    #[test]
    fn test_rejection_reasons() {
        let risk = RiskState::default();
        let mut lossy = RiskState::default();
        lossy.daily_loss = dec!(50);
        let armed = KillSwitchState::Armed;
        let tripped = KillSwitchState::Tripped(TripReason::OperatorManual);
        let limits = limits();
        let base = PolicyContext {
            risk: &risk,
            pool: Some(pool(dec!(5))),
            kill_switch: &armed,
            instrument_inflight: false,
            price_move_pct: None,
            limits: &limits,
        };
        let open = || action(ActionKind::Open, dec!(20), dec!(0.5));

        assert!(matches!(
            decide(open(), &base),
            Err(RejectReason::InsufficientCapital { .. })
        ));

        let ctx = PolicyContext { kill_switch: &tripped, ..base.clone() };
        assert_eq!(decide(open(), &ctx), Err(RejectReason::KillSwitchTripped));

        let ctx = PolicyContext { instrument_inflight: true, ..base.clone() };
        assert_eq!(decide(open(), &ctx), Err(RejectReason::DuplicateInflight));

        let ctx = PolicyContext { price_move_pct: Some(dec!(3)), pool: Some(pool(dec!(100))), ..base.clone() };
        assert!(matches!(
            decide(open(), &ctx),
            Err(RejectReason::VolatilityBreached { .. })
        ));

        let mut frozen = pool(dec!(100));
        frozen.frozen = true;
        let ctx = PolicyContext { pool: Some(frozen), ..base.clone() };
        assert_eq!(decide(open(), &ctx), Err(RejectReason::PoolFrozen));

        let ctx = PolicyContext { risk: &lossy, pool: Some(pool(dec!(100))), ..base };
        assert!(matches!(
            decide(open(), &ctx),
            Err(RejectReason::DailyLossLimit { .. })
        ));
    }

    #[test]
    fn test_strategy_loss_limit() {
        let mut risk = RiskState::default();
        risk.strategy_loss.insert(StrategyId::EventReactive, dec!(45));
        let armed = KillSwitchState::Armed;
        let limits = limits();
        let ctx = PolicyContext {
            risk: &risk,
            pool: Some(pool(dec!(100))),
            kill_switch: &armed,
            instrument_inflight: false,
            price_move_pct: None,
            limits: &limits,
        };

        assert!(matches!(
            decide(action(ActionKind::Adjust, dec!(10), dec!(0.5)), &ctx),
            Err(RejectReason::StrategyLossLimit { .. })
        ));
    }

    #[test]
    fn test_oversized_action_is_violation() {
        let risk = RiskState::default();
        let armed = KillSwitchState::Armed;
        let limits = limits();
        let ctx = PolicyContext {
            risk: &risk,
            pool: Some(pool(dec!(100))),
            kill_switch: &armed,
            instrument_inflight: false,
            price_move_pct: None,
            limits: &limits,
        };

        let reason = decide(action(ActionKind::Open, dec!(200), dec!(0.5)), &ctx).unwrap_err();
        assert!(reason.is_violation());
    }

    #[test]
    fn test_close_bypasses_new_risk_checks_when_tripped() {
        let mut risk = RiskState::default();
        risk.daily_loss = dec!(500);
        let tripped = KillSwitchState::Tripped(TripReason::DrawdownBreach);
        let limits = limits();
        let mut frozen = pool(Decimal::ZERO);
        frozen.frozen = true;
        let ctx = PolicyContext {
            risk: &risk,
            pool: Some(frozen),
            kill_switch: &tripped,
            instrument_inflight: false,
            price_move_pct: Some(dec!(10)),
            limits: &limits,
        };

        let close = action(ActionKind::Close, dec!(20), dec!(0.5));
        assert!(decide(close, &ctx).is_ok());

        let ctx = PolicyContext { instrument_inflight: true, ..ctx };
        let close = action(ActionKind::Close, dec!(20), dec!(0.5));
        assert_eq!(decide(close, &ctx), Err(RejectReason::DuplicateInflight));
    }
}
