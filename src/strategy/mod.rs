//! Trading strategies and market selection.
//!
//! - `event_reactive`: opens immediately on qualifying external events
//! - `quoting`: continuous two-sided quoting with dynamic spreads
//! - `scanner`: ranks markets and picks the ones worth tracking
//!
//! Strategies never touch the venue. They emit `ProposedAction`s that go
//! through the policy layer before execution.

mod event_reactive;
mod quoting;
mod scanner;

pub use event_reactive::{EventReactiveStats, EventReactiveStrategy, SkipReason, TriggerOutcome};
pub use quoting::{
    MarketQuoteView, QuoteDecision, QuotePrices, QuoteTick, QuotingStats, QuotingStrategy, QuotingSummary,
};
pub use scanner::{MarketActivity, MarketScanner, ScoredMarket};

use crate::exchange::{InstrumentId, Side, TimeInForce};
use crate::execution::ExitPlan;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Owner of a capital pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    /// Strategy A
    EventReactive,
    /// Strategy B
    Quoting,
}

impl StrategyId {
    pub const ALL: [StrategyId; 2] = [StrategyId::EventReactive, StrategyId::Quoting];
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyId::EventReactive => write!(f, "strategy_a"),
            StrategyId::Quoting => write!(f, "strategy_b"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// New exposure
    Open,
    /// Replacement of a resting quote
    Adjust,
    /// Reduces or flattens a position
    Close,
}

/// An order a strategy wants placed. Consumed by the policy layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedAction {
    pub strategy: StrategyId,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub size: Decimal,
    pub limit_price: Decimal,
    pub time_in_force: TimeInForce,
    pub kind: ActionKind,
    /// Short tag explaining why the action was proposed
    pub rationale: String,
    pub exit_plan: Option<ExitPlan>,
}

impl ProposedAction {
    pub fn notional(&self) -> Decimal {
        self.size * self.limit_price
    }

    /// Open and Adjust add exposure; Close only reduces it.
    pub fn opens_risk(&self) -> bool {
        !matches!(self.kind, ActionKind::Close)
    }
}
