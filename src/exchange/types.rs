//! Venue-neutral market and order types.

use crate::strategy::{ActionKind, StrategyId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type InstrumentId = String;

// ==================== Market Data ====================

/// A tradable outcome on the venue. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub outcome_tokens: Vec<String>,
    pub tick_size: Decimal,
    pub min_order_size: Decimal,
}

impl Instrument {
    pub fn new(id: impl Into<String>, tick_size: Decimal, min_order_size: Decimal) -> Self {
        Self {
            id: id.into(),
            outcome_tokens: Vec::new(),
            tick_size,
            min_order_size,
        }
    }

    pub fn with_outcome_tokens(mut self, tokens: Vec<String>) -> Self {
        self.outcome_tokens = tokens;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Point-in-time view of one instrument's book.
///
/// Bids are sorted best (highest) first, asks best (lowest) first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub instrument_id: InstrumentId,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub last_trade_price: Option<Decimal>,
    pub last_trade_at: Option<DateTime<Utc>>,
    /// Rolling 24h traded notional
    pub volume_24h: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Monotonic per instrument
    pub sequence: u64,
}

impl MarketSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / dec!(2)),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Spread as percent of mid.
    pub fn spread_pct(&self) -> Option<Decimal> {
        let mid = self.mid()?;
        if mid <= Decimal::ZERO {
            return None;
        }
        self.spread().map(|s| s / mid * dec!(100))
    }

    /// Total size resting on one side across the top `levels`.
    pub fn depth(&self, side: Side, levels: usize) -> Decimal {
        let book = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        book.iter().take(levels).map(|l| l.size).sum()
    }

    /// Mean level size across both sides of the top `levels`.
    pub fn avg_level_depth(&self, levels: usize) -> Decimal {
        let count = self.bids.iter().take(levels).count() + self.asks.iter().take(levels).count();
        if count == 0 {
            return Decimal::ZERO;
        }
        (self.depth(Side::Buy, levels) + self.depth(Side::Sell, levels)) / Decimal::from(count)
    }

    /// (bid depth - ask depth) / total over the top `levels`, in [-1, 1].
    pub fn imbalance(&self, levels: usize) -> Decimal {
        let bid = self.depth(Side::Buy, levels);
        let ask = self.depth(Side::Sell, levels);
        let total = bid + ask;
        if total == Decimal::ZERO {
            Decimal::ZERO
        } else {
            (bid - ask) / total
        }
    }

    /// Largest size that can be taken on `side` without walking the book
    /// further than `slippage_pct` from the touch.
    pub fn max_executable_size(&self, side: Side, slippage_pct: Decimal) -> Decimal {
        let factor = slippage_pct / dec!(100);
        match side {
            Side::Buy => {
                let Some(best) = self.best_ask() else {
                    return Decimal::ZERO;
                };
                let limit = best * (Decimal::ONE + factor);
                self.asks
                    .iter()
                    .take_while(|l| l.price <= limit)
                    .map(|l| l.size)
                    .sum()
            }
            Side::Sell => {
                let Some(best) = self.best_bid() else {
                    return Decimal::ZERO;
                };
                let limit = best * (Decimal::ONE - factor);
                self.bids
                    .iter()
                    .take_while(|l| l.price >= limit)
                    .map(|l| l.size)
                    .sum()
            }
        }
    }

    /// Touch price a taker on `side` would pay or receive.
    pub fn touch(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Buy => self.best_ask(),
            Side::Sell => self.best_bid(),
        }
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_milliseconds()
    }
}

/// Incremental change to one price level. Size zero removes the level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub instrument_id: InstrumentId,
    /// Buy updates the bid side, Sell the ask side
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Items produced by a market data source.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Snapshot(MarketSnapshot),
    Delta(BookDelta),
    /// Source saw no update within its staleness threshold
    Stale { instrument_id: InstrumentId },
}

impl MarketEvent {
    pub fn instrument_id(&self) -> &str {
        match self {
            MarketEvent::Snapshot(s) => &s.instrument_id,
            MarketEvent::Delta(d) => &d.instrument_id,
            MarketEvent::Stale { instrument_id } => instrument_id,
        }
    }
}

/// External low-latency event (score or outcome update).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastEvent {
    pub instrument_id: InstrumentId,
    pub kind: String,
    /// Side the event favours
    pub direction: Side,
    /// Signal strength in [0, 1]
    pub strength: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ==================== Orders ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till cancelled
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Submitted => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => 3,
        }
    }

    /// Transitions only move forward; terminal states are final.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == OrderStatus::PartiallyFilled && next == OrderStatus::PartiallyFilled {
            return true;
        }
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    pub instrument_id: InstrumentId,
    pub strategy: StrategyId,
    pub kind: ActionKind,
    pub side: Side,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub avg_fill_price: Decimal,
    pub limit_price: Decimal,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub venue_order_id: Option<String>,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.size - self.filled_size
    }

    pub fn notional(&self) -> Decimal {
        self.size * self.limit_price
    }
}

/// One execution reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Venue-side order state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VenueOrderState {
    /// Accepted and resting (possibly partially filled)
    Open,
    Filled,
    Cancelled,
    Rejected(String),
}

/// Venue acknowledgement. `fills` is cumulative for the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueAck {
    pub venue_order_id: String,
    pub state: VenueOrderState,
    pub fills: Vec<Fill>,
}

impl VenueAck {
    pub fn filled_size(&self) -> Decimal {
        self.fills.iter().map(|f| f.size).sum()
    }
}
