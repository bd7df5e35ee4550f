//! Event-reactive strategy: opens immediately on a qualifying external event.
//!
//! Each instrument carries a lock and a cooldown stamp. An event is ignored
//! while the instrument is locked (an order from a previous trigger is still
//! working) or inside the cooldown window that started at the last trigger.

use super::{ActionKind, ProposedAction, StrategyId};
use crate::config::{StrategyAConfig, TierSettings};
use crate::exchange::{FastEvent, InstrumentId, MarketSnapshot, Side, TimeInForce};
use crate::execution::ExitPlan;
use crate::risk::PoolSnapshot;
use crate::utils::decimal::{from_score, round_down_to_lot};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const SIZE_STEP: Decimal = dec!(0.01);

#[derive(Debug, Default)]
struct InstrumentSlot {
    locked: bool,
    last_trigger: Option<DateTime<Utc>>,
    pending_order: Option<String>,
}

/// Why an event produced no action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    WeakSignal,
    /// No cached book younger than the tier TTL
    StaleBook,
    NoLiquidity,
    NoCapital,
    /// Event points against the position this strategy already holds
    OpposesPosition,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Disabled => "disabled",
            SkipReason::WeakSignal => "weak_signal",
            SkipReason::StaleBook => "stale_book",
            SkipReason::NoLiquidity => "no_liquidity",
            SkipReason::NoCapital => "no_capital",
            SkipReason::OpposesPosition => "opposes_position",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Proposed(ProposedAction),
    /// An earlier trigger's order is still working
    Locked,
    CoolingDown { remaining_ms: i64 },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EventReactiveStats {
    pub triggers: u64,
    pub ignored: u64,
    pub wins: u64,
    pub losses: u64,
}

#[derive(Default)]
struct Counters {
    triggers: AtomicU64,
    ignored: AtomicU64,
    wins: AtomicU64,
    losses: AtomicU64,
}

pub struct EventReactiveStrategy {
    config: RwLock<StrategyAConfig>,
    tier: RwLock<TierSettings>,
    slots: DashMap<InstrumentId, InstrumentSlot>,
    books: DashMap<InstrumentId, (MarketSnapshot, DateTime<Utc>)>,
    counters: Counters,
}

impl EventReactiveStrategy {
    pub fn new(config: StrategyAConfig, tier: TierSettings) -> Self {
        Self {
            config: RwLock::new(config),
            tier: RwLock::new(tier),
            slots: DashMap::new(),
            books: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn reconfigure(&self, config: StrategyAConfig, tier: TierSettings) {
        *self.config.write() = config;
        *self.tier.write() = tier;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Remember the latest book for an instrument.
    pub fn cache_book(&self, snapshot: &MarketSnapshot, now: DateTime<Utc>) {
        self.books
            .insert(snapshot.instrument_id.clone(), (snapshot.clone(), now));
    }

    /// Cached book if it is younger than the tier TTL.
    pub fn cached_book(&self, instrument_id: &str, now: DateTime<Utc>) -> Option<MarketSnapshot> {
        let ttl = Duration::milliseconds(self.tier.read().book_cache_ttl_ms as i64);
        let entry = self.books.get(instrument_id)?;
        let (snapshot, cached_at) = entry.value();
        (now - *cached_at <= ttl).then(|| snapshot.clone())
    }

    /// React to an external event. `held` is the direction of the position
    /// this strategy already has in the instrument, if any; opens only add
    /// to it, reducing is left to the exit evaluator.
    pub fn on_event(
        &self,
        event: &FastEvent,
        pool: &PoolSnapshot,
        held: Option<Side>,
        volatility: f64,
        now: DateTime<Utc>,
    ) -> TriggerOutcome {
        let config = self.config.read().clone();
        if !config.enabled {
            return TriggerOutcome::Skipped(SkipReason::Disabled);
        }
        if event.strength < config.min_event_strength {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return TriggerOutcome::Skipped(SkipReason::WeakSignal);
        }
        if held.is_some_and(|side| side != event.direction) {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            debug!(instrument = %event.instrument_id, direction = %event.direction, "Event ignored: opposes held position");
            return TriggerOutcome::Skipped(SkipReason::OpposesPosition);
        }
        let Some(book) = self.cached_book(&event.instrument_id, now) else {
            return TriggerOutcome::Skipped(SkipReason::StaleBook);
        };

        {
            let mut slot = self.slots.entry(event.instrument_id.clone()).or_default();
            if slot.locked {
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                debug!(instrument = %event.instrument_id, "Event ignored: instrument locked");
                return TriggerOutcome::Locked;
            }
            if let Some(last) = slot.last_trigger {
                let elapsed = (now - last).num_milliseconds();
                let cooldown = config.cooldown_ms as i64;
                if elapsed < cooldown {
                    self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        instrument = %event.instrument_id,
                        remaining_ms = cooldown - elapsed,
                        "Event ignored: cooling down"
                    );
                    return TriggerOutcome::CoolingDown {
                        remaining_ms: cooldown - elapsed,
                    };
                }
            }
            slot.locked = true;
            slot.last_trigger = Some(now);
        }
        self.counters.triggers.fetch_add(1, Ordering::Relaxed);

        match self.build_action(event, &book, pool, volatility, &config) {
            Ok(action) => {
                info!(
                    instrument = %event.instrument_id,
                    kind = %event.kind,
                    side = %action.side,
                    size = %action.size,
                    limit = %action.limit_price,
                    volatility,
                    "Event trigger"
                );
                TriggerOutcome::Proposed(action)
            }
            Err(reason) => {
                self.release(&event.instrument_id);
                debug!(instrument = %event.instrument_id, %reason, "Trigger produced no action");
                TriggerOutcome::Skipped(reason)
            }
        }
    }

    fn build_action(
        &self,
        event: &FastEvent,
        book: &MarketSnapshot,
        pool: &PoolSnapshot,
        volatility: f64,
        config: &StrategyAConfig,
    ) -> Result<ProposedAction, SkipReason> {
        let tier = self.tier.read().clone();
        let side = event.direction;
        let touch = book.touch(side).ok_or(SkipReason::NoLiquidity)?;

        if pool.frozen || pool.available < tier.min_trade_size {
            return Err(SkipReason::NoCapital);
        }

        let budget = pool.available * config.trade_size_percent / dec!(100);
        let damped = budget / (Decimal::ONE + from_score(volatility));
        let notional = damped
            .min(tier.max_trade_size)
            .max(tier.min_trade_size)
            .min(pool.available);

        let slip = config.max_slippage_pct / dec!(100);
        let limit_price = match side {
            Side::Buy => touch * (Decimal::ONE + slip),
            Side::Sell => touch * (Decimal::ONE - slip),
        }
        .round_dp(6);
        if limit_price <= Decimal::ZERO {
            return Err(SkipReason::NoLiquidity);
        }

        let executable = book.max_executable_size(side, config.max_slippage_pct);
        let size = round_down_to_lot((notional / limit_price).min(executable), SIZE_STEP);
        if size <= Decimal::ZERO {
            return Err(SkipReason::NoLiquidity);
        }

        Ok(ProposedAction {
            strategy: StrategyId::EventReactive,
            instrument_id: event.instrument_id.clone(),
            side,
            size,
            limit_price,
            time_in_force: TimeInForce::Ioc,
            kind: ActionKind::Open,
            rationale: format!("event:{}", event.kind),
            exit_plan: Some(ExitPlan::new(config.exit.clone(), volatility)),
        })
    }

    /// Link a submitted order to the instrument's lock.
    pub fn on_order_submitted(&self, instrument_id: &str, order_id: &str) {
        if let Some(mut slot) = self.slots.get_mut(instrument_id) {
            slot.pending_order = Some(order_id.to_string());
        }
    }

    /// The order placed for a trigger finished; the instrument can trigger again
    /// once the cooldown allows.
    pub fn on_order_terminal(&self, instrument_id: &str, order_id: &str) {
        if let Some(mut slot) = self.slots.get_mut(instrument_id) {
            if slot.pending_order.as_deref() == Some(order_id) {
                slot.locked = false;
                slot.pending_order = None;
            }
        }
    }

    /// Drop the lock without an order (policy rejection or submit failure).
    pub fn release(&self, instrument_id: &str) {
        if let Some(mut slot) = self.slots.get_mut(instrument_id) {
            slot.locked = false;
            slot.pending_order = None;
        }
    }

    pub fn is_locked(&self, instrument_id: &str) -> bool {
        self.slots
            .get(instrument_id)
            .map(|s| s.locked)
            .unwrap_or(false)
    }

    /// Count a realized close as a win or a loss.
    pub fn record_outcome(&self, realized_pnl: Decimal) {
        if realized_pnl > Decimal::ZERO {
            self.counters.wins.fetch_add(1, Ordering::Relaxed);
        } else if realized_pnl < Decimal::ZERO {
            self.counters.losses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> EventReactiveStats {
        EventReactiveStats {
            triggers: self.counters.triggers.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
            wins: self.counters.wins.load(Ordering::Relaxed),
            losses: self.counters.losses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapitalTier;
    use crate::exchange::BookLevel;

    fn strategy() -> EventReactiveStrategy {
        let config = StrategyAConfig {
            cooldown_ms: 5_000,
            ..StrategyAConfig::default()
        };
        EventReactiveStrategy::new(config, CapitalTier::Small.settings())
    }

    fn book(now: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot {
            instrument_id: "X".to_string(),
            bids: vec![BookLevel::new(dec!(0.49), dec!(500))],
            asks: vec![BookLevel::new(dec!(0.50), dec!(500)), BookLevel::new(dec!(0.51), dec!(500))],
            last_trade_price: None,
            last_trade_at: None,
            volume_24h: Decimal::ZERO,
            timestamp: now,
            sequence: 1,
        }
    }

    fn event(now: DateTime<Utc>) -> FastEvent {
        FastEvent {
            instrument_id: "X".to_string(),
            kind: "score_update".to_string(),
            direction: Side::Buy,
            strength: dec!(0.8),
            timestamp: now,
        }
    }

    fn pool(available: Decimal) -> PoolSnapshot {
        PoolSnapshot {
            strategy: StrategyId::EventReactive,
            total: dec!(400),
            locked: dec!(400) - available,
            available,
            frozen: false,
        }
    }

    #[test]
    fn test_second_event_inside_cooldown_ignored() {
        let strategy = strategy();
        let t0 = Utc::now();
        strategy.cache_book(&book(t0), t0);

        let first = strategy.on_event(&event(t0), &pool(dec!(400)), None, 0.0, t0);
        assert!(matches!(first, TriggerOutcome::Proposed(_)));
        strategy.on_order_submitted("X", "ORD-000001");
        strategy.on_order_terminal("X", "ORD-000001");

        let t1 = t0 + Duration::seconds(1);
        strategy.cache_book(&book(t1), t1);
        let second = strategy.on_event(&event(t1), &pool(dec!(400)), None, 0.0, t1);
        assert_eq!(second, TriggerOutcome::CoolingDown { remaining_ms: 4_000 });

        let t6 = t0 + Duration::seconds(6);
        strategy.cache_book(&book(t6), t6);
        let third = strategy.on_event(&event(t6), &pool(dec!(400)), None, 0.0, t6);
        assert!(matches!(third, TriggerOutcome::Proposed(_)));

        let stats = strategy.stats();
        assert_eq!(stats.triggers, 2);
        assert_eq!(stats.ignored, 1);
    }

    #[test]
    fn test_locked_until_order_terminal() {
        let strategy = strategy();
        let t0 = Utc::now();
        strategy.cache_book(&book(t0), t0);

        strategy.on_event(&event(t0), &pool(dec!(400)), None, 0.0, t0);
        strategy.on_order_submitted("X", "ORD-000001");

        let t10 = t0 + Duration::seconds(10);
        strategy.cache_book(&book(t10), t10);
        assert_eq!(
            strategy.on_event(&event(t10), &pool(dec!(400)), None, 0.0, t10),
            TriggerOutcome::Locked
        );

        // A stale terminal for another order leaves the lock in place
        strategy.on_order_terminal("X", "ORD-000009");
        assert!(strategy.is_locked("X"));

        strategy.on_order_terminal("X", "ORD-000001");
        assert!(!strategy.is_locked("X"));
    }

    #[test]
    fn test_sizing_damped_and_bounded() {
        let strategy = strategy();
        let now = Utc::now();
        strategy.cache_book(&book(now), now);

        // 5% of 400 = 20, damped by 1 + 1.0 -> 10 notional at 0.505 limit
        let TriggerOutcome::Proposed(action) = strategy.on_event(&event(now), &pool(dec!(400)), None, 1.0, now) else {
            panic!("expected a proposal");
        };
        assert_eq!(action.limit_price, dec!(0.505));
        assert_eq!(action.size, dec!(19.80));
        assert_eq!(action.kind, ActionKind::Open);
        assert_eq!(action.time_in_force, TimeInForce::Ioc);
        assert_eq!(action.rationale, "event:score_update");

        let plan = action.exit_plan.unwrap();
        assert_eq!(plan.volatility_at_open, 1.0);
    }

    #[test]
    fn test_no_action_releases_lock() {
        let strategy = strategy();
        let now = Utc::now();
        strategy.cache_book(&book(now), now);

        let outcome = strategy.on_event(&event(now), &pool(dec!(0.5)), None, 0.0, now);
        assert_eq!(outcome, TriggerOutcome::Skipped(SkipReason::NoCapital));
        assert!(!strategy.is_locked("X"));
    }

    #[test]
    fn test_stale_book_skips_without_stamping() {
        let strategy = strategy();
        let now = Utc::now();
        strategy.cache_book(&book(now), now);

        let later = now + Duration::seconds(1);
        assert_eq!(
            strategy.on_event(&event(later), &pool(dec!(400)), None, 0.0, later),
            TriggerOutcome::Skipped(SkipReason::StaleBook)
        );

        strategy.cache_book(&book(later), later);
        assert!(matches!(
            strategy.on_event(&event(later), &pool(dec!(400)), None, 0.0, later),
            TriggerOutcome::Proposed(_)
        ));
    }

    #[test]
    fn test_weak_signal_ignored() {
        let strategy = strategy();
        let now = Utc::now();
        strategy.cache_book(&book(now), now);

        let mut weak = event(now);
        weak.strength = dec!(0.2);
        assert_eq!(
            strategy.on_event(&weak, &pool(dec!(400)), None, 0.0, now),
            TriggerOutcome::Skipped(SkipReason::WeakSignal)
        );
        assert_eq!(strategy.stats().ignored, 1);
    }

    #[test]
    fn test_event_against_held_position_skipped() {
        let strategy = strategy();
        let now = Utc::now();
        strategy.cache_book(&book(now), now);

        let mut sell = event(now);
        sell.direction = Side::Sell;
        assert_eq!(
            strategy.on_event(&sell, &pool(dec!(400)), Some(Side::Buy), 0.0, now),
            TriggerOutcome::Skipped(SkipReason::OpposesPosition)
        );
        assert!(!strategy.is_locked("X"));
        assert_eq!(strategy.stats().triggers, 0);

        // Same direction adds to the position
        assert!(matches!(
            strategy.on_event(&event(now), &pool(dec!(400)), Some(Side::Buy), 0.0, now),
            TriggerOutcome::Proposed(_)
        ));
    }
}
