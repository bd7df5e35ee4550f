//! Continuous two-sided quoting.
//!
//! Each tick runs exits before quote logic. The quoted spread widens with
//! volatility, the quote center shifts toward the deeper side of the book and
//! away from held inventory. While flat the strategy bids; while holding it
//! offers the position out. A working quote that drifts past the re-quote
//! threshold is cancelled and replaced on a later tick.

use super::{ActionKind, ProposedAction, StrategyId};
use crate::config::StrategyBConfig;
use crate::exchange::{InstrumentId, MarketSnapshot, Side, TimeInForce};
use crate::execution::{ExitPlan, Position};
use crate::risk::PoolSnapshot;
use crate::utils::decimal::{ceil_to_tick, floor_to_tick, from_score, round_down_to_lot, safe_div};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const SIZE_STEP: Decimal = dec!(0.01);

/// Inputs for one quoting tick on one market.
pub struct QuoteTick<'a> {
    pub snapshot: &'a MarketSnapshot,
    pub volatility: f64,
    pub tick_size: Decimal,
    pub position: Option<&'a Position>,
    pub pool: &'a PoolSnapshot,
    /// Tier cap on the notional of one quote
    pub max_notional: Decimal,
    /// Close proposed by the exit evaluator for this tick, if any
    pub exit: Option<ProposedAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuoteDecision {
    Exit(ProposedAction),
    Quote(ProposedAction),
    /// Pull a working order before anything new goes out
    Cancel { order_id: String, reason: String },
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotePrices {
    pub bid: Decimal,
    pub ask: Decimal,
    /// Fraction of mid
    pub spread: Decimal,
}

#[derive(Debug, Clone)]
struct WorkingOrder {
    order_id: String,
    side: Side,
    price: Decimal,
    exit: bool,
}

#[derive(Debug, Default)]
struct MarketQuote {
    /// An action is with the policy layer or engine and not yet acknowledged
    pending: bool,
    pending_exit: bool,
    working: Option<WorkingOrder>,
    /// Last working bid was pulled for a re-quote
    replacing: bool,
    last_prices: Option<QuotePrices>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QuotingStats {
    pub quotes_sent: u64,
    pub requotes: u64,
    pub exits: u64,
    pub avg_spread: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketQuoteView {
    pub instrument_id: InstrumentId,
    pub working_order_id: Option<String>,
    pub working_side: Option<Side>,
    pub working_price: Option<Decimal>,
    pub last_prices: Option<QuotePrices>,
}

/// Consolidated view of the quoting book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotingSummary {
    pub active_markets: usize,
    pub working_orders: usize,
    pub markets: Vec<MarketQuoteView>,
    pub stats: QuotingStats,
}

#[derive(Default)]
struct Counters {
    quotes_sent: AtomicU64,
    requotes: AtomicU64,
    exits: AtomicU64,
}

pub struct QuotingStrategy {
    config: RwLock<StrategyBConfig>,
    markets: DashMap<InstrumentId, MarketQuote>,
    counters: Counters,
    spread_total: Mutex<(Decimal, u64)>,
}

impl QuotingStrategy {
    pub fn new(config: StrategyBConfig) -> Self {
        Self {
            config: RwLock::new(config),
            markets: DashMap::new(),
            counters: Counters::default(),
            spread_total: Mutex::new((Decimal::ZERO, 0)),
        }
    }

    pub fn reconfigure(&self, config: StrategyBConfig) {
        *self.config.write() = config;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Spread as a fraction of mid: `clamp(base * (1 + vol * (mult - 1)), min, max)`.
    pub fn dynamic_spread(&self, volatility: f64) -> Decimal {
        let cfg = self.config.read();
        let raw = cfg.base_spread * (Decimal::ONE + from_score(volatility) * (cfg.volatility_multiplier - Decimal::ONE));
        raw.max(cfg.min_spread).min(cfg.max_spread)
    }

    /// Bid and ask around a shifted mid. `None` without a two-sided book or
    /// when rounding collapses the quote.
    pub fn quote_prices(
        &self,
        snapshot: &MarketSnapshot,
        volatility: f64,
        inventory: Decimal,
        tick_size: Decimal,
    ) -> Option<QuotePrices> {
        let mid = snapshot.mid()?;
        let spread = self.dynamic_spread(volatility);
        let cfg = self.config.read();

        let shift = snapshot.imbalance(cfg.imbalance_levels) * cfg.imbalance_factor;
        let inventory_ratio = safe_div(inventory * mid, cfg.max_inventory)
            .max(Decimal::NEGATIVE_ONE)
            .min(Decimal::ONE);
        let skew = -inventory_ratio * cfg.inventory_skew_max;

        let center = mid * (Decimal::ONE + shift + skew);
        let half = spread / dec!(2);
        let bid = floor_to_tick(center * (Decimal::ONE - half), tick_size)
            .max(cfg.price_floor)
            .min(cfg.price_ceiling);
        let ask = ceil_to_tick(center * (Decimal::ONE + half), tick_size)
            .max(cfg.price_floor)
            .min(cfg.price_ceiling);

        (bid < ask).then_some(QuotePrices { bid, ask, spread })
    }

    /// Decide what to do on one market this tick.
    pub fn on_tick(&self, tick: &QuoteTick<'_>) -> QuoteDecision {
        let instrument_id = &tick.snapshot.instrument_id;
        let cfg = self.config.read().clone();
        let mut market = self.markets.entry(instrument_id.clone()).or_default();

        if market.pending {
            return QuoteDecision::Hold;
        }

        if let Some(exit) = &tick.exit {
            return match market.working.clone() {
                Some(working) if working.exit => QuoteDecision::Hold,
                Some(working) => QuoteDecision::Cancel {
                    order_id: working.order_id,
                    reason: format!("pre-exit ({})", exit.rationale),
                },
                None => {
                    market.pending = true;
                    market.pending_exit = true;
                    self.counters.exits.fetch_add(1, Ordering::Relaxed);
                    QuoteDecision::Exit(exit.clone())
                }
            };
        }

        if !cfg.enabled {
            return match market.working.as_ref() {
                Some(working) if !working.exit => QuoteDecision::Cancel {
                    order_id: working.order_id.clone(),
                    reason: "quoting disabled".to_string(),
                },
                _ => QuoteDecision::Hold,
            };
        }

        let held = tick.position.map(|p| p.size).unwrap_or(Decimal::ZERO);
        let Some(prices) = self.quote_prices(tick.snapshot, tick.volatility, held, tick.tick_size) else {
            return QuoteDecision::Hold;
        };
        market.last_prices = Some(prices);

        // Flat: bid for inventory. Holding: offer it out on the reducing side.
        let (side, price, kind) = if held > Decimal::ZERO {
            (Side::Sell, prices.ask, ActionKind::Close)
        } else if held < Decimal::ZERO {
            (Side::Buy, prices.bid, ActionKind::Close)
        } else if market.replacing {
            (Side::Buy, prices.bid, ActionKind::Adjust)
        } else {
            (Side::Buy, prices.bid, ActionKind::Open)
        };

        // A frozen pool only settles; new inventory is never bid for.
        if kind != ActionKind::Close && tick.pool.frozen {
            return QuoteDecision::Hold;
        }

        if let Some(working) = &market.working {
            if working.exit {
                return QuoteDecision::Hold;
            }
            let deviation = safe_div((working.price - price).abs(), working.price);
            if working.side != side || deviation > cfg.requote_threshold {
                self.counters.requotes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    instrument = %instrument_id,
                    working = %working.price,
                    target = %price,
                    %deviation,
                    "Quote drifted, re-quoting"
                );
                return QuoteDecision::Cancel {
                    order_id: working.order_id.clone(),
                    reason: "requote".to_string(),
                };
            }
            return QuoteDecision::Hold;
        }

        let size = match kind {
            ActionKind::Close => held.abs(),
            _ => {
                let notional = (tick.pool.available * cfg.trade_size_percent / dec!(100))
                    .min(cfg.max_inventory)
                    .min(tick.max_notional);
                let executable = tick.snapshot.max_executable_size(side, cfg.max_slippage_pct);
                round_down_to_lot(safe_div(notional, price).min(executable), SIZE_STEP)
            }
        };
        if size <= Decimal::ZERO {
            return QuoteDecision::Hold;
        }

        market.pending = true;
        drop(market);

        self.counters.quotes_sent.fetch_add(1, Ordering::Relaxed);
        {
            let mut total = self.spread_total.lock();
            total.0 += prices.spread;
            total.1 += 1;
        }

        info!(
            instrument = %instrument_id,
            %side,
            %price,
            %size,
            kind = ?kind,
            spread = %prices.spread,
            "Quote"
        );

        QuoteDecision::Quote(ProposedAction {
            strategy: StrategyId::Quoting,
            instrument_id: instrument_id.clone(),
            side,
            size,
            limit_price: price,
            time_in_force: TimeInForce::Gtc,
            kind,
            rationale: format!("quote:{}", if side == Side::Buy { "bid" } else { "ask" }),
            exit_plan: (kind != ActionKind::Close).then(|| ExitPlan::new(cfg.exit.clone(), tick.volatility)),
        })
    }

    /// The engine accepted a proposed action.
    pub fn on_order_submitted(&self, action: &ProposedAction, order_id: &str) {
        if let Some(mut market) = self.markets.get_mut(&action.instrument_id) {
            market.working = Some(WorkingOrder {
                order_id: order_id.to_string(),
                side: action.side,
                price: action.limit_price,
                exit: market.pending_exit,
            });
            market.pending = false;
            market.pending_exit = false;
            market.replacing = false;
        }
    }

    /// The action never became an order (policy rejection or submit failure).
    pub fn on_action_dropped(&self, instrument_id: &str) {
        if let Some(mut market) = self.markets.get_mut(instrument_id) {
            market.pending = false;
            market.pending_exit = false;
        }
    }

    pub fn on_order_terminal(&self, instrument_id: &str, order_id: &str, cancelled_for_requote: bool) {
        if let Some(mut market) = self.markets.get_mut(instrument_id) {
            if market.working.as_ref().map(|w| w.order_id.as_str()) == Some(order_id) {
                market.working = None;
                market.replacing = cancelled_for_requote;
            }
        }
    }

    /// Drop state for a market that left the selection. Only called once
    /// nothing is working and nothing is held there.
    pub fn forget(&self, instrument_id: &str) {
        self.markets.remove(instrument_id);
    }

    pub fn stats(&self) -> QuotingStats {
        let (total, count) = *self.spread_total.lock();
        QuotingStats {
            quotes_sent: self.counters.quotes_sent.load(Ordering::Relaxed),
            requotes: self.counters.requotes.load(Ordering::Relaxed),
            exits: self.counters.exits.load(Ordering::Relaxed),
            avg_spread: safe_div(total, Decimal::from(count)),
        }
    }

    pub fn summary(&self) -> QuotingSummary {
        let mut markets: Vec<MarketQuoteView> = self
            .markets
            .iter()
            .map(|entry| {
                let m = entry.value();
                MarketQuoteView {
                    instrument_id: entry.key().clone(),
                    working_order_id: m.working.as_ref().map(|w| w.order_id.clone()),
                    working_side: m.working.as_ref().map(|w| w.side),
                    working_price: m.working.as_ref().map(|w| w.price),
                    last_prices: m.last_prices,
                }
            })
            .collect();
        markets.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));

        QuotingSummary {
            active_markets: markets.len(),
            working_orders: markets.iter().filter(|m| m.working_order_id.is_some()).count(),
            markets,
            stats: self.stats(),
        }
    }
}
