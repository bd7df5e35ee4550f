//! Per-instrument actor.
//!
//! Each tracked instrument gets one task that owns its live order book and
//! processes market data, fast events, order completions and ticks strictly
//! in arrival order. Decision logic runs synchronously inside the task; the
//! only suspension points are venue calls and rate-limiter waits.

use super::feed::FeedEventKind;
use super::{Core, Lifecycle};
use crate::config::Config;
use crate::exchange::{FastEvent, Instrument, MarketEvent, MarketSnapshot, Order, OrderBook};
use crate::strategy::{ActionKind, QuoteDecision, QuoteTick, StrategyId, TriggerOutcome};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const BOOK_LEVELS: usize = 10;

/// Reason used when a quote is pulled so it can be replaced.
pub(crate) const REQUOTE_REASON: &str = "requote";

#[derive(Debug)]
pub(crate) enum InstrumentInput {
    Market(MarketEvent),
    Fast(FastEvent),
    /// Engine reported the order terminal
    Terminal(Order),
    /// Market entered or left the quoting selection
    Quoting(bool),
    Tick,
}

pub(crate) struct InstrumentWorker {
    core: Arc<Core>,
    instrument: Instrument,
    book: OrderBook,
    quoting: bool,
    /// Last successful fallback fetch
    refreshed_at: Option<DateTime<Utc>>,
    rx: mpsc::Receiver<InstrumentInput>,
}

impl InstrumentWorker {
    pub(crate) fn spawn(
        core: Arc<Core>,
        instrument: Instrument,
        quoting: bool,
        capacity: usize,
    ) -> mpsc::Sender<InstrumentInput> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self {
            book: OrderBook::new(instrument.id.clone()),
            core,
            instrument,
            quoting,
            refreshed_at: None,
            rx,
        };
        tokio::spawn(worker.run());
        tx
    }

    async fn run(mut self) {
        debug!(instrument = %self.instrument.id, quoting = self.quoting, "Worker started");
        while let Some(input) = self.rx.recv().await {
            if self.core.lifecycle() == Lifecycle::Stopped {
                if let InstrumentInput::Terminal(order) = &input {
                    self.core.notify_terminal(order);
                }
                continue;
            }
            // Config swaps wait for the evaluation in progress.
            let core = self.core.clone();
            let _gate = core.evaluation_gate.read().await;
            let config = core.config();
            self.handle(&config, input).await;
        }
        debug!(instrument = %self.instrument.id, "Worker stopped");
    }

    async fn handle(&mut self, config: &Config, input: InstrumentInput) {
        match input {
            InstrumentInput::Market(MarketEvent::Snapshot(snapshot)) => {
                if self.book.apply_snapshot(&snapshot) {
                    self.on_book(config).await;
                }
            }
            InstrumentInput::Market(MarketEvent::Delta(delta)) => {
                if self.book.apply_delta(&delta) {
                    self.on_book(config).await;
                }
            }
            InstrumentInput::Market(MarketEvent::Stale { .. }) => {
                if let Some(snapshot) = self.refresh_book(config).await {
                    self.on_snapshot(config, &snapshot).await;
                }
            }
            InstrumentInput::Fast(event) => self.on_fast_event(config, event).await,
            InstrumentInput::Terminal(order) => self.core.notify_terminal(&order),
            InstrumentInput::Quoting(quoting) => self.set_quoting(quoting).await,
            InstrumentInput::Tick => {
                let now = Utc::now();
                if self.is_stale(config, now) {
                    if let Some(snapshot) = self.refresh_book(config).await {
                        self.on_snapshot(config, &snapshot).await;
                    }
                } else if let Some(snapshot) = self.book.snapshot(BOOK_LEVELS) {
                    self.evaluate(config, &snapshot).await;
                }
            }
        }
    }

    fn is_stale(&self, config: &Config, now: DateTime<Utc>) -> bool {
        let threshold = ChronoDuration::milliseconds(config.orchestrator.staleness_ms as i64);
        let last = match (self.book.updated_at(), self.refreshed_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        last.map_or(true, |at| now - at > threshold)
    }

    async fn on_book(&mut self, config: &Config) {
        if let Some(snapshot) = self.book.snapshot(BOOK_LEVELS) {
            self.on_snapshot(config, &snapshot).await;
        }
    }

    /// Feed a fresh book into the volatility filter, the event cache and
    /// position marks, then evaluate.
    async fn on_snapshot(&mut self, config: &Config, snapshot: &MarketSnapshot) {
        let now = Utc::now();
        if let Some(mid) = snapshot.mid() {
            self.core.volatility.read().record(&self.instrument.id, mid, now);
        }
        self.core.strategy_a.cache_book(snapshot, now);
        self.core.engine.mark_to_market(snapshot);
        self.evaluate(config, snapshot).await;
    }

    /// Fallback snapshot from the venue when the stream went quiet.
    async fn refresh_book(&mut self, config: &Config) -> Option<MarketSnapshot> {
        let id = &self.instrument.id;
        let limiter_timeout = Duration::from_millis(config.execution.rate_limit_timeout_ms);
        let venue_timeout = Duration::from_millis(config.execution.venue_timeout_ms);

        let detail = match self.core.limiter.acquire(limiter_timeout).await {
            Err(e) => e.to_string(),
            Ok(()) => match tokio::time::timeout(venue_timeout, self.core.venue.fetch_snapshot(id)).await {
                Ok(Ok(snapshot)) => {
                    self.book.apply_snapshot(&snapshot);
                    self.refreshed_at = Some(Utc::now());
                    debug!(instrument = %id, sequence = snapshot.sequence, "Book refreshed from venue");
                    return Some(snapshot);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "snapshot fetch timed out".to_string(),
            },
        };

        warn!(instrument = %id, %detail, "Stale market data and fallback fetch failed");
        self.core.feed.publish(FeedEventKind::StaleData {
            instrument_id: id.clone(),
            detail,
        });
        None
    }

    async fn on_fast_event(&mut self, config: &Config, event: FastEvent) {
        let id = self.instrument.id.clone();
        if self.core.lifecycle() != Lifecycle::Running {
            debug!(instrument = %id, kind = %event.kind, "Event ignored while not running");
            return;
        }

        // Strategy A reads books from its short-TTL cache.
        if self.core.strategy_a.cached_book(&id, Utc::now()).is_none() {
            if let Some(snapshot) = self.refresh_book(config).await {
                self.core.strategy_a.cache_book(&snapshot, Utc::now());
            }
        }

        let Some(pool) = self.core.capital.snapshot(StrategyId::EventReactive) else {
            return;
        };
        let volatility = self.core.volatility.read().score(&id);
        let held = self
            .core
            .engine
            .position(StrategyId::EventReactive, &id)
            .and_then(|p| p.direction());

        match self.core.strategy_a.on_event(&event, &pool, held, volatility, Utc::now()) {
            TriggerOutcome::Proposed(action) => match self.core.dispatch(action) {
                Some(order_id) => self.core.strategy_a.on_order_submitted(&id, &order_id),
                None => self.core.strategy_a.release(&id),
            },
            TriggerOutcome::Locked => debug!(instrument = %id, "Event ignored, order working"),
            TriggerOutcome::CoolingDown { remaining_ms } => {
                debug!(instrument = %id, remaining_ms, "Event ignored, cooling down")
            }
            TriggerOutcome::Skipped(reason) => debug!(instrument = %id, %reason, "Event skipped"),
        }
    }

    async fn set_quoting(&mut self, quoting: bool) {
        if self.quoting == quoting {
            return;
        }
        self.quoting = quoting;
        info!(instrument = %self.instrument.id, quoting, "Quoting selection changed");

        if !quoting {
            if let Some(order) = self.inflight_order() {
                if order.strategy == StrategyId::Quoting && order.kind != ActionKind::Close {
                    self.cancel(&order.id, "market deselected").await;
                }
            }
        }
    }

    fn inflight_order(&self) -> Option<Order> {
        let order_id = self.core.engine.inflight_order(&self.instrument.id)?;
        self.core.engine.order(&order_id)
    }

    async fn cancel(&self, order_id: &str, reason: &str) {
        if let Err(e) = self.core.engine.cancel(order_id, reason).await {
            debug!(order_id, %reason, error = %e, "Cancel skipped");
        }
    }

    /// Exits for both strategies, then Strategy B's quote logic.
    async fn evaluate(&mut self, config: &Config, snapshot: &MarketSnapshot) {
        let id = self.instrument.id.clone();
        let now = Utc::now();
        let volatility = self.core.volatility.read().score(&id);

        // Strategy A exits. An order already working on the instrument goes
        // first, unless it is a resting quote that can be pulled.
        if let Some(close) = self
            .core
            .engine
            .evaluate_exits(StrategyId::EventReactive, snapshot, volatility, now)
        {
            match self.inflight_order() {
                None => {
                    self.core.dispatch(close);
                }
                Some(order) if order.strategy == StrategyId::Quoting && order.kind != ActionKind::Close => {
                    self.core.requote_cancels.insert(order.id.clone());
                    self.cancel(&order.id, "yield to exit").await;
                    if self.inflight_order().is_none() {
                        self.core.dispatch(close);
                    }
                }
                Some(_) => {}
            }
        }

        let position = self.core.engine.position(StrategyId::Quoting, &id);
        let holding = position.as_ref().is_some_and(|p| !p.is_flat());
        if !self.quoting && !holding {
            if self.inflight_order().is_none() {
                self.core.strategy_b.forget(&id);
            }
            return;
        }
        if let Some(order) = self.inflight_order() {
            if order.strategy != StrategyId::Quoting {
                return;
            }
        }
        let Some(pool) = self.core.capital.snapshot(StrategyId::Quoting) else {
            return;
        };

        let exit = self
            .core
            .engine
            .evaluate_exits(StrategyId::Quoting, snapshot, volatility, now);
        let decision = self.core.strategy_b.on_tick(&QuoteTick {
            snapshot,
            volatility,
            tick_size: self.instrument.tick_size,
            position: position.as_ref(),
            pool: &pool,
            max_notional: config.tier_settings().max_trade_size,
            exit,
        });

        match decision {
            QuoteDecision::Exit(action) | QuoteDecision::Quote(action) => {
                let proposed = action.clone();
                match self.core.dispatch(action) {
                    Some(order_id) => self.core.strategy_b.on_order_submitted(&proposed, &order_id),
                    None => self.core.strategy_b.on_action_dropped(&id),
                }
            }
            QuoteDecision::Cancel { order_id, reason } => {
                if reason == REQUOTE_REASON {
                    self.core.requote_cancels.insert(order_id.clone());
                }
                self.cancel(&order_id, &reason).await;
            }
            QuoteDecision::Hold => {}
        }
    }
}
