//! Order lifecycle, positions and PnL.
//!
//! Every approved action becomes one `Order` driven by its own task:
//! Pending → (rate-limit token) → Submitted → venue ack → polled until
//! terminal or timed out. Orders only move forward through their states and
//! at most one non-terminal order exists per instrument.
//!
//! Opening orders watch the kill switch while they wait on the rate limiter
//! and recheck it after every wait, so nothing that adds exposure reaches the
//! venue after a trip.

use super::exits::{self, ExitInput, ExitPlan};
use super::position::Position;
use super::rate_limiter::RateLimiter;
use crate::config::{Config, ExecutionConfig, ExitConfig};
use crate::error::{EngineError, Result, VenueError};
use crate::exchange::{
    Fill, InstrumentId, MarketSnapshot, Order, OrderStatus, Side, TimeInForce, VenueAck,
    VenueClient, VenueOrderState,
};
use crate::risk::{
    ApprovedAction, CapitalManager, FaultConfig, FaultMonitor, KillSwitch, PoolSnapshot,
    Reservation, RiskState, RiskTracker, TripReason,
};
use crate::strategy::{ActionKind, ProposedAction, StrategyId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Events the engine reports back to the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionReport {
    Fill {
        order_id: String,
        strategy: StrategyId,
        instrument_id: InstrumentId,
        kind: ActionKind,
        side: Side,
        price: Decimal,
        size: Decimal,
        realized_pnl: Decimal,
    },
    /// Sent once per order, after its capital has been settled
    Terminal { order: Order },
}

/// Caller's view of a submitted order.
pub struct OrderHandle {
    pub order_id: String,
    pub instrument_id: InstrumentId,
    status: watch::Receiver<OrderStatus>,
}

impl OrderHandle {
    pub fn status(&self) -> OrderStatus {
        *self.status.borrow()
    }

    /// Resolve once the order reaches a terminal state.
    pub async fn wait_terminal(&mut self) -> OrderStatus {
        let resolved = self.status.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match resolved {
            Ok(status) => status,
            Err(_) => *self.status.borrow(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub submitted: u64,
    pub filled: u64,
    pub partially_filled: u64,
    pub rejected: u64,
    pub cancelled: u64,
    /// Filled share of terminal orders
    pub fill_success_rate: f64,
    /// Share of submitted orders that saw a partial fill
    pub partial_fill_rate: f64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    filled: AtomicU64,
    partially_filled: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

/// Consolidated position and PnL view.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub positions: Vec<Position>,
    pub pools: Vec<PoolSnapshot>,
    pub open_orders: usize,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub risk: RiskState,
    pub stats: ExecutionStats,
}

struct OrderRecord {
    order: Order,
    reservation: Option<Reservation>,
    /// Locked capital already moved onto the position by fills
    transferred: Decimal,
    applied_fills: usize,
    exit_plan: Option<ExitPlan>,
    status_tx: watch::Sender<OrderStatus>,
    finalized: bool,
}

/// Order fields needed to book a fill without holding the order entry.
struct FillContext {
    order_id: String,
    strategy: StrategyId,
    instrument_id: InstrumentId,
    kind: ActionKind,
    side: Side,
    limit_price: Decimal,
    exit_plan: Option<ExitPlan>,
}

enum Gate {
    Open,
    Tripped,
    Limited(EngineError),
}

type PositionKey = (StrategyId, InstrumentId);

pub struct ExecutionEngine {
    venue: Arc<dyn VenueClient>,
    limiter: Arc<RateLimiter>,
    capital: Arc<CapitalManager>,
    kill_switch: Arc<KillSwitch>,
    config: RwLock<ExecutionConfig>,
    exit_configs: RwLock<HashMap<StrategyId, ExitConfig>>,
    orders: DashMap<String, OrderRecord>,
    inflight: DashMap<InstrumentId, String>,
    positions: DashMap<PositionKey, Position>,
    risk: Mutex<RiskTracker>,
    faults: Mutex<FaultMonitor>,
    reports: mpsc::UnboundedSender<ExecutionReport>,
    counters: Counters,
    order_seq: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(
        config: &Config,
        venue: Arc<dyn VenueClient>,
        limiter: Arc<RateLimiter>,
        capital: Arc<CapitalManager>,
        kill_switch: Arc<KillSwitch>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutionReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let initial_equity = capital.total_capital();

        let engine = Arc::new(Self {
            venue,
            limiter,
            capital,
            kill_switch,
            config: RwLock::new(config.execution.clone()),
            exit_configs: RwLock::new(exit_configs(config)),
            orders: DashMap::new(),
            inflight: DashMap::new(),
            positions: DashMap::new(),
            risk: Mutex::new(RiskTracker::new(config.risk.max_drawdown_pct, initial_equity)),
            faults: Mutex::new(FaultMonitor::new(FaultConfig::from(&config.risk))),
            reports,
            counters: Counters::default(),
            order_seq: AtomicU64::new(1),
        });
        (engine, rx)
    }

    /// Apply a new configuration snapshot. Orders already in flight keep the
    /// timeouts they started with.
    pub fn reconfigure(&self, config: &Config) {
        *self.config.write() = config.execution.clone();
        *self.exit_configs.write() = exit_configs(config);
        self.risk.lock().set_max_drawdown_pct(config.risk.max_drawdown_pct);
        self.faults.lock().set_config(FaultConfig::from(&config.risk));
    }

    pub fn exit_config(&self, strategy: StrategyId) -> Option<ExitConfig> {
        self.exit_configs.read().get(&strategy).cloned()
    }

    // ==================== Submission ====================

    /// Create a Pending order for an approved action and start driving it.
    #[instrument(skip(self, approved), fields(instrument = %approved.action().instrument_id))]
    pub fn submit(self: &Arc<Self>, approved: ApprovedAction) -> Result<OrderHandle> {
        let action = approved.into_inner();

        let slot = match self.inflight.entry(action.instrument_id.clone()) {
            Entry::Occupied(existing) => {
                warn!(
                    instrument = %action.instrument_id,
                    inflight = %existing.get(),
                    "Submission refused: order already in flight"
                );
                return Err(EngineError::DuplicateInflight {
                    instrument: action.instrument_id,
                });
            }
            Entry::Vacant(slot) => slot,
        };

        let (size, reservation) = if action.opens_risk() {
            self.ensure_adds_to_position(&action)?;
            let reservation = self.capital.allocate(action.strategy, action.notional())?;
            (action.size, Some(reservation))
        } else {
            (self.prepare_close(&action)?, None)
        };

        let now = Utc::now();
        let order_id = format!("ORD-{:06}", self.order_seq.fetch_add(1, Ordering::SeqCst));
        let order = Order {
            id: order_id.clone(),
            instrument_id: action.instrument_id.clone(),
            strategy: action.strategy,
            kind: action.kind,
            side: action.side,
            size,
            filled_size: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            limit_price: action.limit_price,
            time_in_force: action.time_in_force,
            status: OrderStatus::Pending,
            venue_order_id: None,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        };

        info!(
            order_id = %order_id,
            strategy = %action.strategy,
            instrument = %action.instrument_id,
            side = %action.side,
            kind = ?action.kind,
            size = %size,
            limit = %action.limit_price,
            rationale = %action.rationale,
            "Order created"
        );

        let (status_tx, status_rx) = watch::channel(OrderStatus::Pending);
        self.orders.insert(
            order_id.clone(),
            OrderRecord {
                order,
                reservation,
                transferred: Decimal::ZERO,
                applied_fills: 0,
                exit_plan: action.exit_plan,
                status_tx,
                finalized: false,
            },
        );
        slot.insert(order_id.clone());

        let engine = Arc::clone(self);
        let task_id = order_id.clone();
        tokio::spawn(async move { engine.drive(task_id).await });

        Ok(OrderHandle {
            order_id,
            instrument_id: action.instrument_id,
            status: status_rx,
        })
    }

    /// Orders are never re-driven. A live order hands back a handle to
    /// itself; a finished one is refused.
    pub fn resubmit(&self, order_id: &str) -> Result<OrderHandle> {
        let record = self
            .orders
            .get(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        if record.order.status.is_terminal() {
            return Err(EngineError::OrderAlreadyTerminal(order_id.to_string()));
        }
        Ok(OrderHandle {
            order_id: order_id.to_string(),
            instrument_id: record.order.instrument_id.clone(),
            status: record.status_tx.subscribe(),
        })
    }

    /// Clamp a close to the held size and mark the position as closing.
    /// Opening orders may only grow a held position. Capital reserved by
    /// opens is released by closes, so an open that reduces would strand it.
    fn ensure_adds_to_position(&self, action: &ProposedAction) -> Result<()> {
        let key = (action.strategy, action.instrument_id.clone());
        let held = self.positions.get(&key).and_then(|p| p.direction());
        match held {
            Some(direction) if direction != action.side => Err(EngineError::InvalidState(format!(
                "{:?} {} would reduce {} position in {}",
                action.kind, action.side, direction, action.instrument_id
            ))),
            _ => Ok(()),
        }
    }

    fn prepare_close(&self, action: &ProposedAction) -> Result<Decimal> {
        let key = (action.strategy, action.instrument_id.clone());
        let mut position = self.positions.get_mut(&key).ok_or_else(|| {
            EngineError::InvalidState(format!("no {} position in {}", action.strategy, action.instrument_id))
        })?;

        match position.direction() {
            Some(direction) if direction == action.side.opposite() => {}
            _ => {
                return Err(EngineError::InvalidState(format!(
                    "close side {} does not reduce position {}",
                    action.side, position.size
                )))
            }
        }

        position.closing = true;
        Ok(action.size.min(position.size.abs()))
    }

    // ==================== Order task ====================

    async fn drive(self: Arc<Self>, order_id: String) {
        let cfg = self.config.read().clone();
        let Some((instrument, opens)) = self
            .orders
            .get(&order_id)
            .map(|r| (r.order.instrument_id.clone(), r.order.kind != ActionKind::Close))
        else {
            return;
        };

        match self.gate(opens, Duration::from_millis(cfg.rate_limit_timeout_ms)).await {
            Gate::Open => {}
            Gate::Tripped => {
                info!(order_id = %order_id, "Kill switch tripped before submission");
                self.cancel_locally(&order_id, "kill switch tripped");
                return;
            }
            Gate::Limited(err) => {
                self.faults.lock().record_rate_limited("submit_order");
                self.transition(&order_id, OrderStatus::Rejected, Some(err.to_string()));
                self.finalize(&order_id);
                return;
            }
        }

        if opens && self.kill_switch.is_tripped() {
            self.cancel_locally(&order_id, "kill switch tripped");
            return;
        }
        if !self.transition(&order_id, OrderStatus::Submitted, None) {
            // Cancelled while waiting for a token
            self.finalize(&order_id);
            return;
        }

        let Some(order) = self.order(&order_id) else {
            return;
        };
        let venue_timeout = Duration::from_millis(cfg.venue_timeout_ms);
        let ack = match tokio::time::timeout(venue_timeout, self.venue.submit_order(&order)).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(err)) => return self.venue_failure(&order_id, &instrument, err),
            Err(_) => return self.venue_failure(&order_id, &instrument, VenueError::Timeout),
        };
        self.faults.lock().record_success(&instrument);

        if self.status(&order_id).is_terminal() {
            // Cancelled while the request was in flight
            self.book_ack(&order_id, &ack);
            if ack.state == VenueOrderState::Open {
                self.send_cancel(&ack.venue_order_id, venue_timeout).await;
            }
            self.finalize(&order_id);
            return;
        }

        if self.apply_ack(&order_id, &ack).is_terminal() {
            self.finalize(&order_id);
            return;
        }

        self.poll(&order_id, opens, &cfg).await;
    }

    /// Wait for a token. Opening orders give up as soon as the kill switch trips.
    async fn gate(&self, opens: bool, timeout: Duration) -> Gate {
        if !opens {
            return match self.limiter.acquire(timeout).await {
                Ok(()) => Gate::Open,
                Err(err) => Gate::Limited(err),
            };
        }

        let mut kill = self.kill_switch.subscribe();
        tokio::select! {
            biased;
            _ = kill.wait_for(|state| state.is_tripped()) => Gate::Tripped,
            acquired = self.limiter.acquire(timeout) => match acquired {
                Ok(()) => Gate::Open,
                Err(err) => Gate::Limited(err),
            },
        }
    }

    /// Poll a resting order until it is terminal or its timeout elapses.
    async fn poll(&self, order_id: &str, opens: bool, cfg: &ExecutionConfig) {
        let deadline = Instant::now() + Duration::from_millis(cfg.order_timeout_ms);
        let interval = Duration::from_millis(cfg.fill_poll_interval_ms.max(1));
        let venue_timeout = Duration::from_millis(cfg.venue_timeout_ms);
        let limiter_timeout = Duration::from_millis(cfg.rate_limit_timeout_ms).min(interval * 4);

        loop {
            tokio::time::sleep(interval).await;

            if self.status(order_id).is_terminal() {
                self.finalize(order_id);
                return;
            }
            if opens && self.kill_switch.is_tripped() {
                self.cancel_at_venue(order_id, "kill switch tripped", venue_timeout).await;
                return;
            }
            if Instant::now() >= deadline {
                info!(order_id = %order_id, "Order timed out, cancelling");
                self.cancel_at_venue(order_id, "order timeout", venue_timeout).await;
                return;
            }

            match self.gate(opens, limiter_timeout).await {
                Gate::Open => {}
                Gate::Tripped => {
                    self.cancel_at_venue(order_id, "kill switch tripped", venue_timeout).await;
                    return;
                }
                Gate::Limited(_) => continue,
            }

            let Some(venue_order_id) = self.venue_order_id(order_id) else {
                return;
            };
            match tokio::time::timeout(venue_timeout, self.venue.order_status(&venue_order_id)).await {
                Ok(Ok(ack)) => {
                    if self.status(order_id).is_terminal() {
                        self.book_ack(order_id, &ack);
                        self.finalize(order_id);
                        return;
                    }
                    if self.apply_ack(order_id, &ack).is_terminal() {
                        self.finalize(order_id);
                        return;
                    }
                }
                Ok(Err(err)) => {
                    self.send_cancel(&venue_order_id, venue_timeout).await;
                    let instrument = self
                        .order(order_id)
                        .map(|o| o.instrument_id)
                        .unwrap_or_default();
                    return self.venue_failure(order_id, &instrument, err);
                }
                Err(_) => {
                    self.send_cancel(&venue_order_id, venue_timeout).await;
                    let instrument = self
                        .order(order_id)
                        .map(|o| o.instrument_id)
                        .unwrap_or_default();
                    return self.venue_failure(order_id, &instrument, VenueError::Timeout);
                }
            }
        }
    }

    fn venue_failure(&self, order_id: &str, instrument: &str, err: VenueError) {
        warn!(order_id = %order_id, %instrument, error = %err, "Venue call failed, rejecting order");

        let alert = self.faults.lock().record_venue_error(instrument, &err, Utc::now());
        if let Some(alert) = alert {
            if alert.systemic {
                self.kill_switch.trip(TripReason::SystemicFault, alert.message);
            }
        }

        let reason = match err {
            VenueError::Timeout => EngineError::VenueTimeout { operation: "venue call" }.to_string(),
            other => EngineError::from(other).to_string(),
        };
        self.transition(order_id, OrderStatus::Rejected, Some(reason));
        self.finalize(order_id);
    }

    // ==================== State transitions ====================

    fn transition(&self, order_id: &str, next: OrderStatus, reason: Option<String>) -> bool {
        let Some(mut record) = self.orders.get_mut(order_id) else {
            return false;
        };
        let prev = record.order.status;
        if !prev.can_transition_to(next) {
            return false;
        }

        record.order.status = next;
        record.order.updated_at = Utc::now();
        if reason.is_some() {
            record.order.reject_reason = reason;
        }
        record.status_tx.send_replace(next);

        match next {
            OrderStatus::Submitted => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            OrderStatus::PartiallyFilled if prev != OrderStatus::PartiallyFilled => {
                self.counters.partially_filled.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        debug!(order_id = %order_id, ?prev, ?next, "Order transition");
        true
    }

    /// Mark an order Cancelled. Returns its venue id (if any) when this call
    /// performed the transition.
    fn mark_cancelled(&self, order_id: &str, reason: &str) -> Option<Option<String>> {
        if !self.transition(order_id, OrderStatus::Cancelled, Some(reason.to_string())) {
            return None;
        }
        Some(self.venue_order_id(order_id))
    }

    fn cancel_locally(&self, order_id: &str, reason: &str) {
        self.mark_cancelled(order_id, reason);
        self.finalize(order_id);
    }

    async fn cancel_at_venue(&self, order_id: &str, reason: &str, venue_timeout: Duration) {
        if let Some(Some(venue_order_id)) = self.mark_cancelled(order_id, reason) {
            self.send_cancel(&venue_order_id, venue_timeout).await;
        }
        self.finalize(order_id);
    }

    async fn send_cancel(&self, venue_order_id: &str, venue_timeout: Duration) {
        match tokio::time::timeout(venue_timeout, self.venue.cancel_order(venue_order_id)).await {
            Ok(Ok(())) => debug!(%venue_order_id, "Cancel acknowledged"),
            Ok(Err(err)) => warn!(%venue_order_id, error = %err, "Cancel failed"),
            Err(_) => warn!(%venue_order_id, "Cancel timed out"),
        }
    }

    /// Settle a terminal order exactly once: release unused capital, free
    /// the instrument and report.
    fn finalize(&self, order_id: &str) {
        let (order, leftover) = {
            let Some(mut record) = self.orders.get_mut(order_id) else {
                return;
            };
            if record.finalized || !record.order.status.is_terminal() {
                return;
            }
            record.finalized = true;
            let transferred = record.transferred;
            let leftover = record
                .reservation
                .take()
                .map(|r| (r.amount - transferred).max(Decimal::ZERO))
                .unwrap_or(Decimal::ZERO);
            (record.order.clone(), leftover)
        };

        if leftover > Decimal::ZERO {
            if let Err(e) = self.capital.release_amount(order.strategy, leftover) {
                error!(order_id = %order_id, error = %e, "Failed to release order capital");
            }
        }

        self.inflight.remove_if(&order.instrument_id, |_, id| id == order_id);

        if order.kind == ActionKind::Close {
            if let Some(mut position) = self
                .positions
                .get_mut(&(order.strategy, order.instrument_id.clone()))
            {
                position.closing = false;
            }
        }

        let counter = match order.status {
            OrderStatus::Filled => &self.counters.filled,
            OrderStatus::Cancelled => &self.counters.cancelled,
            _ => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        info!(
            order_id = %order_id,
            instrument = %order.instrument_id,
            status = ?order.status,
            filled = %order.filled_size,
            reason = order.reject_reason.as_deref().unwrap_or(""),
            "Order finished"
        );
        let _ = self.reports.send(ExecutionReport::Terminal { order });
    }

    // ==================== Fills ====================

    /// Book fills and move the order to the state the venue reports.
    fn apply_ack(&self, order_id: &str, ack: &VenueAck) -> OrderStatus {
        let filled = self.book_ack(order_id, ack);

        let next = match &ack.state {
            VenueOrderState::Filled => Some((OrderStatus::Filled, None)),
            VenueOrderState::Cancelled => Some((OrderStatus::Cancelled, Some("cancelled by venue".to_string()))),
            VenueOrderState::Rejected(reason) => Some((OrderStatus::Rejected, Some(reason.clone()))),
            VenueOrderState::Open if filled > Decimal::ZERO => Some((OrderStatus::PartiallyFilled, None)),
            VenueOrderState::Open => None,
        };
        if let Some((status, reason)) = next {
            self.transition(order_id, status, reason);
        }
        self.status(order_id)
    }

    /// Apply fills not seen before. Returns the order's filled size.
    fn book_ack(&self, order_id: &str, ack: &VenueAck) -> Decimal {
        let (ctx, fills, filled) = {
            let Some(mut record) = self.orders.get_mut(order_id) else {
                return Decimal::ZERO;
            };
            record.order.venue_order_id = Some(ack.venue_order_id.clone());

            let fills: Vec<Fill> = ack.fills.iter().skip(record.applied_fills).cloned().collect();
            record.applied_fills = record.applied_fills.max(ack.fills.len());

            for fill in &fills {
                let prior = record.order.filled_size;
                let total = prior + fill.size;
                if total > Decimal::ZERO {
                    record.order.avg_fill_price =
                        (record.order.avg_fill_price * prior + fill.price * fill.size) / total;
                }
                record.order.filled_size = total;
                if record.order.kind != ActionKind::Close {
                    let limit = record.order.limit_price;
                    record.transferred += fill.size * limit;
                }
            }

            let ctx = FillContext {
                order_id: order_id.to_string(),
                strategy: record.order.strategy,
                instrument_id: record.order.instrument_id.clone(),
                kind: record.order.kind,
                side: record.order.side,
                limit_price: record.order.limit_price,
                exit_plan: record.exit_plan.clone(),
            };
            (ctx, fills, record.order.filled_size)
        };

        for fill in &fills {
            self.apply_fill(&ctx, fill);
        }
        filled
    }

    fn apply_fill(&self, ctx: &FillContext, fill: &Fill) {
        let key = (ctx.strategy, ctx.instrument_id.clone());
        let (realized, released, flat) = {
            let mut position = self
                .positions
                .entry(key.clone())
                .or_insert_with(|| Position::new(ctx.instrument_id.clone(), ctx.strategy, fill.timestamp));

            let before = position.size.abs();
            let realized = position.apply_fill(ctx.side, fill.price, fill.size, fill.timestamp);

            let released = match ctx.kind {
                ActionKind::Open | ActionKind::Adjust => {
                    position.reserved += fill.size * ctx.limit_price;
                    if position.exit_plan.is_none() {
                        position.exit_plan = ctx.exit_plan.clone();
                    }
                    Decimal::ZERO
                }
                ActionKind::Close => {
                    let share = if position.is_flat() || before == Decimal::ZERO {
                        position.reserved
                    } else {
                        position.reserved * fill.size.min(before) / before
                    };
                    position.reserved -= share;
                    share
                }
            };
            (realized, released, position.is_flat())
        };

        if released > Decimal::ZERO {
            if let Err(e) = self.capital.release_amount(ctx.strategy, released) {
                error!(order_id = %ctx.order_id, error = %e, "Failed to release position capital");
            }
        }
        if realized != Decimal::ZERO || ctx.kind == ActionKind::Close {
            if let Err(e) = self.capital.settle(ctx.strategy, realized) {
                error!(order_id = %ctx.order_id, error = %e, "Failed to settle realized PnL");
            }
            self.risk.lock().record_realized(ctx.strategy, realized, fill.timestamp);
        }
        if flat {
            self.positions.remove_if(&key, |_, p| p.is_flat());
        }
        self.update_equity();

        info!(
            order_id = %ctx.order_id,
            instrument = %ctx.instrument_id,
            side = %ctx.side,
            price = %fill.price,
            size = %fill.size,
            realized = %realized,
            "Fill applied"
        );
        let _ = self.reports.send(ExecutionReport::Fill {
            order_id: ctx.order_id.clone(),
            strategy: ctx.strategy,
            instrument_id: ctx.instrument_id.clone(),
            kind: ctx.kind,
            side: ctx.side,
            price: fill.price,
            size: fill.size,
            realized_pnl: realized,
        });
    }

    fn unrealized_pnl(&self) -> Decimal {
        self.positions.iter().map(|p| p.unrealized_pnl).sum()
    }

    fn update_equity(&self) {
        let equity = self.capital.total_capital() + self.unrealized_pnl();
        if self.risk.lock().update_equity(equity) {
            debug!(%equity, "Session drawdown limit reached");
        }
    }

    // ==================== Marking and exits ====================

    /// Mark every position in the snapshot's instrument at mid.
    pub fn mark_to_market(&self, snapshot: &MarketSnapshot) {
        let Some(mid) = snapshot.mid() else {
            return;
        };
        let mut marked = false;
        for strategy in StrategyId::ALL {
            if let Some(mut position) = self
                .positions
                .get_mut(&(strategy, snapshot.instrument_id.clone()))
            {
                position.mark(mid);
                marked = true;
            }
        }
        if marked {
            self.update_equity();
        }
    }

    /// Close action for the strategy's position when an exit condition holds.
    /// Callers decide whether an order already working on the instrument
    /// should be cancelled first.
    pub fn evaluate_exits(
        &self,
        strategy: StrategyId,
        snapshot: &MarketSnapshot,
        volatility: f64,
        now: DateTime<Utc>,
    ) -> Option<ProposedAction> {
        let key = (strategy, snapshot.instrument_id.clone());
        let (direction, size, plan, input) = {
            let position = self.positions.get(&key)?;
            let direction = position.direction()?;
            let plan = match &position.exit_plan {
                Some(plan) => plan.clone(),
                None => ExitPlan::new(self.exit_config(strategy)?, volatility),
            };
            let input = ExitInput {
                pnl_pct: position.pnl_pct(),
                hwm_pct: position.hwm_pct,
                held_secs: position.held_secs(now),
                volatility,
            };
            (direction, position.size.abs(), plan, input)
        };

        let trigger = exits::evaluate(&plan, &input)?;
        let side = direction.opposite();
        let limit_price = snapshot.touch(side)?;

        info!(
            %strategy,
            instrument = %snapshot.instrument_id,
            %trigger,
            pnl_pct = %input.pnl_pct.round_dp(3),
            hwm_pct = %input.hwm_pct.round_dp(3),
            held_secs = input.held_secs,
            "Exit triggered"
        );

        Some(ProposedAction {
            strategy,
            instrument_id: snapshot.instrument_id.clone(),
            side,
            size,
            limit_price,
            time_in_force: TimeInForce::Ioc,
            kind: ActionKind::Close,
            rationale: format!("exit:{trigger}"),
            exit_plan: None,
        })
    }

    // ==================== Cancellation ====================

    /// Cancel one live order.
    pub async fn cancel(&self, order_id: &str, reason: &str) -> Result<()> {
        let status = self
            .orders
            .get(order_id)
            .map(|r| r.order.status)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        if status.is_terminal() {
            return Err(EngineError::OrderAlreadyTerminal(order_id.to_string()));
        }

        let venue_timeout = Duration::from_millis(self.config.read().venue_timeout_ms);
        self.cancel_at_venue(order_id, reason, venue_timeout).await;
        Ok(())
    }

    /// Cancel every non-terminal order. Pending orders never reach the venue;
    /// submitted ones get a venue cancel. Returns the number cancelled.
    #[instrument(skip(self))]
    pub async fn cancel_all(&self, reason: &str) -> usize {
        let order_ids: Vec<String> = self.inflight.iter().map(|e| e.value().clone()).collect();
        let venue_timeout = Duration::from_millis(self.config.read().venue_timeout_ms);

        let mut venue_cancels = Vec::new();
        let mut cancelled = 0;
        for order_id in &order_ids {
            if let Some(venue_order_id) = self.mark_cancelled(order_id, reason) {
                cancelled += 1;
                venue_cancels.extend(venue_order_id);
            }
            self.finalize(order_id);
        }

        for venue_order_id in &venue_cancels {
            self.send_cancel(venue_order_id, venue_timeout).await;
        }

        info!(
            cancelled,
            venue_cancels = venue_cancels.len(),
            %reason,
            "Cancelled all open orders"
        );
        cancelled
    }

    // ==================== Queries ====================

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.orders.get(order_id).map(|r| r.order.clone())
    }

    pub fn status(&self, order_id: &str) -> OrderStatus {
        self.orders
            .get(order_id)
            .map(|r| r.order.status)
            .unwrap_or(OrderStatus::Rejected)
    }

    fn venue_order_id(&self, order_id: &str) -> Option<String> {
        self.orders.get(order_id).and_then(|r| r.order.venue_order_id.clone())
    }

    pub fn open_orders(&self) -> Vec<Order> {
        let mut open: Vec<Order> = self
            .orders
            .iter()
            .filter(|r| !r.order.status.is_terminal())
            .map(|r| r.order.clone())
            .collect();
        open.sort_by(|a, b| a.id.cmp(&b.id));
        open
    }

    /// Id of the non-terminal order on an instrument.
    pub fn inflight_order(&self, instrument_id: &str) -> Option<String> {
        self.inflight.get(instrument_id).map(|e| e.value().clone())
    }

    pub fn has_inflight(&self, instrument_id: &str) -> bool {
        self.inflight.contains_key(instrument_id)
    }

    pub fn position(&self, strategy: StrategyId, instrument_id: &str) -> Option<Position> {
        self.positions
            .get(&(strategy, instrument_id.to_string()))
            .map(|p| p.clone())
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.positions.iter().map(|p| p.clone()).collect();
        all.sort_by(|a, b| (a.strategy, &a.instrument_id).cmp(&(b.strategy, &b.instrument_id)));
        all
    }

    pub fn risk_state(&self) -> RiskState {
        self.risk.lock().state()
    }

    pub fn stats(&self) -> ExecutionStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let submitted = load(&self.counters.submitted);
        let filled = load(&self.counters.filled);
        let partially_filled = load(&self.counters.partially_filled);
        let rejected = load(&self.counters.rejected);
        let cancelled = load(&self.counters.cancelled);

        let terminal = filled + rejected + cancelled;
        ExecutionStats {
            submitted,
            filled,
            partially_filled,
            rejected,
            cancelled,
            fill_success_rate: ratio(filled, terminal),
            partial_fill_rate: ratio(partially_filled, submitted),
        }
    }

    pub fn summary(&self) -> PortfolioSummary {
        let unrealized_pnl = self.unrealized_pnl();
        let risk = self.risk_state();
        PortfolioSummary {
            positions: self.positions(),
            pools: self.capital.snapshots(),
            open_orders: self.inflight.len(),
            realized_pnl: risk.realized_pnl,
            unrealized_pnl,
            equity: self.capital.total_capital() + unrealized_pnl,
            risk,
            stats: self.stats(),
        }
    }
}

fn exit_configs(config: &Config) -> HashMap<StrategyId, ExitConfig> {
    HashMap::from([
        (StrategyId::EventReactive, config.strategy_a.exit.clone()),
        (StrategyId::Quoting, config.strategy_b.exit.clone()),
    ])
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
