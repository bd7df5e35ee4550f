//! Wiring, lifecycle and the operator control surface.
//!
//! The orchestrator owns the shared core (capital pools, kill switch, rate
//! limiter, execution engine, strategies), one worker per tracked instrument
//! and the background tasks:
//! - execution report routing
//! - kill-switch reaction (cancel everything once tripped)
//! - evaluation ticks and the heartbeat stamp
//! - liveness check
//! - market discovery for the quoting strategy
//!
//! Every proposed action, from either strategy or from the exit evaluator,
//! goes through `Core::dispatch`: lifecycle gate, policy layer, then the
//! engine.

mod feed;
mod worker;

pub use feed::{FeedEvent, FeedEventKind, ObservabilityFeed};

use crate::config::Config;
use crate::error::Result;
use crate::exchange::{
    ConfigurationSource, CredentialVault, FastEvent, FastEventSource, Instrument, InstrumentId,
    MarketDataSource, MarketEvent, Order, OrderStatus, VenueClient,
};
use crate::execution::{ExecutionEngine, ExecutionReport, PortfolioSummary, RateLimiter};
use crate::risk::{
    self, CapitalManager, KillSwitch, KillSwitchState, PolicyContext, PolicyDecision,
    PolicyLimits, TripReason, TripRecord, VolatilityTracker,
};
use crate::strategy::{
    ActionKind, EventReactiveStats, EventReactiveStrategy, MarketScanner, ProposedAction,
    QuotingStrategy, QuotingSummary, StrategyId,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};
use worker::{InstrumentInput, InstrumentWorker};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Running => "running",
            Lifecycle::Paused => "paused",
            Lifecycle::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Result of an operator command.
#[derive(Debug, Clone, Serialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub state: Lifecycle,
    pub kill_switch: KillSwitchState,
    pub message: String,
}

/// Consolidated read-only view for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub lifecycle: Lifecycle,
    pub kill_switch: KillSwitchState,
    pub trip: Option<TripRecord>,
    pub portfolio: PortfolioSummary,
    pub strategy_a: EventReactiveStats,
    pub strategy_b: QuotingSummary,
    pub tracked_instruments: Vec<InstrumentId>,
    pub feed_sequence: u64,
}

struct WorkerSlot {
    tx: mpsc::Sender<InstrumentInput>,
    quoting: bool,
    /// Tracked by the operator; discovery never deselects it
    pinned: bool,
}

/// State shared by the orchestrator, its workers and background tasks.
pub(crate) struct Core {
    config: watch::Sender<Arc<Config>>,
    lifecycle: watch::Sender<Lifecycle>,
    /// Held for reading while a worker evaluates, for writing while a new
    /// configuration is swapped in.
    evaluation_gate: tokio::sync::RwLock<()>,
    capital: Arc<CapitalManager>,
    kill_switch: Arc<KillSwitch>,
    limiter: Arc<RateLimiter>,
    engine: Arc<ExecutionEngine>,
    venue: Arc<dyn VenueClient>,
    vault: Arc<dyn CredentialVault>,
    volatility: RwLock<VolatilityTracker>,
    strategy_a: EventReactiveStrategy,
    strategy_b: QuotingStrategy,
    scanner: MarketScanner,
    feed: ObservabilityFeed,
    instruments: DashMap<InstrumentId, Instrument>,
    workers: DashMap<InstrumentId, WorkerSlot>,
    /// Quoting orders pulled so they can be replaced
    requote_cancels: DashSet<String>,
    /// Realized PnL per Strategy A closing order, booked on completion
    close_pnl: DashMap<String, Decimal>,
    heartbeat: Mutex<Instant>,
    trip_handled: AtomicBool,
}

impl Core {
    fn config(&self) -> Arc<Config> {
        self.config.borrow().clone()
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Move to `to` if the current state is one of `from`. Returns the
    /// previous state, or the current one when the move is not allowed.
    fn transition(&self, from: &[Lifecycle], to: Lifecycle) -> std::result::Result<Lifecycle, Lifecycle> {
        let mut previous = self.lifecycle();
        let moved = self.lifecycle.send_if_modified(|state| {
            previous = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(previous);
        }
        info!(from = %previous, %to, "Lifecycle changed");
        self.feed
            .publish(FeedEventKind::LifecycleChanged { from: previous, to });
        Ok(previous)
    }

    /// Gate, authorize and submit one action. Returns the order id when the
    /// engine accepted it.
    fn dispatch(&self, action: ProposedAction) -> Option<String> {
        let strategy = action.strategy;
        let instrument_id = action.instrument_id.clone();
        let kind = action.kind;

        let lifecycle = self.lifecycle();
        if action.opens_risk() && lifecycle != Lifecycle::Running {
            debug!(%strategy, instrument = %instrument_id, %lifecycle, "Opening action dropped");
            self.feed.publish(FeedEventKind::ActionDropped {
                strategy,
                instrument_id,
                kind,
                detail: format!("lifecycle {lifecycle}"),
            });
            return None;
        }

        self.feed.publish(FeedEventKind::ActionProposed {
            strategy,
            instrument_id: instrument_id.clone(),
            kind,
            side: action.side,
            size: action.size,
            limit_price: action.limit_price,
            rationale: action.rationale.clone(),
        });

        let config = self.config();
        let risk_state = self.engine.risk_state();
        let kill_switch = self.kill_switch.state();
        let limits = PolicyLimits::from_config(&config);
        let ctx = PolicyContext {
            risk: &risk_state,
            pool: self.capital.snapshot(strategy),
            kill_switch: &kill_switch,
            instrument_inflight: self.engine.has_inflight(&instrument_id),
            price_move_pct: self.volatility.read().move_pct(&instrument_id),
            limits: &limits,
        };

        match risk::evaluate(action, &ctx) {
            PolicyDecision::Approve(approved) => match self.engine.submit(approved) {
                Ok(handle) => {
                    self.feed.publish(FeedEventKind::OrderSubmitted {
                        order_id: handle.order_id.clone(),
                        strategy,
                        instrument_id,
                        kind,
                    });
                    Some(handle.order_id)
                }
                Err(e) => {
                    warn!(%strategy, instrument = %instrument_id, error = %e, "Approved action not submitted");
                    self.feed.publish(FeedEventKind::ActionDropped {
                        strategy,
                        instrument_id,
                        kind,
                        detail: e.to_string(),
                    });
                    None
                }
            },
            PolicyDecision::Reject { reason, .. } => {
                info!(%strategy, instrument = %instrument_id, %reason, "Action rejected by policy");
                if reason.is_violation() {
                    self.kill_switch
                        .trip(TripReason::PolicyViolation, reason.to_string());
                }
                self.feed.publish(FeedEventKind::ActionRejected {
                    strategy,
                    instrument_id,
                    kind,
                    reason,
                });
                None
            }
        }
    }

    /// Tell the owning strategy an order is done.
    fn notify_terminal(&self, order: &Order) {
        match order.strategy {
            StrategyId::EventReactive => self
                .strategy_a
                .on_order_terminal(&order.instrument_id, &order.id),
            StrategyId::Quoting => {
                let requote = self.requote_cancels.remove(&order.id).is_some()
                    && order.status == OrderStatus::Cancelled;
                self.strategy_b
                    .on_order_terminal(&order.instrument_id, &order.id, requote);
            }
        }
    }

    async fn handle_report(&self, report: ExecutionReport) {
        match report {
            ExecutionReport::Fill {
                order_id,
                strategy,
                instrument_id,
                kind,
                side,
                price,
                size,
                realized_pnl,
            } => {
                if kind == ActionKind::Close && strategy == StrategyId::EventReactive {
                    *self.close_pnl.entry(order_id.clone()).or_default() += realized_pnl;
                }
                self.feed.publish(FeedEventKind::Fill {
                    order_id,
                    strategy,
                    instrument_id,
                    kind,
                    side,
                    price,
                    size,
                    realized_pnl,
                });
                let config = self.config();
                self.kill_switch
                    .observe_risk(&self.engine.risk_state(), &config.risk);
            }
            ExecutionReport::Terminal { order } => {
                if let Some((_, pnl)) = self.close_pnl.remove(&order.id) {
                    self.strategy_a.record_outcome(pnl);
                }
                self.feed.publish(FeedEventKind::OrderTerminal {
                    order_id: order.id.clone(),
                    strategy: order.strategy,
                    instrument_id: order.instrument_id.clone(),
                    status: order.status,
                    filled_size: order.filled_size,
                    detail: order.reject_reason.clone(),
                });
                let instrument_id = order.instrument_id.clone();
                if let Err(InstrumentInput::Terminal(order)) = self
                    .route(&instrument_id, InstrumentInput::Terminal(order))
                    .await
                {
                    self.notify_terminal(&order);
                }
            }
        }
    }

    /// Cancel everything once per trip and record it on the feed.
    async fn on_trip(&self) {
        let KillSwitchState::Tripped(reason) = self.kill_switch.state() else {
            return;
        };
        if self.trip_handled.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled = self.engine.cancel_all("kill switch tripped").await;
        let detail = self
            .kill_switch
            .trip_record()
            .map(|r| r.detail)
            .unwrap_or_default();
        error!(%reason, %detail, cancelled, "Kill switch tripped, open orders cancelled");
        self.feed.publish(FeedEventKind::KillSwitchTripped {
            reason,
            detail,
            cancelled_orders: cancelled,
        });
    }

    fn stamp_heartbeat(&self) {
        *self.heartbeat.lock() = Instant::now();
    }

    /// Trip the kill switch when the heartbeat is older than the timeout.
    fn check_liveness(&self, now: Instant) -> bool {
        let timeout = Duration::from_millis(self.config().orchestrator.heartbeat_timeout_ms);
        let elapsed = now.saturating_duration_since(*self.heartbeat.lock());
        if elapsed <= timeout {
            return false;
        }
        error!(elapsed_ms = elapsed.as_millis() as u64, "Heartbeat missed");
        self.kill_switch.trip(
            TripReason::HeartbeatTimeout,
            format!("no heartbeat for {} ms", elapsed.as_millis()),
        )
    }

    /// Deliver an input to the instrument's worker. Gives the input back
    /// when no worker accepts it.
    async fn route(&self, instrument_id: &str, input: InstrumentInput) -> std::result::Result<(), InstrumentInput> {
        let Some(tx) = self.workers.get(instrument_id).map(|slot| slot.tx.clone()) else {
            return Err(input);
        };
        tx.send(input).await.map_err(|e| e.0)
    }

    /// Worker for a known instrument, spawned on first use.
    fn worker_for(self: &Arc<Self>, instrument_id: &str) -> Option<mpsc::Sender<InstrumentInput>> {
        if let Some(slot) = self.workers.get(instrument_id) {
            return Some(slot.tx.clone());
        }
        if self.lifecycle() == Lifecycle::Stopped {
            return None;
        }
        let instrument = self.instruments.get(instrument_id).map(|i| i.value().clone())?;
        let capacity = self.config().orchestrator.worker_queue;

        let tx = match self.workers.entry(instrument_id.to_string()) {
            Entry::Occupied(slot) => slot.get().tx.clone(),
            Entry::Vacant(slot) => {
                let tx = InstrumentWorker::spawn(self.clone(), instrument, false, capacity);
                slot.insert(WorkerSlot {
                    tx: tx.clone(),
                    quoting: false,
                    pinned: false,
                });
                info!(instrument = %instrument_id, "Tracking instrument");
                tx
            }
        };
        Some(tx)
    }

    /// Add or remove a market from the quoting selection. Returns true if
    /// the selection changed.
    async fn set_quoting(&self, instrument_id: &str, quoting: bool) -> bool {
        let tx = self.workers.get_mut(instrument_id).and_then(|mut slot| {
            (slot.quoting != quoting).then(|| {
                slot.quoting = quoting;
                slot.tx.clone()
            })
        });
        match tx {
            Some(tx) => tx.send(InstrumentInput::Quoting(quoting)).await.is_ok(),
            None => false,
        }
    }

    async fn route_market(&self, event: MarketEvent) {
        let instrument_id = event.instrument_id().to_string();
        if self
            .route(&instrument_id, InstrumentInput::Market(event))
            .await
            .is_err()
        {
            trace!(instrument = %instrument_id, "Market data for untracked instrument");
        }
    }

    async fn route_fast(self: &Arc<Self>, event: FastEvent) {
        let Some(tx) = self.worker_for(&event.instrument_id) else {
            warn!(instrument = %event.instrument_id, kind = %event.kind, "Event for unknown instrument");
            return;
        };
        if tx.send(InstrumentInput::Fast(event)).await.is_err() {
            debug!("Worker gone, event dropped");
        }
    }

    /// One discovery pass: rank the venue's markets and hand the top ones to
    /// the quoting strategy.
    #[instrument(skip(self))]
    async fn discover_once(self: &Arc<Self>) {
        if !self.strategy_b.is_enabled() {
            return;
        }
        let config = self.config();
        let request_timeout = Duration::from_millis(config.execution.venue_timeout_ms);
        let candidates = match self
            .scanner
            .discover(self.venue.as_ref(), &self.limiter, request_timeout)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Market discovery failed");
                return;
            }
        };

        for (instrument, _) in &candidates {
            self.instruments
                .insert(instrument.id.clone(), instrument.clone());
        }
        let ranked = self.scanner.rank(candidates, Utc::now());
        let selected = MarketScanner::select(
            &ranked,
            config.scanner.top_n,
            config.tier_settings().max_concurrent_markets,
        );
        let chosen: Vec<InstrumentId> = selected.iter().map(|m| m.instrument.id.clone()).collect();

        let mut changed = false;
        for id in &chosen {
            if self.worker_for(id).is_some() {
                changed |= self.set_quoting(id, true).await;
            }
        }
        let dropped: Vec<InstrumentId> = self
            .workers
            .iter()
            .filter(|slot| slot.quoting && !slot.pinned && !chosen.contains(slot.key()))
            .map(|slot| slot.key().clone())
            .collect();
        for id in &dropped {
            changed |= self.set_quoting(id, false).await;
        }

        if changed {
            info!(selected = chosen.len(), dropped = dropped.len(), "Quoting selection updated");
            self.feed
                .publish(FeedEventKind::MarketsSelected { instruments: chosen });
        }
    }
}

// ==================== Background tasks ====================

async fn run_reports(core: Arc<Core>, mut reports: mpsc::UnboundedReceiver<ExecutionReport>) {
    while let Some(report) = reports.recv().await {
        core.handle_report(report).await;
    }
}

async fn run_kill_watch(core: Arc<Core>) {
    let mut rx = core.kill_switch.subscribe();
    let tripped = rx.wait_for(|state| state.is_tripped()).await.is_ok();
    if tripped {
        core.on_trip().await;
    }
}

/// Stamps the heartbeat, checks risk limits and ticks every worker.
async fn run_ticker(core: Arc<Core>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if core.lifecycle() == Lifecycle::Stopped {
            break;
        }
        core.stamp_heartbeat();

        let config = core.config();
        core.kill_switch
            .observe_risk(&core.engine.risk_state(), &config.risk);

        let workers: Vec<mpsc::Sender<InstrumentInput>> =
            core.workers.iter().map(|slot| slot.tx.clone()).collect();
        for tx in workers {
            // A full mailbox already has work queued.
            let _ = tx.try_send(InstrumentInput::Tick);
        }
    }
}

async fn run_liveness(core: Arc<Core>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if core.lifecycle() == Lifecycle::Stopped {
            break;
        }
        if core.check_liveness(Instant::now()) {
            core.on_trip().await;
        }
    }
}

async fn run_discovery(core: Arc<Core>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match core.lifecycle() {
            Lifecycle::Stopped => break,
            Lifecycle::Running => core.discover_once().await,
            _ => {}
        }
    }
}

async fn run_market_source(core: Arc<Core>, mut source: Box<dyn MarketDataSource>) {
    while let Some(event) = source.next_event().await {
        if core.lifecycle() == Lifecycle::Stopped {
            break;
        }
        core.route_market(event).await;
    }
    debug!("Market data source finished");
}

async fn run_event_source(core: Arc<Core>, mut source: Box<dyn FastEventSource>) {
    while let Some(event) = source.next_event().await {
        if core.lifecycle() == Lifecycle::Stopped {
            break;
        }
        core.route_fast(event).await;
    }
    debug!("Fast event source finished");
}

// ==================== Orchestrator ====================

pub struct Orchestrator {
    core: Arc<Core>,
    reports: Mutex<Option<mpsc::UnboundedReceiver<ExecutionReport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build every component from a validated configuration.
    pub fn new(
        config: Config,
        venue: Arc<dyn VenueClient>,
        vault: Arc<dyn CredentialVault>,
    ) -> Result<Self> {
        config.validate()?;

        let tier = config.tier_settings();
        let capital = Arc::new(CapitalManager::from_config(&config.capital));
        let kill_switch = Arc::new(KillSwitch::new(capital.clone()));
        let limiter = Arc::new(RateLimiter::from_tier(&tier));
        let (engine, reports) = ExecutionEngine::new(
            &config,
            venue.clone(),
            limiter.clone(),
            capital.clone(),
            kill_switch.clone(),
        );

        info!(
            tier = ?config.tier(),
            total = %config.capital.total,
            strategy_a = %config.capital.strategy_a_allocation,
            strategy_b = %config.capital.strategy_b_allocation,
            paper = config.execution.paper_trading,
            "Orchestrator ready"
        );

        let core = Core {
            volatility: RwLock::new(VolatilityTracker::from_config(&config.risk)),
            strategy_a: EventReactiveStrategy::new(config.strategy_a.clone(), tier),
            strategy_b: QuotingStrategy::new(config.strategy_b.clone()),
            scanner: MarketScanner::new(config.scanner.clone()),
            config: watch::channel(Arc::new(config)).0,
            lifecycle: watch::channel(Lifecycle::Idle).0,
            evaluation_gate: tokio::sync::RwLock::new(()),
            capital,
            kill_switch,
            limiter,
            engine,
            venue,
            vault,
            feed: ObservabilityFeed::new(FEED_CAPACITY),
            instruments: DashMap::new(),
            workers: DashMap::new(),
            requote_cancels: DashSet::new(),
            close_pnl: DashMap::new(),
            heartbeat: Mutex::new(Instant::now()),
            trip_handled: AtomicBool::new(false),
        };

        Ok(Self {
            core: Arc::new(core),
            reports: Mutex::new(Some(reports)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn outcome(&self, success: bool, message: impl Into<String>) -> ControlOutcome {
        ControlOutcome {
            success,
            state: self.core.lifecycle(),
            kill_switch: self.core.kill_switch.state(),
            message: message.into(),
        }
    }

    // ==================== Control surface ====================

    /// Idle → Running. Spawns the background tasks.
    pub fn start(&self) -> ControlOutcome {
        if let Err(current) = self.core.transition(&[Lifecycle::Idle], Lifecycle::Running) {
            return self.outcome(false, format!("cannot start from {current}"));
        }
        let Some(reports) = self.reports.lock().take() else {
            return self.outcome(false, "already started once");
        };

        let config = self.core.config();
        let heartbeat = Duration::from_millis(config.orchestrator.heartbeat_interval_ms.max(1));
        let scan = Duration::from_secs(config.scanner.scan_interval_secs.max(1));
        self.core.stamp_heartbeat();

        let core = &self.core;
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_reports(core.clone(), reports)));
        tasks.push(tokio::spawn(run_kill_watch(core.clone())));
        tasks.push(tokio::spawn(run_ticker(core.clone(), heartbeat)));
        tasks.push(tokio::spawn(run_liveness(core.clone(), heartbeat)));
        tasks.push(tokio::spawn(run_discovery(core.clone(), scan)));

        self.outcome(true, "started")
    }

    /// Running → Paused. Open orders stay working and exits keep running.
    pub fn pause(&self) -> ControlOutcome {
        match self.core.transition(&[Lifecycle::Running], Lifecycle::Paused) {
            Ok(_) => self.outcome(true, "paused; exits still managed"),
            Err(current) => self.outcome(false, format!("cannot pause from {current}")),
        }
    }

    pub fn resume(&self) -> ControlOutcome {
        match self.core.transition(&[Lifecycle::Paused], Lifecycle::Running) {
            Ok(_) => self.outcome(true, "resumed"),
            Err(current) => self.outcome(false, format!("cannot resume from {current}")),
        }
    }

    /// Stop the session: cancel every open order, lock the vault.
    #[instrument(skip(self))]
    pub async fn safe_exit(&self) -> ControlOutcome {
        if let Err(current) = self.core.transition(
            &[Lifecycle::Idle, Lifecycle::Running, Lifecycle::Paused],
            Lifecycle::Stopped,
        ) {
            return self.outcome(false, format!("cannot exit from {current}"));
        }

        let cancelled = self.core.engine.cancel_all("safe exit").await;
        self.core.vault.lock();
        self.core.workers.clear();
        info!(cancelled, "Safe exit complete");
        self.outcome(true, format!("stopped; {cancelled} orders cancelled"))
    }

    /// Operator kill switch. Irreversible for the session.
    #[instrument(skip(self))]
    pub async fn emergency_stop(&self, detail: &str) -> ControlOutcome {
        self.trip(TripReason::OperatorManual, detail).await
    }

    /// External watchdog signal.
    pub async fn watchdog_signal(&self, detail: &str) -> ControlOutcome {
        self.trip(TripReason::ExternalWatchdog, detail).await
    }

    async fn trip(&self, reason: TripReason, detail: &str) -> ControlOutcome {
        let tripped = self.core.kill_switch.trip(reason, detail);
        self.core.on_trip().await;
        if tripped {
            self.outcome(true, format!("kill switch tripped: {reason}"))
        } else {
            self.outcome(false, "kill switch already tripped")
        }
    }

    /// Stamp the liveness heartbeat.
    pub fn heartbeat(&self) {
        self.core.stamp_heartbeat();
    }

    // ==================== Configuration ====================

    /// Load a snapshot from `source` and swap it in.
    pub async fn reload(&self, source: &dyn ConfigurationSource) -> Result<()> {
        match source.load().await {
            Ok(config) => self.apply_config(config).await,
            Err(e) => {
                warn!(error = %e, "Configuration reload failed");
                self.core
                    .feed
                    .publish(FeedEventKind::ConfigRejected { error: e.to_string() });
                Err(e)
            }
        }
    }

    /// Swap in a new configuration between evaluations. Pool sizes are fixed
    /// for the session; the tier and every strategy parameter may change.
    pub async fn apply_config(&self, mut config: Config) -> Result<()> {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Rejected configuration");
            self.core
                .feed
                .publish(FeedEventKind::ConfigRejected { error: e.to_string() });
            return Err(e);
        }

        let _gate = self.core.evaluation_gate.write().await;
        let current = self.core.config();
        let (old, new) = (&current.capital, &config.capital);
        if (old.total, old.strategy_a_allocation, old.strategy_b_allocation)
            != (new.total, new.strategy_a_allocation, new.strategy_b_allocation)
        {
            warn!("Capital pools are fixed for the session, keeping current sizes");
            config.capital.total = old.total;
            config.capital.strategy_a_allocation = old.strategy_a_allocation;
            config.capital.strategy_b_allocation = old.strategy_b_allocation;
        }

        let core = &self.core;
        let tier = config.tier();
        let settings = tier.settings();
        core.limiter
            .reconfigure(settings.rate_limit_capacity, settings.rate_limit_refill_per_sec);
        core.engine.reconfigure(&config);
        core.strategy_a
            .reconfigure(config.strategy_a.clone(), settings);
        core.strategy_b.reconfigure(config.strategy_b.clone());
        core.scanner.reconfigure(config.scanner.clone());
        core.volatility.write().reconfigure(&config.risk);
        core.config.send_replace(Arc::new(config));

        info!(?tier, "Configuration reloaded");
        core.feed.publish(FeedEventKind::ConfigReloaded { tier });
        Ok(())
    }

    pub fn config(&self) -> Arc<Config> {
        self.core.config()
    }

    // ==================== Inputs ====================

    /// Start tracking an instrument. Quoting markets are also handed to
    /// Strategy B; others only react to events.
    pub async fn track(&self, instrument: Instrument, quoting: bool) -> bool {
        let id = instrument.id.clone();
        self.core.instruments.insert(id.clone(), instrument);
        if self.core.worker_for(&id).is_none() {
            return false;
        }
        if quoting {
            if let Some(mut slot) = self.core.workers.get_mut(&id) {
                slot.pinned = true;
            }
            self.core.set_quoting(&id, true).await;
        }
        true
    }

    pub async fn route_market_event(&self, event: MarketEvent) {
        self.core.route_market(event).await;
    }

    pub async fn route_fast_event(&self, event: FastEvent) {
        self.core.route_fast(event).await;
    }

    /// Pump both sources into the workers until they finish.
    pub fn attach_sources(
        &self,
        market: Box<dyn MarketDataSource>,
        events: Box<dyn FastEventSource>,
    ) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_market_source(self.core.clone(), market)));
        tasks.push(tokio::spawn(run_event_source(self.core.clone(), events)));
    }

    /// Run one discovery pass now.
    pub async fn discover(&self) {
        self.core.discover_once().await;
    }

    // ==================== Queries ====================

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    pub fn kill_switch_state(&self) -> KillSwitchState {
        self.core.kill_switch.state()
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.core.engine
    }

    pub fn subscribe_feed(&self) -> broadcast::Receiver<FeedEvent> {
        self.core.feed.subscribe()
    }

    pub fn summary(&self) -> SessionSummary {
        let mut tracked: Vec<InstrumentId> =
            self.core.workers.iter().map(|slot| slot.key().clone()).collect();
        tracked.sort();
        SessionSummary {
            lifecycle: self.core.lifecycle(),
            kill_switch: self.core.kill_switch.state(),
            trip: self.core.kill_switch.trip_record(),
            portfolio: self.core.engine.summary(),
            strategy_a: self.core.strategy_a.stats(),
            strategy_b: self.core.strategy_b.summary(),
            tracked_instruments: tracked,
            feed_sequence: self.core.feed.last_sequence(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // Workers exit once their senders are gone.
        self.core.workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExitMode, PaperConfig};
    use crate::error::VenueError;
    use crate::exchange::{
        BookLevel, Fill, InMemoryVault, MarketSnapshot, MockVenueClient, PaperVenue, Side,
        TimeInForce, VenueAck, VenueOrderState,
    };
    use crate::risk::RejectReason;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU64;

    fn paper_config(fill_probability: f64) -> PaperConfig {
        PaperConfig {
            base_slippage_pct: dec!(0.1),
            size_slippage_pct: Decimal::ZERO,
            depth_impact_pct: Decimal::ZERO,
            noise_pct: Decimal::ZERO,
            latency_min_ms: 0,
            latency_max_ms: 0,
            fill_probability_min: fill_probability,
            fill_probability_max: fill_probability,
            partial_fill_rate: 0.0,
            seed: Some(11),
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.paper = paper_config(1.0);
        config.execution.venue_timeout_ms = 200;
        config.execution.order_timeout_ms = 5_000;
        config.execution.fill_poll_interval_ms = 10;
        config.orchestrator.heartbeat_interval_ms = 20;
        config.orchestrator.heartbeat_timeout_ms = 5_000;
        config.strategy_b.enabled = false;
        config
    }

    fn snapshot(id: &str, bid: Decimal, ask: Decimal, sequence: u64) -> MarketSnapshot {
        MarketSnapshot {
            instrument_id: id.to_string(),
            bids: vec![BookLevel::new(bid, dec!(1000))],
            asks: vec![BookLevel::new(ask, dec!(1000))],
            last_trade_price: None,
            last_trade_at: None,
            volume_24h: Decimal::ZERO,
            timestamp: Utc::now(),
            sequence,
        }
    }

    fn instrument(id: &str) -> Instrument {
        Instrument::new(id, dec!(0.01), dec!(1))
    }

    fn event(id: &str, strength: Decimal) -> FastEvent {
        FastEvent {
            instrument_id: id.to_string(),
            kind: "goal".to_string(),
            direction: Side::Buy,
            strength,
            timestamp: Utc::now(),
        }
    }

    async fn paper_venue(config: PaperConfig, ids: &[&str]) -> Arc<PaperVenue> {
        let venue = Arc::new(PaperVenue::new(config));
        for id in ids {
            venue.add_instrument(instrument(id)).await;
            venue
                .update_snapshot(snapshot(id, dec!(0.49), dec!(0.50), 1))
                .await;
        }
        venue
    }

    fn orchestrator(config: Config, venue: Arc<PaperVenue>) -> (Orchestrator, Arc<InMemoryVault>) {
        let vault = Arc::new(InMemoryVault::new("key", b"secret".to_vec()));
        let orchestrator = Orchestrator::new(config, venue, vault.clone()).unwrap();
        (orchestrator, vault)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    struct StaticSource(Config);

    #[async_trait]
    impl ConfigurationSource for StaticSource {
        async fn load(&self) -> Result<Config> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = test_config();
        config.capital.strategy_a_allocation = dec!(5000);
        let venue = Arc::new(PaperVenue::new(paper_config(1.0)));
        let vault = Arc::new(InMemoryVault::new("key", b"secret".to_vec()));

        assert!(Orchestrator::new(config, venue, vault).is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let venue = paper_venue(paper_config(1.0), &[]).await;
        let (orchestrator, vault) = orchestrator(test_config(), venue);
        let mut feed = orchestrator.subscribe_feed();
        assert_eq!(orchestrator.lifecycle(), Lifecycle::Idle);
        assert!(!orchestrator.pause().success);

        assert!(orchestrator.start().success);
        assert!(!orchestrator.start().success);

        let paused = orchestrator.pause();
        assert!(paused.success);
        assert_eq!(paused.state, Lifecycle::Paused);
        assert!(orchestrator.resume().success);

        let stopped = orchestrator.safe_exit().await;
        assert!(stopped.success);
        assert_eq!(stopped.state, Lifecycle::Stopped);
        assert_eq!(stopped.kill_switch, KillSwitchState::Armed);
        assert!(!vault.is_unlocked());
        assert!(!orchestrator.resume().success);

        let mut last = 0;
        for _ in 0..4 {
            let event = feed.recv().await.unwrap();
            assert!(event.sequence > last);
            assert!(matches!(event.kind, FeedEventKind::LifecycleChanged { .. }));
            last = event.sequence;
        }
    }

    #[tokio::test]
    async fn test_event_opens_position_and_releases_lock() {
        let venue = paper_venue(paper_config(1.0), &["m-1"]).await;
        let (orchestrator, _) = orchestrator(test_config(), venue.clone());
        orchestrator.start();
        assert!(orchestrator.track(instrument("m-1"), false).await);

        orchestrator
            .route_market_event(MarketEvent::Snapshot(snapshot("m-1", dec!(0.49), dec!(0.50), 2)))
            .await;
        orchestrator.route_fast_event(event("m-1", dec!(0.9))).await;

        let engine = orchestrator.engine().clone();
        wait_until(|| engine.position(StrategyId::EventReactive, "m-1").is_some()).await;
        wait_until(|| !engine.has_inflight("m-1")).await;
        wait_until(|| !orchestrator.core.strategy_a.is_locked("m-1")).await;

        assert_eq!(venue.submission_count(), 1);
        let summary = orchestrator.summary();
        assert_eq!(summary.strategy_a.triggers, 1);
        assert_eq!(summary.tracked_instruments, vec!["m-1".to_string()]);
        assert_eq!(summary.portfolio.stats.filled, 1);
    }

    #[tokio::test]
    async fn test_weak_event_and_unknown_instrument_ignored() {
        let venue = paper_venue(paper_config(1.0), &["m-1"]).await;
        let (orchestrator, _) = orchestrator(test_config(), venue.clone());
        orchestrator.start();
        orchestrator.track(instrument("m-1"), false).await;

        orchestrator.route_fast_event(event("m-1", dec!(0.1))).await;
        orchestrator.route_fast_event(event("unknown", dec!(0.9))).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(venue.submission_count(), 0);
        assert_eq!(orchestrator.summary().strategy_a.ignored, 1);
    }

    #[tokio::test]
    async fn test_pause_blocks_new_entries() {
        let venue = paper_venue(paper_config(1.0), &["m-1"]).await;
        let (orchestrator, _) = orchestrator(test_config(), venue.clone());
        orchestrator.start();
        orchestrator.track(instrument("m-1"), false).await;
        orchestrator.pause();

        orchestrator
            .route_market_event(MarketEvent::Snapshot(snapshot("m-1", dec!(0.49), dec!(0.50), 2)))
            .await;
        orchestrator.route_fast_event(event("m-1", dec!(0.9))).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(venue.submission_count(), 0);

        orchestrator.resume();
        orchestrator.route_fast_event(event("m-1", dec!(0.9))).await;
        wait_until(|| venue.submission_count() == 1).await;
    }

    #[tokio::test]
    async fn test_emergency_stop_cancels_resting_quote() {
        let mut config = test_config();
        config.paper = paper_config(0.0);
        config.strategy_b.enabled = true;
        let venue = paper_venue(config.paper.clone(), &["m-1"]).await;
        let (orchestrator, _) = orchestrator(config, venue.clone());
        orchestrator.start();
        orchestrator.track(instrument("m-1"), true).await;

        orchestrator
            .route_market_event(MarketEvent::Snapshot(snapshot("m-1", dec!(0.45), dec!(0.55), 2)))
            .await;
        let engine = orchestrator.engine().clone();
        wait_until(|| engine.open_orders().iter().any(|o| o.status == OrderStatus::Submitted)).await;

        let outcome = orchestrator.emergency_stop("operator").await;
        assert!(outcome.success);
        assert_eq!(
            outcome.kill_switch,
            KillSwitchState::Tripped(TripReason::OperatorManual)
        );

        wait_until(|| engine.open_orders().is_empty()).await;
        assert_eq!(venue.cancel_requests().len(), 1);
        assert!(engine
            .summary()
            .pools
            .iter()
            .all(|pool| pool.frozen));

        let again = orchestrator.watchdog_signal("late").await;
        assert!(!again.success);
        assert_eq!(
            orchestrator.kill_switch_state(),
            KillSwitchState::Tripped(TripReason::OperatorManual)
        );
    }

    #[tokio::test]
    async fn test_watchdog_signal_trips() {
        let venue = paper_venue(paper_config(1.0), &[]).await;
        let (orchestrator, _) = orchestrator(test_config(), venue);
        orchestrator.start();

        let outcome = orchestrator.watchdog_signal("feed handler silent").await;

        assert!(outcome.success);
        assert_eq!(outcome.state, Lifecycle::Running);
        assert_eq!(
            outcome.kill_switch,
            KillSwitchState::Tripped(TripReason::ExternalWatchdog)
        );
        let trip = orchestrator.summary().trip.unwrap();
        assert_eq!(trip.detail, "feed handler silent");
    }

    #[tokio::test]
    async fn test_missed_heartbeat_trips() {
        let venue = paper_venue(paper_config(1.0), &[]).await;
        let (orchestrator, _) = orchestrator(test_config(), venue);
        orchestrator.heartbeat();

        assert!(!orchestrator.core.check_liveness(Instant::now()));
        assert!(orchestrator
            .core
            .check_liveness(Instant::now() + Duration::from_secs(60)));
        assert_eq!(
            orchestrator.kill_switch_state(),
            KillSwitchState::Tripped(TripReason::HeartbeatTimeout)
        );
    }

    #[tokio::test]
    async fn test_limit_violation_trips_kill_switch() {
        let venue = paper_venue(paper_config(1.0), &["m-1"]).await;
        let (orchestrator, _) = orchestrator(test_config(), venue.clone());
        orchestrator.start();

        let oversized = ProposedAction {
            strategy: StrategyId::EventReactive,
            instrument_id: "m-1".to_string(),
            side: Side::Buy,
            size: dec!(1000),
            limit_price: dec!(0.5),
            time_in_force: TimeInForce::Ioc,
            kind: ActionKind::Open,
            rationale: "test".to_string(),
            exit_plan: None,
        };
        let mut feed = orchestrator.subscribe_feed();

        assert!(orchestrator.core.dispatch(oversized).is_none());

        assert_eq!(
            orchestrator.kill_switch_state(),
            KillSwitchState::Tripped(TripReason::PolicyViolation)
        );
        assert_eq!(venue.submission_count(), 0);
        let rejected = loop {
            let event = feed.recv().await.unwrap();
            if let FeedEventKind::ActionRejected { reason, .. } = event.kind {
                break reason;
            }
        };
        assert!(matches!(rejected, RejectReason::LimitViolation { .. }));
    }

    #[tokio::test]
    async fn test_reload_swaps_parameters_but_keeps_pools() {
        let venue = paper_venue(paper_config(1.0), &[]).await;
        let (orchestrator, _) = orchestrator(test_config(), venue);

        let mut next = test_config();
        next.strategy_a.cooldown_ms = 1_000;
        next.capital.total = dec!(2000);
        orchestrator.reload(&StaticSource(next)).await.unwrap();

        let config = orchestrator.config();
        assert_eq!(config.strategy_a.cooldown_ms, 1_000);
        assert_eq!(config.capital.total, dec!(1000));

        let mut invalid = test_config();
        invalid.strategy_b.min_spread = dec!(0.5);
        assert!(orchestrator.apply_config(invalid).await.is_err());
        assert_eq!(orchestrator.config().strategy_a.cooldown_ms, 1_000);
    }

    #[tokio::test]
    async fn test_discovery_selects_liquid_markets() {
        let mut config = test_config();
        config.strategy_b.enabled = true;
        config.paper = paper_config(0.0);
        let venue = paper_venue(config.paper.clone(), &[]).await;
        venue.add_instrument(instrument("liquid")).await;
        venue.add_instrument(instrument("thin")).await;
        let mut liquid = snapshot("liquid", dec!(0.48), dec!(0.50), 1);
        liquid.volume_24h = dec!(50000);
        liquid.last_trade_at = Some(Utc::now());
        venue.update_snapshot(liquid).await;
        venue
            .update_snapshot(snapshot("thin", dec!(0.48), dec!(0.50), 1))
            .await;

        let (orchestrator, _) = orchestrator(config, venue);
        orchestrator.core.transition(&[Lifecycle::Idle], Lifecycle::Running).unwrap();
        orchestrator.discover().await;

        let summary = orchestrator.summary();
        assert_eq!(summary.tracked_instruments, vec!["liquid".to_string()]);
        assert!(orchestrator.core.workers.get("liquid").unwrap().quoting);
    }

    fn unreachable_book_venue() -> MockVenueClient {
        let mut venue = MockVenueClient::new();
        venue
            .expect_fetch_snapshot()
            .returning(|_| Err(VenueError::Transport("connection reset".to_string())));
        venue.expect_list_instruments().returning(|| Ok(Vec::new()));
        venue
    }

    async fn next_stale_data(feed: &mut broadcast::Receiver<FeedEvent>) -> (InstrumentId, String) {
        let wait = async {
            loop {
                let event = feed.recv().await.unwrap();
                if let FeedEventKind::StaleData { instrument_id, detail } = event.kind {
                    return (instrument_id, detail);
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("no stale data event")
    }

    #[tokio::test]
    async fn test_stale_feed_fetch_failure_published() {
        let vault = Arc::new(InMemoryVault::new("key", b"secret".to_vec()));
        let orchestrator =
            Orchestrator::new(test_config(), Arc::new(unreachable_book_venue()), vault).unwrap();
        let mut feed = orchestrator.subscribe_feed();
        orchestrator.track(instrument("m-1"), false).await;

        orchestrator
            .route_market_event(MarketEvent::Stale {
                instrument_id: "m-1".to_string(),
            })
            .await;

        let (instrument_id, detail) = next_stale_data(&mut feed).await;
        assert_eq!(instrument_id, "m-1");
        assert!(detail.contains("connection reset"));
        assert!(orchestrator
            .core
            .strategy_a
            .cached_book("m-1", Utc::now())
            .is_none());
    }

    #[tokio::test]
    async fn test_quiet_instrument_fetched_on_tick() {
        let vault = Arc::new(InMemoryVault::new("key", b"secret".to_vec()));
        let orchestrator =
            Orchestrator::new(test_config(), Arc::new(unreachable_book_venue()), vault).unwrap();
        let mut feed = orchestrator.subscribe_feed();
        orchestrator.start();
        orchestrator.track(instrument("m-1"), false).await;

        // No market data ever arrives; the ticker finds the book stale.
        let (instrument_id, _) = next_stale_data(&mut feed).await;
        assert_eq!(instrument_id, "m-1");
        assert_eq!(orchestrator.lifecycle(), Lifecycle::Running);
    }

    #[tokio::test]
    async fn test_stale_feed_refreshed_from_venue() {
        let venue = paper_venue(paper_config(1.0), &["m-1"]).await;
        let (orchestrator, _) = orchestrator(test_config(), venue);
        orchestrator.track(instrument("m-1"), false).await;

        orchestrator
            .route_market_event(MarketEvent::Stale {
                instrument_id: "m-1".to_string(),
            })
            .await;

        let strategy_a = &orchestrator.core.strategy_a;
        wait_until(|| strategy_a.cached_book("m-1", Utc::now()).is_some()).await;
        let book = strategy_a.cached_book("m-1", Utc::now()).unwrap();
        assert_eq!(book.best_bid(), Some(dec!(0.49)));
    }

    /// IOC orders fill at their limit, GTC quotes rest until cancelled.
    /// Every submit and cancel is logged in arrival order.
    fn resting_quote_venue() -> (MockVenueClient, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let next_id = Arc::new(AtomicU64::new(1));
        let mut venue = unreachable_book_venue();

        let submits = log.clone();
        venue.expect_submit_order().returning(move |order| {
            let n = next_id.fetch_add(1, Ordering::SeqCst);
            let ack = match order.time_in_force {
                TimeInForce::Gtc => VenueAck {
                    venue_order_id: format!("REST-{n}"),
                    state: VenueOrderState::Open,
                    fills: Vec::new(),
                },
                _ => VenueAck {
                    venue_order_id: format!("TAKE-{n}"),
                    state: VenueOrderState::Filled,
                    fills: vec![Fill {
                        price: order.limit_price,
                        size: order.size,
                        timestamp: Utc::now(),
                    }],
                },
            };
            submits
                .lock()
                .push(format!("submit {} {}", order.side, ack.venue_order_id));
            Ok(ack)
        });
        venue.expect_order_status().returning(|venue_order_id| {
            Ok(VenueAck {
                venue_order_id: venue_order_id.to_string(),
                state: VenueOrderState::Open,
                fills: Vec::new(),
            })
        });
        let cancels = log.clone();
        venue.expect_cancel_order().returning(move |venue_order_id| {
            cancels.lock().push(format!("cancel {venue_order_id}"));
            Ok(())
        });
        (venue, log)
    }

    #[tokio::test]
    async fn test_exit_pulls_resting_quote_before_requote() {
        let mut config = test_config();
        config.strategy_b.enabled = true;
        config.execution.fill_poll_interval_ms = 1_000;
        config.strategy_a.exit.stop_loss_pct = dec!(30);
        config.strategy_a.exit.min_hold_secs = 0;
        config.strategy_a.exit.mode = ExitMode::Static;
        let (venue, log) = resting_quote_venue();
        let vault = Arc::new(InMemoryVault::new("key", b"secret".to_vec()));
        let orchestrator = Orchestrator::new(config, Arc::new(venue), vault).unwrap();
        orchestrator.start();
        orchestrator.track(instrument("m-1"), false).await;
        let engine = orchestrator.engine().clone();

        orchestrator
            .route_market_event(MarketEvent::Snapshot(snapshot("m-1", dec!(0.49), dec!(0.50), 2)))
            .await;
        orchestrator.route_fast_event(event("m-1", dec!(0.9))).await;
        wait_until(|| {
            engine
                .position(StrategyId::EventReactive, "m-1")
                .is_some_and(|p| !p.is_flat())
        })
        .await;
        wait_until(|| !engine.has_inflight("m-1")).await;

        // Quoting joins the market and its bid rests.
        orchestrator.track(instrument("m-1"), true).await;
        wait_until(|| {
            engine
                .open_orders()
                .iter()
                .any(|o| o.strategy == StrategyId::Quoting && o.status == OrderStatus::Submitted)
        })
        .await;
        let quote = engine
            .open_orders()
            .into_iter()
            .find(|o| o.strategy == StrategyId::Quoting)
            .unwrap();
        let quote_venue_id = quote.venue_order_id.clone().unwrap();

        // The book collapses through Strategy A's stop.
        orchestrator
            .route_market_event(MarketEvent::Snapshot(snapshot("m-1", dec!(0.20), dec!(0.22), 3)))
            .await;
        wait_until(|| {
            engine
                .position(StrategyId::EventReactive, "m-1")
                .map_or(true, |p| p.is_flat())
        })
        .await;

        assert_eq!(engine.status(&quote.id), OrderStatus::Cancelled);
        let log = log.lock().clone();
        let cancel_at = log
            .iter()
            .position(|entry| *entry == format!("cancel {quote_venue_id}"))
            .unwrap();
        let close_at = log
            .iter()
            .position(|entry| entry.starts_with("submit SELL TAKE"))
            .unwrap();
        assert!(cancel_at < close_at, "{log:?}");
        assert!(log[..close_at]
            .iter()
            .filter(|entry| entry.starts_with("submit BUY REST"))
            .all(|entry| entry.ends_with(&quote_venue_id)));
        assert_eq!(orchestrator.summary().strategy_a.triggers, 1);
    }
}
