//! Configuration management for the trading core.
//!
//! Loads settings from an optional config file and `EQE__` environment
//! variables, and validates them before a snapshot is handed to the
//! orchestrator.

use crate::error::{EngineError, Result as EngineResult};
use crate::exchange::ConfigurationSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Capital pools and tier
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Event-reactive strategy
    #[serde(default)]
    pub strategy_a: StrategyAConfig,
    /// Continuous quoting strategy
    #[serde(default)]
    pub strategy_b: StrategyBConfig,
    /// Risk limits and fault thresholds
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order handling and timeouts
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Simulated fill model
    #[serde(default)]
    pub paper: PaperConfig,
    /// Market discovery and scoring
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Liveness and routing
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Total session capital in quote currency
    #[serde(default = "default_total_capital")]
    pub total: Decimal,
    /// Pool size for the event-reactive strategy
    #[serde(default = "default_strategy_a_allocation")]
    pub strategy_a_allocation: Decimal,
    /// Pool size for the quoting strategy
    #[serde(default = "default_strategy_b_allocation")]
    pub strategy_b_allocation: Decimal,
    /// Explicit tier; inferred from `total` when absent
    #[serde(default)]
    pub tier: Option<CapitalTier>,
}

/// Capital tiers bound concurrency, throttling and trade size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapitalTier {
    Micro,
    Small,
    Medium,
    Large,
}

/// Limits derived from a capital tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierSettings {
    pub max_concurrent_markets: usize,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: f64,
    pub book_cache_ttl_ms: u64,
    pub min_trade_size: Decimal,
    pub max_trade_size: Decimal,
}

impl CapitalTier {
    /// Infer a tier from total session capital.
    pub fn for_capital(total: Decimal) -> Self {
        if total < dec!(500) {
            CapitalTier::Micro
        } else if total < dec!(5000) {
            CapitalTier::Small
        } else if total < dec!(50000) {
            CapitalTier::Medium
        } else {
            CapitalTier::Large
        }
    }

    pub fn settings(&self) -> TierSettings {
        match self {
            CapitalTier::Micro => TierSettings {
                max_concurrent_markets: 3,
                rate_limit_capacity: 5,
                rate_limit_refill_per_sec: 2.0,
                book_cache_ttl_ms: 200,
                min_trade_size: dec!(1),
                max_trade_size: dec!(10),
            },
            CapitalTier::Small => TierSettings {
                max_concurrent_markets: 10,
                rate_limit_capacity: 10,
                rate_limit_refill_per_sec: 5.0,
                book_cache_ttl_ms: 150,
                min_trade_size: dec!(1),
                max_trade_size: dec!(50),
            },
            CapitalTier::Medium => TierSettings {
                max_concurrent_markets: 25,
                rate_limit_capacity: 20,
                rate_limit_refill_per_sec: 10.0,
                book_cache_ttl_ms: 100,
                min_trade_size: dec!(5),
                max_trade_size: dec!(250),
            },
            CapitalTier::Large => TierSettings {
                max_concurrent_markets: 50,
                rate_limit_capacity: 40,
                rate_limit_refill_per_sec: 20.0,
                book_cache_ttl_ms: 50,
                min_trade_size: dec!(10),
                max_trade_size: dec!(1000),
            },
        }
    }
}

/// How exit targets evolve after a position opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitMode {
    /// Targets fixed at open
    Static,
    /// Targets recomputed from the latest volatility score every tick
    Dynamic,
}

/// Exit parameters. Percentages are in percent units (1.5 = 1.5%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitConfig {
    pub profit_target_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub trailing_stop_pct: Decimal,
    pub min_hold_secs: u64,
    pub max_hold_secs: u64,
    pub mode: ExitMode,
    /// Volatility scaling coefficient `k`
    pub volatility_k: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Share of available pool per trade (0-100)
    #[serde(default = "default_a_trade_size_percent")]
    pub trade_size_percent: Decimal,
    /// Per-instrument trigger cooldown
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Maximum price concession over best ask (percent)
    #[serde(default = "default_a_max_slippage_pct")]
    pub max_slippage_pct: Decimal,
    /// Minimum event strength that qualifies (0.0-1.0)
    #[serde(default = "default_min_event_strength")]
    pub min_event_strength: Decimal,
    #[serde(default = "default_a_exit")]
    pub exit: ExitConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyBConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Share of available pool per quote (0-100)
    #[serde(default = "default_b_trade_size_percent")]
    pub trade_size_percent: Decimal,
    /// Spreads are fractions of mid (0.02 = 2%)
    #[serde(default = "default_base_spread")]
    pub base_spread: Decimal,
    #[serde(default = "default_min_spread")]
    pub min_spread: Decimal,
    #[serde(default = "default_max_spread")]
    pub max_spread: Decimal,
    #[serde(default = "default_volatility_multiplier")]
    pub volatility_multiplier: Decimal,
    /// Quote shift per unit of book imbalance
    #[serde(default = "default_imbalance_factor")]
    pub imbalance_factor: Decimal,
    /// Book levels considered for imbalance
    #[serde(default = "default_imbalance_levels")]
    pub imbalance_levels: usize,
    /// Maximum quote shift from held inventory
    #[serde(default = "default_inventory_skew_max")]
    pub inventory_skew_max: Decimal,
    /// Inventory notional at which skew saturates
    #[serde(default = "default_max_inventory")]
    pub max_inventory: Decimal,
    /// Relative price deviation that forces a re-quote
    #[serde(default = "default_requote_threshold")]
    pub requote_threshold: Decimal,
    /// Depth budget when sizing against the book (percent)
    #[serde(default = "default_b_max_slippage_pct")]
    pub max_slippage_pct: Decimal,
    #[serde(default = "default_price_floor")]
    pub price_floor: Decimal,
    #[serde(default = "default_price_ceiling")]
    pub price_ceiling: Decimal,
    #[serde(default = "default_b_exit")]
    pub exit: ExitConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Session drawdown that trips the kill switch (percent)
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    /// Realized daily loss that blocks new risk (quote currency)
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Daily loss that trips the kill switch
    #[serde(default = "default_kill_daily_loss")]
    pub kill_switch_daily_loss: Decimal,
    /// Per-strategy realized loss that blocks new risk
    #[serde(default = "default_max_strategy_loss")]
    pub max_strategy_loss: Decimal,
    #[serde(default = "default_volatility_window_secs")]
    pub volatility_window_secs: u64,
    /// Price move within the window treated as extreme (percent)
    #[serde(default = "default_extreme_move_pct")]
    pub extreme_move_pct: Decimal,
    /// Price move that maps to a volatility score of 1.0 (percent)
    #[serde(default = "default_volatility_full_scale_pct")]
    pub volatility_full_scale_pct: Decimal,
    #[serde(default = "default_max_errors_per_window")]
    pub max_errors_per_window: u32,
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Consecutive venue auth failures treated as systemic
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_true")]
    pub paper_trading: bool,
    /// Resting orders are cancelled after this long
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,
    /// Timeout applied to every venue call
    #[serde(default = "default_venue_timeout_ms")]
    pub venue_timeout_ms: u64,
    /// Maximum wait for a rate-limiter token
    #[serde(default = "default_rate_limit_timeout_ms")]
    pub rate_limit_timeout_ms: u64,
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Slippage components are in percent of the reference price
    #[serde(default = "default_base_slippage_pct")]
    pub base_slippage_pct: Decimal,
    /// Added per 100 units of notional
    #[serde(default = "default_size_slippage_pct")]
    pub size_slippage_pct: Decimal,
    /// Scaled by order size over top-of-book depth
    #[serde(default = "default_depth_impact_pct")]
    pub depth_impact_pct: Decimal,
    /// Uniform noise bound
    #[serde(default = "default_noise_pct")]
    pub noise_pct: Decimal,
    #[serde(default = "default_latency_min_ms")]
    pub latency_min_ms: u64,
    #[serde(default = "default_latency_max_ms")]
    pub latency_max_ms: u64,
    #[serde(default = "default_fill_probability_min")]
    pub fill_probability_min: f64,
    #[serde(default = "default_fill_probability_max")]
    pub fill_probability_max: f64,
    /// Fraction of fills that are partial
    #[serde(default = "default_partial_fill_rate")]
    pub partial_fill_rate: f64,
    /// Seed for reproducible runs
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_min_volume")]
    pub min_volume: Decimal,
    #[serde(default = "default_min_depth")]
    pub min_depth: Decimal,
    /// Widest acceptable spread (percent of mid)
    #[serde(default = "default_scanner_max_spread_pct")]
    pub max_spread_pct: Decimal,
    /// Volume that maps to a full volume score
    #[serde(default = "default_volume_norm")]
    pub volume_norm: Decimal,
    /// Average level depth that maps to a full depth score
    #[serde(default = "default_depth_norm")]
    pub depth_norm: Decimal,
    /// Trades older than this contribute no recency score
    #[serde(default = "default_activity_window_secs")]
    pub activity_window_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Liveness gap that trips the kill switch
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Age after which a market snapshot is considered stale
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,
    #[serde(default = "default_worker_queue")]
    pub worker_queue: usize,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_total_capital() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_strategy_a_allocation() -> Decimal {
    Decimal::new(400, 0)
}

fn default_strategy_b_allocation() -> Decimal {
    Decimal::new(600, 0)
}

fn default_a_trade_size_percent() -> Decimal {
    Decimal::new(5, 0) // 5% of available pool
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_a_max_slippage_pct() -> Decimal {
    Decimal::new(1, 0) // 1%
}

fn default_min_event_strength() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_a_exit() -> ExitConfig {
    ExitConfig {
        profit_target_pct: dec!(2.0),
        stop_loss_pct: dec!(1.0),
        trailing_stop_pct: dec!(0.5),
        min_hold_secs: 5,
        max_hold_secs: 120,
        mode: ExitMode::Dynamic,
        volatility_k: dec!(0.5),
    }
}

fn default_b_trade_size_percent() -> Decimal {
    Decimal::new(10, 0)
}

fn default_base_spread() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_min_spread() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_max_spread() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_volatility_multiplier() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_imbalance_factor() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_imbalance_levels() -> usize {
    5
}

fn default_inventory_skew_max() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_max_inventory() -> Decimal {
    Decimal::new(100, 0)
}

fn default_requote_threshold() -> Decimal {
    Decimal::new(5, 3) // 0.5% deviation
}

fn default_b_max_slippage_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_price_floor() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_price_ceiling() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn default_b_exit() -> ExitConfig {
    ExitConfig {
        profit_target_pct: dec!(1.5),
        stop_loss_pct: dec!(1.0),
        trailing_stop_pct: dec!(0.5),
        min_hold_secs: 10,
        max_hold_secs: 600,
        mode: ExitMode::Static,
        volatility_k: dec!(0.5),
    }
}

fn default_max_drawdown_pct() -> Decimal {
    Decimal::new(10, 0) // 10%
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(50, 0)
}

fn default_kill_daily_loss() -> Decimal {
    Decimal::new(100, 0)
}

fn default_max_strategy_loss() -> Decimal {
    Decimal::new(40, 0)
}

fn default_volatility_window_secs() -> u64 {
    60
}

fn default_extreme_move_pct() -> Decimal {
    Decimal::new(2, 0) // 2% move inside the window
}

fn default_volatility_full_scale_pct() -> Decimal {
    Decimal::new(5, 0)
}

fn default_max_errors_per_window() -> u32 {
    10
}

fn default_error_window_secs() -> u64 {
    60
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_auth_failures() -> u32 {
    3
}

fn default_order_timeout_ms() -> u64 {
    30_000
}

fn default_venue_timeout_ms() -> u64 {
    5_000
}

fn default_rate_limit_timeout_ms() -> u64 {
    2_000
}

fn default_fill_poll_interval_ms() -> u64 {
    250
}

fn default_base_slippage_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05%
}

fn default_size_slippage_pct() -> Decimal {
    Decimal::new(1, 2) // 0.01% per 100 notional
}

fn default_depth_impact_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5% when consuming the whole top level
}

fn default_noise_pct() -> Decimal {
    Decimal::new(5, 2)
}

fn default_latency_min_ms() -> u64 {
    20
}

fn default_latency_max_ms() -> u64 {
    120
}

fn default_fill_probability_min() -> f64 {
    0.85
}

fn default_fill_probability_max() -> f64 {
    1.0
}

fn default_partial_fill_rate() -> f64 {
    0.1
}

fn default_min_volume() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_min_depth() -> Decimal {
    Decimal::new(100, 0)
}

fn default_scanner_max_spread_pct() -> Decimal {
    Decimal::new(20, 0)
}

fn default_volume_norm() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_depth_norm() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_activity_window_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    25
}

fn default_batch_delay_ms() -> u64 {
    20
}

fn default_scan_interval_secs() -> u64 {
    30
}

fn default_top_n() -> usize {
    20
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_staleness_ms() -> u64 {
    5_000
}

fn default_worker_queue() -> usize {
    256
}

impl Config {
    /// Load configuration from an optional file and environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or("config")).required(false))
            .add_source(config::Environment::default().separator("__").prefix("EQE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Tier in effect for this snapshot.
    pub fn tier(&self) -> CapitalTier {
        self.capital
            .tier
            .unwrap_or_else(|| CapitalTier::for_capital(self.capital.total))
    }

    pub fn tier_settings(&self) -> TierSettings {
        self.tier().settings()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> EngineResult<()> {
        let c = &self.capital;
        ensure(c.total > Decimal::ZERO, "capital.total must be positive")?;
        ensure(
            c.strategy_a_allocation >= Decimal::ZERO && c.strategy_b_allocation >= Decimal::ZERO,
            "strategy allocations must not be negative",
        )?;
        ensure(
            c.strategy_a_allocation + c.strategy_b_allocation <= c.total,
            "strategy allocations exceed total capital",
        )?;

        for (name, pct) in [
            ("strategy_a", self.strategy_a.trade_size_percent),
            ("strategy_b", self.strategy_b.trade_size_percent),
        ] {
            ensure(
                pct > Decimal::ZERO && pct <= dec!(100),
                &format!("{name}.trade_size_percent must be in (0, 100]"),
            )?;
        }

        let b = &self.strategy_b;
        ensure(
            b.min_spread > Decimal::ZERO && b.min_spread <= b.base_spread && b.base_spread <= b.max_spread,
            "strategy_b spreads must satisfy 0 < min <= base <= max",
        )?;
        ensure(
            b.price_floor > Decimal::ZERO && b.price_floor < b.price_ceiling,
            "strategy_b.price_floor must be below price_ceiling",
        )?;
        ensure(b.max_inventory > Decimal::ZERO, "strategy_b.max_inventory must be positive")?;
        ensure(b.imbalance_levels > 0, "strategy_b.imbalance_levels must be positive")?;

        validate_exit("strategy_a.exit", &self.strategy_a.exit)?;
        validate_exit("strategy_b.exit", &b.exit)?;

        let r = &self.risk;
        ensure(
            r.max_drawdown_pct > Decimal::ZERO && r.max_drawdown_pct <= dec!(100),
            "risk.max_drawdown_pct must be in (0, 100]",
        )?;
        ensure(
            r.max_daily_loss > Decimal::ZERO && r.kill_switch_daily_loss >= r.max_daily_loss,
            "risk.kill_switch_daily_loss must be >= max_daily_loss > 0",
        )?;
        ensure(r.extreme_move_pct > Decimal::ZERO, "risk.extreme_move_pct must be positive")?;
        ensure(
            r.volatility_full_scale_pct > Decimal::ZERO,
            "risk.volatility_full_scale_pct must be positive",
        )?;

        let p = &self.paper;
        ensure(p.latency_min_ms <= p.latency_max_ms, "paper latency range is inverted")?;
        ensure(
            (0.0..=1.0).contains(&p.fill_probability_min)
                && (0.0..=1.0).contains(&p.fill_probability_max)
                && p.fill_probability_min <= p.fill_probability_max,
            "paper fill probability range must lie within [0, 1]",
        )?;
        ensure(
            (0.0..=1.0).contains(&p.partial_fill_rate),
            "paper.partial_fill_rate must lie within [0, 1]",
        )?;

        ensure(self.scanner.batch_size > 0, "scanner.batch_size must be positive")?;
        ensure(
            self.orchestrator.heartbeat_timeout_ms > self.orchestrator.heartbeat_interval_ms,
            "heartbeat timeout must exceed the heartbeat interval",
        )?;
        ensure(self.orchestrator.worker_queue > 0, "orchestrator.worker_queue must be positive")?;

        Ok(())
    }
}

fn validate_exit(section: &str, exit: &ExitConfig) -> EngineResult<()> {
    ensure(
        exit.profit_target_pct > Decimal::ZERO && exit.stop_loss_pct > Decimal::ZERO,
        &format!("{section}: profit target and stop loss must be positive"),
    )?;
    ensure(
        exit.trailing_stop_pct >= Decimal::ZERO && exit.volatility_k >= Decimal::ZERO,
        &format!("{section}: trailing stop and volatility k must not be negative"),
    )?;
    ensure(
        exit.min_hold_secs <= exit.max_hold_secs,
        &format!("{section}: min_hold_secs exceeds max_hold_secs"),
    )
}

fn ensure(condition: bool, message: &str) -> EngineResult<()> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::ConfigurationInvalid(message.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capital: CapitalConfig::default(),
            strategy_a: StrategyAConfig::default(),
            strategy_b: StrategyBConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            paper: PaperConfig::default(),
            scanner: ScannerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            total: default_total_capital(),
            strategy_a_allocation: default_strategy_a_allocation(),
            strategy_b_allocation: default_strategy_b_allocation(),
            tier: None,
        }
    }
}

impl Default for StrategyAConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trade_size_percent: default_a_trade_size_percent(),
            cooldown_ms: default_cooldown_ms(),
            max_slippage_pct: default_a_max_slippage_pct(),
            min_event_strength: default_min_event_strength(),
            exit: default_a_exit(),
        }
    }
}

impl Default for StrategyBConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trade_size_percent: default_b_trade_size_percent(),
            base_spread: default_base_spread(),
            min_spread: default_min_spread(),
            max_spread: default_max_spread(),
            volatility_multiplier: default_volatility_multiplier(),
            imbalance_factor: default_imbalance_factor(),
            imbalance_levels: default_imbalance_levels(),
            inventory_skew_max: default_inventory_skew_max(),
            max_inventory: default_max_inventory(),
            requote_threshold: default_requote_threshold(),
            max_slippage_pct: default_b_max_slippage_pct(),
            price_floor: default_price_floor(),
            price_ceiling: default_price_ceiling(),
            exit: default_b_exit(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: default_max_drawdown_pct(),
            max_daily_loss: default_max_daily_loss(),
            kill_switch_daily_loss: default_kill_daily_loss(),
            max_strategy_loss: default_max_strategy_loss(),
            volatility_window_secs: default_volatility_window_secs(),
            extreme_move_pct: default_extreme_move_pct(),
            volatility_full_scale_pct: default_volatility_full_scale_pct(),
            max_errors_per_window: default_max_errors_per_window(),
            error_window_secs: default_error_window_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_auth_failures: default_max_auth_failures(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            paper_trading: true,
            order_timeout_ms: default_order_timeout_ms(),
            venue_timeout_ms: default_venue_timeout_ms(),
            rate_limit_timeout_ms: default_rate_limit_timeout_ms(),
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            base_slippage_pct: default_base_slippage_pct(),
            size_slippage_pct: default_size_slippage_pct(),
            depth_impact_pct: default_depth_impact_pct(),
            noise_pct: default_noise_pct(),
            latency_min_ms: default_latency_min_ms(),
            latency_max_ms: default_latency_max_ms(),
            fill_probability_min: default_fill_probability_min(),
            fill_probability_max: default_fill_probability_max(),
            partial_fill_rate: default_partial_fill_rate(),
            seed: None,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            min_volume: default_min_volume(),
            min_depth: default_min_depth(),
            max_spread_pct: default_scanner_max_spread_pct(),
            volume_norm: default_volume_norm(),
            depth_norm: default_depth_norm(),
            activity_window_secs: default_activity_window_secs(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            scan_interval_secs: default_scan_interval_secs(),
            top_n: default_top_n(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            staleness_ms: default_staleness_ms(),
            worker_queue: default_worker_queue(),
        }
    }
}

/// Reads a configuration file (plus environment overrides) on demand.
pub struct FileConfigSource {
    path: Option<PathBuf>,
}

impl FileConfigSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ConfigurationSource for FileConfigSource {
    async fn load(&self) -> EngineResult<Config> {
        let path = self.path.as_ref().and_then(|p| p.to_str());
        let config = Config::load(path)
            .map_err(|e| EngineError::ConfigurationInvalid(format!("{e:#}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_allocations_cannot_exceed_total() {
        let mut config = Config::default();
        config.capital.strategy_b_allocation = dec!(700);

        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::ConfigurationInvalid(msg) if msg.contains("exceed")));
    }

    #[test]
    fn test_inverted_spread_band_rejected() {
        let mut config = Config::default();
        config.strategy_b.min_spread = dec!(0.2);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exit_hold_window_must_be_ordered() {
        let mut config = Config::default();
        config.strategy_a.exit.min_hold_secs = 500;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tier_inferred_from_capital() {
        assert_eq!(CapitalTier::for_capital(dec!(100)), CapitalTier::Micro);
        assert_eq!(CapitalTier::for_capital(dec!(1000)), CapitalTier::Small);
        assert_eq!(CapitalTier::for_capital(dec!(20000)), CapitalTier::Medium);
        assert_eq!(CapitalTier::for_capital(dec!(100000)), CapitalTier::Large);

        let mut config = Config::default();
        assert_eq!(config.tier(), CapitalTier::Small);
        config.capital.tier = Some(CapitalTier::Large);
        assert_eq!(config.tier_settings().max_concurrent_markets, 50);
    }
}
