//! Event Quote Engine - Main Entry Point
//!
//! Runs a paper session against a synthetic market feed, or validates a
//! configuration file without starting anything.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use event_quote_engine::config::Config;
use event_quote_engine::exchange::{
    BookLevel, ChannelSource, CredentialVault, FastEvent, InMemoryVault, Instrument, MarketEvent,
    MarketSnapshot, PaperVenue, Side,
};
use event_quote_engine::orchestrator::{Orchestrator, SessionSummary};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, fmt::writer::MakeWriterExt, EnvFilter};

const FEED_STEP_MS: u64 = 250;
const SUMMARY_INTERVAL_SECS: u64 = 30;
const EVENT_PROBABILITY: f64 = 0.04;
const EVENT_KINDS: [&str; 4] = ["goal", "red_card", "penalty", "score_update"];

#[derive(Parser)]
#[command(name = "event-quote-engine")]
#[command(version, about = "Risk-gated event-reactive and quoting trading core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a paper session against a synthetic feed
    Run {
        /// Config file (without extension); defaults to `config`
        #[arg(short, long)]
        config: Option<String>,
        /// Stop after this many seconds
        #[arg(short, long, default_value_t = 300)]
        duration_secs: u64,
        /// Seed for the synthetic feed and the paper venue
        #[arg(short, long)]
        seed: Option<u64>,
        /// Number of synthetic markets
        #[arg(short, long, default_value_t = 8)]
        markets: usize,
    },
    /// Load and validate a configuration, then exit
    Validate {
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command {
        Some(Commands::Validate { config }) => validate(config.as_deref()),
        Some(Commands::Run {
            config,
            duration_secs,
            seed,
            markets,
        }) => run_paper(config.as_deref(), duration_secs, seed, markets).await,
        None => run_paper(None, 300, None, 8).await,
    }
}

/// Stdout plus an hourly-rolled file under `logs/`.
fn init_logging() -> Result<()> {
    std::fs::create_dir_all("logs").context("Failed to create logs directory")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "event-quote-engine.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    // Flushes on drop; must outlive the process.
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("event_quote_engine=info".parse()?)
        .add_directive(Level::INFO.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

fn validate(path: Option<&str>) -> Result<()> {
    let config = Config::load(path)?;
    config.validate().context("Configuration is invalid")?;
    log_config(&config);
    info!("✅ Configuration is valid");
    Ok(())
}

fn log_config(config: &Config) {
    let tier = config.tier_settings();
    info!("📋 Configuration:");
    info!("   Mode: {}", if config.execution.paper_trading { "PAPER" } else { "LIVE" });
    info!(
        "   Capital: ${} (A: ${}, B: ${})",
        config.capital.total, config.capital.strategy_a_allocation, config.capital.strategy_b_allocation
    );
    info!(
        "   Tier: {:?} (max markets {}, trade size ${}-${})",
        config.tier(),
        tier.max_concurrent_markets,
        tier.min_trade_size,
        tier.max_trade_size
    );
    info!(
        "   Rate limit: {} tokens, {}/s refill",
        tier.rate_limit_capacity, tier.rate_limit_refill_per_sec
    );
    info!(
        "   Strategies: A {}, B {}",
        if config.strategy_a.enabled { "on" } else { "off" },
        if config.strategy_b.enabled { "on" } else { "off" }
    );
}

async fn run_paper(path: Option<&str>, duration_secs: u64, seed: Option<u64>, markets: usize) -> Result<()> {
    info!("═══════════════════════════════════════════════════════════");
    info!("  Event Quote Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════");

    let mut config = Config::load(path)?;
    if seed.is_some() {
        config.paper.seed = seed;
    }
    config.validate().context("Configuration is invalid")?;
    if !config.execution.paper_trading {
        warn!("⚠️  No live venue adapter is bundled; running against the paper venue");
    }
    log_config(&config);

    let venue = Arc::new(PaperVenue::new(config.paper.clone()));
    let vault: Arc<dyn CredentialVault> = match InMemoryVault::from_env() {
        Some(vault) => {
            info!("🔑 Credentials loaded for {}", vault.api_key());
            Arc::new(vault)
        }
        None => Arc::new(InMemoryVault::new("paper", uuid::Uuid::new_v4().as_bytes().to_vec())),
    };

    let mut feed = SyntheticFeed::new(markets.max(1), seed);
    for snapshot in feed.step() {
        venue.update_snapshot(snapshot).await;
    }
    for instrument in feed.instruments() {
        venue.add_instrument(instrument).await;
    }

    let orchestrator = Orchestrator::new(config, venue.clone(), vault)?;
    let (market_tx, market_source) = ChannelSource::channel(1024);
    let (event_tx, event_source) = ChannelSource::channel(256);
    orchestrator.attach_sources(Box::new(market_source), Box::new(event_source));

    let outcome = orchestrator.start();
    if !outcome.success {
        anyhow::bail!("Failed to start session: {}", outcome.message);
    }
    for instrument in feed.instruments() {
        orchestrator.track(instrument, false).await;
    }
    orchestrator.discover().await;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    info!("🚀 Session running for up to {}s across {} markets", duration_secs, feed.len());

    let deadline = Instant::now() + Duration::from_secs(duration_secs);
    let mut step = tokio::time::interval(Duration::from_millis(FEED_STEP_MS));
    let mut report = tokio::time::interval(Duration::from_secs(SUMMARY_INTERVAL_SECS));
    report.tick().await;

    while !shutdown.load(Ordering::SeqCst) && Instant::now() < deadline {
        tokio::select! {
            _ = step.tick() => {
                for snapshot in feed.step() {
                    venue.update_snapshot(snapshot.clone()).await;
                    if market_tx.send(MarketEvent::Snapshot(snapshot)).await.is_err() {
                        warn!("Market data channel closed");
                        shutdown.store(true, Ordering::SeqCst);
                    }
                }
                if let Some(event) = feed.maybe_event() {
                    info!(instrument = %event.instrument_id, kind = %event.kind, strength = %event.strength, "📣 Fast event");
                    event_tx.send(event).await.ok();
                }
                orchestrator.heartbeat();
            }
            _ = report.tick() => log_summary(&orchestrator.summary()),
        }
    }

    let outcome = orchestrator.safe_exit().await;
    info!("🏁 {}", outcome.message);

    let summary = orchestrator.summary();
    log_summary(&summary);
    info!(
        "Final summary: {}",
        serde_json::to_string(&summary).context("Failed to serialize session summary")?
    );
    Ok(())
}

fn log_summary(summary: &SessionSummary) {
    let portfolio = &summary.portfolio;
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "📊 {} | kill switch {:?} | feed #{}",
        summary.lifecycle, summary.kill_switch, summary.feed_sequence
    );
    info!(
        "   Equity ${:.2} | realized ${:.2} | unrealized ${:.2} | drawdown {:.2}%",
        portfolio.equity,
        portfolio.realized_pnl,
        portfolio.unrealized_pnl,
        portfolio.risk.current_drawdown_pct
    );
    for pool in &portfolio.pools {
        info!(
            "   Pool {}: available ${:.2}, locked ${:.2}{}",
            pool.strategy,
            pool.available,
            pool.locked,
            if pool.frozen { " (frozen)" } else { "" }
        );
    }
    info!(
        "   Orders: {} open, {} submitted, {} filled, {} rejected, {} cancelled",
        portfolio.open_orders,
        portfolio.stats.submitted,
        portfolio.stats.filled,
        portfolio.stats.rejected,
        portfolio.stats.cancelled
    );
    info!(
        "   Strategy A: {} triggers, {} ignored, {}W/{}L",
        summary.strategy_a.triggers, summary.strategy_a.ignored, summary.strategy_a.wins, summary.strategy_a.losses
    );
    info!(
        "   Strategy B: {} markets, {} quotes, {} requotes, {} exits",
        summary.strategy_b.active_markets,
        summary.strategy_b.stats.quotes_sent,
        summary.strategy_b.stats.requotes,
        summary.strategy_b.stats.exits
    );
    if let Some(trip) = &summary.trip {
        warn!("   🚨 Tripped: {} ({})", trip.reason, trip.detail);
    }
}

struct SyntheticMarket {
    instrument: Instrument,
    /// Mid price in thousandths
    mid_milli: i64,
    volume: Decimal,
}

/// Random-walk books for a handful of binary markets.
struct SyntheticFeed {
    rng: StdRng,
    markets: Vec<SyntheticMarket>,
    sequence: u64,
}

impl SyntheticFeed {
    fn new(count: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let markets = (0..count)
            .map(|i| SyntheticMarket {
                instrument: Instrument::new(format!("market-{:02}", i + 1), dec!(0.001), dec!(1))
                    .with_outcome_tokens(vec!["YES".to_string(), "NO".to_string()]),
                mid_milli: rng.gen_range(200..=800),
                volume: Decimal::from(rng.gen_range(5_000..=100_000)),
            })
            .collect();
        Self {
            rng,
            markets,
            sequence: 0,
        }
    }

    fn len(&self) -> usize {
        self.markets.len()
    }

    fn instruments(&self) -> Vec<Instrument> {
        self.markets.iter().map(|m| m.instrument.clone()).collect()
    }

    /// Advance every market one step.
    fn step(&mut self) -> Vec<MarketSnapshot> {
        let now = Utc::now();
        let mut snapshots = Vec::with_capacity(self.markets.len());
        for market in &mut self.markets {
            self.sequence += 1;
            market.mid_milli = (market.mid_milli + self.rng.gen_range(-4..=4)).clamp(50, 950);
            let half_spread = self.rng.gen_range(5..=20);
            let levels = |rng: &mut StdRng, start: i64, step: i64| -> Vec<BookLevel> {
                (0..3)
                    .map(|i| {
                        BookLevel::new(
                            Decimal::new(start + step * i, 3),
                            Decimal::from(rng.gen_range(200..=2_000)),
                        )
                    })
                    .collect()
            };
            let bids = levels(&mut self.rng, market.mid_milli - half_spread, -5);
            let asks = levels(&mut self.rng, market.mid_milli + half_spread, 5);
            market.volume += Decimal::from(self.rng.gen_range(0..=500));

            snapshots.push(MarketSnapshot {
                instrument_id: market.instrument.id.clone(),
                bids,
                asks,
                last_trade_price: Some(Decimal::new(market.mid_milli, 3)),
                last_trade_at: Some(now),
                volume_24h: market.volume,
                timestamp: now,
                sequence: self.sequence,
            });
        }
        snapshots
    }

    fn maybe_event(&mut self) -> Option<FastEvent> {
        if self.markets.is_empty() || !self.rng.gen_bool(EVENT_PROBABILITY) {
            return None;
        }
        let market = &self.markets[self.rng.gen_range(0..self.markets.len())];
        let kind = EVENT_KINDS[self.rng.gen_range(0..EVENT_KINDS.len())];
        Some(FastEvent {
            instrument_id: market.instrument.id.clone(),
            kind: kind.to_string(),
            direction: if self.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell },
            strength: Decimal::new(self.rng.gen_range(30..=100), 2),
            timestamp: Utc::now(),
        })
    }
}
