//! Simulated venue for paper trading.
//!
//! Fills are synthesized from the latest known book: slippage is the sum of a
//! base component, a size-dependent component, depth impact and bounded
//! noise. Latency and fill probability are sampled from configured ranges and
//! a configured fraction of fills arrive partially.

use super::traits::VenueClient;
use super::types::*;
use crate::config::PaperConfig;
use crate::error::VenueError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Order as the simulated venue sees it.
#[derive(Debug, Clone)]
struct PaperOrder {
    instrument_id: InstrumentId,
    side: Side,
    size: Decimal,
    limit_price: Decimal,
    fills: Vec<Fill>,
    state: VenueOrderState,
}

impl PaperOrder {
    fn filled(&self) -> Decimal {
        self.fills.iter().map(|f| f.size).sum()
    }

    fn ack(&self, venue_order_id: &str) -> VenueAck {
        VenueAck {
            venue_order_id: venue_order_id.to_string(),
            state: self.state.clone(),
            fills: self.fills.clone(),
        }
    }
}

/// Random draws for one fill attempt, taken together so the RNG lock is
/// never held across an await.
struct FillDraw {
    fills: bool,
    partial_fraction: Option<Decimal>,
    noise_pct: Decimal,
}

/// Paper venue that simulates order handling against recorded books.
pub struct PaperVenue {
    config: PaperConfig,
    books: RwLock<HashMap<InstrumentId, MarketSnapshot>>,
    instruments: RwLock<Vec<Instrument>>,
    orders: RwLock<HashMap<String, PaperOrder>>,
    rng: Mutex<StdRng>,
    order_id_counter: AtomicU64,
    submissions: AtomicU64,
    cancel_requests: Mutex<Vec<String>>,
}

impl PaperVenue {
    pub fn new(config: PaperConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            books: RwLock::new(HashMap::new()),
            instruments: RwLock::new(Vec::new()),
            orders: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
            order_id_counter: AtomicU64::new(1),
            submissions: AtomicU64::new(0),
            cancel_requests: Mutex::new(Vec::new()),
        }
    }

    /// Register a tradable instrument.
    pub async fn add_instrument(&self, instrument: Instrument) {
        let mut instruments = self.instruments.write().await;
        if !instruments.iter().any(|i| i.id == instrument.id) {
            instruments.push(instrument);
        }
    }

    /// Record the latest book (call this with feed data).
    pub async fn update_snapshot(&self, snapshot: MarketSnapshot) {
        self.books
            .write()
            .await
            .insert(snapshot.instrument_id.clone(), snapshot);
    }

    /// Number of orders that reached the venue.
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Venue order ids for which a cancel was requested, in order.
    pub fn cancel_requests(&self) -> Vec<String> {
        self.cancel_requests.lock().clone()
    }

    fn next_order_id(&self) -> String {
        format!("PAPER-{:06}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn sample_latency(&self) -> Duration {
        let ms = self
            .rng
            .lock()
            .gen_range(self.config.latency_min_ms..=self.config.latency_max_ms);
        Duration::from_millis(ms)
    }

    fn draw(&self) -> FillDraw {
        let mut rng = self.rng.lock();
        let probability =
            rng.gen_range(self.config.fill_probability_min..=self.config.fill_probability_max);
        let fills = rng.gen_bool(probability.clamp(0.0, 1.0));
        let partial_fraction = if rng.gen_bool(self.config.partial_fill_rate.clamp(0.0, 1.0)) {
            let fraction: f64 = rng.gen_range(0.3..=0.7);
            Decimal::from_f64_retain(fraction).map(|d| d.round_dp(2))
        } else {
            None
        };
        let noise = self.config.noise_pct.abs();
        let noise_pct = if noise > Decimal::ZERO {
            let bound = noise.to_f64().unwrap_or(0.0);
            let sample: f64 = rng.gen_range(-bound..=bound);
            Decimal::from_f64_retain(sample)
                .map(|d| d.round_dp(6))
                .unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        FillDraw {
            fills,
            partial_fraction,
            noise_pct,
        }
    }

    /// Slippage in percent for taking `size` against `book`.
    pub fn slippage_pct(&self, book: &MarketSnapshot, side: Side, size: Decimal, noise_pct: Decimal) -> Decimal {
        let touch = book.touch(side).unwrap_or(Decimal::ZERO);
        let notional = size * touch;
        let size_component = self.config.size_slippage_pct * notional / dec!(100);

        let top_depth = match side {
            Side::Buy => book.asks.first().map(|l| l.size),
            Side::Sell => book.bids.first().map(|l| l.size),
        }
        .unwrap_or(Decimal::ZERO);
        let depth_ratio = if top_depth > Decimal::ZERO {
            (size / top_depth).min(Decimal::ONE)
        } else {
            Decimal::ONE
        };

        let total = self.config.base_slippage_pct
            + size_component
            + self.config.depth_impact_pct * depth_ratio
            + noise_pct;
        total.max(Decimal::ZERO)
    }

    /// Price for an execution, or `None` if the order cannot trade yet.
    fn execution_price(&self, order: &PaperOrder, book: &MarketSnapshot, size: Decimal, noise_pct: Decimal) -> Option<Decimal> {
        let touch = book.touch(order.side)?;
        let crosses = match order.side {
            Side::Buy => order.limit_price >= touch,
            Side::Sell => order.limit_price <= touch,
        };

        if !crosses {
            // Passive quote: fills at its own price when the draw succeeds
            return Some(order.limit_price);
        }

        let slip = self.slippage_pct(book, order.side, size, noise_pct) / dec!(100);
        let price = match order.side {
            Side::Buy => (touch * (Decimal::ONE + slip)).min(order.limit_price),
            Side::Sell => (touch * (Decimal::ONE - slip)).max(order.limit_price),
        };
        Some(price.round_dp(6))
    }

    /// Try to execute some of the remaining size of an open order.
    fn try_fill(&self, order: &mut PaperOrder, book: &MarketSnapshot) {
        let draw = self.draw();
        if !draw.fills {
            return;
        }

        let remaining = order.size - order.filled();
        let size = match draw.partial_fraction {
            Some(fraction) if order.fills.is_empty() => {
                let partial = (remaining * fraction).round_dp(4);
                if partial > Decimal::ZERO && partial < remaining {
                    partial
                } else {
                    remaining
                }
            }
            _ => remaining,
        };

        let Some(price) = self.execution_price(order, book, size, draw.noise_pct) else {
            return;
        };

        order.fills.push(Fill {
            price,
            size,
            timestamp: Utc::now(),
        });
        if order.filled() >= order.size {
            order.state = VenueOrderState::Filled;
        }
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    async fn submit_order(&self, order: &Order) -> Result<VenueAck, VenueError> {
        tokio::time::sleep(self.sample_latency()).await;
        self.submissions.fetch_add(1, Ordering::SeqCst);

        let venue_order_id = self.next_order_id();
        if order.size <= Decimal::ZERO || order.limit_price <= Decimal::ZERO {
            return Err(VenueError::Rejected("invalid size or price".to_string()));
        }

        let book = self
            .books
            .read()
            .await
            .get(&order.instrument_id)
            .cloned()
            .ok_or_else(|| VenueError::Rejected(format!("no market for {}", order.instrument_id)))?;

        let mut paper = PaperOrder {
            instrument_id: order.instrument_id.clone(),
            side: order.side,
            size: order.size,
            limit_price: order.limit_price,
            fills: Vec::new(),
            state: VenueOrderState::Open,
        };
        self.try_fill(&mut paper, &book);

        if paper.state == VenueOrderState::Open && order.time_in_force != TimeInForce::Gtc {
            paper.state = VenueOrderState::Cancelled;
        }

        debug!(
            order_id = %order.id,
            venue_order_id = %venue_order_id,
            instrument = %order.instrument_id,
            side = %order.side,
            size = %order.size,
            filled = %paper.filled(),
            "Paper order processed"
        );

        let ack = paper.ack(&venue_order_id);
        self.orders.write().await.insert(venue_order_id, paper);
        Ok(ack)
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        self.cancel_requests.lock().push(venue_order_id.to_string());

        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(venue_order_id)
            .ok_or_else(|| VenueError::UnknownOrder(venue_order_id.to_string()))?;
        if order.state == VenueOrderState::Open {
            order.state = VenueOrderState::Cancelled;
            info!(venue_order_id = %venue_order_id, "Paper order cancelled");
        }
        Ok(())
    }

    async fn order_status(&self, venue_order_id: &str) -> Result<VenueAck, VenueError> {
        tokio::time::sleep(self.sample_latency()).await;

        let instrument_id = {
            let orders = self.orders.read().await;
            let order = orders
                .get(venue_order_id)
                .ok_or_else(|| VenueError::UnknownOrder(venue_order_id.to_string()))?;
            if order.state != VenueOrderState::Open {
                return Ok(order.ack(venue_order_id));
            }
            order.instrument_id.clone()
        };

        let book = self.books.read().await.get(&instrument_id).cloned();
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(venue_order_id)
            .ok_or_else(|| VenueError::UnknownOrder(venue_order_id.to_string()))?;
        if order.state == VenueOrderState::Open {
            if let Some(book) = book {
                self.try_fill(order, &book);
            }
        }
        Ok(order.ack(venue_order_id))
    }

    async fn fetch_snapshot(&self, instrument_id: &str) -> Result<MarketSnapshot, VenueError> {
        tokio::time::sleep(self.sample_latency()).await;
        self.books
            .read()
            .await
            .get(instrument_id)
            .cloned()
            .ok_or_else(|| VenueError::Transport(format!("no book for {instrument_id}")))
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>, VenueError> {
        Ok(self.instruments.read().await.clone())
    }
}
