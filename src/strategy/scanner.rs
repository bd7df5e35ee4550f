//! Market scanner for picking the instruments worth tracking.

use crate::config::ScannerConfig;
use crate::error::{EngineError, Result};
use crate::exchange::{Instrument, MarketSnapshot, Side, VenueClient};
use crate::execution::RateLimiter;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument, trace, warn};

const VOLUME_WEIGHT: f64 = 0.30;
const SPREAD_WEIGHT: f64 = 0.30;
const DEPTH_WEIGHT: f64 = 0.20;
const RECENCY_WEIGHT: f64 = 0.20;

/// Book levels per side considered for depth.
const DEPTH_LEVELS: usize = 5;

/// Reasons for rejecting a market during ranking.
#[derive(Debug, Clone, Copy)]
enum RejectReason {
    NoBook,
    LowVolume,
    WideSpread,
    ThinBook,
}

/// Trading activity that a book snapshot alone does not show.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketActivity {
    pub volume_24h: Decimal,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl MarketActivity {
    pub fn from_snapshot(snapshot: &MarketSnapshot) -> Self {
        Self {
            volume_24h: snapshot.volume_24h,
            last_trade_at: snapshot.last_trade_at,
        }
    }
}

/// A candidate that passed the filters, with its score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMarket {
    pub instrument: Instrument,
    pub snapshot: MarketSnapshot,
    /// Weighted score in [0, 1]
    pub score: f64,
    pub volume_score: f64,
    pub spread_score: f64,
    pub depth_score: f64,
    pub recency_score: f64,
}

/// Scores, filters and selects markets.
pub struct MarketScanner {
    config: RwLock<ScannerConfig>,
}

fn ratio(numerator: Decimal, denominator: Decimal) -> f64 {
    if denominator <= Decimal::ZERO {
        return 1.0;
    }
    (numerator / denominator).to_f64().unwrap_or(0.0).max(0.0)
}

impl MarketScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn reconfigure(&self, config: ScannerConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> ScannerConfig {
        self.config.read().clone()
    }

    /// Component scores: volume, spread tightness, depth, recency.
    fn components(&self, snapshot: &MarketSnapshot, activity: &MarketActivity, now: DateTime<Utc>) -> [f64; 4] {
        let cfg = self.config.read();

        let volume = ratio(activity.volume_24h, cfg.volume_norm).sqrt().min(1.0);

        let spread = match snapshot.spread_pct() {
            Some(pct) => 1.0 - ratio(pct, cfg.max_spread_pct).min(1.0),
            None => 0.0,
        };

        let depth = ratio(snapshot.avg_level_depth(DEPTH_LEVELS), cfg.depth_norm)
            .sqrt()
            .min(1.0);

        let recency = match activity.last_trade_at {
            Some(at) if cfg.activity_window_secs > 0 => {
                let age = (now - at).num_milliseconds().max(0) as f64 / 1000.0;
                (1.0 - age / cfg.activity_window_secs as f64).max(0.0)
            }
            _ => 0.0,
        };

        [volume, spread, depth, recency]
    }

    /// Weighted score in [0, 1].
    pub fn score(&self, snapshot: &MarketSnapshot, activity: &MarketActivity, now: DateTime<Utc>) -> f64 {
        let [volume, spread, depth, recency] = self.components(snapshot, activity, now);
        (volume * VOLUME_WEIGHT + spread * SPREAD_WEIGHT + depth * DEPTH_WEIGHT + recency * RECENCY_WEIGHT)
            .clamp(0.0, 1.0)
    }

    fn qualify(
        &self,
        instrument: Instrument,
        snapshot: MarketSnapshot,
        now: DateTime<Utc>,
    ) -> std::result::Result<ScoredMarket, RejectReason> {
        let cfg = self.config.read().clone();
        let id = &instrument.id;

        let Some(spread_pct) = snapshot.spread_pct() else {
            trace!(instrument = %id, "No two-sided book");
            return Err(RejectReason::NoBook);
        };

        if snapshot.volume_24h < cfg.min_volume {
            trace!(instrument = %id, volume = %snapshot.volume_24h, "Volume below threshold");
            return Err(RejectReason::LowVolume);
        }

        if spread_pct > cfg.max_spread_pct {
            trace!(instrument = %id, %spread_pct, "Spread above threshold");
            return Err(RejectReason::WideSpread);
        }

        let depth = snapshot.depth(Side::Buy, DEPTH_LEVELS) + snapshot.depth(Side::Sell, DEPTH_LEVELS);
        if depth < cfg.min_depth {
            trace!(instrument = %id, %depth, "Book too thin");
            return Err(RejectReason::ThinBook);
        }

        let activity = MarketActivity::from_snapshot(&snapshot);
        let [volume_score, spread_score, depth_score, recency_score] =
            self.components(&snapshot, &activity, now);
        let score = self.score(&snapshot, &activity, now);

        Ok(ScoredMarket {
            instrument,
            snapshot,
            score,
            volume_score,
            spread_score,
            depth_score,
            recency_score,
        })
    }

    /// Filter and sort candidates by score, best first.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn rank(&self, candidates: Vec<(Instrument, MarketSnapshot)>, now: DateTime<Utc>) -> Vec<ScoredMarket> {
        let total_scanned = candidates.len();

        // Track rejection reasons for summary logging
        let mut rejected_no_book = 0usize;
        let mut rejected_low_volume = 0usize;
        let mut rejected_wide_spread = 0usize;
        let mut rejected_thin_book = 0usize;

        let mut qualified: Vec<ScoredMarket> = candidates
            .into_iter()
            .filter_map(|(instrument, snapshot)| match self.qualify(instrument, snapshot, now) {
                Ok(market) => Some(market),
                Err(reason) => {
                    match reason {
                        RejectReason::NoBook => rejected_no_book += 1,
                        RejectReason::LowVolume => rejected_low_volume += 1,
                        RejectReason::WideSpread => rejected_wide_spread += 1,
                        RejectReason::ThinBook => rejected_thin_book += 1,
                    }
                    None
                }
            })
            .collect();

        qualified.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.instrument.id.cmp(&b.instrument.id))
        });

        info!(
            total_scanned,
            qualified = qualified.len(),
            rejected_no_book,
            rejected_low_volume,
            rejected_wide_spread,
            rejected_thin_book,
            "Market scan complete"
        );

        qualified
    }

    /// Top markets, bounded by both the configured count and the tier's
    /// concurrency limit.
    pub fn select(ranked: &[ScoredMarket], top_n: usize, max_concurrent: usize) -> Vec<ScoredMarket> {
        ranked.iter().take(top_n.min(max_concurrent)).cloned().collect()
    }

    /// Fetch books for every listed instrument in rate-limited batches.
    /// Instruments whose fetch fails or times out are skipped.
    #[instrument(skip_all)]
    pub async fn discover(
        &self,
        venue: &dyn VenueClient,
        limiter: &RateLimiter,
        request_timeout: Duration,
    ) -> Result<Vec<(Instrument, MarketSnapshot)>> {
        let cfg = self.config();

        limiter.acquire(request_timeout).await?;
        let instruments = match tokio::time::timeout(request_timeout, venue.list_instruments()).await {
            Ok(Ok(instruments)) => instruments,
            Ok(Err(e)) => return Err(EngineError::from(e)),
            Err(_) => {
                return Err(EngineError::VenueTimeout {
                    operation: "list_instruments",
                })
            }
        };

        let mut discovered = Vec::with_capacity(instruments.len());
        let mut failed = 0usize;
        let batch_count = instruments.len().div_ceil(cfg.batch_size.max(1));

        for (index, batch) in instruments.chunks(cfg.batch_size.max(1)).enumerate() {
            let fetches = batch.iter().map(|instrument| async move {
                limiter.acquire(request_timeout).await?;
                match tokio::time::timeout(request_timeout, venue.fetch_snapshot(&instrument.id)).await {
                    Ok(Ok(snapshot)) => Ok((instrument.clone(), snapshot)),
                    Ok(Err(e)) => Err(EngineError::from(e)),
                    Err(_) => Err(EngineError::VenueTimeout {
                        operation: "fetch_snapshot",
                    }),
                }
            });

            for (instrument, result) in batch.iter().zip(join_all(fetches).await) {
                match result {
                    Ok(found) => discovered.push(found),
                    Err(e) => {
                        failed += 1;
                        warn!(instrument = %instrument.id, error = %e, "Skipping instrument during discovery");
                    }
                }
            }

            if index + 1 < batch_count && cfg.batch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(cfg.batch_delay_ms)).await;
            }
        }

        info!(
            listed = instruments.len(),
            fetched = discovered.len(),
            failed,
            batches = batch_count,
            "Discovery complete"
        );
        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::exchange::{BookLevel, PaperVenue};
    use rust_decimal_macros::dec;

    fn snapshot(id: &str, bid: Decimal, ask: Decimal, depth: Decimal, volume: Decimal) -> MarketSnapshot {
        let now = Utc::now();
        MarketSnapshot {
            instrument_id: id.to_string(),
            bids: vec![BookLevel::new(bid, depth)],
            asks: vec![BookLevel::new(ask, depth)],
            last_trade_price: Some(bid),
            last_trade_at: Some(now),
            volume_24h: volume,
            timestamp: now,
            sequence: 1,
        }
    }

    fn instrument(id: &str) -> Instrument {
        Instrument::new(id, dec!(0.01), dec!(1))
    }

    #[test]
    fn test_score_weights() {
        let scanner = MarketScanner::new(ScannerConfig::default());
        let now = Utc::now();

        // Locked book at full volume and depth with a trade this instant
        let mut strong = snapshot("A", dec!(0.50), dec!(0.50), dec!(10000), dec!(100000));
        strong.last_trade_at = Some(now);
        let score = scanner.score(&strong, &MarketActivity::from_snapshot(&strong), now);
        assert!((score - 1.0).abs() < 1e-9);

        // Quarter volume and quarter depth score 0.5 each through the square root
        let mut middling = snapshot("B", dec!(0.50), dec!(0.50), dec!(2500), dec!(25000));
        middling.last_trade_at = None;
        let score = scanner.score(&middling, &MarketActivity::from_snapshot(&middling), now);
        assert!((score - (0.5 * 0.30 + 0.30 + 0.5 * 0.20)).abs() < 1e-9);
    }

    #[test]
    fn test_rank_filters_and_sorts() {
        let scanner = MarketScanner::new(ScannerConfig::default());
        let now = Utc::now();

        let candidates = vec![
            (instrument("deep"), snapshot("deep", dec!(0.49), dec!(0.51), dec!(5000), dec!(50000))),
            (instrument("thin"), snapshot("thin", dec!(0.49), dec!(0.51), dec!(10), dec!(50000))),
            (instrument("quiet"), snapshot("quiet", dec!(0.49), dec!(0.51), dec!(5000), dec!(10))),
            (instrument("wide"), snapshot("wide", dec!(0.30), dec!(0.70), dec!(5000), dec!(50000))),
            (instrument("mid"), snapshot("mid", dec!(0.49), dec!(0.51), dec!(500), dec!(5000))),
        ];

        let ranked = scanner.rank(candidates, now);
        let ids: Vec<&str> = ranked.iter().map(|m| m.instrument.id.as_str()).collect();
        assert_eq!(ids, vec!["deep", "mid"]);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_select_bounded_by_tier() {
        let scanner = MarketScanner::new(ScannerConfig::default());
        let now = Utc::now();
        let candidates = (0..6)
            .map(|i| {
                let id = format!("M{i}");
                let snap = snapshot(&id, dec!(0.49), dec!(0.51), dec!(1000), dec!(50000));
                (instrument(&id), snap)
            })
            .collect();
        let ranked = scanner.rank(candidates, now);

        assert_eq!(MarketScanner::select(&ranked, 20, 3).len(), 3);
        assert_eq!(MarketScanner::select(&ranked, 2, 10).len(), 2);
    }

    #[tokio::test]
    async fn test_discover_skips_failed_fetches() {
        let scanner = MarketScanner::new(ScannerConfig {
            batch_size: 2,
            batch_delay_ms: 1,
            ..ScannerConfig::default()
        });
        let venue = PaperVenue::new(PaperConfig {
            latency_min_ms: 0,
            latency_max_ms: 0,
            seed: Some(1),
            ..PaperConfig::default()
        });
        for id in ["A", "B", "C"] {
            venue.add_instrument(instrument(id)).await;
        }
        venue
            .update_snapshot(snapshot("A", dec!(0.49), dec!(0.51), dec!(100), dec!(5000)))
            .await;
        venue
            .update_snapshot(snapshot("C", dec!(0.49), dec!(0.51), dec!(100), dec!(5000)))
            .await;

        let limiter = RateLimiter::new(10, 10.0);
        let found = scanner
            .discover(&venue, &limiter, Duration::from_secs(1))
            .await
            .unwrap();

        let ids: Vec<&str> = found.iter().map(|(i, _)| i.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }
}
