//! Locally maintained order book built from snapshots and level deltas.

use super::types::{BookDelta, BookLevel, InstrumentId, MarketSnapshot, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::trace;

/// Book for a single instrument. Updates are applied strictly in sequence order.
#[derive(Debug, Clone)]
pub struct OrderBook {
    instrument_id: InstrumentId,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_trade_price: Option<Decimal>,
    last_trade_at: Option<DateTime<Utc>>,
    volume_24h: Decimal,
    sequence: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl OrderBook {
    pub fn new(instrument_id: impl Into<String>) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_trade_price: None,
            last_trade_at: None,
            volume_24h: Decimal::ZERO,
            sequence: 0,
            updated_at: None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Replace the whole book. Returns false when the snapshot is older than
    /// what has already been applied.
    pub fn apply_snapshot(&mut self, snapshot: &MarketSnapshot) -> bool {
        if self.updated_at.is_some() && snapshot.sequence <= self.sequence {
            trace!(
                instrument = %self.instrument_id,
                sequence = snapshot.sequence,
                applied = self.sequence,
                "Dropping superseded snapshot"
            );
            return false;
        }

        self.bids = snapshot
            .bids
            .iter()
            .filter(|l| l.size > Decimal::ZERO)
            .map(|l| (l.price, l.size))
            .collect();
        self.asks = snapshot
            .asks
            .iter()
            .filter(|l| l.size > Decimal::ZERO)
            .map(|l| (l.price, l.size))
            .collect();
        self.last_trade_price = snapshot.last_trade_price;
        self.last_trade_at = snapshot.last_trade_at;
        self.volume_24h = snapshot.volume_24h;
        self.sequence = snapshot.sequence;
        self.updated_at = Some(snapshot.timestamp);
        true
    }

    /// Apply a single level update. Out-of-order deltas are ignored.
    pub fn apply_delta(&mut self, delta: &BookDelta) -> bool {
        if delta.sequence <= self.sequence {
            return false;
        }

        let levels = match delta.side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if delta.size <= Decimal::ZERO {
            levels.remove(&delta.price);
        } else {
            levels.insert(delta.price, delta.size);
        }

        self.sequence = delta.sequence;
        self.updated_at = Some(delta.timestamp);
        true
    }

    /// Sorted, immutable view of the top `levels` on each side.
    pub fn snapshot(&self, levels: usize) -> Option<MarketSnapshot> {
        let timestamp = self.updated_at?;
        Some(MarketSnapshot {
            instrument_id: self.instrument_id.clone(),
            bids: self
                .bids
                .iter()
                .rev()
                .take(levels)
                .map(|(p, s)| BookLevel::new(*p, *s))
                .collect(),
            asks: self
                .asks
                .iter()
                .take(levels)
                .map(|(p, s)| BookLevel::new(*p, *s))
                .collect(),
            last_trade_price: self.last_trade_price,
            last_trade_at: self.last_trade_at,
            volume_24h: self.volume_24h,
            timestamp,
            sequence: self.sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(sequence: u64) -> MarketSnapshot {
        MarketSnapshot {
            instrument_id: "X".to_string(),
            bids: vec![BookLevel::new(dec!(0.48), dec!(100)), BookLevel::new(dec!(0.47), dec!(50))],
            asks: vec![BookLevel::new(dec!(0.52), dec!(80))],
            last_trade_price: Some(dec!(0.50)),
            last_trade_at: None,
            volume_24h: dec!(5000),
            timestamp: Utc::now(),
            sequence,
        }
    }

    fn delta(side: Side, price: Decimal, size: Decimal, sequence: u64) -> BookDelta {
        BookDelta {
            instrument_id: "X".to_string(),
            side,
            price,
            size,
            sequence,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_then_deltas() {
        let mut book = OrderBook::new("X");
        assert!(book.snapshot(5).is_none());
        assert!(book.apply_snapshot(&snapshot(10)));

        assert!(book.apply_delta(&delta(Side::Buy, dec!(0.49), dec!(20), 11)));
        assert!(book.apply_delta(&delta(Side::Sell, dec!(0.52), Decimal::ZERO, 12)));
        assert!(book.apply_delta(&delta(Side::Sell, dec!(0.53), dec!(40), 13)));

        let view = book.snapshot(5).unwrap();
        assert_eq!(view.best_bid(), Some(dec!(0.49)));
        assert_eq!(view.best_ask(), Some(dec!(0.53)));
        assert_eq!(view.bids.len(), 3);
        assert_eq!(view.sequence, 13);
    }

    #[test]
    fn test_stale_updates_are_dropped() {
        let mut book = OrderBook::new("X");
        book.apply_snapshot(&snapshot(10));

        assert!(!book.apply_snapshot(&snapshot(9)));
        assert!(!book.apply_delta(&delta(Side::Buy, dec!(0.49), dec!(20), 10)));
        assert_eq!(book.snapshot(5).unwrap().best_bid(), Some(dec!(0.48)));
    }

    #[test]
    fn test_snapshot_truncates_levels() {
        let mut book = OrderBook::new("X");
        book.apply_snapshot(&snapshot(1));

        let view = book.snapshot(1).unwrap();
        assert_eq!(view.bids.len(), 1);
        assert_eq!(view.bids[0].price, dec!(0.48));
    }
}
