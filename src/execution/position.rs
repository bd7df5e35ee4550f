//! Positions built from fills.

use super::exits::ExitPlan;
use crate::exchange::{InstrumentId, Side};
use crate::strategy::StrategyId;
use crate::utils::decimal::{pct_change, weighted_average};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::Serialize;

/// Exposure held by one strategy in one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub instrument_id: InstrumentId,
    pub strategy: StrategyId,
    /// Positive long, negative short
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub mark_price: Decimal,
    /// Best unrealized profit (percent) since entry
    pub hwm_pct: Decimal,
    pub opened_at: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    /// Capital locked against the open size
    pub reserved: Decimal,
    pub exit_plan: Option<ExitPlan>,
    /// A close order is in flight
    pub closing: bool,
}

impl Position {
    pub fn new(instrument_id: InstrumentId, strategy: StrategyId, opened_at: DateTime<Utc>) -> Self {
        Self {
            instrument_id,
            strategy,
            size: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
            hwm_pct: Decimal::ZERO,
            opened_at,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            reserved: Decimal::ZERO,
            exit_plan: None,
            closing: false,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size == Decimal::ZERO
    }

    /// Side of the open exposure.
    pub fn direction(&self) -> Option<Side> {
        if self.size > Decimal::ZERO {
            Some(Side::Buy)
        } else if self.size < Decimal::ZERO {
            Some(Side::Sell)
        } else {
            None
        }
    }

    /// Apply one execution. Returns the PnL realized by the reducing part.
    pub fn apply_fill(&mut self, side: Side, price: Decimal, size: Decimal, now: DateTime<Utc>) -> Decimal {
        let signed = side.sign() * size;

        if self.is_flat() || self.size.is_sign_positive() == signed.is_sign_positive() {
            if self.is_flat() {
                self.opened_at = now;
                self.hwm_pct = Decimal::ZERO;
            }
            self.avg_entry_price =
                weighted_average(&[(self.avg_entry_price, self.size.abs()), (price, size)]);
            self.size += signed;
            self.refresh(price_or(self.mark_price, price));
            return Decimal::ZERO;
        }

        let direction = self.size.signum();
        let closed = size.min(self.size.abs());
        let realized = (price - self.avg_entry_price) * closed * direction;
        self.realized_pnl += realized;
        self.size += signed;

        if self.is_flat() {
            self.unrealized_pnl = Decimal::ZERO;
        } else if self.size.signum() != direction {
            // Flipped through zero: the excess opens fresh at the fill price
            self.avg_entry_price = price;
            self.opened_at = now;
            self.hwm_pct = Decimal::ZERO;
            self.refresh(price);
        } else {
            self.refresh(price_or(self.mark_price, price));
        }
        realized
    }

    /// Mark at `price`; raises the high-water mark when profit improves.
    pub fn mark(&mut self, price: Decimal) {
        if price <= Decimal::ZERO || self.is_flat() {
            return;
        }
        self.refresh(price);
    }

    fn refresh(&mut self, price: Decimal) {
        self.mark_price = price;
        self.unrealized_pnl = (price - self.avg_entry_price) * self.size;
        let pnl_pct = self.pnl_pct();
        if pnl_pct > self.hwm_pct {
            self.hwm_pct = pnl_pct;
        }
    }

    /// Unrealized profit in percent of entry, signed by direction.
    pub fn pnl_pct(&self) -> Decimal {
        pct_change(self.avg_entry_price, self.mark_price) * self.size.signum()
    }

    pub fn held_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.opened_at).num_seconds().max(0) as u64
    }
}

fn price_or(mark: Decimal, fallback: Decimal) -> Decimal {
    if mark > Decimal::ZERO {
        mark
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::new("X".to_string(), StrategyId::EventReactive, Utc::now())
    }

    #[test]
    fn test_weighted_entry_and_realized_pnl() {
        let mut pos = position();
        let now = Utc::now();

        pos.apply_fill(Side::Buy, dec!(0.50), dec!(30), now);
        pos.apply_fill(Side::Buy, dec!(0.60), dec!(10), now);
        assert_eq!(pos.size, dec!(40));
        assert_eq!(pos.avg_entry_price, dec!(0.525));

        let realized = pos.apply_fill(Side::Sell, dec!(0.625), dec!(20), now);
        assert_eq!(realized, dec!(2));
        assert_eq!(pos.size, dec!(20));
        assert_eq!(pos.avg_entry_price, dec!(0.525));

        pos.apply_fill(Side::Sell, dec!(0.525), dec!(20), now);
        assert!(pos.is_flat());
        assert_eq!(pos.realized_pnl, dec!(2));
        assert_eq!(pos.unrealized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_mark_updates_high_water_mark() {
        let mut pos = position();
        pos.apply_fill(Side::Buy, dec!(0.50), dec!(10), Utc::now());

        pos.mark(dec!(0.51));
        assert_eq!(pos.pnl_pct(), dec!(2));
        assert_eq!(pos.unrealized_pnl, dec!(0.1));

        pos.mark(dec!(0.505));
        assert_eq!(pos.hwm_pct, dec!(2));
        assert_eq!(pos.pnl_pct(), dec!(1));
    }

    #[test]
    fn test_short_position_pnl() {
        let mut pos = position();
        pos.apply_fill(Side::Sell, dec!(0.50), dec!(10), Utc::now());
        assert_eq!(pos.direction(), Some(Side::Sell));

        pos.mark(dec!(0.49));
        assert_eq!(pos.pnl_pct(), dec!(2));
        assert_eq!(pos.unrealized_pnl, dec!(0.1));

        let realized = pos.apply_fill(Side::Buy, dec!(0.45), dec!(10), Utc::now());
        assert_eq!(realized, dec!(0.5));
    }

    #[test]
    fn test_flip_reopens_at_fill_price() {
        let mut pos = position();
        pos.apply_fill(Side::Buy, dec!(0.50), dec!(10), Utc::now());

        let realized = pos.apply_fill(Side::Sell, dec!(0.55), dec!(15), Utc::now());

        assert_eq!(realized, dec!(0.5));
        assert_eq!(pos.size, dec!(-5));
        assert_eq!(pos.avg_entry_price, dec!(0.55));
    }
}
