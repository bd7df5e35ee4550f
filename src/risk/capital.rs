//! Per-strategy capital pools.
//!
//! Each pool sits behind its own mutex so every mutation is a single critical
//! section and readers never see a torn `total / locked / available` triple.

use crate::config::CapitalConfig;
use crate::error::{EngineError, Result};
use crate::strategy::StrategyId;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consistent copy of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub strategy: StrategyId,
    pub total: Decimal,
    pub locked: Decimal,
    pub available: Decimal,
    pub frozen: bool,
}

/// Receipt for locked capital. Consumed by `release`.
#[derive(Debug, PartialEq)]
pub struct Reservation {
    pub id: Uuid,
    pub strategy: StrategyId,
    pub amount: Decimal,
}

#[derive(Debug)]
struct PoolState {
    total: Decimal,
    locked: Decimal,
    available: Decimal,
    frozen: bool,
}

impl PoolState {
    fn snapshot(&self, strategy: StrategyId) -> PoolSnapshot {
        PoolSnapshot {
            strategy,
            total: self.total,
            locked: self.locked,
            available: self.available,
            frozen: self.frozen,
        }
    }
}

/// Owns every capital pool for the session.
pub struct CapitalManager {
    pools: HashMap<StrategyId, Mutex<PoolState>>,
}

impl CapitalManager {
    pub fn new(allocations: &[(StrategyId, Decimal)]) -> Self {
        let pools = allocations
            .iter()
            .map(|(strategy, total)| {
                (
                    *strategy,
                    Mutex::new(PoolState {
                        total: *total,
                        locked: Decimal::ZERO,
                        available: *total,
                        frozen: false,
                    }),
                )
            })
            .collect();

        Self { pools }
    }

    pub fn from_config(config: &CapitalConfig) -> Self {
        Self::new(&[
            (StrategyId::EventReactive, config.strategy_a_allocation),
            (StrategyId::Quoting, config.strategy_b_allocation),
        ])
    }

    fn pool(&self, strategy: StrategyId) -> Result<&Mutex<PoolState>> {
        self.pools
            .get(&strategy)
            .ok_or_else(|| EngineError::InvalidState(format!("no capital pool for {strategy}")))
    }

    /// Lock `amount` from the strategy's available capital.
    pub fn allocate(&self, strategy: StrategyId, amount: Decimal) -> Result<Reservation> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidState(format!(
                "allocation must be positive, got {amount}"
            )));
        }

        let mut pool = self.pool(strategy)?.lock();
        if pool.frozen {
            warn!(%strategy, %amount, "Allocation refused: pool frozen");
            return Err(EngineError::Frozen);
        }
        if amount > pool.available {
            warn!(
                %strategy,
                requested = %amount,
                available = %pool.available,
                "Allocation refused: insufficient capital"
            );
            return Err(EngineError::InsufficientCapital {
                strategy,
                requested: amount,
                available: pool.available,
            });
        }

        pool.locked += amount;
        pool.available -= amount;
        debug!(%strategy, %amount, locked = %pool.locked, available = %pool.available, "Capital locked");

        Ok(Reservation {
            id: Uuid::new_v4(),
            strategy,
            amount,
        })
    }

    /// Return a reservation's capital to the available balance.
    pub fn release(&self, reservation: Reservation) -> Result<Decimal> {
        self.release_amount(reservation.strategy, reservation.amount)
    }

    /// Unlock part of a strategy's locked capital. Clamped to what is locked.
    pub fn release_amount(&self, strategy: StrategyId, amount: Decimal) -> Result<Decimal> {
        let mut pool = self.pool(strategy)?.lock();
        let amount = amount.max(Decimal::ZERO).min(pool.locked);
        pool.locked -= amount;
        pool.available += amount;
        debug!(%strategy, %amount, locked = %pool.locked, available = %pool.available, "Capital released");
        Ok(amount)
    }

    /// Add realized profit to the pool.
    pub fn credit(&self, strategy: StrategyId, amount: Decimal) -> Result<()> {
        let mut pool = self.pool(strategy)?.lock();
        pool.total += amount;
        pool.available += amount;
        Ok(())
    }

    /// Remove realized loss from the pool.
    pub fn debit(&self, strategy: StrategyId, amount: Decimal) -> Result<()> {
        let mut pool = self.pool(strategy)?.lock();
        pool.total -= amount;
        pool.available -= amount;
        if pool.available < Decimal::ZERO {
            warn!(%strategy, available = %pool.available, "Pool available balance negative after debit");
        }
        Ok(())
    }

    /// Apply a signed realized PnL.
    pub fn settle(&self, strategy: StrategyId, pnl: Decimal) -> Result<()> {
        if pnl >= Decimal::ZERO {
            self.credit(strategy, pnl)
        } else {
            self.debit(strategy, -pnl)
        }
    }

    /// Freeze every pool. There is no unfreeze within a session.
    pub fn freeze_all(&self) {
        for (strategy, pool) in &self.pools {
            let mut pool = pool.lock();
            if !pool.frozen {
                pool.frozen = true;
                info!(%strategy, locked = %pool.locked, available = %pool.available, "Capital pool frozen");
            }
        }
    }

    pub fn is_frozen(&self, strategy: StrategyId) -> bool {
        self.pools
            .get(&strategy)
            .map(|p| p.lock().frozen)
            .unwrap_or(true)
    }

    pub fn snapshot(&self, strategy: StrategyId) -> Option<PoolSnapshot> {
        self.pools.get(&strategy).map(|p| p.lock().snapshot(strategy))
    }

    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        let mut all: Vec<PoolSnapshot> = self
            .pools
            .iter()
            .map(|(strategy, pool)| pool.lock().snapshot(*strategy))
            .collect();
        all.sort_by_key(|s| s.strategy);
        all
    }

    /// Sum of pool totals.
    pub fn total_capital(&self) -> Decimal {
        self.pools.values().map(|p| p.lock().total).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn manager() -> CapitalManager {
        CapitalManager::new(&[
            (StrategyId::EventReactive, dec!(100)),
            (StrategyId::Quoting, dec!(200)),
        ])
    }

    fn assert_invariant(snap: &PoolSnapshot) {
        assert_eq!(snap.locked + snap.available, snap.total);
    }

    #[test]
    fn test_allocate_then_oversized_allocation_rejected() {
        let capital = manager();

        let reservation = capital.allocate(StrategyId::EventReactive, dec!(40)).unwrap();
        let snap = capital.snapshot(StrategyId::EventReactive).unwrap();
        assert_eq!(snap.locked, dec!(40));
        assert_eq!(snap.available, dec!(60));

        let err = capital.allocate(StrategyId::EventReactive, dec!(70)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientCapital { .. }));

        capital.release(reservation).unwrap();
        let snap = capital.snapshot(StrategyId::EventReactive).unwrap();
        assert_eq!(snap.available, dec!(100));
        assert_invariant(&snap);
    }

    #[test]
    fn test_pools_are_isolated() {
        let capital = manager();
        capital.allocate(StrategyId::Quoting, dec!(150)).unwrap();

        let a = capital.snapshot(StrategyId::EventReactive).unwrap();
        assert_eq!(a.available, dec!(100));
    }

    #[test]
    fn test_settle_keeps_invariant() {
        let capital = manager();
        let r = capital.allocate(StrategyId::Quoting, dec!(50)).unwrap();
        capital.release(r).unwrap();

        capital.settle(StrategyId::Quoting, dec!(5)).unwrap();
        capital.settle(StrategyId::Quoting, dec!(-12)).unwrap();

        let snap = capital.snapshot(StrategyId::Quoting).unwrap();
        assert_eq!(snap.total, dec!(193));
        assert_invariant(&snap);
    }

    #[test]
    fn test_release_amount_is_clamped() {
        let capital = manager();
        capital.allocate(StrategyId::EventReactive, dec!(10)).unwrap();

        let released = capital.release_amount(StrategyId::EventReactive, dec!(25)).unwrap();
        assert_eq!(released, dec!(10));
        assert_invariant(&capital.snapshot(StrategyId::EventReactive).unwrap());
    }

    #[test]
    fn test_frozen_pool_rejects_allocation_but_settles() {
        let capital = manager();
        let r = capital.allocate(StrategyId::EventReactive, dec!(30)).unwrap();

        capital.freeze_all();

        assert!(capital.is_frozen(StrategyId::EventReactive));
        assert!(capital.is_frozen(StrategyId::Quoting));
        assert_eq!(
            capital.allocate(StrategyId::Quoting, dec!(1)).unwrap_err(),
            EngineError::Frozen
        );
        capital.release(r).unwrap();
        capital.settle(StrategyId::EventReactive, dec!(-3)).unwrap();
        assert_invariant(&capital.snapshot(StrategyId::EventReactive).unwrap());
    }

    #[test]
    fn test_non_positive_allocation_rejected() {
        let capital = manager();
        assert!(capital.allocate(StrategyId::Quoting, Decimal::ZERO).is_err());
    }

    #[test]
    fn test_invariant_under_concurrent_access() {
        let capital = Arc::new(manager());
        let mut handles = Vec::new();

        for i in 0..8 {
            let capital = capital.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..500 {
                    let amount = Decimal::from((i + j) % 7 + 1);
                    if let Ok(r) = capital.allocate(StrategyId::EventReactive, amount) {
                        let snap = capital.snapshot(StrategyId::EventReactive).unwrap();
                        assert_eq!(snap.locked + snap.available, snap.total);
                        if j % 3 == 0 {
                            capital.settle(StrategyId::EventReactive, dec!(0.5)).unwrap();
                        }
                        capital.release(r).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = capital.snapshot(StrategyId::EventReactive).unwrap();
        assert_eq!(snap.locked, Decimal::ZERO);
        assert_invariant(&snap);
        assert!(snap.total > dec!(100));
    }
}
