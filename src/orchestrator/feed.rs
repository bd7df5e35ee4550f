//! Append-only observability feed.
//!
//! One sequence-numbered event per state-changing decision. Events are
//! broadcast to live subscribers and mirrored as JSON on the `audit` target.

use super::Lifecycle;
use crate::config::CapitalTier;
use crate::exchange::{InstrumentId, OrderStatus, Side};
use crate::risk::{RejectReason, TripReason};
use crate::strategy::{ActionKind, StrategyId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEventKind {
    LifecycleChanged {
        from: Lifecycle,
        to: Lifecycle,
    },
    /// A strategy or the exit evaluator produced an action
    ActionProposed {
        strategy: StrategyId,
        instrument_id: InstrumentId,
        kind: ActionKind,
        side: Side,
        size: Decimal,
        limit_price: Decimal,
        rationale: String,
    },
    ActionRejected {
        strategy: StrategyId,
        instrument_id: InstrumentId,
        kind: ActionKind,
        reason: RejectReason,
    },
    /// Approved but never became an order, or refused before the policy layer
    ActionDropped {
        strategy: StrategyId,
        instrument_id: InstrumentId,
        kind: ActionKind,
        detail: String,
    },
    OrderSubmitted {
        order_id: String,
        strategy: StrategyId,
        instrument_id: InstrumentId,
        kind: ActionKind,
    },
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
    OrderTerminal {
        order_id: String,
        strategy: StrategyId,
        instrument_id: InstrumentId,
        status: OrderStatus,
        filled_size: Decimal,
        detail: Option<String>,
    },
    KillSwitchTripped {
        reason: TripReason,
        detail: String,
        cancelled_orders: usize,
    },
    ConfigReloaded {
        tier: CapitalTier,
    },
    ConfigRejected {
        error: String,
    },
    MarketsSelected {
        instruments: Vec<InstrumentId>,
    },
    StaleData {
        instrument_id: InstrumentId,
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: FeedEventKind,
}

pub struct ObservabilityFeed {
    sequence: Mutex<u64>,
    tx: broadcast::Sender<FeedEvent>,
}

impl ObservabilityFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            sequence: Mutex::new(0),
            tx,
        }
    }

    /// Append an event and return its sequence number.
    pub fn publish(&self, kind: FeedEventKind) -> u64 {
        // Held across the send so subscribers see sequence order.
        let mut sequence = self.sequence.lock();
        *sequence += 1;
        let event = FeedEvent {
            sequence: *sequence,
            timestamp: Utc::now(),
            kind,
        };

        let json = serde_json::to_string(&event).unwrap_or_default();
        info!(target: "audit", "{}", json);

        // No subscribers is not an error.
        let _ = self.tx.send(event);
        *sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    pub fn last_sequence(&self) -> u64 {
        *self.sequence.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_events_are_sequenced_in_order() {
        let feed = ObservabilityFeed::new(16);
        let mut rx = feed.subscribe();

        feed.publish(FeedEventKind::LifecycleChanged {
            from: Lifecycle::Idle,
            to: Lifecycle::Running,
        });
        feed.publish(FeedEventKind::MarketsSelected {
            instruments: vec!["m-1".to_string()],
        });

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 2);
        assert_eq!(feed.last_sequence(), 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let feed = ObservabilityFeed::new(4);
        for _ in 0..10 {
            feed.publish(FeedEventKind::ConfigRejected {
                error: "bad".to_string(),
            });
        }
        assert_eq!(feed.last_sequence(), 10);
    }

    #[test]
    fn test_event_json_shape() {
        let event = FeedEvent {
            sequence: 7,
            timestamp: Utc::now(),
            kind: FeedEventKind::ActionRejected {
                strategy: StrategyId::EventReactive,
                instrument_id: "m-1".to_string(),
                kind: ActionKind::Open,
                reason: RejectReason::InsufficientCapital {
                    requested: dec!(50),
                    available: dec!(10),
                },
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["event"], "action_rejected");
        assert_eq!(json["reason"]["reason"], "insufficient_capital");
        assert_eq!(json["strategy"], "event_reactive");
    }
}
