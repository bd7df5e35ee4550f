//! Interfaces to the collaborators the core consumes.
//!
//! Transport, wire formats and persistence live behind these traits:
//! - market data and fast event streams
//! - order submission and cancellation
//! - configuration snapshots
//! - in-memory signing material

use super::types::{FastEvent, Instrument, MarketEvent, MarketSnapshot, Order, VenueAck};
use crate::config::Config;
use crate::error::{Result, VenueError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Order-book snapshots and deltas, per instrument in arrival order.
#[async_trait]
pub trait MarketDataSource: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<MarketEvent>;
}

/// External qualifying events consumed by the event-reactive strategy.
#[async_trait]
pub trait FastEventSource: Send {
    async fn next_event(&mut self) -> Option<FastEvent>;
}

/// Order routing to the venue. Every call is rate limited and timed out by
/// the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn submit_order(&self, order: &Order) -> std::result::Result<VenueAck, VenueError>;

    async fn cancel_order(&self, venue_order_id: &str) -> std::result::Result<(), VenueError>;

    /// Current state of a previously acknowledged order.
    async fn order_status(&self, venue_order_id: &str) -> std::result::Result<VenueAck, VenueError>;

    /// Fallback snapshot when the streaming feed is stale.
    async fn fetch_snapshot(
        &self,
        instrument_id: &str,
    ) -> std::result::Result<MarketSnapshot, VenueError>;

    /// Tradable instruments, for discovery.
    async fn list_instruments(&self) -> std::result::Result<Vec<Instrument>, VenueError>;
}

/// Delivers validated configuration snapshots.
#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    async fn load(&self) -> Result<Config>;
}

/// Session-scoped signing material. Never persisted.
pub trait CredentialVault: Send + Sync {
    fn is_unlocked(&self) -> bool;

    /// Hex signature over `payload`.
    fn sign(&self, payload: &[u8]) -> Result<String>;

    /// Wipe material; later `sign` calls fail.
    fn lock(&self);
}

/// Channel-backed source, used to bridge adapter tasks into the core.
pub struct ChannelSource<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> ChannelSource<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Paired sender and source.
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl MarketDataSource for ChannelSource<MarketEvent> {
    async fn next_event(&mut self) -> Option<MarketEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
impl FastEventSource for ChannelSource<FastEvent> {
    async fn next_event(&mut self) -> Option<FastEvent> {
        self.rx.recv().await
    }
}
