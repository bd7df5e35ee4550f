//! Venue-facing types and collaborator interfaces.
//!
//! - `types`: instruments, books, orders and acknowledgements
//! - `traits`: market data, fast events, venue routing, config and vault
//! - `orderbook`: local book maintained from snapshots and deltas
//! - `mock`: paper venue with a synthetic fill model
//! - `vault`: in-memory credential vault

pub mod mock;
mod orderbook;
mod traits;
mod types;
mod vault;

pub use mock::PaperVenue;
pub use orderbook::OrderBook;
pub use traits::{
    ChannelSource, ConfigurationSource, CredentialVault, FastEventSource, MarketDataSource,
    VenueClient,
};
#[cfg(test)]
pub use traits::MockVenueClient;
pub use types::*;
pub use vault::InMemoryVault;
