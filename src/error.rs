//! Error taxonomy for the trading core.

use crate::risk::RejectReason;
use crate::strategy::StrategyId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by the core. None of these is retried automatically.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("insufficient capital in {strategy} pool: requested {requested}, available {available}")]
    InsufficientCapital {
        strategy: StrategyId,
        requested: Decimal,
        available: Decimal,
    },

    #[error("policy rejected action: {0}")]
    PolicyRejected(RejectReason),

    #[error("rate limited after waiting {waited_ms}ms")]
    RateLimited { waited_ms: u64 },

    #[error("venue timeout during {operation}")]
    VenueTimeout { operation: &'static str },

    #[error("venue rejected request: {0}")]
    VenueRejected(String),

    #[error("capital frozen")]
    Frozen,

    #[error("stale market data for {instrument}")]
    StaleData { instrument: String },

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("order already in flight for {instrument}")]
    DuplicateInflight { instrument: String },

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("order {0} already reached a terminal state")]
    OrderAlreadyTerminal(String),

    #[error("invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("credential vault: {0}")]
    Vault(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures reported by a venue adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VenueError {
    #[error("request timed out")]
    Timeout,

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("unknown order {0}")]
    UnknownOrder(String),
}

impl VenueError {
    /// Authentication failures are escalated by the fault monitor.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, VenueError::Unauthorized(_))
    }
}

impl From<VenueError> for EngineError {
    fn from(err: VenueError) -> Self {
        match err {
            VenueError::Timeout => EngineError::VenueTimeout { operation: "venue call" },
            other => EngineError::VenueRejected(other.to_string()),
        }
    }
}
