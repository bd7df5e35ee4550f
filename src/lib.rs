//! # Event Quote Engine
//!
//! Risk-gated trading core running two strategies side by side: an
//! event-reactive strategy that opens on qualifying external events, and a
//! continuous two-sided quoting strategy. Capital is isolated per strategy
//! and a one-way kill switch halts all new risk.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading, validation and capital tiers
//! - `error`: Error taxonomy shared by every component
//! - `exchange`: Venue, feed and vault interfaces, order book, paper venue
//! - `execution`: Order lifecycle, positions, exits and rate limiting
//! - `risk`: Capital pools, policy gate, kill switch, drawdown and faults
//! - `strategy`: Strategy A, Strategy B and the market scanner
//! - `orchestrator`: Lifecycle, routing, control surface and audit feed
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod orchestrator;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{EngineError, Result};
