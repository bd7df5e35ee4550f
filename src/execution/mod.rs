//! Order execution.
//!
//! - `engine`: order lifecycle, fills, positions and PnL
//! - `exits`: profit target, stop loss, trailing stop and timeout rules
//! - `position`: per-strategy exposure built from fills
//! - `rate_limiter`: token bucket in front of every venue call

mod engine;
mod exits;
mod position;
mod rate_limiter;

pub use engine::{ExecutionEngine, ExecutionReport, ExecutionStats, OrderHandle, PortfolioSummary};
pub use exits::{evaluate as evaluate_exit, ExitInput, ExitPlan, ExitTrigger};
pub use position::Position;
pub use rate_limiter::RateLimiter;
