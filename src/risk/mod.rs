//! Capital and risk controls.
//!
//! - Per-strategy capital pools with freeze support
//! - Stateless policy gate for every capital-affecting action
//! - One-way kill switch
//! - Drawdown and realized-loss tracking
//! - Rolling volatility filter
//! - Fault (malfunction) detection with systemic escalation

mod capital;
mod kill_switch;
mod malfunction;
mod mdd;
mod policy;
mod volatility;

pub use capital::{CapitalManager, PoolSnapshot, Reservation};
pub use kill_switch::{KillSwitch, KillSwitchState, TripReason, TripRecord};
pub use malfunction::{AlertSeverity, FaultAlert, FaultConfig, FaultMonitor, FaultType};
pub use mdd::{DrawdownTracker, RiskState, RiskTracker};
pub use policy::{
    evaluate, ApprovedAction, PolicyContext, PolicyDecision, PolicyLimits, RejectReason,
};
pub use volatility::VolatilityTracker;
