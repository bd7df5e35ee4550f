//! Global emergency stop.
//!
//! A one-way Armed → Tripped state machine. Every trip carries exactly one
//! reason from a closed set, and the first reason wins. Tripping freezes all
//! capital pools immediately and publishes the new state on a watch channel
//! so in-flight submissions observe it at their next resume point.

use super::capital::CapitalManager;
use super::malfunction::AlertSeverity;
use super::mdd::RiskState;
use crate::config::RiskConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;
use uuid::Uuid;

/// Why the kill switch tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    OperatorManual,
    DrawdownBreach,
    DailyLossBreach,
    PolicyViolation,
    HeartbeatTimeout,
    ExternalWatchdog,
    SystemicFault,
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TripReason::OperatorManual => "operator_manual",
            TripReason::DrawdownBreach => "drawdown_breach",
            TripReason::DailyLossBreach => "daily_loss_breach",
            TripReason::PolicyViolation => "policy_violation",
            TripReason::HeartbeatTimeout => "heartbeat_timeout",
            TripReason::ExternalWatchdog => "external_watchdog",
            TripReason::SystemicFault => "systemic_fault",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum KillSwitchState {
    Armed,
    Tripped(TripReason),
}

impl KillSwitchState {
    pub fn is_tripped(&self) -> bool {
        matches!(self, KillSwitchState::Tripped(_))
    }

    pub fn reason(&self) -> Option<TripReason> {
        match self {
            KillSwitchState::Armed => None,
            KillSwitchState::Tripped(reason) => Some(*reason),
        }
    }
}

/// Structured record of the trip.
#[derive(Debug, Clone, Serialize)]
pub struct TripRecord {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub reason: TripReason,
    pub detail: String,
    pub severity: AlertSeverity,
}

impl TripRecord {
    fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        error!(target: "risk_alert", "RISK_ALERT: {}", json);
    }
}

pub struct KillSwitch {
    state: watch::Sender<KillSwitchState>,
    capital: Arc<CapitalManager>,
    record: Mutex<Option<TripRecord>>,
}

impl KillSwitch {
    pub fn new(capital: Arc<CapitalManager>) -> Self {
        let (state, _) = watch::channel(KillSwitchState::Armed);
        Self {
            state,
            capital,
            record: Mutex::new(None),
        }
    }

    pub fn state(&self) -> KillSwitchState {
        *self.state.borrow()
    }

    pub fn is_tripped(&self) -> bool {
        self.state().is_tripped()
    }

    /// Receiver that observes the trip.
    pub fn subscribe(&self) -> watch::Receiver<KillSwitchState> {
        self.state.subscribe()
    }

    pub fn trip_record(&self) -> Option<TripRecord> {
        self.record.lock().clone()
    }

    /// Trip the switch. Returns true if this call performed the transition;
    /// later calls leave the original reason in place.
    pub fn trip(&self, reason: TripReason, detail: impl Into<String>) -> bool {
        let transitioned = self.state.send_if_modified(|state| match state {
            KillSwitchState::Armed => {
                *state = KillSwitchState::Tripped(reason);
                true
            }
            KillSwitchState::Tripped(_) => false,
        });

        if !transitioned {
            return false;
        }

        self.capital.freeze_all();

        let record = TripRecord {
            alert_id: format!("kill-{}", Uuid::new_v4()),
            timestamp: Utc::now(),
            reason,
            detail: detail.into(),
            severity: AlertSeverity::Critical,
        };
        record.emit();
        *self.record.lock() = Some(record);
        true
    }

    /// Trip on drawdown or daily-loss breaches. Returns the reason if tripped.
    pub fn observe_risk(&self, risk: &RiskState, limits: &RiskConfig) -> Option<TripReason> {
        let reason = if risk.current_drawdown_pct >= limits.max_drawdown_pct {
            TripReason::DrawdownBreach
        } else if risk.daily_loss >= limits.kill_switch_daily_loss {
            TripReason::DailyLossBreach
        } else {
            return None;
        };

        let detail = format!(
            "drawdown {}%, daily loss {}",
            risk.current_drawdown_pct.round_dp(2),
            risk.daily_loss
        );
        self.trip(reason, detail).then_some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyId;
    use rust_decimal_macros::dec;

    fn kill_switch() -> (KillSwitch, Arc<CapitalManager>) {
        let capital = Arc::new(CapitalManager::new(&[
            (StrategyId::EventReactive, dec!(100)),
            (StrategyId::Quoting, dec!(100)),
        ]));
        (KillSwitch::new(capital.clone()), capital)
    }

    #[test]
    fn test_trip_freezes_pools() {
        let (switch, capital) = kill_switch();
        assert_eq!(switch.state(), KillSwitchState::Armed);

        assert!(switch.trip(TripReason::OperatorManual, "operator"));

        assert!(switch.is_tripped());
        assert!(capital.is_frozen(StrategyId::EventReactive));
        assert!(capital.is_frozen(StrategyId::Quoting));
        assert_eq!(switch.trip_record().unwrap().reason, TripReason::OperatorManual);
    }

    #[test]
    fn test_trip_is_one_way_and_keeps_first_reason() {
        let (switch, _) = kill_switch();
        switch.trip(TripReason::HeartbeatTimeout, "stalled");

        for reason in [
            TripReason::OperatorManual,
            TripReason::PolicyViolation,
            TripReason::ExternalWatchdog,
        ] {
            assert!(!switch.trip(reason, "again"));
            assert_eq!(
                switch.state(),
                KillSwitchState::Tripped(TripReason::HeartbeatTimeout)
            );
        }
    }

    #[tokio::test]
    async fn test_subscribers_observe_trip() {
        let (switch, _) = kill_switch();
        let mut rx = switch.subscribe();

        switch.trip(TripReason::ExternalWatchdog, "watchdog");

        let state = *rx.wait_for(|s| s.is_tripped()).await.unwrap();
        assert_eq!(state.reason(), Some(TripReason::ExternalWatchdog));
    }

    #[test]
    fn test_observe_risk_trips_on_breach() {
        let (switch, _) = kill_switch();
        let limits = RiskConfig::default();
        let mut risk = RiskState::default();

        assert_eq!(switch.observe_risk(&risk, &limits), None);
        assert!(!switch.is_tripped());

        risk.current_drawdown_pct = limits.max_drawdown_pct;
        assert_eq!(
            switch.observe_risk(&risk, &limits),
            Some(TripReason::DrawdownBreach)
        );
    }
}
