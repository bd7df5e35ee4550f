//! Fault classification for venue and execution errors.
//!
//! Detects conditions that indicate the system, not a single order, is
//! broken:
//! - error rate spikes
//! - consecutive order failures on one instrument
//! - repeated venue authentication failures
//!
//! Alerts flagged `systemic` are escalated to the kill switch by the caller.

use crate::config::RiskConfig;
use crate::error::VenueError;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Kinds of faults that can be detected.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum FaultType {
    /// Error count inside the window exceeded threshold
    ErrorSpike { error_count: u32, window_secs: u64 },
    /// Consecutive failures for one instrument
    OrderFailures {
        instrument: String,
        consecutive_failures: u32,
    },
    /// Venue refused our credentials repeatedly
    AuthFailures { consecutive_failures: u32 },
    /// A caller waited out its rate-limit timeout
    RateLimited { operation: String },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FaultAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub fault_type: FaultType,
    pub severity: AlertSeverity,
    pub message: String,
    pub systemic: bool,
}

impl FaultAlert {
    fn new(fault_type: FaultType, severity: AlertSeverity, message: String, systemic: bool) -> Self {
        Self {
            alert_id: format!("fault-{}", Uuid::new_v4()),
            timestamp: Utc::now(),
            fault_type,
            severity,
            message,
            systemic,
        }
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "risk_alert", "RISK_ALERT: {}", json)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub max_errors_per_window: u32,
    pub error_window_secs: u64,
    pub max_consecutive_failures: u32,
    pub max_auth_failures: u32,
}

impl From<&RiskConfig> for FaultConfig {
    fn from(risk: &RiskConfig) -> Self {
        Self {
            max_errors_per_window: risk.max_errors_per_window,
            error_window_secs: risk.error_window_secs,
            max_consecutive_failures: risk.max_consecutive_failures,
            max_auth_failures: risk.max_auth_failures,
        }
    }
}

/// Tracks recent failures and classifies them.
pub struct FaultMonitor {
    config: FaultConfig,
    error_history: VecDeque<DateTime<Utc>>,
    failure_counts: HashMap<String, u32>,
    auth_failures: u32,
}

impl FaultMonitor {
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            error_history: VecDeque::new(),
            failure_counts: HashMap::new(),
            auth_failures: 0,
        }
    }

    pub fn set_config(&mut self, config: FaultConfig) {
        self.config = config;
    }

    /// Record any error; alerts when the windowed count reaches the limit.
    pub fn record_error(&mut self, context: &str, now: DateTime<Utc>) -> Option<FaultAlert> {
        self.error_history.push_back(now);

        let window_start = now - Duration::seconds(self.config.error_window_secs as i64);
        while let Some(timestamp) = self.error_history.front() {
            if *timestamp < window_start {
                self.error_history.pop_front();
            } else {
                break;
            }
        }

        let error_count = self.error_history.len() as u32;
        debug!(%context, error_count, "Recorded error");

        if error_count >= self.config.max_errors_per_window {
            let alert = FaultAlert::new(
                FaultType::ErrorSpike {
                    error_count,
                    window_secs: self.config.error_window_secs,
                },
                AlertSeverity::Error,
                format!(
                    "{} errors in {}s, venue may be unstable",
                    error_count, self.config.error_window_secs
                ),
                error_count >= self.config.max_errors_per_window * 2,
            );
            alert.emit();
            return Some(alert);
        }

        None
    }

    /// Record a venue failure for one instrument. Authentication failures
    /// are counted globally; enough in a row is systemic.
    pub fn record_venue_error(
        &mut self,
        instrument: &str,
        err: &VenueError,
        now: DateTime<Utc>,
    ) -> Option<FaultAlert> {
        if err.is_auth_failure() {
            self.auth_failures += 1;
            if self.auth_failures >= self.config.max_auth_failures {
                let alert = FaultAlert::new(
                    FaultType::AuthFailures {
                        consecutive_failures: self.auth_failures,
                    },
                    AlertSeverity::Critical,
                    format!(
                        "{} consecutive authentication failures",
                        self.auth_failures
                    ),
                    true,
                );
                alert.emit();
                return Some(alert);
            }
        }

        let count = self.failure_counts.entry(instrument.to_string()).or_insert(0);
        *count += 1;
        let consecutive = *count;
        debug!(%instrument, consecutive_failures = consecutive, error = %err, "Recorded order failure");

        if consecutive >= self.config.max_consecutive_failures {
            let alert = FaultAlert::new(
                FaultType::OrderFailures {
                    instrument: instrument.to_string(),
                    consecutive_failures: consecutive,
                },
                AlertSeverity::Warning,
                format!("{consecutive} consecutive order failures for {instrument}"),
                false,
            );
            alert.emit();
            return Some(alert);
        }

        self.record_error(instrument, now)
    }

    pub fn record_rate_limited(&mut self, operation: &str) -> FaultAlert {
        let alert = FaultAlert::new(
            FaultType::RateLimited {
                operation: operation.to_string(),
            },
            AlertSeverity::Warning,
            format!("Rate limit wait expired during {operation}"),
            false,
        );
        alert.emit();
        alert
    }

    /// A successful venue round trip resets the counters for that instrument.
    pub fn record_success(&mut self, instrument: &str) {
        if let Some(count) = self.failure_counts.get_mut(instrument) {
            *count = 0;
        }
        self.auth_failures = 0;
    }

    pub fn failure_count(&self, instrument: &str) -> u32 {
        self.failure_counts.get(instrument).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FaultConfig {
        FaultConfig {
            max_errors_per_window: 5,
            error_window_secs: 60,
            max_consecutive_failures: 3,
            max_auth_failures: 2,
        }
    }

    #[test]
    fn test_error_spike() {
        let mut monitor = FaultMonitor::new(test_config());
        let now = Utc::now();

        for _ in 0..4 {
            assert!(monitor.record_error("test", now).is_none());
        }
        let alert = monitor.record_error("test", now).unwrap();
        assert!(matches!(alert.fault_type, FaultType::ErrorSpike { .. }));
        assert!(!alert.systemic);
    }

    #[test]
    fn test_old_errors_leave_the_window() {
        let mut monitor = FaultMonitor::new(test_config());
        let start = Utc::now();

        for _ in 0..4 {
            monitor.record_error("test", start);
        }
        assert!(monitor
            .record_error("test", start + Duration::seconds(120))
            .is_none());
    }

    #[test]
    fn test_consecutive_order_failures_reset_on_success() {
        let mut monitor = FaultMonitor::new(test_config());
        let now = Utc::now();
        let err = VenueError::Rejected("post only".to_string());

        monitor.record_venue_error("X", &err, now);
        monitor.record_venue_error("X", &err, now);
        let alert = monitor.record_venue_error("X", &err, now).unwrap();
        assert!(matches!(alert.fault_type, FaultType::OrderFailures { .. }));

        monitor.record_success("X");
        assert_eq!(monitor.failure_count("X"), 0);
    }

    #[test]
    fn test_repeated_auth_failure_is_systemic() {
        let mut monitor = FaultMonitor::new(test_config());
        let now = Utc::now();
        let err = VenueError::Unauthorized("bad signature".to_string());

        assert!(monitor.record_venue_error("X", &err, now).is_none());
        let alert = monitor.record_venue_error("Y", &err, now).unwrap();
        assert!(alert.systemic);
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }
}
