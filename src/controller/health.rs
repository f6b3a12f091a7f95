use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, warn};

use super::{Alert, AlertSeverity};
use crate::domain::SeriesKind;

/// Rolling health of the decision loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_cycles: u64,
    pub total_failures: u64,
    /// Whether each source answered in its most recent cycle
    pub sources: BTreeMap<SeriesKind, bool>,
}

impl HealthStatus {
    /// Some source is down but cycles may still succeed
    pub fn is_degraded(&self) -> bool {
        self.sources.values().any(|ok| !ok)
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    status: HealthStatus,
    alert_after: u32,
}

impl HealthMonitor {
    pub fn new(alert_after_consecutive_failures: u32) -> Self {
        Self {
            status: HealthStatus::default(),
            alert_after: alert_after_consecutive_failures.max(1),
        }
    }

    pub fn status(&self) -> &HealthStatus {
        &self.status
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.status.last_success = Some(at);
        self.status.last_error = None;
        self.status.consecutive_failures = 0;
        self.status.total_cycles += 1;
    }

    /// Returns an alert once the consecutive failure count reaches the
    /// threshold, and on every failure after that.
    pub fn record_failure(&mut self, at: DateTime<Utc>, reason: &str) -> Option<Alert> {
        self.status.consecutive_failures += 1;
        self.status.total_failures += 1;
        self.status.total_cycles += 1;
        self.status.last_error = Some(reason.to_string());

        if self.status.consecutive_failures < self.alert_after {
            return None;
        }
        error!(
            consecutive_failures = self.status.consecutive_failures,
            last_error = reason,
            "decision loop failing repeatedly"
        );
        Some(Alert::new(
            at,
            AlertSeverity::Critical,
            format!(
                "{} consecutive failed cycles; last: {reason}",
                self.status.consecutive_failures
            ),
        ))
    }

    pub fn record_source(&mut self, series: SeriesKind, available: bool) {
        let was = self.status.sources.insert(series, available);
        if !available && was != Some(false) {
            warn!(%series, "source unavailable");
        }
    }

    /// Failing repeatedly, or the price feed is down
    pub fn is_critical(&self) -> bool {
        self.status.consecutive_failures >= self.alert_after
            || self.status.sources.get(&SeriesKind::Price) == Some(&false)
    }

    pub fn summary(&self) -> String {
        let s = &self.status;
        let sources = s
            .sources
            .iter()
            .map(|(k, ok)| format!("{k}:{}", if *ok { "ok" } else { "down" }))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "cycles={} failures={} consecutive={} sources=[{sources}]",
            s.total_cycles, s.total_failures, s.consecutive_failures
        )
    }
}
