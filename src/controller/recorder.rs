use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::DecisionCycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub message: String,
    /// Cycle that raised the alert, when there is one
    pub cycle_id: Option<Uuid>,
}

impl Alert {
    pub fn new(timestamp: DateTime<Utc>, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            severity,
            message: message.into(),
            cycle_id: None,
        }
    }

    pub fn for_cycle(mut self, cycle_id: Uuid) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }
}

/// Where decision records and operator alerts go
#[async_trait]
pub trait RecordingSink: Send + Sync {
    async fn record(&self, cycle: &DecisionCycle) -> Result<()>;
    async fn alert(&self, alert: &Alert) -> Result<()>;
}

/// Emits every record as a structured log line
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl RecordingSink for TracingSink {
    async fn record(&self, cycle: &DecisionCycle) -> Result<()> {
        let json = serde_json::to_string(cycle)?;
        info!(
            target: "gridpilot::decision",
            cycle_id = %cycle.id(),
            status = %cycle.status(),
            mode = %cycle.mode().map(|m| m.to_string()).unwrap_or_default(),
            power_kw = cycle.action().power_kw,
            reason = %cycle.reason(),
            rules = %matched_rules(cycle),
            record = %json,
            "decision recorded"
        );
        Ok(())
    }

    async fn alert(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical => error!(
                target: "gridpilot::alert",
                alert_id = %alert.id,
                cycle_id = ?alert.cycle_id,
                "ALERT: {}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                target: "gridpilot::alert",
                alert_id = %alert.id,
                cycle_id = ?alert.cycle_id,
                "ALERT: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Matching classifier rules as `a,b,c`, highest priority first
fn matched_rules(cycle: &DecisionCycle) -> String {
    cycle
        .rules()
        .iter()
        .filter(|r| r.matched)
        .map(|r| r.mode.to_string())
        .join(",")
}

/// Keeps everything in memory; used by tests and the simulator
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    cycles: Arc<Mutex<Vec<DecisionCycle>>>,
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(&self) -> Vec<DecisionCycle> {
        self.cycles.lock().clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn last_cycle(&self) -> Option<DecisionCycle> {
        self.cycles.lock().last().cloned()
    }
}

#[async_trait]
impl RecordingSink for MemorySink {
    async fn record(&self, cycle: &DecisionCycle) -> Result<()> {
        self.cycles.lock().push(cycle.clone());
        Ok(())
    }

    async fn alert(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Command, InputSnapshot, Mode, Rationale, RuleMatch};

    #[tokio::test]
    async fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        let now = Utc::now();
        for power in [1.0, -2.0] {
            let cycle = DecisionCycle::completed(
                now,
                InputSnapshot::new(now),
                Mode::SelfConsume,
                Command { power_kw: power, duration_secs: 300 },
                0.0,
                false,
                Rationale::default(),
            );
            sink.record(&cycle).await.unwrap();
        }
        let alert = Alert::new(now, AlertSeverity::Warning, "weather down");
        sink.alert(&alert).await.unwrap();

        let cycles = sink.cycles();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[1].action().power_kw, -2.0);
        assert_eq!(sink.alerts(), vec![alert]);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_records() {
        let now = Utc::now();
        let cycle = DecisionCycle::completed(
            now,
            InputSnapshot::new(now),
            Mode::Idle,
            Command::idle(300),
            0.0,
            false,
            Rationale {
                reason: "no action at 12.0c import, 8.0c export, SOC 40%".into(),
                rules: vec![
                    RuleMatch { mode: Mode::SelfConsume, matched: false },
                    RuleMatch { mode: Mode::Idle, matched: true },
                ],
            },
        );
        assert_eq!(matched_rules(&cycle), "idle");
        assert!(TracingSink.record(&cycle).await.is_ok());
        let alert = Alert::new(now, AlertSeverity::Critical, "x").for_cycle(cycle.id());
        assert!(TracingSink.alert(&alert).await.is_ok());
    }
}
