use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Command, SeriesKind};

/// The seven mutually exclusive operating modes
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    VppDispatch,
    SpikeShield,
    GridCharge,
    SolarCharge,
    PeakSell,
    SelfConsume,
    Idle,
}

impl Mode {
    /// Evaluation order of the classifier rules; the first match wins.
    pub const PRIORITY: [Mode; 7] = [
        Mode::VppDispatch,
        Mode::SpikeShield,
        Mode::GridCharge,
        Mode::SolarCharge,
        Mode::PeakSell,
        Mode::SelfConsume,
        Mode::Idle,
    ];
}

/// One classifier rule and whether it held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub mode: Mode,
    pub matched: bool,
}

/// Why a cycle acted as it did: a readable reason plus every rule the
/// classifier tried, in priority order. `rules` is empty when the cycle
/// failed before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rationale {
    pub reason: String,
    pub rules: Vec<RuleMatch>,
}

/// Scheduler state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Gathering,
    Building,
    Classifying,
    Optimizing,
    Emitting,
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CycleStatus {
    Ok,
    Degraded,
    Failed,
}

/// Serializable mirror of `EngineError` variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    DataStale,
    MissingRequiredSeries,
    InfeasibleSchedule,
    CommandRejected,
    Timeout,
    TelemetryUnavailable,
    InvalidTelemetry,
    MalformedTimeline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Availability of one input during a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub series: SeriesKind,
    pub available: bool,
}

/// Reference to the inputs a cycle decided on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub id: Uuid,
    pub gathered_at: DateTime<Utc>,
    pub sources: Vec<SourceStatus>,
    pub battery_soc_percent: Option<f64>,
    pub timeline_intervals: usize,
    pub vpp_event_active: bool,
}

impl InputSnapshot {
    pub fn new(gathered_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            gathered_at,
            sources: Vec::new(),
            battery_soc_percent: None,
            timeline_intervals: 0,
            vpp_event_active: false,
        }
    }

    pub fn is_missing(&self, series: SeriesKind) -> bool {
        self.sources.iter().any(|s| s.series == series && !s.available)
    }
}

/// Outcome of one decision cycle. Written once, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCycle {
    id: Uuid,
    timestamp: DateTime<Utc>,
    snapshot: InputSnapshot,
    mode: Option<Mode>,
    action: Command,
    expected_value_cents: f64,
    status: CycleStatus,
    failure: Option<CycleFailure>,
    rationale: Rationale,
}

impl DecisionCycle {
    pub fn completed(
        timestamp: DateTime<Utc>,
        snapshot: InputSnapshot,
        mode: Mode,
        action: Command,
        expected_value_cents: f64,
        degraded: bool,
        rationale: Rationale,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            snapshot,
            mode: Some(mode),
            action,
            expected_value_cents,
            status: if degraded { CycleStatus::Degraded } else { CycleStatus::Ok },
            failure: None,
            rationale,
        }
    }

    /// `action` is the fallback that was emitted in place of a decision;
    /// the failure message becomes the reason.
    pub fn failed(
        timestamp: DateTime<Utc>,
        snapshot: InputSnapshot,
        mode: Option<Mode>,
        action: Command,
        failure: CycleFailure,
        rules: Vec<RuleMatch>,
    ) -> Self {
        let rationale = Rationale {
            reason: failure.message.clone(),
            rules,
        };
        Self {
            id: Uuid::new_v4(),
            timestamp,
            snapshot,
            mode,
            action,
            expected_value_cents: 0.0,
            status: CycleStatus::Failed,
            failure: Some(failure),
            rationale,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    pub fn snapshot(&self) -> &InputSnapshot {
        &self.snapshot
    }
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }
    pub fn action(&self) -> Command {
        self.action
    }
    pub fn expected_value_cents(&self) -> f64 {
        self.expected_value_cents
    }
    pub fn status(&self) -> CycleStatus {
        self.status
    }
    pub fn failure(&self) -> Option<&CycleFailure> {
        self.failure.as_ref()
    }
    pub fn reason(&self) -> &str {
        &self.rationale.reason
    }
    pub fn rules(&self) -> &[RuleMatch] {
        &self.rationale.rules
    }
}
