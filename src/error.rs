use thiserror::Error;

use crate::domain::{BatteryError, CycleFailure, FailureKind, Mode, SeriesKind};

/// Everything that can abort a decision cycle
#[derive(Debug, Error)]
pub enum EngineError {
    /// `age_minutes` is the distance between the first uncovered bucket and
    /// the nearest instant the series still covers
    #[error("{series} data is stale: {age_minutes} min from coverage (grace {grace_minutes} min)")]
    DataStale {
        series: SeriesKind,
        age_minutes: i64,
        grace_minutes: i64,
    },

    #[error("required series missing: {0}")]
    MissingRequiredSeries(SeriesKind),

    #[error("no feasible schedule in mode {mode}: {reason}")]
    InfeasibleSchedule { mode: Mode, reason: String },

    #[error("command rejected by battery: {0}")]
    CommandRejected(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("battery telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    #[error("invalid battery telemetry: {0}")]
    InvalidTelemetry(#[from] BatteryError),

    #[error("malformed timeline: {0}")]
    MalformedTimeline(String),
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::DataStale { .. } => FailureKind::DataStale,
            EngineError::MissingRequiredSeries(_) => FailureKind::MissingRequiredSeries,
            EngineError::InfeasibleSchedule { .. } => FailureKind::InfeasibleSchedule,
            EngineError::CommandRejected(_) => FailureKind::CommandRejected,
            EngineError::Timeout(_) => FailureKind::Timeout,
            EngineError::TelemetryUnavailable(_) => FailureKind::TelemetryUnavailable,
            EngineError::InvalidTelemetry(_) => FailureKind::InvalidTelemetry,
            EngineError::MalformedTimeline(_) => FailureKind::MalformedTimeline,
        }
    }

    /// Record form stored on the decision cycle
    pub fn to_failure(&self) -> CycleFailure {
        CycleFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
