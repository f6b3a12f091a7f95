use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Command, Mode};

/// One interval of the planned trajectory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub start: DateTime<Utc>,
    pub duration_minutes: i64,
    /// Signed battery power (kW); positive charges
    pub power_kw: f64,
    /// SOC at the end of the interval
    pub soc_percent: f64,
    /// Net grid energy (kWh); positive imports
    pub grid_kwh: f64,
    /// Unweighted value of the interval (cents)
    pub value_cents: f64,
}

impl PlannedStep {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(self.duration_minutes)
    }
}

/// Optimizer output: the command for the current interval plus the plan
/// it was taken from. Only `command` is ever executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub mode: Mode,
    pub command: Command,
    /// Value of the first interval alone (cents)
    pub expected_value_cents: f64,
    /// Confidence-weighted objective over the whole horizon (cents)
    pub horizon_value_cents: f64,
    pub trajectory: Vec<PlannedStep>,
}
