use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Market-level view of the grid region (NEM dispatch summary)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    /// NEM region id, e.g. "NSW1"
    pub region: String,
    pub demand_mw: f64,
    /// Share of generation by fuel type (%)
    pub generation_mix: BTreeMap<String, f64>,
    /// Interconnector flow (MW); positive = importing into the region
    pub interconnector_flow_mw: f64,
    pub renewables_percent: f64,
    pub timestamp: DateTime<Utc>,
}

impl GridState {
    pub fn is_importing(&self) -> bool {
        self.interconnector_flow_mw > 0.0
    }

    /// Largest contributor in the generation mix, if any is reported
    pub fn dominant_fuel(&self) -> Option<&str> {
        self.generation_mix
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(fuel, _)| fuel.as_str())
    }
}

/// Grid figures carried on each timeline interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridConditions {
    pub demand_mw: f64,
    pub renewables_percent: f64,
    pub interconnector_flow_mw: f64,
}

impl From<&GridState> for GridConditions {
    fn from(g: &GridState) -> Self {
        Self {
            demand_mw: g.demand_mw,
            renewables_percent: g.renewables_percent,
            interconnector_flow_mw: g.interconnector_flow_mw,
        }
    }
}
