use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{bump, local_hour};
use crate::domain::GridState;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GridProvider: Send + Sync {
    async fn fetch(&self) -> Result<GridState>;
}

/// Regional dispatch summary with a solar-heavy midday mix
#[derive(Debug, Clone)]
pub struct SimulatedGridProvider {
    pub region: String,
    pub utc_offset_hours: i32,
    pub base_demand_mw: f64,
}

impl SimulatedGridProvider {
    pub fn new(region: impl Into<String>, utc_offset_hours: i32) -> Self {
        Self {
            region: region.into(),
            utc_offset_hours,
            base_demand_mw: 7000.0,
        }
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> GridState {
        let hh = local_hour(now, self.utc_offset_hours);
        let demand = self.base_demand_mw * (1.0 + 0.3 * bump(hh, 18.0, 2.5) + 0.1 * bump(hh, 8.0, 1.5));
        let solar = 35.0 * bump(hh, 12.5, 2.5);
        let wind = 12.0;
        let hydro = 5.0;
        let gas = 4.0 + 6.0 * bump(hh, 18.5, 1.5);
        let coal = (100.0 - solar - wind - hydro - gas).max(0.0);

        let generation_mix: BTreeMap<String, f64> = [
            ("black_coal", coal),
            ("gas", gas),
            ("hydro", hydro),
            ("solar", solar),
            ("wind", wind),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        GridState {
            region: self.region.clone(),
            demand_mw: demand,
            generation_mix,
            // exporting at midday, importing during the evening ramp
            interconnector_flow_mw: 400.0 * bump(hh, 18.5, 2.0) - 300.0 * bump(hh, 12.5, 2.0),
            renewables_percent: solar + wind + hydro,
            timestamp: now,
        }
    }
}

#[async_trait]
impl GridProvider for SimulatedGridProvider {
    async fn fetch(&self) -> Result<GridState> {
        Ok(self.state_at(Utc::now()))
    }
}
